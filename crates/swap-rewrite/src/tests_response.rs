fn rewritten_for(account_id: &str) -> RewriteDecision {
    RewriteDecision {
        action: RewriteAction::Rewritten {
            account_id: account_id.to_string(),
            rule_id: "vendor-bearer".to_string(),
        },
        reason: RewriteReason::CredentialSubstituted,
    }
}

fn settings_file(contents: &str) -> (tempfile::TempDir, Arc<UserSettings>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("user_settings.json");
    std::fs::write(&path, contents).expect("write settings");
    let settings = Arc::new(UserSettings::from_path(path));
    (dir, settings)
}

#[test]
fn forbidden_multi_agent_response_blocks_the_substituted_account() {
    let policy = ResponsePolicy::new(Arc::new(UserSettings::disabled()));
    let req = request("POST /ai/multi-agent HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
    let resp = response("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n", "POST");

    assert_eq!(
        policy.inspect(&req, "app.warp.dev", &resp, &rewritten_for("a")),
        ResponseAction::MarkBlocked {
            account_id: "a".to_string()
        }
    );
    let untouched = RewriteDecision {
        action: RewriteAction::PassThrough,
        reason: RewriteReason::NoActiveAccount,
    };
    assert_eq!(
        policy.inspect(&req, "app.warp.dev", &resp, &untouched),
        ResponseAction::Forward
    );

    let other = request("GET /graphql HTTP/1.1\r\n\r\n");
    assert_eq!(
        policy.inspect(&other, "app.warp.dev", &resp, &rewritten_for("a")),
        ResponseAction::Forward
    );
}

#[test]
fn unauthorized_response_requests_a_refresh() {
    let policy = ResponsePolicy::new(Arc::new(UserSettings::disabled()));
    let req = request("GET /graphql HTTP/1.1\r\n\r\n");
    let resp = response("HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n", "GET");
    assert_eq!(
        policy.inspect(&req, "app.warp.dev", &resp, &rewritten_for("b")),
        ResponseAction::RefreshCredentials {
            account_id: "b".to_string()
        }
    );
    assert_eq!(
        policy.inspect(&req, "example.com", &resp, &rewritten_for("b")),
        ResponseAction::Forward
    );
}

#[test]
fn cloud_objects_response_is_replaced_by_settings_document() {
    let (_dir, settings) = settings_file(r#"{"data":{"updatedCloudObjects":[]}}"#);
    let policy = ResponsePolicy::new(settings);
    let req = request(
        "POST /graphql/v2?op=GetUpdatedCloudObjects HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    );
    let ok = response("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n", "POST");

    match policy.inspect(&req, "app.warp.dev", &ok, &rewritten_for("a")) {
        ResponseAction::ReplaceBody(body) => {
            assert_eq!(&body[..], br#"{"data":{"updatedCloudObjects":[]}}"#)
        }
        other => panic!("unexpected action: {other:?}"),
    }

    let failed = response("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n", "POST");
    assert_eq!(
        policy.inspect(&req, "app.warp.dev", &failed, &rewritten_for("a")),
        ResponseAction::Forward
    );

    let manager = RewriteDecision {
        action: RewriteAction::PassThrough,
        reason: RewriteReason::IdentityHeader,
    };
    assert_eq!(
        policy.inspect(&req, "app.warp.dev", &ok, &manager),
        ResponseAction::Forward
    );
}

#[test]
fn settings_reload_keeps_last_good_document() {
    let (dir, settings) = settings_file(r#"{"v":1}"#);
    let policy = ResponsePolicy::new(Arc::clone(&settings));
    let create = request(
        "POST /graphql/v2?op=CreateGenericStringObject HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(policy.wants_settings_reload(&create, "app.warp.dev"));
    let get = request("GET /graphql/v2?op=CreateGenericStringObject HTTP/1.1\r\n\r\n");
    assert!(!policy.wants_settings_reload(&get, "app.warp.dev"));

    let path = dir.path().join("user_settings.json");
    std::fs::write(&path, r#"{"v":2}"#).expect("rewrite");
    assert!(settings.reload().expect("reload"));
    assert_eq!(settings.document().as_deref(), Some(&br#"{"v":2}"#[..]));

    std::fs::write(&path, "not json").expect("corrupt");
    assert!(matches!(settings.reload(), Err(SettingsError::Invalid { .. })));
    assert_eq!(settings.document().as_deref(), Some(&br#"{"v":2}"#[..]));
}

#[test]
fn missing_settings_file_disables_replacement() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = UserSettings::from_path(dir.path().join("absent.json"));
    assert_eq!(settings.document(), None);
    assert!(!settings.reload().expect("missing file is not an error"));
    assert!(!UserSettings::disabled().reload().expect("no path"));
}

#[test]
fn deleting_the_settings_file_drops_the_loaded_document() {
    let (dir, settings) = settings_file(r#"{"v":1}"#);
    let policy = ResponsePolicy::new(Arc::clone(&settings));
    assert!(settings.document().is_some());

    std::fs::remove_file(dir.path().join("user_settings.json")).expect("remove settings");
    assert!(!settings.reload().expect("missing file is not an error"));
    assert_eq!(settings.document(), None);

    let cloud_objects = request(
        "POST /graphql/v2?op=GetUpdatedCloudObjects HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    );
    let ok = response("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n", "POST");
    assert_eq!(
        policy.inspect(&cloud_objects, "app.warp.dev", &ok, &rewritten_for("a")),
        ResponseAction::Forward
    );
}
