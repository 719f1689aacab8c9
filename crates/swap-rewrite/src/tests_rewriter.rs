#[test]
fn substitutes_bearer_token_and_records_use() {
    let (rewriter, usage) = rewriter();
    let mut head = request(
        "POST /ai/multi-agent HTTP/1.1\r\nHost: app.warp.dev\r\nAuthorization: Bearer user-token\r\nX-Custom: keep\r\nContent-Length: 0\r\n\r\n",
    );
    let decision = rewriter.rewrite(&mut head, "app.warp.dev", Some(&active("a", "token-a")));

    assert_eq!(
        decision.action,
        RewriteAction::Rewritten {
            account_id: "a".to_string(),
            rule_id: "vendor-bearer".to_string()
        }
    );
    assert_eq!(decision.reason, RewriteReason::CredentialSubstituted);
    assert_eq!(head.header("authorization"), Some("Bearer token-a"));
    assert_eq!(head.header("x-custom"), Some("keep"));
    assert_eq!(head.header("content-length"), Some("0"));
    let encoded = String::from_utf8(head.encode()).expect("utf8");
    assert!(encoded.starts_with("POST /ai/multi-agent HTTP/1.1\r\n"));
    assert!(!encoded.contains("user-token"));

    let uses = usage.uses.lock();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].0, "a");
}

#[test]
fn refreshes_experiment_id_on_rewritten_requests() {
    let (rewriter, _usage) = rewriter();
    let mut head = request(
        "GET /graphql HTTP/1.1\r\nHost: app.warp.dev\r\nAuthorization: Bearer u\r\nx-warp-experiment-id: fixed\r\n\r\n",
    );
    rewriter.rewrite(&mut head, "app.warp.dev", Some(&active("a", "t")));
    let experiment = head.header(EXPERIMENT_ID_HEADER).expect("header kept");
    assert_ne!(experiment, "fixed");
    let parsed = uuid::Uuid::parse_str(experiment).expect("uuid");
    assert_eq!(parsed.get_version_num(), 4);

    let mut without = request("GET /graphql HTTP/1.1\r\nAuthorization: Bearer u\r\n\r\n");
    rewriter.rewrite(&mut without, "app.warp.dev", Some(&active("a", "t")));
    assert!(without.has_header(EXPERIMENT_ID_HEADER));
}

#[test]
fn telemetry_hosts_get_a_local_no_content() {
    let (rewriter, usage) = rewriter();
    for host in ["dataplane.rudderstack.com", "warp.dataplane.rudderstack.com"] {
        let mut head = request("POST /v1/batch HTTP/1.1\r\nContent-Length: 2\r\n\r\n");
        let original = head.clone();
        let decision = rewriter.rewrite(&mut head, host, Some(&active("a", "t")));
        assert_eq!(decision.action, RewriteAction::LocalResponse { status: 204 });
        assert_eq!(head, original);
    }
    assert!(usage.uses.lock().is_empty());
}

#[test]
fn identity_requests_keep_the_users_credential() {
    let (rewriter, usage) = rewriter();
    let cases = [
        (
            "GET /graphql HTTP/1.1\r\nAuthorization: Bearer mine\r\nX-Warp-Manager-Request: true\r\n\r\n",
            RewriteReason::IdentityHeader,
        ),
        (
            "POST /auth/refresh HTTP/1.1\r\nAuthorization: Bearer mine\r\nContent-Length: 0\r\n\r\n",
            RewriteReason::IdentityPath,
        ),
    ];
    for (raw, reason) in cases {
        let mut head = request(raw);
        let original = head.clone();
        let decision = rewriter.rewrite(&mut head, "app.warp.dev", Some(&active("a", "t")));
        assert_eq!(decision.action, RewriteAction::PassThrough);
        assert_eq!(decision.reason, reason);
        assert!(decision.reason.is_identity_exclusion());
        assert_eq!(head, original);
    }
    assert!(usage.uses.lock().is_empty());
}

#[test]
fn passes_through_without_active_account_or_credential_field() {
    let (rewriter, usage) = rewriter();

    let mut head = request("GET /graphql HTTP/1.1\r\nAuthorization: Bearer mine\r\n\r\n");
    let decision = rewriter.rewrite(&mut head, "app.warp.dev", None);
    assert_eq!(decision.reason, RewriteReason::NoActiveAccount);
    assert_eq!(head.header("authorization"), Some("Bearer mine"));

    let mut anonymous = request("GET /graphql HTTP/1.1\r\nHost: app.warp.dev\r\n\r\n");
    let decision = rewriter.rewrite(&mut anonymous, "app.warp.dev", Some(&active("a", "t")));
    assert_eq!(decision.reason, RewriteReason::NoCredentialField);
    assert!(!anonymous.has_header("authorization"));

    let mut basic = request("GET / HTTP/1.1\r\nAuthorization: Basic abc\r\n\r\n");
    let decision = rewriter.rewrite(&mut basic, "app.warp.dev", Some(&active("a", "t")));
    assert_eq!(decision.action, RewriteAction::PassThrough);

    let mut other_host = request("GET / HTTP/1.1\r\nAuthorization: Bearer mine\r\n\r\n");
    let decision = rewriter.rewrite(&mut other_host, "example.com", Some(&active("a", "t")));
    assert_eq!(decision.action, RewriteAction::PassThrough);
    assert!(usage.uses.lock().is_empty());
}

#[test]
fn first_matching_rule_with_a_present_field_wins() {
    let usage = Arc::new(RecordingUsage::default());
    let rules = RuleTable {
        credential_rules: vec![
            CredentialRule {
                id: "api-key".to_string(),
                host: HostPattern::Domain("example.com".to_string()),
                path: PathPattern::Prefix("/v2/".to_string()),
                field: CredentialField::Header("X-Api-Key".to_string()),
            },
            CredentialRule {
                id: "bearer".to_string(),
                host: HostPattern::Any,
                path: PathPattern::Any,
                field: CredentialField::AuthorizationBearer,
            },
        ],
        ..RuleTable::default()
    };
    let rewriter = CredentialRewriter::new(rules, usage);

    let mut keyed = request("GET /v2/items HTTP/1.1\r\nx-api-key: old\r\nAuthorization: Bearer keep\r\n\r\n");
    let decision = rewriter.rewrite(&mut keyed, "api.example.com", Some(&active("a", "secret")));
    assert!(matches!(decision.action, RewriteAction::Rewritten { ref rule_id, .. } if rule_id == "api-key"));
    assert_eq!(keyed.header("x-api-key"), Some("secret"));
    assert_eq!(keyed.header("authorization"), Some("Bearer keep"));

    let mut bearer_only = request("GET /v2/items HTTP/1.1\r\nAuthorization: Bearer old\r\n\r\n");
    let decision = rewriter.rewrite(&mut bearer_only, "api.example.com", Some(&active("a", "secret")));
    assert!(matches!(decision.action, RewriteAction::Rewritten { ref rule_id, .. } if rule_id == "bearer"));
    assert_eq!(bearer_only.header("authorization"), Some("Bearer secret"));
}

#[test]
fn host_patterns_normalize_case_and_trailing_dots() {
    assert!(HostPattern::Exact("app.warp.dev".to_string()).matches("APP.Warp.dev."));
    assert!(!HostPattern::Exact("app.warp.dev".to_string()).matches("x.app.warp.dev"));
    assert!(HostPattern::Domain("warp.dev".to_string()).matches("app.warp.dev"));
    assert!(HostPattern::Domain("warp.dev".to_string()).matches("warp.dev"));
    assert!(!HostPattern::Domain("warp.dev".to_string()).matches("notwarp.dev"));
}

#[test]
fn config_supplies_the_blocked_hosts() {
    let config = swap_core::ProxyConfig {
        blocked_hosts: vec!["telemetry.example.com".to_string()],
        ..swap_core::ProxyConfig::default()
    };
    let rules = RuleTable::from_config(&config);
    assert!(rules.is_blocked("telemetry.example.com"));
    assert!(!rules.is_blocked("dataplane.rudderstack.com"));
    assert_eq!(rules.credential_rules, RuleTable::vendor_defaults().credential_rules);
}
