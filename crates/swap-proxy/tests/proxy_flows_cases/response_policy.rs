#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forbidden_multi_agent_response_blocks_the_active_account() {
    let mut upstream = start_upstream(|seen: &Seen| {
        if seen.head_text().starts_with("POST /ai/multi-agent") {
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\nlimits".to_vec()
        } else {
            ok_response(seen)
        }
    })
    .await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let blocked_request = format!(
        "POST /ai/multi-agent HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\nContent-Length: 2\r\n\r\n{{}}"
    );
    let (head, body) = exchange(&mut tls, blocked_request.as_bytes()).await;
    assert_eq!(status_of(&head), 403);
    assert_eq!(body, b"limits");
    upstream.next_request().await;

    assert_eq!(proxy.handle.coordinator().current(), None);
    let account = proxy.store.get("a").expect("account a");
    assert_eq!(account.status, AccountStatus::BlockedByUpstream);
    assert_eq!(proxy.store.active_account_id().expect("persisted selection"), None);
    let blocked = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::AccountBlocked)
        .expect("account blocked event");
    assert_eq!(blocked.attribute("account_id"), Some("a"));
    assert_eq!(blocked.attribute("selection_cleared"), Some("true"));
    assert!(proxy.handle.coordinator().switch_to("a").is_err());

    let follow_up = format!(
        "GET / HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n\r\n"
    );
    exchange(&mut tls, follow_up.as_bytes()).await;
    let seen = upstream.next_request().await;
    assert_eq!(
        seen.header("authorization").as_deref(),
        Some("Bearer client-token")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cloud_objects_response_is_replaced_with_the_local_settings_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings_path = dir.path().join("user_settings.json");
    std::fs::write(&settings_path, br#"{"objects":["first"]}"#).expect("write settings");

    let mut upstream = start_upstream(|seen: &Seen| {
        if seen.head_text().contains("GetUpdatedCloudObjects") {
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: identity\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                .to_vec()
        } else {
            ok_response(seen)
        }
    })
    .await;
    let proxy = start_proxy(
        test_config(),
        loopback_policy(UserSettings::from_path(&settings_path)),
    )
    .await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let fetch = format!(
        "POST /graphql/v2?op=GetUpdatedCloudObjects HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\nContent-Length: 2\r\n\r\n{{}}"
    );

    let (head, body) = exchange(&mut tls, fetch.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, br#"{"objects":["first"]}"#);
    assert_eq!(header_value(&head, "transfer-encoding"), None);
    assert_eq!(header_value(&head, "content-encoding"), None);
    assert_eq!(
        header_value(&head, "content-type").as_deref(),
        Some("application/json")
    );
    upstream.next_request().await;

    std::fs::write(&settings_path, br#"{"objects":["first","second"]}"#).expect("rewrite settings");
    let create = format!(
        "POST /graphql/v2?op=CreateGenericStringObject HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\nContent-Length: 2\r\n\r\n{{}}"
    );
    let (head, body) = exchange(&mut tls, create.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"ok");
    upstream.next_request().await;

    let (_, body) = exchange(&mut tls, fetch.as_bytes()).await;
    assert_eq!(body, br#"{"objects":["first","second"]}"#);
    assert_eq!(proxy.handle.metrics().bodies_replaced, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthorized_response_is_forwarded_unchanged() {
    let mut upstream = start_upstream(|_: &Seen| {
        b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 7\r\n\r\nexpired".to_vec()
    })
    .await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET /graphql/v2?op=GetUser HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n\r\n"
    );
    let (head, body) = exchange(&mut tls, request.as_bytes()).await;
    upstream.next_request().await;

    assert_eq!(status_of(&head), 401);
    assert_eq!(body, b"expired");
    assert_eq!(proxy.handle.coordinator().current().as_deref(), Some("a"));
    assert_eq!(
        proxy.store.get("a").expect("account a").status,
        AccountStatus::ActiveCandidate
    );
}
