#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_account_token_replaces_client_token_and_follows_switches() {
    let mut upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET /graphql/v2?op=GetUser HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n{EXPERIMENT_ID_HEADER}: fixed\r\n\r\n"
    );

    let (head, body) = exchange(&mut tls, request.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"ok");
    let first = upstream.next_request().await;
    assert_eq!(first.header("authorization").as_deref(), Some("Bearer token-a"));
    let experiment = first
        .header(EXPERIMENT_ID_HEADER)
        .expect("experiment id header");
    assert_ne!(experiment, "fixed");
    assert_eq!(experiment.len(), 36);

    proxy.handle.coordinator().switch_to("b").expect("switch to b");
    let (head, _) = exchange(&mut tls, request.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    let second = upstream.next_request().await;
    assert_eq!(second.header("authorization").as_deref(), Some("Bearer token-b"));
    assert_ne!(second.header(EXPERIMENT_ID_HEADER), Some(experiment));

    assert_eq!(upstream.accepts(), 1, "upstream connection is reused");
    let metrics = proxy.handle.metrics();
    assert_eq!(metrics.credential_substitutions, 2);
    assert_eq!(metrics.pass_throughs, 0);
    let substituted = proxy
        .sink
        .snapshot()
        .into_iter()
        .filter(|event| event.kind == EventType::CredentialSubstituted)
        .map(|event| event.attribute("account_id").map(str::to_string))
        .collect::<Vec<_>>();
    assert_eq!(
        substituted,
        vec![Some("a".to_string()), Some("b".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_active_account_request_head_is_forwarded_byte_for_byte() {
    let mut upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    assert_eq!(proxy.handle.coordinator().current(), None);

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: {authority}\r\nauthorization:   Bearer client-token\r\nX-Odd-Case: Value\r\nContent-Length: 5\r\n\r\nhello"
    );

    let (head, _) = exchange(&mut tls, request.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    let seen = upstream.next_request().await;
    assert_eq!(seen.head, &request.as_bytes()[..request.len() - 5]);
    assert_eq!(seen.body, b"hello");
    assert_eq!(proxy.handle.metrics().pass_throughs, 1);
    let passed = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::RequestPassedThrough)
        .expect("pass-through event");
    assert_eq!(passed.attribute("reason"), Some("no_active_account"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_the_active_account_stops_substitution() {
    let mut upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    let coordinator = proxy.handle.coordinator();
    coordinator.switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n\r\n"
    );

    exchange(&mut tls, request.as_bytes()).await;
    let seen = upstream.next_request().await;
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer token-a"));

    coordinator.remove("a").expect("remove a");
    assert_eq!(coordinator.current(), None);
    assert!(proxy.store.get("a").is_err());

    exchange(&mut tls, request.as_bytes()).await;
    let seen = upstream.next_request().await;
    assert_eq!(
        seen.header("authorization").as_deref(),
        Some("Bearer client-token")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manager_requests_keep_their_own_credentials() {
    let mut upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET /auth/whoami HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer own-token\r\n{MANAGER_REQUEST_HEADER}: true\r\n\r\n"
    );

    exchange(&mut tls, request.as_bytes()).await;
    let seen = upstream.next_request().await;
    assert_eq!(seen.head_text(), request);
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer own-token"));
    assert_eq!(proxy.handle.metrics().credential_substitutions, 0);
    let passed = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::RequestPassedThrough)
        .expect("pass-through event");
    assert_eq!(passed.attribute("reason"), Some("identity_header"));
}

const CHUNKED_WITH_TRAILERS: &[u8] = b"HTTP/1.1 200 OK\r\nX-Odd-CASE:  kept as-is \r\ntransfer-encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n4;note=first\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: abc123\r\nx-lower-trailer: yes\r\n\r\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_response_with_trailers_reaches_the_client_unchanged() {
    let mut upstream = start_upstream(|_: &Seen| CHUNKED_WITH_TRAILERS.to_vec()).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!("GET /download HTTP/1.1\r\nHost: {authority}\r\nAccept: */*\r\n\r\n");

    for _ in 0..2 {
        tls.write_all(request.as_bytes()).await.expect("write request");
        tls.flush().await.expect("flush request");
        let mut received = vec![0_u8; CHUNKED_WITH_TRAILERS.len()];
        tokio::time::timeout(Duration::from_secs(5), tls.read_exact(&mut received))
            .await
            .expect("response in time")
            .expect("read response");
        assert_eq!(received, CHUNKED_WITH_TRAILERS);

        let seen = upstream.next_request().await;
        assert_eq!(seen.head_text(), request);
    }

    assert_eq!(upstream.accepts(), 1);
    assert_eq!(proxy.handle.metrics().credential_substitutions, 0);
    assert_eq!(proxy.handle.metrics().pass_throughs, 2);
}
