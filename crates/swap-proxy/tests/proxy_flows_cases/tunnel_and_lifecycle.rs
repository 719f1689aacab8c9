#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passthrough_host_is_tunneled_without_termination() {
    let echo = start_echo().await;
    let config = ProxyConfig {
        passthrough_hosts: vec!["127.0.0.1".to_string()],
        ..test_config()
    };
    let proxy = start_proxy(config, loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let (mut tcp, head) = send_connect(proxy.addr(), &format!("127.0.0.1:{}", echo.port())).await;
    assert_eq!(status_of(&head), 200);

    let payload = b"\x16\x03\x01 not really a client hello, Authorization: Bearer client-token";
    tcp.write_all(payload).await.expect("write through tunnel");
    let mut echoed = vec![0_u8; payload.len()];
    tcp.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(echoed, payload);
    drop(tcp);

    wait_for_event(&proxy.sink, EventType::StreamClosed, 1).await;
    let events = proxy.sink.snapshot();
    let opened = events
        .iter()
        .find(|event| event.kind == EventType::TunnelOpened)
        .expect("tunnel opened event");
    assert_eq!(opened.attribute("route"), Some("passthrough"));
    let closed = events
        .iter()
        .find(|event| event.kind == EventType::StreamClosed)
        .expect("stream closed event");
    assert_eq!(closed.attribute("reason_code"), Some("relay_eof"));
    let expected_bytes = payload.len().to_string();
    assert_eq!(
        closed.attribute("bytes_from_client"),
        Some(expected_bytes.as_str())
    );
    assert_eq!(proxy.sink.count(EventType::TlsHandshakeSucceeded), 0);
    assert_eq!(proxy.handle.metrics().credential_substitutions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaf_certificate_follows_the_requested_server_name() {
    let upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let tls = open_tls(proxy.addr(), &authority, "app.warp.dev").await;
    let certificates = tls
        .get_ref()
        .1
        .peer_certificates()
        .expect("peer certificates");
    let (_, leaf) = x509_parser::parse_x509_certificate(certificates[0].as_ref()).expect("parse leaf");
    let san = leaf
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let dns_names = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            x509_parser::extensions::GeneralName::DNSName(value) => Some(value.to_string()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(dns_names, vec!["app.warp.dev".to_string()]);

    let (_, issuer) = x509_parser::parse_x509_certificate(
        proxy.handle.ca().ca_certificate_der().as_ref(),
    )
    .expect("parse root");
    assert_eq!(leaf.issuer().to_string(), issuer.subject().to_string());

    wait_for_event(&proxy.sink, EventType::TlsHandshakeSucceeded, 1).await;
    let succeeded = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::TlsHandshakeSucceeded)
        .expect("handshake event");
    assert_eq!(succeeded.attribute("leaf_host"), Some("app.warp.dev"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn selection_persisted_elsewhere_is_picked_up() {
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    assert_eq!(proxy.handle.coordinator().current(), None);

    proxy
        .store
        .set_active_account_id(Some("b"))
        .expect("persist selection");
    for _ in 0..100 {
        if proxy.handle.coordinator().current().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(proxy.handle.coordinator().current().as_deref(), Some("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_flushes_usage_counters() {
    let mut upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n\r\n"
    );
    exchange(&mut tls, request.as_bytes()).await;
    upstream.next_request().await;

    let proxy_addr = proxy.addr();
    let store = proxy.store.clone();
    proxy
        .handle
        .shutdown(Duration::from_secs(5))
        .await
        .expect("shutdown");

    let account = store.get("a").expect("account a");
    assert_eq!(account.usage.requests_served, 1);
    assert!(account.usage.last_used_at_ms.is_some());
    assert!(TcpStream::connect(proxy_addr).await.is_err());
}
