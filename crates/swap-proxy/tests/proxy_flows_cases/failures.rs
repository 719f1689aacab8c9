#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_is_answered_locally_and_closes_the_connection() {
    let upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let (head, _) = exchange(&mut tls, b"BROKEN\r\n\r\n").await;

    assert_eq!(status_of(&head), 400);
    assert_eq!(header_value(&head, "connection").as_deref(), Some("close"));
    assert_eq!(proxy.sink.count(EventType::MalformedRequest), 1);
    assert_eq!(upstream.accepts(), 0);

    wait_for_event(&proxy.sink, EventType::StreamClosed, 1).await;
    let closed = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::StreamClosed)
        .expect("stream closed event");
    assert_eq!(closed.attribute("reason_code"), Some("malformed_request"));
    assert_eq!(proxy.handle.metrics().malformed_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_upstream_is_retried_once_then_answered_with_502() {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind throwaway listener");
        listener.local_addr().expect("throwaway addr").port()
    };
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{closed_port}");
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!("GET / HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    let (head, _) = exchange(&mut tls, request.as_bytes()).await;

    assert_eq!(status_of(&head), 502);
    assert_eq!(proxy.sink.count(EventType::UpstreamRetry), 1);
    assert_eq!(proxy.sink.count(EventType::UpstreamFailed), 1);
    let failed = proxy
        .sink
        .snapshot()
        .into_iter()
        .find(|event| event.kind == EventType::UpstreamFailed)
        .expect("upstream failed event");
    assert_eq!(failed.attribute("status_code"), Some("502"));

    wait_for_event(&proxy.sink, EventType::StreamClosed, 1).await;
    let metrics = proxy.handle.metrics();
    assert_eq!(metrics.upstream_retries, 1);
    assert_eq!(metrics.upstream_failures, 1);
    assert_eq!(metrics.active_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_host_gets_204_without_an_upstream_connection() {
    let upstream = start_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("localhost:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "localhost").await;
    let request = format!(
        "POST /v1/batch HTTP/1.1\r\nHost: {authority}\r\nContent-Length: 7\r\n\r\n{{\"a\":1}}"
    );

    for _ in 0..2 {
        let (head, body) = exchange(&mut tls, request.as_bytes()).await;
        assert_eq!(status_of(&head), 204);
        assert_eq!(header_value(&head, "content-length"), None);
        assert!(body.is_empty());
    }

    assert_eq!(upstream.accepts(), 0);
    assert_eq!(proxy.handle.metrics().local_responses, 2);
    assert_eq!(proxy.handle.metrics().credential_substitutions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_connect_heads_are_rejected() {
    let config = ProxyConfig {
        max_connect_head_bytes: 256,
        ..test_config()
    };
    let proxy = start_proxy(config, loopback_policy(UserSettings::disabled())).await;

    let mut garbage = TcpStream::connect(proxy.addr()).await.expect("connect proxy");
    garbage
        .write_all(b"GARBAGE\r\n\r\n")
        .await
        .expect("write garbage");
    let head = read_head_exact(&mut garbage).await;
    assert_eq!(status_of(&head), 400);

    let mut oversized = TcpStream::connect(proxy.addr()).await.expect("connect proxy");
    let mut head_bytes = b"CONNECT 127.0.0.1:443 HTTP/1.1\r\nX-Pad: ".to_vec();
    head_bytes.resize(257, b'a');
    oversized.write_all(&head_bytes).await.expect("write oversized");
    let head = read_head_exact(&mut oversized).await;
    assert_eq!(status_of(&head), 431);

    wait_for_event(&proxy.sink, EventType::StreamClosed, 2).await;
    let codes = proxy
        .sink
        .snapshot()
        .into_iter()
        .filter(|event| event.kind == EventType::ConnectParseFailed)
        .filter_map(|event| event.attribute("parse_error_code").map(str::to_string))
        .collect::<Vec<_>>();
    assert_eq!(codes.len(), 2);
    assert!(codes.contains(&"header_too_large".to_string()));
    assert_eq!(proxy.sink.count(EventType::TunnelOpened), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kept_upstream_closed_while_idle_is_replaced_for_the_next_request() {
    let mut upstream = start_single_response_upstream(ok_response).await;
    let proxy = start_proxy(test_config(), loopback_policy(UserSettings::disabled())).await;
    proxy.handle.coordinator().switch_to("a").expect("switch to a");

    let authority = format!("127.0.0.1:{}", upstream.addr.port());
    let mut tls = open_tls(proxy.addr(), &authority, "127.0.0.1").await;
    let request = format!(
        "GET /v1/models HTTP/1.1\r\nHost: {authority}\r\nAuthorization: Bearer client-token\r\n\r\n"
    );

    let (head, body) = exchange(&mut tls, request.as_bytes()).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"ok");
    upstream.next_request().await;

    // Give the upstream time to close the connection the proxy keeps.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (head, body) = exchange(&mut tls, request.as_bytes()).await;
    assert_eq!(status_of(&head), 200, "second answer: {head:?}");
    assert_eq!(body, b"ok");
    let second = upstream.next_request().await;
    assert_eq!(
        second.header("authorization").as_deref(),
        Some("Bearer token-a")
    );

    assert_eq!(upstream.accepts(), 2);
    assert_eq!(proxy.sink.count(EventType::UpstreamFailed), 0);
    assert_eq!(proxy.handle.metrics().upstream_failures, 0);
}
