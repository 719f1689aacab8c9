use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swap_accounts::{Account, AccountStatus, AccountStore, Credentials};
use swap_core::ProxyConfig;
use swap_observe::{EventType, VecEventSink};
use swap_proxy::{ProxyHandle, ProxyServerBuilder};
use swap_rewrite::{
    CredentialField, CredentialRule, HeaderRefresher, HostPattern, PathPattern, ResponsePolicy,
    RuleTable, UserSettings, EXPERIMENT_ID_HEADER, MANAGER_REQUEST_HEADER,
};
use swap_tls::{build_upstream_client_config, CaConfig, CertificateAuthority};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn test_config() -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        passthrough_hosts: Vec::new(),
        intercept_hosts: vec!["127.0.0.1".to_string(), "localhost".to_string()],
        blocked_hosts: vec!["localhost".to_string()],
        upstream_tls_insecure_skip_verify: true,
        upstream_connect_timeout_ms: 2_000,
        upstream_retry_delay_ms: 10,
        token_refresh_enabled: false,
        usage_flush_interval_ms: 50,
        ..ProxyConfig::default()
    }
}

/// Vendor-style rules applied to every host so the loopback upstream gets
/// the same treatment as the real one.
fn loopback_rules() -> RuleTable {
    RuleTable {
        blocked_hosts: vec!["localhost".to_string()],
        identity_headers: vec![(MANAGER_REQUEST_HEADER.to_string(), "true".to_string())],
        identity_rules: Vec::new(),
        credential_rules: vec![CredentialRule {
            id: "loopback-bearer".to_string(),
            host: HostPattern::Any,
            path: PathPattern::Any,
            field: CredentialField::AuthorizationBearer,
        }],
        header_refreshers: vec![HeaderRefresher {
            host: HostPattern::Any,
            header: EXPERIMENT_ID_HEADER.to_string(),
        }],
    }
}

fn loopback_policy(settings: UserSettings) -> ResponsePolicy {
    ResponsePolicy::new(Arc::new(settings))
        .with_vendor_host(HostPattern::Exact("127.0.0.1".to_string()))
}

fn seeded_store() -> AccountStore {
    let store = AccountStore::in_memory().expect("in-memory store");
    for (id, token) in [("a", "token-a"), ("b", "token-b")] {
        let account = Account::new(id, format!("account {id}"), Credentials::bearer(token));
        store.upsert(&account).expect("seed account");
    }
    store
}

struct TestProxy {
    handle: ProxyHandle,
    store: AccountStore,
    sink: VecEventSink,
}

impl TestProxy {
    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

async fn start_proxy(config: ProxyConfig, policy: ResponsePolicy) -> TestProxy {
    let store = seeded_store();
    let sink = VecEventSink::default();
    let ca = CertificateAuthority::ensure_root(CaConfig::default()).expect("in-memory root");
    let server = ProxyServerBuilder::new(config)
        .with_ca(Arc::new(ca))
        .with_account_store(store.clone())
        .with_rules(loopback_rules())
        .with_response_policy(policy)
        .with_event_sink(Arc::new(sink.clone()))
        .build()
        .expect("build proxy");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy listener");
    let handle = server.start(listener).expect("start proxy");
    TestProxy {
        handle,
        store,
        sink,
    }
}

/// One request as the fake upstream saw it.
#[derive(Debug)]
struct Seen {
    head: Vec<u8>,
    body: Vec<u8>,
}

impl Seen {
    fn head_text(&self) -> String {
        String::from_utf8_lossy(&self.head).to_string()
    }

    fn header(&self, name: &str) -> Option<String> {
        header_value(&self.head, name)
    }
}

struct FakeUpstream {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl FakeUpstream {
    async fn next_request(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("upstream request in time")
            .expect("upstream request")
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// TLS upstream on loopback. Every request is answered with what `respond`
/// returns for its head; connections are kept alive until the peer closes.
async fn start_upstream<F>(respond: F) -> FakeUpstream
where
    F: Fn(&Seen) -> Vec<u8> + Send + Sync + 'static,
{
    serve_upstream(respond, false).await
}

/// Like [`start_upstream`], but each connection is closed right after its
/// first response without announcing it in the response headers.
async fn start_single_response_upstream<F>(respond: F) -> FakeUpstream
where
    F: Fn(&Seen) -> Vec<u8> + Send + Sync + 'static,
{
    serve_upstream(respond, true).await
}

async fn serve_upstream<F>(respond: F, close_after_response: bool) -> FakeUpstream
where
    F: Fn(&Seen) -> Vec<u8> + Send + Sync + 'static,
{
    let ca = CertificateAuthority::ensure_root(CaConfig::default()).expect("upstream root");
    let leaf = ca.leaf_for("127.0.0.1").expect("upstream leaf");
    let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let accepts = Arc::new(AtomicUsize::new(0));
    let (tx, seen) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    let accept_count = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            accept_count.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                loop {
                    let head = read_head_exact(&mut tls).await;
                    if head.is_empty() {
                        return;
                    }
                    let body = read_sized_body(&mut tls, &head).await;
                    let seen = Seen { head, body };
                    let response = respond(&seen);
                    let _ = tx.send(seen);
                    if tls.write_all(&response).await.is_err() || tls.flush().await.is_err() {
                        return;
                    }
                    if close_after_response {
                        let _ = tls.shutdown().await;
                        return;
                    }
                }
            });
        }
    });

    FakeUpstream {
        addr,
        accepts,
        seen,
    }
}

fn ok_response(_: &Seen) -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
}

/// Plain TCP echo server for tunnel checks.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Reads byte by byte up to and including the blank line, so nothing of the
/// body is consumed. Returns an empty vector on a clean close.
async fn read_head_exact<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut byte = [0_u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) => break,
            Ok(_) => data.push(byte[0]),
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) => panic!("read head: {error}"),
        }
    }
    data
}

async fn read_sized_body<S: AsyncRead + Unpin>(stream: &mut S, head: &[u8]) -> Vec<u8> {
    let length = header_value(head, "content-length")
        .map(|value| value.parse::<usize>().expect("valid content-length"))
        .unwrap_or(0);
    let mut body = vec![0_u8; length];
    stream.read_exact(&mut body).await.expect("read body");
    body
}

fn header_value(head: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    text.split("\r\n").skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

fn status_of(head: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(head);
    text.split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("no status in {text:?}"))
}

async fn send_connect(proxy: SocketAddr, authority: &str) -> (TcpStream, Vec<u8>) {
    let mut tcp = TcpStream::connect(proxy).await.expect("connect proxy");
    let connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    tcp.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let head = read_head_exact(&mut tcp).await;
    (tcp, head)
}

/// Opens an intercepted TLS session through the proxy. `sni` is the name
/// the client asks for.
async fn open_tls(proxy: SocketAddr, authority: &str, sni: &str) -> TlsStream<TcpStream> {
    let (tcp, head) = send_connect(proxy, authority).await;
    assert_eq!(status_of(&head), 200, "CONNECT answer: {head:?}");
    let connector = TlsConnector::from(build_upstream_client_config(true).expect("client config"));
    let server_name = ServerName::try_from(sni.to_string()).expect("server name");
    connector
        .connect(server_name, tcp)
        .await
        .expect("TLS through proxy")
}

/// Sends `request` and reads one `Content-Length` response.
async fn exchange<S>(stream: &mut S, request: &[u8]) -> (Vec<u8>, Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.expect("write request");
    stream.flush().await.expect("flush request");
    let head = read_head_exact(stream).await;
    assert!(!head.is_empty(), "proxy closed without a response");
    let body = read_sized_body(stream, &head).await;
    (head, body)
}

async fn wait_for_event(sink: &VecEventSink, kind: EventType, count: usize) {
    for _ in 0..100 {
        if sink.count(kind) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} {kind:?} events, saw {}", sink.count(kind));
}

include!("proxy_flows_cases/substitution.rs");
include!("proxy_flows_cases/failures.rs");
include!("proxy_flows_cases/response_policy.rs");
include!("proxy_flows_cases/tunnel_and_lifecycle.rs");
