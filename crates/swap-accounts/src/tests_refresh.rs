use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::{
    credentials_from_response, needs_refresh, RefreshError, RefreshOutcome, SecureTokenRefresher,
    TokenKeeper, TokenRefresher,
};
use crate::model::{now_unix_ms, Account, Credentials};
use crate::store::AccountStore;
use crate::switch::SwitchCoordinator;

#[derive(Debug, Default)]
struct CountingRefresher {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, credentials: &Credentials) -> Result<Credentials, RefreshError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            access_token: format!("refreshed-{call}"),
            refresh_token: credentials.refresh_token.clone(),
            expires_at_ms: Some(now_unix_ms() + 3_600_000),
            api_key: credentials.api_key.clone(),
        })
    }
}

fn account_expiring_in(id: &str, ms_from_now: u64) -> Account {
    Account::new(
        id,
        format!("{id}@example.com"),
        Credentials {
            access_token: format!("{id}-token"),
            refresh_token: Some(format!("{id}-refresh")),
            expires_at_ms: Some(now_unix_ms() + ms_from_now),
            api_key: Some("api-key".to_string()),
        },
    )
}

fn keeper_with(
    accounts: &[Account],
    active: Option<&str>,
) -> (Arc<SwitchCoordinator>, Arc<CountingRefresher>, TokenKeeper) {
    let store = AccountStore::in_memory().expect("store");
    for account in accounts {
        store.upsert(account).expect("upsert");
    }
    let coordinator = Arc::new(SwitchCoordinator::new(store));
    if let Some(id) = active {
        coordinator.switch_to(id).expect("switch");
    }
    let refresher = Arc::new(CountingRefresher::default());
    let keeper = TokenKeeper::new(
        Arc::clone(&coordinator),
        refresher.clone(),
        Duration::from_secs(30),
        Duration::from_secs(60),
    );
    (coordinator, refresher, keeper)
}

#[test]
fn refresh_window_uses_margin_before_expiry() {
    let now = 1_000_000;
    let margin = Duration::from_secs(60);
    let mut credentials = Credentials::bearer("t");
    assert!(!needs_refresh(&credentials, now, margin));
    credentials.expires_at_ms = Some(now + 59_000);
    assert!(needs_refresh(&credentials, now, margin));
    credentials.expires_at_ms = Some(now + 61_000);
    assert!(!needs_refresh(&credentials, now, margin));
    credentials.expires_at_ms = Some(now - 1);
    assert!(needs_refresh(&credentials, now, margin));
}

#[test]
fn response_parsing_accepts_string_expiry_and_keeps_refresh_token() {
    let previous = Credentials {
        access_token: "old".to_string(),
        refresh_token: Some("keep-me".to_string()),
        expires_at_ms: None,
        api_key: Some("k".to_string()),
    };
    let payload = serde_json::json!({"access_token": "new", "expires_in": "3600"});
    let updated = credentials_from_response(&previous, &payload, 10_000).expect("parse");
    assert_eq!(updated.access_token, "new");
    assert_eq!(updated.refresh_token.as_deref(), Some("keep-me"));
    assert_eq!(updated.expires_at_ms, Some(10_000 + 3_600_000));
    assert_eq!(updated.api_key.as_deref(), Some("k"));

    let missing = serde_json::json!({"expires_in": 3600});
    assert!(matches!(
        credentials_from_response(&previous, &missing, 0),
        Err(RefreshError::InvalidResponse(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keeper_refreshes_expiring_active_account_and_republishes() {
    let (coordinator, refresher, keeper) =
        keeper_with(&[account_expiring_in("a", 10_000)], Some("a"));

    let outcome = keeper.refresh_active().await.expect("refresh");
    assert_eq!(
        outcome,
        RefreshOutcome::Refreshed {
            account_id: "a".to_string()
        }
    );
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    let snapshot = coordinator.snapshot().expect("active");
    assert_eq!(snapshot.access_token, "refreshed-1");
    let stored = coordinator.store().get("a").expect("get");
    assert_eq!(stored.credentials.access_token, "refreshed-1");
    assert_eq!(stored.credentials.refresh_token.as_deref(), Some("a-refresh"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keeper_leaves_fresh_tokens_alone_until_forced() {
    let (coordinator, refresher, keeper) =
        keeper_with(&[account_expiring_in("a", 3_600_000)], Some("a"));

    assert_eq!(keeper.refresh_active().await.expect("check"), RefreshOutcome::Fresh);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);

    keeper.request_refresh("a");
    assert!(matches!(
        keeper.refresh_active().await.expect("forced"),
        RefreshOutcome::Refreshed { .. }
    ));
    assert_eq!(coordinator.snapshot().expect("active").access_token, "refreshed-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_refresh_for_a_replaced_account_is_dropped() {
    let (coordinator, refresher, keeper) = keeper_with(
        &[
            account_expiring_in("a", 3_600_000),
            account_expiring_in("b", 3_600_000),
        ],
        Some("a"),
    );
    keeper.request_refresh("a");
    coordinator.switch_to("b").expect("switch");

    assert_eq!(keeper.refresh_active().await.expect("check"), RefreshOutcome::Fresh);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keeper_without_selection_does_nothing() {
    let (_coordinator, refresher, keeper) = keeper_with(&[account_expiring_in("a", 0)], None);
    assert_eq!(
        keeper.refresh_active().await.expect("check"),
        RefreshOutcome::NoActiveAccount
    );
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = stream.read(&mut chunk).await.expect("read");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        let response = format!(
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.expect("write");
        String::from_utf8_lossy(&request).to_string()
    });
    (format!("http://{addr}/v1/token"), task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn secure_token_refresher_posts_refresh_grant() {
    let (endpoint, server) = serve_once(
        "HTTP/1.1 200 OK",
        r#"{"access_token":"fresh","refresh_token":"rotated","expires_in":"3600"}"#,
    )
    .await;
    let refresher = SecureTokenRefresher::new(endpoint).expect("client");
    let previous = account_expiring_in("a", 0).credentials;

    let before = now_unix_ms();
    let updated = refresher.refresh(&previous).await.expect("refresh");
    assert_eq!(updated.access_token, "fresh");
    assert_eq!(updated.refresh_token.as_deref(), Some("rotated"));
    assert!(updated.expires_at_ms.expect("expiry") >= before + 3_600_000);

    let request = server.await.expect("server");
    assert!(request.starts_with("POST /v1/token?key=api-key HTTP/1.1"));
    assert!(request.contains(r#""grant_type":"refresh_token""#));
    assert!(request.contains(r#""refresh_token":"a-refresh""#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn secure_token_refresher_reports_rejection() {
    let (endpoint, server) = serve_once(
        "HTTP/1.1 400 Bad Request",
        r#"{"error":{"message":"TOKEN_EXPIRED"}}"#,
    )
    .await;
    let refresher = SecureTokenRefresher::new(endpoint).expect("client");
    let error = refresher
        .refresh(&account_expiring_in("a", 0).credentials)
        .await
        .expect_err("rejected");
    match error {
        RefreshError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("TOKEN_EXPIRED"));
        }
        other => panic!("unexpected error: {other}"),
    }
    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn secure_token_refresher_requires_refresh_material() {
    let refresher = SecureTokenRefresher::new("http://127.0.0.1:9/v1/token").expect("client");
    let error = refresher
        .refresh(&Credentials::bearer("t"))
        .await
        .expect_err("no refresh token");
    assert!(matches!(error, RefreshError::MissingRefreshToken));
}
