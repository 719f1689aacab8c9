//! Access token refresh for the active account.
//!
//! `SecureTokenRefresher` speaks the identity provider's token endpoint.
//! `TokenKeeper` watches the active selection and refreshes its credentials
//! shortly before they expire, or immediately when the upstream rejects them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::model::{now_unix_ms, number_or_string, Credentials};
use crate::switch::SwitchCoordinator;
use crate::AccountError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("account has no refresh token")]
    MissingRefreshToken,
    #[error("account has no api key for the token endpoint")]
    MissingApiKey,
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint rejected refresh with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Store(#[from] AccountError),
    #[error("refresh task failed: {0}")]
    Task(String),
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync + std::fmt::Debug {
    async fn refresh(&self, credentials: &Credentials) -> Result<Credentials, RefreshError>;
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

/// Client for a `securetoken`-style endpoint:
/// `POST <endpoint>?key=<api_key>` with a JSON `refresh_token` grant.
#[derive(Debug, Clone)]
pub struct SecureTokenRefresher {
    client: reqwest::Client,
    endpoint: String,
}

impl SecureTokenRefresher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RefreshError> {
        // The proxy may be the system proxy; refresh must never loop through it.
        let client = reqwest::Client::builder()
            .no_proxy()
            .user_agent(concat!("tokenswap/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TokenRefresher for SecureTokenRefresher {
    async fn refresh(&self, credentials: &Credentials) -> Result<Credentials, RefreshError> {
        let refresh_token = credentials
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(RefreshError::MissingRefreshToken)?;
        let api_key = credentials
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(RefreshError::MissingApiKey)?;

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", api_key)])
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let payload: serde_json::Value = response.json().await?;
        credentials_from_response(credentials, &payload, now_unix_ms())
    }
}

/// Applies a token endpoint response to `previous`. A response without a
/// refresh token keeps the old one.
fn credentials_from_response(
    previous: &Credentials,
    payload: &serde_json::Value,
    now_ms: u64,
) -> Result<Credentials, RefreshError> {
    let access_token = payload
        .get("access_token")
        .or_else(|| payload.get("id_token"))
        .and_then(serde_json::Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| RefreshError::InvalidResponse("missing access_token".to_string()))?;
    let expires_in = payload
        .get("expires_in")
        .and_then(number_or_string)
        .ok_or_else(|| RefreshError::InvalidResponse("missing expires_in".to_string()))?;
    let refresh_token = payload
        .get("refresh_token")
        .and_then(serde_json::Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| previous.refresh_token.clone());

    Ok(Credentials {
        access_token: access_token.to_string(),
        refresh_token,
        expires_at_ms: Some(now_ms.saturating_add(expires_in.saturating_mul(1000))),
        api_key: previous.api_key.clone(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoActiveAccount,
    Fresh,
    Refreshed { account_id: String },
}

/// Keeps the active account's access token valid.
pub struct TokenKeeper {
    coordinator: Arc<SwitchCoordinator>,
    refresher: Arc<dyn TokenRefresher>,
    check_interval: Duration,
    margin: Duration,
    forced: Mutex<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for TokenKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenKeeper")
            .field("refresher", &self.refresher)
            .field("check_interval", &self.check_interval)
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

impl TokenKeeper {
    pub fn new(
        coordinator: Arc<SwitchCoordinator>,
        refresher: Arc<dyn TokenRefresher>,
        check_interval: Duration,
        margin: Duration,
    ) -> Self {
        Self {
            coordinator,
            refresher,
            check_interval,
            margin,
            forced: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Asks for an immediate refresh of `account_id`, regardless of expiry.
    /// Ignored if the account is no longer active when the keeper runs.
    pub fn request_refresh(&self, account_id: &str) {
        *self.forced.lock() = Some(account_id.to_string());
        self.notify.notify_one();
    }

    pub async fn refresh_active(&self) -> Result<RefreshOutcome, RefreshError> {
        let forced = self.forced.lock().take();
        let Some(snapshot) = self.coordinator.snapshot() else {
            return Ok(RefreshOutcome::NoActiveAccount);
        };
        let account_id = snapshot.account_id.clone();
        let forced = forced.as_deref() == Some(account_id.as_str());

        let store = self.coordinator.store().clone();
        let lookup_id = account_id.clone();
        let mut account = run_blocking(move || store.get(&lookup_id)).await?;
        if !forced && !needs_refresh(&account.credentials, now_unix_ms(), self.margin) {
            return Ok(RefreshOutcome::Fresh);
        }

        let refreshed = self.refresher.refresh(&account.credentials).await?;
        let store = self.coordinator.store().clone();
        let update_id = account_id.clone();
        let persisted = refreshed.clone();
        run_blocking(move || store.update_credentials(&update_id, &persisted)).await?;

        account.credentials = refreshed;
        let republished = self.coordinator.republish(&account);
        tracing::info!(
            account_id = %account_id,
            forced,
            republished,
            expires_at_ms = account.credentials.expires_at_ms,
            "refreshed account credentials"
        );
        Ok(RefreshOutcome::Refreshed { account_id })
    }

    /// Runs the keeper until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.notify.notified() => {}
                }
                if let Err(error) = self.refresh_active().await {
                    tracing::warn!(error = %error, "token refresh failed");
                }
            }
        })
    }
}

fn needs_refresh(credentials: &Credentials, now_ms: u64, margin: Duration) -> bool {
    match credentials.expires_at_ms {
        Some(expires_at_ms) => expires_at_ms.saturating_sub(now_ms) < margin.as_millis() as u64,
        None => false,
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, RefreshError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AccountError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|error| RefreshError::Task(error.to_string()))?
        .map_err(RefreshError::from)
}

#[cfg(test)]
mod tests {
    include!("tests_refresh.rs");
}
