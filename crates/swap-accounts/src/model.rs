use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::AccountError;

pub const DEFAULT_LIMIT_INFO: &str = "Not updated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token expiry, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    /// Key passed to the token endpoint on refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at_ms: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    ActiveCandidate,
    Disabled,
    BlockedByUpstream,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveCandidate => "active_candidate",
            Self::Disabled => "disabled",
            Self::BlockedByUpstream => "blocked_by_upstream",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active_candidate" => Some(Self::ActiveCandidate),
            "disabled" => Some(Self::Disabled),
            "blocked_by_upstream" => Some(Self::BlockedByUpstream),
            _ => None,
        }
    }

    /// Only accounts in this state may become the active selection.
    pub fn is_selectable(self) -> bool {
        self == Self::ActiveCandidate
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests_served: u64,
    pub last_used_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub label: String,
    pub credentials: Credentials,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub status: AccountStatus,
    pub usage: Usage,
    pub limit_info: String,
}

impl Account {
    pub fn new(id: impl Into<String>, label: impl Into<String>, credentials: Credentials) -> Self {
        let now = now_unix_ms();
        Self {
            id: id.into(),
            label: label.into(),
            credentials,
            created_at_ms: now,
            updated_at_ms: now,
            status: AccountStatus::ActiveCandidate,
            usage: Usage::default(),
            limit_info: DEFAULT_LIMIT_INFO.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), AccountError> {
        if self.id.trim().is_empty() {
            return Err(AccountError::Validation("id must not be empty".to_string()));
        }
        if self.label.trim().is_empty() {
            return Err(AccountError::Validation(
                "label must not be empty".to_string(),
            ));
        }
        if self.credentials.access_token.trim().is_empty() {
            return Err(AccountError::Validation(
                "credentials.access_token must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds an account from the user record the vendor's identity provider
    /// hands out after sign-in (`email`, `apiKey`, `stsTokenManager`). The
    /// e-mail doubles as id and label.
    pub fn from_identity_record(json: &str) -> Result<Self, AccountError> {
        let record: IdentityRecord = serde_json::from_str(json)
            .map_err(|error| AccountError::Validation(format!("unreadable user record: {error}")))?;
        let credentials = Credentials {
            access_token: record.sts_token_manager.access_token,
            refresh_token: record.sts_token_manager.refresh_token,
            expires_at_ms: record
                .sts_token_manager
                .expiration_time
                .as_ref()
                .and_then(number_or_string),
            api_key: record.api_key,
        };
        let account = Self::new(record.email.clone(), record.email, credentials);
        account.validate()?;
        Ok(account)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    email: String,
    #[serde(default)]
    api_key: Option<String>,
    sts_token_manager: StsTokenManager,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StsTokenManager {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expiration_time: Option<serde_json::Value>,
}

/// Reads an integer that may be encoded as a JSON number or a decimal string.
pub(crate) fn number_or_string(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        serde_json::Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub fn now_unix_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as u64,
        Err(_) => 0,
    }
}
