use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectParseMode {
    Strict,
    Lenient,
}

impl Default for ConnectParseMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Runtime configuration of the proxy. Every field has a default so a
/// partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub connect_parse_mode: ConnectParseMode,
    pub max_connect_head_bytes: usize,
    pub max_http_head_bytes: usize,

    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub ca_validity_days: u32,
    pub leaf_cert_cache_capacity: usize,
    pub leaf_validity_seconds: u64,
    pub leaf_renew_before_seconds: u64,

    /// Hosts that are always tunneled without interception.
    pub passthrough_hosts: Vec<String>,
    /// Hosts that are intercepted. Consulted only when `passthrough_unlisted`
    /// is set.
    pub intercept_hosts: Vec<String>,
    pub passthrough_unlisted: bool,
    /// Hosts answered locally with `204 No Content`.
    pub blocked_hosts: Vec<String>,

    pub upstream_connect_timeout_ms: u64,
    pub upstream_retry_delay_ms: u64,
    pub upstream_tls_insecure_skip_verify: bool,

    pub accounts_db_path: Option<String>,
    pub user_settings_path: Option<String>,
    pub usage_flush_interval_ms: u64,

    pub token_refresh_enabled: bool,
    pub token_endpoint: String,
    pub token_check_interval_seconds: u64,
    pub token_refresh_margin_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8080,
            connect_parse_mode: ConnectParseMode::Strict,
            max_connect_head_bytes: 8 * 1024,
            max_http_head_bytes: 64 * 1024,
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "tokenswap Root CA".to_string(),
            ca_organization: "tokenswap".to_string(),
            ca_validity_days: 3650,
            leaf_cert_cache_capacity: 1024,
            leaf_validity_seconds: 7 * 24 * 60 * 60,
            leaf_renew_before_seconds: 60 * 60,
            passthrough_hosts: vec![
                "securetoken.googleapis.com".to_string(),
                ".googleapis.com".to_string(),
                ".gstatic.com".to_string(),
                ".google.com".to_string(),
            ],
            intercept_hosts: vec![
                "app.warp.dev".to_string(),
                ".dataplane.rudderstack.com".to_string(),
            ],
            passthrough_unlisted: true,
            blocked_hosts: vec![".dataplane.rudderstack.com".to_string()],
            upstream_connect_timeout_ms: 10_000,
            upstream_retry_delay_ms: 250,
            upstream_tls_insecure_skip_verify: false,
            accounts_db_path: None,
            user_settings_path: None,
            usage_flush_interval_ms: 2_000,
            token_refresh_enabled: true,
            token_endpoint: "https://securetoken.googleapis.com/v1/token".to_string(),
            token_check_interval_seconds: 30,
            token_refresh_margin_seconds: 60,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        require_non_zero(self.max_connect_head_bytes as u64, "max_connect_head_bytes")?;
        require_non_zero(self.max_http_head_bytes as u64, "max_http_head_bytes")?;
        require_non_zero(u64::from(self.ca_validity_days), "ca_validity_days")?;
        require_non_zero(
            self.leaf_cert_cache_capacity as u64,
            "leaf_cert_cache_capacity",
        )?;
        require_non_zero(self.leaf_validity_seconds, "leaf_validity_seconds")?;
        require_non_zero(self.upstream_connect_timeout_ms, "upstream_connect_timeout_ms")?;
        require_non_zero(self.usage_flush_interval_ms, "usage_flush_interval_ms")?;
        require_non_zero(
            self.token_check_interval_seconds,
            "token_check_interval_seconds",
        )?;
        if self.leaf_renew_before_seconds >= self.leaf_validity_seconds {
            return Err(ConfigError::RenewWindowTooLarge);
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(ConfigError::InvalidCaPathPair);
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(ConfigError::EmptyCaCommonName);
        }
        if self.ca_organization.trim().is_empty() {
            return Err(ConfigError::EmptyCaOrganization);
        }
        if self.token_refresh_enabled && self.token_endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyTokenEndpoint);
        }
        validate_host_list(&self.passthrough_hosts, "passthrough_hosts")?;
        validate_host_list(&self.intercept_hosts, "intercept_hosts")?;
        validate_host_list(&self.blocked_hosts, "blocked_hosts")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("leaf_renew_before_seconds must be smaller than leaf_validity_seconds")]
    RenewWindowTooLarge,
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("ca_common_name must not be empty")]
    EmptyCaCommonName,
    #[error("ca_organization must not be empty")]
    EmptyCaOrganization,
    #[error("token_endpoint must not be empty while token refresh is enabled")]
    EmptyTokenEndpoint,
    #[error("{field} contains an empty host entry")]
    EmptyHostEntry { field: &'static str },
}

fn require_non_zero(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroValue(field));
    }
    Ok(())
}

fn validate_host_list(hosts: &[String], field: &'static str) -> Result<(), ConfigError> {
    if hosts.iter().any(|host| host.trim().is_empty()) {
        return Err(ConfigError::EmptyHostEntry { field });
    }
    Ok(())
}
