//! Certificate authority for the intercepting proxy.
//!
//! A long-lived root is loaded from (or generated into) a pair of PEM files.
//! Leaf certificates are issued per host on demand and kept in a bounded LRU
//! cache; a cached leaf is only handed out while it stays valid for at least
//! the configured renewal window.

mod authority;
mod client;
mod errors;
mod leaf;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use authority::CertificateAuthority;
pub use client::build_upstream_client_config;
pub use errors::{CaInitError, CertificateError};
pub use leaf::LeafCertificate;

pub const CA_CERT_FILE_NAME: &str = "tokenswap-ca.pem";
pub const CA_KEY_FILE_NAME: &str = "tokenswap-ca-key.pem";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    /// Both paths set: persistent root. Both unset: in-memory root.
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub common_name: String,
    pub organization: String,
    pub validity_days: u32,
    pub leaf_cache_capacity: usize,
    pub leaf_validity: Duration,
    pub leaf_renew_before: Duration,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            common_name: "tokenswap Root CA".to_string(),
            organization: "tokenswap".to_string(),
            validity_days: 3650,
            leaf_cache_capacity: 1024,
            leaf_validity: Duration::from_secs(7 * 24 * 60 * 60),
            leaf_renew_before: Duration::from_secs(60 * 60),
        }
    }
}

impl CaConfig {
    /// Persistent root stored under `dir` with the default file names.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: Some(dir.join(CA_CERT_FILE_NAME)),
            key_path: Some(dir.join(CA_KEY_FILE_NAME)),
            ..Self::default()
        }
    }

    /// Maps the proxy configuration onto CA settings. Paths missing from the
    /// configuration fall back to `default_dir`.
    pub fn from_proxy_config(config: &swap_core::ProxyConfig, default_dir: &Path) -> Self {
        let (cert_path, key_path) = match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
            (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
            _ => (
                default_dir.join(CA_CERT_FILE_NAME),
                default_dir.join(CA_KEY_FILE_NAME),
            ),
        };
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            common_name: config.ca_common_name.clone(),
            organization: config.ca_organization.clone(),
            validity_days: config.ca_validity_days,
            leaf_cache_capacity: config.leaf_cert_cache_capacity,
            leaf_validity: Duration::from_secs(config.leaf_validity_seconds),
            leaf_renew_before: Duration::from_secs(config.leaf_renew_before_seconds),
        }
    }

    fn validate(&self) -> Result<(), CaInitError> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(CaInitError::InvalidConfig(
                "cert_path and key_path must either both be set or both be unset".to_string(),
            ));
        }
        if self.common_name.trim().is_empty() || self.organization.trim().is_empty() {
            return Err(CaInitError::InvalidConfig(
                "common_name and organization must not be empty".to_string(),
            ));
        }
        if self.validity_days == 0 || self.leaf_validity.is_zero() {
            return Err(CaInitError::InvalidConfig(
                "validity periods must be greater than zero".to_string(),
            ));
        }
        if self.leaf_renew_before >= self.leaf_validity {
            return Err(CaInitError::InvalidConfig(
                "leaf_renew_before must be shorter than leaf_validity".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub expired_reissues: u64,
}

/// Crypto provider shared by every rustls config built here.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use rustls::pki_types::CertificateDer;
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::{CaConfig, CaInitError, CertificateAuthority, CertificateError};

    include!("tests_ca_persistence.rs");
    include!("tests_leaf_cache.rs");
}
