use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use swap_accounts::{
    AccountStore, SecureTokenRefresher, SwitchCoordinator, TokenKeeper, TokenRefresher,
};
use swap_core::ProxyConfig;
use swap_observe::{EventSink, FanoutEventSink, TracingEventSink};
use swap_rewrite::{CredentialRewriter, ResponsePolicy, RuleTable, UserSettings};
use swap_tls::{build_upstream_client_config, CaConfig, CertificateAuthority};

use crate::errors::ProxyError;
use crate::metrics::{MetricsEventSink, ProxyMetricsStore};
use crate::server::{ProxyRuntime, ProxyServer};
use crate::upstream::UpstreamConnector;

pub const ACCOUNTS_DB_FILE_NAME: &str = "accounts.db";
pub const USER_SETTINGS_FILE_NAME: &str = "user_settings.json";
pub const CA_DIR_NAME: &str = "ca";

/// Assembles a [`ProxyServer`]. Components not supplied explicitly are
/// created from the configuration, with files placed under the data
/// directory.
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    data_dir: Option<PathBuf>,
    ca: Option<Arc<CertificateAuthority>>,
    store: Option<AccountStore>,
    rules: Option<RuleTable>,
    response_policy: Option<ResponsePolicy>,
    event_sink: Option<Arc<dyn EventSink>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            data_dir: None,
            ca: None,
            store: None,
            rules: None,
            response_policy: None,
            event_sink: None,
            refresher: None,
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn with_account_store(mut self, store: AccountStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_response_policy(mut self, policy: ResponsePolicy) -> Self {
        self.response_policy = Some(policy);
        self
    }

    /// Receives every flow event in addition to the built-in logging and
    /// metrics sinks.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn build(self) -> Result<ProxyServer, ProxyError> {
        self.config.validate()?;
        let config = self.config;
        let data_dir = self.data_dir;

        let ca = match self.ca {
            Some(ca) => ca,
            None => {
                let ca_dir = require_data_dir(&data_dir, "the root CA")?.join(CA_DIR_NAME);
                let ca_config = CaConfig::from_proxy_config(&config, &ca_dir);
                Arc::new(CertificateAuthority::ensure_root(ca_config)?)
            }
        };

        let store = match self.store {
            Some(store) => store,
            None => match &config.accounts_db_path {
                Some(path) => AccountStore::open(path)?,
                None => AccountStore::open(
                    require_data_dir(&data_dir, "the account store")?.join(ACCOUNTS_DB_FILE_NAME),
                )?,
            },
        };
        let coordinator = Arc::new(SwitchCoordinator::restored(store.clone())?);

        let rules = self
            .rules
            .unwrap_or_else(|| RuleTable::from_config(&config));
        let rewriter = CredentialRewriter::new(rules, Arc::new(store.clone()));

        let response_policy = match self.response_policy {
            Some(policy) => policy,
            None => {
                let settings = match (&config.user_settings_path, data_dir.as_deref()) {
                    (Some(path), _) => UserSettings::from_path(path),
                    (None, Some(dir)) => UserSettings::from_path(dir.join(USER_SETTINGS_FILE_NAME)),
                    (None, None) => UserSettings::disabled(),
                };
                ResponsePolicy::new(Arc::new(settings))
            }
        };

        let keeper = if config.token_refresh_enabled {
            let refresher = match self.refresher {
                Some(refresher) => refresher,
                None => Arc::new(SecureTokenRefresher::new(config.token_endpoint.clone())?)
                    as Arc<dyn TokenRefresher>,
            };
            Some(Arc::new(TokenKeeper::new(
                Arc::clone(&coordinator),
                refresher,
                Duration::from_secs(config.token_check_interval_seconds),
                Duration::from_secs(config.token_refresh_margin_seconds),
            )))
        } else {
            None
        };

        let upstream = UpstreamConnector::new(
            build_upstream_client_config(config.upstream_tls_insecure_skip_verify)?,
            Duration::from_millis(config.upstream_connect_timeout_ms),
            Duration::from_millis(config.upstream_retry_delay_ms),
        );

        let metrics = Arc::new(ProxyMetricsStore::default());
        let mut sink = FanoutEventSink::new()
            .with(Arc::new(TracingEventSink))
            .with(Arc::new(MetricsEventSink::new(Arc::clone(&metrics))));
        if let Some(extra) = self.event_sink {
            sink = sink.with(extra);
        }

        let runtime = ProxyRuntime::new(
            config,
            ca,
            coordinator,
            rewriter,
            response_policy,
            keeper,
            upstream,
            Arc::new(sink),
        );
        Ok(ProxyServer::new(Arc::new(runtime), store, metrics))
    }
}

fn require_data_dir<'a>(data_dir: &'a Option<PathBuf>, what: &str) -> Result<&'a Path, ProxyError> {
    data_dir
        .as_deref()
        .ok_or_else(|| ProxyError::InvalidConfig(format!("{what} needs a data directory")))
}
