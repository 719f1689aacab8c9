use thiserror::Error;

/// Failure of one request/response exchange. Ends the client connection
/// only.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The upstream could not be reached or dropped the exchange. `status`
    /// is what the client is answered with.
    #[error("upstream {authority} failed: {detail}")]
    Upstream {
        authority: String,
        status: u16,
        detail: String,
    },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl ExchangeError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::MalformedRequest(_) => 400,
        }
    }
}

/// Startup and runtime failures of the proxy as a whole.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] swap_core::ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    ConfigFile(#[from] crate::config_file::ConfigFileError),
    #[error("certificate authority initialization failed: {0}")]
    CaInit(#[from] swap_tls::CaInitError),
    #[error("account store error: {0}")]
    Accounts(#[from] swap_accounts::AccountError),
    #[error("token refresher setup failed: {0}")]
    Refresh(#[from] swap_accounts::RefreshError),
    #[error("upstream TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
