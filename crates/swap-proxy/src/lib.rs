//! The tokenswap proxy: accepts `CONNECT` tunnels, terminates TLS for the
//! vendor hosts with leaves from the local root CA, and swaps the outgoing
//! credential for the one of the active account.
//!
//! Certificate-pinned identity hosts and unlisted hosts are tunneled
//! untouched. Every connection runs in its own task and takes one snapshot
//! of the account selection per exchange.

mod builder;
mod close_codes;
mod config_file;
mod errors;
mod flow;
mod metrics;
mod relay;
mod server;
mod upstream;

pub use builder::{
    ProxyServerBuilder, ACCOUNTS_DB_FILE_NAME, CA_DIR_NAME, USER_SETTINGS_FILE_NAME,
};
pub use config_file::{default_data_dir, load_config_file, ConfigFileError};
pub use errors::{ExchangeError, ProxyError};
pub use metrics::ProxyMetrics;
pub use server::{ProxyHandle, ProxyServer};
