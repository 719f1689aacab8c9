//! Accounts for tokenswap: the SQLite account store, the process-wide active
//! selection and background token refresh.

mod error;
mod model;
mod refresh;
mod store;
mod switch;

pub use error::AccountError;
pub use model::{
    now_unix_ms, Account, AccountStatus, Credentials, Usage, DEFAULT_LIMIT_INFO,
};
pub use refresh::{
    RefreshError, RefreshOutcome, SecureTokenRefresher, TokenKeeper, TokenRefresher,
};
pub use store::{spawn_usage_flusher, AccountStore, UsageRecorder};
pub use switch::{ActiveSnapshot, SwitchCoordinator};
