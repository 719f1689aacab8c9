//! Request rewriting for tokenswap.
//!
//! [`CredentialRewriter`] decides per request head whether to answer
//! locally, pass the request through untouched, or substitute the active
//! account's credential. [`ResponsePolicy`] inspects upstream response heads
//! and asks the proxy to block an account, refresh its token, or replace a
//! response body with the locally stored settings document.

mod response;
mod rewriter;
mod rules;
mod settings;

pub use response::{ResponseAction, ResponsePolicy};
pub use rewriter::{CredentialRewriter, RewriteAction, RewriteDecision, RewriteReason};
pub use rules::{
    CredentialField, CredentialRule, HeaderRefresher, HostPattern, IdentityRule, PathPattern,
    RuleTable, EXPERIMENT_ID_HEADER, MANAGER_REQUEST_HEADER, VENDOR_HOST,
};
pub use settings::{SettingsError, UserSettings};
