use std::sync::Arc;

use bytes::Bytes;
use swap_core::{HttpRequestHead, HttpResponseHead};

use crate::rewriter::RewriteDecision;
use crate::rules::{HostPattern, PathPattern, VENDOR_HOST};
use crate::settings::UserSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    Forward,
    /// The upstream refused the account; it must not be used again.
    MarkBlocked { account_id: String },
    /// The upstream rejected the substituted token.
    RefreshCredentials { account_id: String },
    /// Send this body instead of the upstream's.
    ReplaceBody(Bytes),
}

/// Post-response rules for the vendor host.
#[derive(Debug)]
pub struct ResponsePolicy {
    vendor_host: HostPattern,
    blocking_path: PathPattern,
    replace_body_path: PathPattern,
    settings_reload_path: PathPattern,
    settings: Arc<UserSettings>,
}

impl ResponsePolicy {
    pub fn new(settings: Arc<UserSettings>) -> Self {
        Self {
            vendor_host: HostPattern::Exact(VENDOR_HOST.to_string()),
            blocking_path: PathPattern::Contains("/ai/multi-agent".to_string()),
            replace_body_path: PathPattern::Prefix(
                "/graphql/v2?op=GetUpdatedCloudObjects".to_string(),
            ),
            settings_reload_path: PathPattern::Prefix(
                "/graphql/v2?op=CreateGenericStringObject".to_string(),
            ),
            settings,
        }
    }

    /// Applies the rules to `host` instead of the vendor host.
    pub fn with_vendor_host(mut self, host: HostPattern) -> Self {
        self.vendor_host = host;
        self
    }

    pub fn settings(&self) -> &Arc<UserSettings> {
        &self.settings
    }

    /// Whether this request changes the cloud objects the settings document
    /// mirrors, so the document should be reloaded.
    pub fn wants_settings_reload(&self, request: &HttpRequestHead, host: &str) -> bool {
        request.method.eq_ignore_ascii_case("POST")
            && self.vendor_host.matches(host)
            && self.settings_reload_path.matches(request.path())
    }

    pub fn inspect(
        &self,
        request: &HttpRequestHead,
        host: &str,
        response: &HttpResponseHead,
        decision: &RewriteDecision,
    ) -> ResponseAction {
        if !self.vendor_host.matches(host) || decision.reason.is_identity_exclusion() {
            return ResponseAction::Forward;
        }
        let path = request.path();

        if let Some(account_id) = decision.account_id() {
            if response.status_code == 403 && self.blocking_path.matches(path) {
                return ResponseAction::MarkBlocked {
                    account_id: account_id.to_string(),
                };
            }
            if response.status_code == 401 {
                return ResponseAction::RefreshCredentials {
                    account_id: account_id.to_string(),
                };
            }
        }

        if response.status_code == 200
            && request.method.eq_ignore_ascii_case("POST")
            && self.replace_body_path.matches(path)
        {
            if let Some(document) = self.settings.document() {
                return ResponseAction::ReplaceBody(document);
            }
        }
        ResponseAction::Forward
    }
}
