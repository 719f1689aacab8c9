use std::sync::Arc;

use swap_accounts::{now_unix_ms, ActiveSnapshot, UsageRecorder};
use swap_core::HttpRequestHead;

use crate::rules::RuleTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteAction {
    /// Answer the client without contacting the upstream.
    LocalResponse { status: u16 },
    /// Forward the head exactly as received.
    PassThrough,
    /// The head was modified in place and must be re-encoded.
    Rewritten { account_id: String, rule_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteReason {
    BlockedHost,
    IdentityHeader,
    IdentityPath,
    NoActiveAccount,
    NoCredentialField,
    CredentialSubstituted,
}

impl RewriteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockedHost => "blocked_host",
            Self::IdentityHeader => "identity_header",
            Self::IdentityPath => "identity_path",
            Self::NoActiveAccount => "no_active_account",
            Self::NoCredentialField => "no_credential_field",
            Self::CredentialSubstituted => "credential_substituted",
        }
    }

    pub fn is_identity_exclusion(self) -> bool {
        matches!(self, Self::IdentityHeader | Self::IdentityPath)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteDecision {
    pub action: RewriteAction,
    pub reason: RewriteReason,
}

impl RewriteDecision {
    fn pass(reason: RewriteReason) -> Self {
        Self {
            action: RewriteAction::PassThrough,
            reason,
        }
    }

    /// Account whose credential the request carries, if it was rewritten.
    pub fn account_id(&self) -> Option<&str> {
        match &self.action {
            RewriteAction::Rewritten { account_id, .. } => Some(account_id),
            _ => None,
        }
    }
}

pub struct CredentialRewriter {
    rules: RuleTable,
    usage: Arc<dyn UsageRecorder>,
}

impl std::fmt::Debug for CredentialRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRewriter")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl CredentialRewriter {
    pub fn new(rules: RuleTable, usage: Arc<dyn UsageRecorder>) -> Self {
        Self { rules, usage }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Decides how to handle one request. Only a `Rewritten` decision
    /// modifies `head`; every other outcome leaves it untouched.
    pub fn rewrite(
        &self,
        head: &mut HttpRequestHead,
        host: &str,
        active: Option<&ActiveSnapshot>,
    ) -> RewriteDecision {
        if self.rules.is_blocked(host) {
            return RewriteDecision {
                action: RewriteAction::LocalResponse { status: 204 },
                reason: RewriteReason::BlockedHost,
            };
        }
        if self.rules.carries_identity_header(head) {
            return RewriteDecision::pass(RewriteReason::IdentityHeader);
        }
        if self.rules.identity_rule_for(head, host).is_some() {
            return RewriteDecision::pass(RewriteReason::IdentityPath);
        }
        let Some(active) = active else {
            return RewriteDecision::pass(RewriteReason::NoActiveAccount);
        };
        let Some(rule) = self.rules.credential_rule_for(head, host) else {
            return RewriteDecision::pass(RewriteReason::NoCredentialField);
        };

        let rule_id = rule.id.clone();
        head.set_header(
            rule.field.header_name(),
            rule.field.value_for(&active.access_token),
        );
        for refresher in self.rules.refreshers_for(host) {
            head.set_header(&refresher.header, uuid::Uuid::new_v4().to_string());
        }
        self.usage.record_use(&active.account_id, now_unix_ms());

        RewriteDecision {
            action: RewriteAction::Rewritten {
                account_id: active.account_id.clone(),
                rule_id,
            },
            reason: RewriteReason::CredentialSubstituted,
        }
    }
}
