use swap_core::{host_matches_any, normalize_host, HttpRequestHead, ProxyConfig};

pub const VENDOR_HOST: &str = "app.warp.dev";
/// Set by the account manager's own requests; those must keep their identity.
pub const MANAGER_REQUEST_HEADER: &str = "x-warp-manager-request";
pub const EXPERIMENT_ID_HEADER: &str = "x-warp-experiment-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Any,
    Exact(String),
    /// The domain itself and every subdomain.
    Domain(String),
}

impl HostPattern {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => normalize_host(host) == normalize_host(expected),
            Self::Domain(domain) => {
                let host = normalize_host(host);
                let domain = normalize_host(domain);
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
        }
    }
}

/// Matched against the request path including its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Any,
    Prefix(String),
    Contains(String),
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Contains(fragment) => path.contains(fragment.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialField {
    /// `Authorization: Bearer <token>`.
    AuthorizationBearer,
    /// A named header carrying the raw token.
    Header(String),
}

impl CredentialField {
    pub fn header_name(&self) -> &str {
        match self {
            Self::AuthorizationBearer => "Authorization",
            Self::Header(name) => name,
        }
    }

    pub fn is_present(&self, head: &HttpRequestHead) -> bool {
        match self {
            Self::AuthorizationBearer => head.header("authorization").is_some_and(|value| {
                value
                    .get(..7)
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
            }),
            Self::Header(name) => head.has_header(name),
        }
    }

    pub fn value_for(&self, token: &str) -> String {
        match self {
            Self::AuthorizationBearer => format!("Bearer {token}"),
            Self::Header(_) => token.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRule {
    pub id: String,
    pub host: HostPattern,
    pub path: PathPattern,
    pub field: CredentialField,
}

/// Requests matching an identity rule reach the upstream with the user's
/// own credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRule {
    pub id: String,
    pub host: HostPattern,
    pub path: PathPattern,
}

/// Replaces `header` with a fresh random v4 UUID on rewritten requests to
/// matching hosts. The header is added when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRefresher {
    pub host: HostPattern,
    pub header: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    /// Host entries in `host_matches_any` form; answered locally with 204.
    pub blocked_hosts: Vec<String>,
    /// `(name, value)` pairs; a request carrying any of them is excluded.
    pub identity_headers: Vec<(String, String)>,
    pub identity_rules: Vec<IdentityRule>,
    /// Evaluated in order; the first rule whose field is present wins.
    pub credential_rules: Vec<CredentialRule>,
    pub header_refreshers: Vec<HeaderRefresher>,
}

impl RuleTable {
    pub fn vendor_defaults() -> Self {
        Self {
            blocked_hosts: vec![".dataplane.rudderstack.com".to_string()],
            identity_headers: vec![(MANAGER_REQUEST_HEADER.to_string(), "true".to_string())],
            identity_rules: vec![IdentityRule {
                id: "vendor-auth".to_string(),
                host: HostPattern::Exact(VENDOR_HOST.to_string()),
                path: PathPattern::Prefix("/auth/".to_string()),
            }],
            credential_rules: vec![CredentialRule {
                id: "vendor-bearer".to_string(),
                host: HostPattern::Exact(VENDOR_HOST.to_string()),
                path: PathPattern::Any,
                field: CredentialField::AuthorizationBearer,
            }],
            header_refreshers: vec![HeaderRefresher {
                host: HostPattern::Exact(VENDOR_HOST.to_string()),
                header: EXPERIMENT_ID_HEADER.to_string(),
            }],
        }
    }

    /// Vendor rules with the blocked host list taken from `config`.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            blocked_hosts: config.blocked_hosts.clone(),
            ..Self::vendor_defaults()
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        host_matches_any(host, &self.blocked_hosts)
    }

    pub(crate) fn carries_identity_header(&self, head: &HttpRequestHead) -> bool {
        self.identity_headers.iter().any(|(name, expected)| {
            head.header(name)
                .is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
        })
    }

    pub(crate) fn identity_rule_for(&self, head: &HttpRequestHead, host: &str) -> Option<&IdentityRule> {
        let path = head.path();
        self.identity_rules
            .iter()
            .find(|rule| rule.host.matches(host) && rule.path.matches(path))
    }

    pub(crate) fn credential_rule_for(
        &self,
        head: &HttpRequestHead,
        host: &str,
    ) -> Option<&CredentialRule> {
        let path = head.path();
        self.credential_rules.iter().find(|rule| {
            rule.host.matches(host) && rule.path.matches(path) && rule.field.is_present(head)
        })
    }

    pub(crate) fn refreshers_for<'a>(
        &'a self,
        host: &'a str,
    ) -> impl Iterator<Item = &'a HeaderRefresher> + 'a {
        self.header_refreshers
            .iter()
            .filter(move |refresher| refresher.host.matches(host))
    }
}
