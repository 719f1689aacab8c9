mod config;
mod connect;
mod http_head;

pub use config::{ConfigError, ConnectParseMode, ProxyConfig};
pub use connect::{
    parse_connect_request_head, parse_connect_request_head_with_mode, parse_connect_request_line,
    parse_connect_request_line_with_mode, ConnectParseError, ConnectRequest,
};
pub use http_head::{
    parse_http_request_head, parse_http_response_head, HttpBodyMode, HttpHeadError, HttpHeader,
    HttpRequestHead, HttpResponseHead, HttpVersion,
};

/// Returns the byte offset just past the first `\r\n\r\n`, if any.
pub fn header_terminator_index(input: &[u8]) -> Option<usize> {
    input
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

/// Lowercases a host and strips surrounding IPv6 brackets and a trailing dot.
pub fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|value| value.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.trim_end_matches('.').to_ascii_lowercase()
}

/// Matches `host` against a list of entries. An entry starting with `.`
/// matches the domain itself and every subdomain; any other entry must match
/// exactly. Comparison is case-insensitive.
pub fn host_matches_any(host: &str, entries: &[String]) -> bool {
    let host = normalize_host(host);
    entries.iter().any(|entry| host_matches(&host, entry))
}

fn host_matches(normalized_host: &str, entry: &str) -> bool {
    let entry = entry.trim().to_ascii_lowercase();
    match entry.strip_prefix('.') {
        Some(domain) => {
            normalized_host == domain
                || normalized_host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => normalized_host == entry,
    }
}
