use std::net::IpAddr;

use thiserror::Error;

use crate::config::ConnectParseMode;
use crate::header_terminator_index;

const DEFAULT_TLS_PORT: u16 = 443;

/// Target of a `CONNECT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

impl ConnectRequest {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectParseError {
    #[error("CONNECT head is incomplete")]
    IncompleteHeaders,
    #[error("CONNECT head is not valid UTF-8")]
    InvalidUtf8,
    #[error("CONNECT request line is empty")]
    EmptyRequestLine,
    #[error("CONNECT request line is malformed")]
    InvalidRequestLine,
    #[error("request method is not CONNECT")]
    MethodNotConnect,
    #[error("CONNECT request carries an invalid HTTP version")]
    InvalidHttpVersion,
    #[error("CONNECT authority is invalid")]
    InvalidAuthority,
    #[error("CONNECT authority has no port")]
    MissingPort,
    #[error("CONNECT port is invalid")]
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

pub fn parse_connect_request_line(request_line: &str) -> Result<ConnectRequest, ConnectParseError> {
    parse_connect_request_line_with_mode(request_line, ConnectParseMode::Strict)
}

pub fn parse_connect_request_line_with_mode(
    request_line: &str,
    mode: ConnectParseMode,
) -> Result<ConnectRequest, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }

    let method_ok = match mode {
        ConnectParseMode::Strict => method == "CONNECT",
        ConnectParseMode::Lenient => method.eq_ignore_ascii_case("CONNECT"),
    };
    if !method_ok {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    let authority = match mode {
        ConnectParseMode::Strict => authority,
        ConnectParseMode::Lenient => strip_absolute_form(authority),
    };
    let (host, port) = split_authority(authority, mode)?;
    Ok(ConnectRequest { host, port })
}

/// Parses a complete CONNECT head and returns the request together with the
/// number of bytes the head occupies in `input`.
pub fn parse_connect_request_head(
    input: &[u8],
) -> Result<(ConnectRequest, usize), ConnectParseError> {
    parse_connect_request_head_with_mode(input, ConnectParseMode::Strict)
}

pub fn parse_connect_request_head_with_mode(
    input: &[u8],
    mode: ConnectParseMode,
) -> Result<(ConnectRequest, usize), ConnectParseError> {
    let head_len = header_terminator_index(input).ok_or(ConnectParseError::IncompleteHeaders)?;
    let head =
        std::str::from_utf8(&input[..head_len]).map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head
        .split("\r\n")
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or(ConnectParseError::EmptyRequestLine)?;
    let request = parse_connect_request_line_with_mode(request_line, mode)?;
    Ok((request, head_len))
}

fn strip_absolute_form(authority: &str) -> &str {
    let trimmed = authority.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .trim()
}

fn split_authority(
    authority: &str,
    mode: ConnectParseMode,
) -> Result<(String, u16), ConnectParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, suffix) = rest
            .split_once(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }
        if suffix.is_empty() {
            return default_port(host, mode);
        }
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        return finish_with_port(host, port_text, mode);
    }

    match authority.rsplit_once(':') {
        None if authority.is_empty() => Err(ConnectParseError::InvalidAuthority),
        None => default_port(authority, mode),
        Some(("", _)) => Err(ConnectParseError::InvalidAuthority),
        Some((host, _)) if host.contains(':') => {
            // Bare IPv6 literal: only the lenient parser accepts it, with the
            // default port.
            if mode == ConnectParseMode::Lenient && authority.parse::<IpAddr>().is_ok() {
                return Ok((authority.to_string(), DEFAULT_TLS_PORT));
            }
            Err(ConnectParseError::InvalidAuthority)
        }
        Some((host, port_text)) => finish_with_port(host, port_text, mode),
    }
}

fn finish_with_port(
    host: &str,
    port_text: &str,
    mode: ConnectParseMode,
) -> Result<(String, u16), ConnectParseError> {
    if port_text.is_empty() {
        return default_port(host, mode);
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| ConnectParseError::InvalidPort)?;
    if port == 0 {
        return Err(ConnectParseError::InvalidPort);
    }
    Ok((host.to_string(), port))
}

fn default_port(host: &str, mode: ConnectParseMode) -> Result<(String, u16), ConnectParseError> {
    match mode {
        ConnectParseMode::Lenient => Ok((host.to_string(), DEFAULT_TLS_PORT)),
        ConnectParseMode::Strict => Err(ConnectParseError::MissingPort),
    }
}
