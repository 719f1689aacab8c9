//! HTTP/1.x message heads.
//!
//! Parsing is strict about framing: folded headers, conflicting
//! `Content-Length` values and `Transfer-Encoding` combined with
//! `Content-Length` are rejected so the proxy never forwards a request that
//! the upstream could frame differently.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpHeadError {
    #[error("message head is not valid UTF-8")]
    InvalidUtf8,
    #[error("start line is missing")]
    MissingStartLine,
    #[error("request line is malformed")]
    InvalidRequestLine,
    #[error("status line is malformed")]
    InvalidStatusLine,
    #[error("only HTTP/1.0 and HTTP/1.1 are supported")]
    UnsupportedVersion,
    #[error("folded header lines are not supported")]
    FoldedHeader,
    #[error("header line has no colon")]
    MalformedHeaderLine,
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("invalid header value")]
    InvalidHeaderValue,
    #[error("invalid Content-Length value")]
    InvalidContentLength,
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("Transfer-Encoding and Content-Length are both present")]
    ConflictingFraming,
    #[error("unsupported Transfer-Encoding value")]
    UnsupportedTransferEncoding,
}

impl HttpHeadError {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingStartLine => "missing_start_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::InvalidStatusLine => "invalid_status_line",
            Self::UnsupportedVersion => "unsupported_version",
            Self::FoldedHeader => "folded_header",
            Self::MalformedHeaderLine => "malformed_header_line",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::InvalidContentLength => "invalid_content_length",
            Self::ConflictingContentLength => "conflicting_content_length",
            Self::ConflictingFraming => "conflicting_framing",
            Self::UnsupportedTransferEncoding => "unsupported_transfer_encoding",
        }
    }
}

/// A parsed request head. `raw` holds the bytes exactly as received so an
/// unmodified head can be forwarded byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

impl HttpRequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Replaces the first header called `name`, drops any duplicates and
    /// appends the header when it was absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        replace_header(&mut self.headers, name, value.into());
    }

    /// Path and query of the target, also for absolute-form targets.
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        let without_scheme = target
            .strip_prefix("https://")
            .or_else(|| target.strip_prefix("http://"));
        match without_scheme {
            Some(rest) => rest.find('/').map_or("/", |index| &rest[index..]),
            None => target,
        }
    }

    /// Serializes the head from its parsed fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version.as_str())
            .into_bytes();
        encode_headers(&self.headers, &mut out);
        out
    }
}

impl HttpResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        replace_header(&mut self.headers, name, value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = if self.reason_phrase.is_empty() {
            format!("{} {}\r\n", self.version.as_str(), self.status_code)
        } else {
            format!(
                "{} {} {}\r\n",
                self.version.as_str(),
                self.status_code,
                self.reason_phrase
            )
        }
        .into_bytes();
        encode_headers(&self.headers, &mut out);
        out
    }
}

pub fn parse_http_request_head(raw: &[u8]) -> Result<HttpRequestHead, HttpHeadError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpHeadError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(HttpHeadError::MissingStartLine)?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version_text), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpHeadError::InvalidRequestLine);
    };
    if method.is_empty() || !method.bytes().all(is_http_token_char) || target.is_empty() {
        return Err(HttpHeadError::InvalidRequestLine);
    }
    let version = parse_http_version(version_text)?;

    let headers = parse_http_headers(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(HttpRequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

/// Parses a response head. The request method is needed to decide whether a
/// body follows.
pub fn parse_http_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<HttpResponseHead, HttpHeadError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpHeadError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(HttpHeadError::MissingStartLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parse_http_version(parts.next().unwrap_or_default())?;
    let status_code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(HttpHeadError::InvalidStatusLine)?;
    let reason_phrase = parts.next().unwrap_or_default().trim().to_string();

    let headers = parse_http_headers(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status_code)?;
    let connection_close =
        body_mode == HttpBodyMode::CloseDelimited || is_connection_close(version, &headers);

    Ok(HttpResponseHead {
        raw: raw.to_vec(),
        version,
        status_code,
        reason_phrase,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_http_version(text: &str) -> Result<HttpVersion, HttpHeadError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(HttpHeadError::UnsupportedVersion),
    }
}

fn parse_http_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<HttpHeader>, HttpHeadError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(HttpHeadError::FoldedHeader);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpHeadError::MalformedHeaderLine)?;
        if name.is_empty() || !name.bytes().all(is_http_token_char) {
            return Err(HttpHeadError::InvalidHeaderName);
        }
        let value = value.trim();
        if value
            .bytes()
            .any(|byte| matches!(byte, 0x00..=0x08 | 0x0A..=0x1F | 0x7F))
        {
            return Err(HttpHeadError::InvalidHeaderValue);
        }
        headers.push(HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(headers)
}

fn request_body_mode(headers: &[HttpHeader]) -> Result<HttpBodyMode, HttpHeadError> {
    Ok(framed_body_mode(headers)?.unwrap_or(HttpBodyMode::None))
}

fn response_body_mode(
    headers: &[HttpHeader],
    request_method: &str,
    status_code: u16,
) -> Result<HttpBodyMode, HttpHeadError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(HttpBodyMode::None);
    }
    Ok(framed_body_mode(headers)?.unwrap_or(HttpBodyMode::CloseDelimited))
}

/// Body mode declared by framing headers, `None` when neither
/// `Transfer-Encoding` nor `Content-Length` is present.
fn framed_body_mode(headers: &[HttpHeader]) -> Result<Option<HttpBodyMode>, HttpHeadError> {
    let chunked = parse_transfer_encoding(headers)?;
    let content_length = parse_content_length(headers)?;
    match (chunked, content_length) {
        (true, Some(_)) => Err(HttpHeadError::ConflictingFraming),
        (true, None) => Ok(Some(HttpBodyMode::Chunked)),
        (false, Some(0)) => Ok(Some(HttpBodyMode::None)),
        (false, Some(length)) => Ok(Some(HttpBodyMode::ContentLength(length))),
        (false, None) => Ok(None),
    }
}

fn parse_content_length(headers: &[HttpHeader]) -> Result<Option<u64>, HttpHeadError> {
    let mut value = None;
    let values = headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("content-length"))
        .flat_map(|header| header.value.split(','));
    for raw in values {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(HttpHeadError::InvalidContentLength);
        }
        let parsed = trimmed
            .parse::<u64>()
            .map_err(|_| HttpHeadError::InvalidContentLength)?;
        match value {
            Some(existing) if existing != parsed => {
                return Err(HttpHeadError::ConflictingContentLength)
            }
            _ => value = Some(parsed),
        }
    }
    Ok(value)
}

/// Returns whether the message is chunked. Only a single `chunked` coding is
/// accepted.
fn parse_transfer_encoding(headers: &[HttpHeader]) -> Result<bool, HttpHeadError> {
    let mut chunked = false;
    let codings = headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|header| header.value.split(','));
    for coding in codings {
        let token = coding.split(';').next().unwrap_or_default().trim();
        if !token.eq_ignore_ascii_case("chunked") || chunked {
            return Err(HttpHeadError::UnsupportedTransferEncoding);
        }
        chunked = true;
    }
    Ok(chunked)
}

fn has_header_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive")
}

fn find_header<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn replace_header(headers: &mut Vec<HttpHeader>, name: &str, value: String) {
    let mut value = Some(value);
    headers.retain_mut(|header| {
        if !header.name.eq_ignore_ascii_case(name) {
            return true;
        }
        match value.take() {
            Some(replacement) => {
                header.value = replacement;
                true
            }
            None => false,
        }
    });
    if let Some(value) = value {
        headers.push(HttpHeader {
            name: name.to_string(),
            value,
        });
    }
}

fn encode_headers(headers: &[HttpHeader], out: &mut Vec<u8>) {
    for header in headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn is_http_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
