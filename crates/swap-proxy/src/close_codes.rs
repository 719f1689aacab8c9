use swap_core::ConnectParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReasonCode {
    ClientClosed,
    ConnectParseFailed,
    TlsHandshakeFailed,
    UpstreamConnectFailed,
    UpstreamProtocolError,
    MalformedRequest,
    RelayEof,
    RelayError,
    HttpCompleted,
    Upgraded,
}

impl CloseReasonCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ConnectParseFailed => "connect_parse_failed",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::UpstreamProtocolError => "upstream_protocol_error",
            Self::MalformedRequest => "malformed_request",
            Self::RelayEof => "relay_eof",
            Self::RelayError => "relay_error",
            Self::HttpCompleted => "http_completed",
            Self::Upgraded => "upgraded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseFailureCode {
    IncompleteHeaders,
    HeaderTooLarge,
    ReadError,
    Parser(ConnectParseError),
}

impl ParseFailureCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::HeaderTooLarge => "header_too_large",
            Self::ReadError => "read_error",
            Self::Parser(code) => code.code(),
        }
    }
}

/// How a client connection ended, reported once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Closed {
    pub(crate) code: CloseReasonCode,
    pub(crate) detail: Option<String>,
    pub(crate) bytes_from_client: Option<u64>,
    pub(crate) bytes_from_server: Option<u64>,
}

impl Closed {
    pub(crate) fn new(code: CloseReasonCode) -> Self {
        Self {
            code,
            detail: None,
            bytes_from_client: None,
            bytes_from_server: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn with_bytes(mut self, from_client: u64, from_server: u64) -> Self {
        self.bytes_from_client = Some(from_client);
        self.bytes_from_server = Some(from_server);
        self
    }
}
