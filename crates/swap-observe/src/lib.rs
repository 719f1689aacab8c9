use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ConnectReceived,
    ConnectParseFailed,
    TunnelOpened,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    RequestHeaders,
    MalformedRequest,
    CredentialSubstituted,
    RequestPassedThrough,
    LocalResponse,
    UpstreamRetry,
    UpstreamFailed,
    ResponseHeaders,
    ResponseBodyReplaced,
    AccountBlocked,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectReceived => "connect_received",
            Self::ConnectParseFailed => "connect_parse_failed",
            Self::TunnelOpened => "tunnel_opened",
            Self::TlsHandshakeSucceeded => "tls_handshake_succeeded",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::RequestHeaders => "request_headers",
            Self::MalformedRequest => "malformed_request",
            Self::CredentialSubstituted => "credential_substituted",
            Self::RequestPassedThrough => "request_passed_through",
            Self::LocalResponse => "local_response",
            Self::UpstreamRetry => "upstream_retry",
            Self::UpstreamFailed => "upstream_failed",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBodyReplaced => "response_body_replaced",
            Self::AccountBlocked => "account_blocked",
            Self::StreamClosed => "stream_closed",
        }
    }
}

/// Identifies one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: Event) {
        (**self).emit(event);
    }
}

/// Keeps every event in memory. Used by tests.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Writes events as `tracing` records. Failures are logged at `warn`,
/// everything else at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        let kind = event.kind.as_str();
        let ctx = &event.context;
        let attributes = format_attributes(&event.attributes);
        match event.kind {
            EventType::ConnectParseFailed
            | EventType::TlsHandshakeFailed
            | EventType::MalformedRequest
            | EventType::UpstreamFailed
            | EventType::AccountBlocked => tracing::warn!(
                flow_id = ctx.flow_id,
                client = %ctx.client_addr,
                host = %ctx.server_host,
                port = ctx.server_port,
                kind,
                %attributes,
                "flow event"
            ),
            _ => tracing::debug!(
                flow_id = ctx.flow_id,
                client = %ctx.client_addr,
                host = %ctx.server_host,
                port = ctx.server_port,
                kind,
                %attributes,
                "flow event"
            ),
        }
    }
}

/// Forwards each event to every inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

fn format_attributes(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Event, EventSink, EventType, FanoutEventSink, FlowContext, VecEventSink};

    fn context() -> FlowContext {
        FlowContext {
            flow_id: 7,
            client_addr: "127.0.0.1:50000".to_string(),
            server_host: "app.warp.dev".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn fanout_delivers_to_every_sink() {
        let first = VecEventSink::default();
        let second = VecEventSink::default();
        let fanout = FanoutEventSink::new()
            .with(Arc::new(first.clone()))
            .with(Arc::new(second.clone()));

        fanout.emit(
            Event::new(EventType::CredentialSubstituted, context())
                .with_attribute("account_id", "acct-b"),
        );

        for sink in [&first, &second] {
            let events = sink.snapshot();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].attribute("account_id"), Some("acct-b"));
        }
    }

    #[test]
    fn vec_sink_counts_by_kind() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventType::UpstreamRetry, context()));
        sink.emit(Event::new(EventType::UpstreamFailed, context()));
        sink.emit(Event::new(EventType::UpstreamRetry, context()));
        assert_eq!(sink.count(EventType::UpstreamRetry), 2);
        assert_eq!(sink.count(EventType::StreamClosed), 0);
    }

    #[test]
    fn empty_fanout_is_a_no_op() {
        FanoutEventSink::new().emit(Event::new(EventType::StreamClosed, context()));
    }
}
