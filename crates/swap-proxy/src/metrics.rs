use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use swap_observe::{Event, EventSink, EventType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub active_connections: u64,
    pub total_connections: u64,
    pub credential_substitutions: u64,
    pub pass_throughs: u64,
    pub local_responses: u64,
    pub upstream_retries: u64,
    pub upstream_failures: u64,
    pub malformed_requests: u64,
    pub certificate_failures: u64,
    pub accounts_blocked: u64,
    pub bodies_replaced: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyMetricsStore {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    credential_substitutions: AtomicU64,
    pass_throughs: AtomicU64,
    local_responses: AtomicU64,
    upstream_retries: AtomicU64,
    upstream_failures: AtomicU64,
    malformed_requests: AtomicU64,
    certificate_failures: AtomicU64,
    accounts_blocked: AtomicU64,
    bodies_replaced: AtomicU64,
}

impl ProxyMetricsStore {
    pub(crate) fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            credential_substitutions: self.credential_substitutions.load(Ordering::Relaxed),
            pass_throughs: self.pass_throughs.load(Ordering::Relaxed),
            local_responses: self.local_responses.load(Ordering::Relaxed),
            upstream_retries: self.upstream_retries.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            malformed_requests: self.malformed_requests.load(Ordering::Relaxed),
            certificate_failures: self.certificate_failures.load(Ordering::Relaxed),
            accounts_blocked: self.accounts_blocked.load(Ordering::Relaxed),
            bodies_replaced: self.bodies_replaced.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_connection_open(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_close(&self) {
        let _ =
            self.active_connections
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.saturating_sub(1))
                });
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Derives the counters from the flow event stream.
#[derive(Debug)]
pub(crate) struct MetricsEventSink {
    store: Arc<ProxyMetricsStore>,
}

impl MetricsEventSink {
    pub(crate) fn new(store: Arc<ProxyMetricsStore>) -> Self {
        Self { store }
    }
}

impl EventSink for MetricsEventSink {
    fn emit(&self, event: Event) {
        let store = &self.store;
        match event.kind {
            EventType::ConnectReceived => store.record_connection_open(),
            EventType::StreamClosed => store.record_connection_close(),
            EventType::CredentialSubstituted => {
                ProxyMetricsStore::bump(&store.credential_substitutions)
            }
            EventType::RequestPassedThrough => ProxyMetricsStore::bump(&store.pass_throughs),
            EventType::LocalResponse => ProxyMetricsStore::bump(&store.local_responses),
            EventType::UpstreamRetry => ProxyMetricsStore::bump(&store.upstream_retries),
            EventType::UpstreamFailed => ProxyMetricsStore::bump(&store.upstream_failures),
            EventType::MalformedRequest => ProxyMetricsStore::bump(&store.malformed_requests),
            EventType::TlsHandshakeFailed if event.attribute("stage") == Some("leaf_issuance") => {
                ProxyMetricsStore::bump(&store.certificate_failures)
            }
            EventType::AccountBlocked => ProxyMetricsStore::bump(&store.accounts_blocked),
            EventType::ResponseBodyReplaced => ProxyMetricsStore::bump(&store.bodies_replaced),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use swap_observe::{Event, EventSink, EventType, FlowContext};

    use super::{MetricsEventSink, ProxyMetricsStore};

    fn context() -> FlowContext {
        FlowContext {
            flow_id: 1,
            client_addr: "127.0.0.1:50000".to_string(),
            server_host: "app.warp.dev".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn proxy_metrics_counter_contract() {
        let store = Arc::new(ProxyMetricsStore::default());
        let sink = MetricsEventSink::new(Arc::clone(&store));

        sink.emit(Event::new(EventType::ConnectReceived, context()));
        sink.emit(Event::new(EventType::ConnectReceived, context()));
        sink.emit(Event::new(EventType::StreamClosed, context()));
        sink.emit(Event::new(EventType::StreamClosed, context()));
        sink.emit(Event::new(EventType::StreamClosed, context()));
        sink.emit(Event::new(EventType::CredentialSubstituted, context()));
        sink.emit(Event::new(EventType::LocalResponse, context()));
        sink.emit(Event::new(EventType::UpstreamRetry, context()));
        sink.emit(Event::new(EventType::TlsHandshakeFailed, context()));
        sink.emit(
            Event::new(EventType::TlsHandshakeFailed, context())
                .with_attribute("stage", "leaf_issuance"),
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.credential_substitutions, 1);
        assert_eq!(snapshot.local_responses, 1);
        assert_eq!(snapshot.upstream_retries, 1);
        assert_eq!(snapshot.certificate_failures, 1);
        assert_eq!(snapshot.upstream_failures, 0);
    }
}
