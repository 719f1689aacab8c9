use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swap_accounts::{spawn_usage_flusher, AccountStore, SwitchCoordinator, TokenKeeper};
use swap_core::ProxyConfig;
use swap_observe::{Event, EventSink};
use swap_rewrite::{CredentialRewriter, ResponsePolicy};
use swap_tls::CertificateAuthority;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::errors::ProxyError;
use crate::flow::handle_client;
use crate::metrics::{ProxyMetrics, ProxyMetricsStore};
use crate::upstream::UpstreamConnector;

/// Everything a connection task needs, shared by all of them.
pub(crate) struct ProxyRuntime {
    pub(crate) config: ProxyConfig,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) coordinator: Arc<SwitchCoordinator>,
    pub(crate) rewriter: CredentialRewriter,
    pub(crate) response_policy: ResponsePolicy,
    pub(crate) keeper: Option<Arc<TokenKeeper>>,
    pub(crate) upstream: UpstreamConnector,
    sink: Arc<dyn EventSink>,
    next_flow_id: AtomicU64,
}

impl ProxyRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        coordinator: Arc<SwitchCoordinator>,
        rewriter: CredentialRewriter,
        response_policy: ResponsePolicy,
        keeper: Option<Arc<TokenKeeper>>,
        upstream: UpstreamConnector,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            ca,
            coordinator,
            rewriter,
            response_policy,
            keeper,
            upstream,
            sink,
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: Event) {
        self.sink.emit(event);
    }
}

pub struct ProxyServer {
    runtime: Arc<ProxyRuntime>,
    store: AccountStore,
    metrics: Arc<ProxyMetricsStore>,
}

impl ProxyServer {
    pub(crate) fn new(
        runtime: Arc<ProxyRuntime>,
        store: AccountStore,
        metrics: Arc<ProxyMetricsStore>,
    ) -> Self {
        Self {
            runtime,
            store,
            metrics,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.runtime.config
    }

    pub fn coordinator(&self) -> &Arc<SwitchCoordinator> {
        &self.runtime.coordinator
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.runtime.ca
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let config = &self.runtime.config;
        let bind_addr = format!("{}:{}", config.listen_addr, config.listen_port);
        TcpListener::bind(&bind_addr).await
    }

    /// Binds the configured address and serves until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind_listener().await?;
        let handle = self.start(listener)?;
        tracing::info!(addr = %handle.local_addr(), "proxy listening");
        shutdown.await;
        handle.shutdown(Duration::from_secs(5)).await
    }

    /// Starts the accept loop and the background tasks on `listener`.
    pub fn start(self, listener: TcpListener) -> Result<ProxyHandle, ProxyError> {
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(accept_loop(Arc::clone(&self.runtime), listener));

        let interval = Duration::from_millis(self.runtime.config.usage_flush_interval_ms);
        let mut background = vec![
            spawn_usage_flusher(self.store.clone(), interval),
            spawn_selection_sync(Arc::clone(&self.runtime.coordinator), interval),
        ];
        if let Some(keeper) = &self.runtime.keeper {
            background.push(Arc::clone(keeper).spawn());
        }

        Ok(ProxyHandle {
            local_addr,
            accept_task,
            background,
            runtime: self.runtime,
            store: self.store,
            metrics: self.metrics,
        })
    }
}

async fn accept_loop(runtime: Arc<ProxyRuntime>, listener: TcpListener) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(error = %error, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            handle_client(runtime, stream, client_addr.to_string()).await;
        });
    }
}

/// Follows selection changes persisted by another process, such as the
/// `accounts switch` command, until the handle is aborted.
fn spawn_selection_sync(coordinator: Arc<SwitchCoordinator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let syncing = Arc::clone(&coordinator);
            match tokio::task::spawn_blocking(move || syncing.follow_store()).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => tracing::warn!(error = %error, "selection sync failed"),
                Err(error) => tracing::warn!(error = %error, "selection sync task failed"),
            }
        }
    })
}

/// A running proxy. Dropping the handle leaves the tasks running; call
/// [`ProxyHandle::shutdown`] to stop them.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    runtime: Arc<ProxyRuntime>,
    store: AccountStore,
    metrics: Arc<ProxyMetricsStore>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.metrics.snapshot()
    }

    pub fn coordinator(&self) -> &Arc<SwitchCoordinator> {
        &self.runtime.coordinator
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.runtime.ca
    }

    pub fn ca_certificate_pem(&self) -> &str {
        self.runtime.ca.ca_certificate_pem()
    }

    /// Stops accepting, stops the background tasks and flushes pending
    /// usage. Connections already being served finish on their own.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ProxyError> {
        let mut tasks = self.background;
        tasks.push(self.accept_task);
        for task in &tasks {
            task.abort();
        }

        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                match task.await {
                    Ok(()) => {}
                    Err(error) if error.is_cancelled() => {}
                    Err(error) => return Err(ProxyError::Join(error)),
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for proxy shutdown",
            ))
        })?;
        joined?;

        let store = self.store;
        let flushed = tokio::task::spawn_blocking(move || store.flush_usage()).await??;
        tracing::info!(flushed, "proxy stopped");
        Ok(())
    }
}
