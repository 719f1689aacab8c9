use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::errors::ExchangeError;

/// Total connect attempts: the first try plus one retry.
const MAX_CONNECT_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamFailureKind {
    ConnectFailure,
    Timeout,
}

pub(crate) fn classify_upstream_failure(error: &io::Error) -> UpstreamFailureKind {
    match error.kind() {
        io::ErrorKind::TimedOut => UpstreamFailureKind::Timeout,
        _ => UpstreamFailureKind::ConnectFailure,
    }
}

pub(crate) fn upstream_http_status_for_error(error: &io::Error) -> u16 {
    match classify_upstream_failure(error) {
        UpstreamFailureKind::Timeout => 504,
        UpstreamFailureKind::ConnectFailure => 502,
    }
}

/// Opens upstream connections. Every attempt resolves the host again.
#[derive(Clone)]
pub(crate) struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
    retry_delay: Duration,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl UpstreamConnector {
    pub(crate) fn new(
        client_config: Arc<ClientConfig>,
        connect_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            tls: TlsConnector::from(client_config),
            connect_timeout,
            retry_delay,
        }
    }

    /// Plain TCP for tunneled hosts.
    pub(crate) async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        on_retry: impl FnMut(u32, &io::Error),
    ) -> Result<TcpStream, ExchangeError> {
        self.with_retry(host, port, on_retry, || async move {
            TcpStream::connect((host, port)).await
        })
        .await
    }

    /// TCP plus TLS handshake; the timeout covers both.
    pub(crate) async fn connect_tls(
        &self,
        host: &str,
        port: u16,
        on_retry: impl FnMut(u32, &io::Error),
    ) -> Result<TlsStream<TcpStream>, ExchangeError> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            ExchangeError::Upstream {
                authority: format!("{host}:{port}"),
                status: 502,
                detail: "invalid server name for upstream TLS".to_string(),
            }
        })?;
        self.with_retry(host, port, on_retry, || {
            let server_name = server_name.clone();
            async move {
                let tcp = TcpStream::connect((host, port)).await?;
                self.tls.connect(server_name, tcp).await
            }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        host: &str,
        port: u16,
        mut on_retry: impl FnMut(u32, &io::Error),
        mut attempt: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut attempt_number = 1;
        loop {
            let error = match tokio::time::timeout(self.connect_timeout, attempt()).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(error)) => error,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"),
            };
            if attempt_number >= MAX_CONNECT_ATTEMPTS {
                return Err(ExchangeError::Upstream {
                    authority: format!("{host}:{port}"),
                    status: upstream_http_status_for_error(&error),
                    detail: error.to_string(),
                });
            }
            on_retry(attempt_number, &error);
            tokio::time::sleep(self.retry_delay).await;
            attempt_number += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::{upstream_http_status_for_error, UpstreamConnector};

    fn connector() -> UpstreamConnector {
        let config = swap_tls::build_upstream_client_config(true).expect("client config");
        UpstreamConnector::new(config, Duration::from_secs(2), Duration::from_millis(10))
    }

    #[test]
    fn upstream_connect_failure_returns_502() {
        let error = io::Error::new(io::ErrorKind::ConnectionRefused, "connect refused");
        assert_eq!(upstream_http_status_for_error(&error), 502);
    }

    #[test]
    fn upstream_timeout_returns_504() {
        let error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
        assert_eq!(upstream_http_status_for_error(&error), 504);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refused_connect_is_retried_once_then_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut retries = Vec::new();
        let error = connector()
            .connect_tcp("127.0.0.1", port, |attempt, _| retries.push(attempt))
            .await
            .expect_err("nothing listens");
        assert_eq!(retries, vec![1]);
        assert_eq!(error.status(), 502);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listening_upstream_connects_without_retry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut retries = 0;
        connector()
            .connect_tcp("127.0.0.1", port, |_, _| retries += 1)
            .await
            .expect("connect");
        assert_eq!(retries, 0);
    }
}
