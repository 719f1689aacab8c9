use std::io;
use std::sync::Arc;

use swap_core::{
    host_matches_any, parse_connect_request_head_with_mode, parse_http_request_head,
    parse_http_response_head, HttpBodyMode, HttpRequestHead, HttpResponseHead, ProxyConfig,
};
use swap_observe::{Event, EventType, FlowContext};
use swap_rewrite::{ResponseAction, RewriteAction, RewriteDecision};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::close_codes::{CloseReasonCode, Closed, ParseFailureCode};
use crate::errors::ExchangeError;
use crate::relay::{drain_body, read_until_pattern, relay_body, write_local_response, BufferedConn};
use crate::server::ProxyRuntime;

type DownstreamTls = tokio_rustls::server::TlsStream<TcpStream>;
type UpstreamTls = tokio_rustls::client::TlsStream<TcpStream>;

/// Hosts that are tunneled without TLS termination. Blocked hosts are always
/// intercepted so they can be answered locally.
pub(crate) fn should_tunnel(config: &ProxyConfig, host: &str) -> bool {
    if host_matches_any(host, &config.passthrough_hosts) {
        return true;
    }
    config.passthrough_unlisted
        && !host_matches_any(host, &config.intercept_hosts)
        && !host_matches_any(host, &config.blocked_hosts)
}

pub(crate) async fn handle_client(
    runtime: Arc<ProxyRuntime>,
    downstream: TcpStream,
    client_addr: String,
) {
    let flow_id = runtime.allocate_flow_id();
    let mut context = unknown_context(flow_id, client_addr);
    runtime.emit(Event::new(EventType::ConnectReceived, context.clone()));

    let closed = match serve_connection(&runtime, downstream, &mut context).await {
        Ok(closed) => closed,
        Err(error) => {
            tracing::debug!(flow_id, host = %context.server_host, error = %error, "connection failed");
            Closed::new(CloseReasonCode::RelayError).with_detail(error.to_string())
        }
    };
    emit_stream_closed(&runtime, context, closed);
}

async fn serve_connection(
    runtime: &Arc<ProxyRuntime>,
    mut downstream: TcpStream,
    context: &mut FlowContext,
) -> io::Result<Closed> {
    let config = &runtime.config;
    let input = match read_connect_head(&mut downstream, config.max_connect_head_bytes).await {
        Ok(Some(input)) => input,
        Ok(None) => return Ok(Closed::new(CloseReasonCode::ClientClosed)),
        Err(error) => {
            let parse_code = match error.kind() {
                io::ErrorKind::UnexpectedEof => ParseFailureCode::IncompleteHeaders,
                io::ErrorKind::InvalidData => ParseFailureCode::HeaderTooLarge,
                _ => ParseFailureCode::ReadError,
            };
            emit_connect_parse_failed(runtime, context, parse_code, Some(error.to_string()));
            if parse_code == ParseFailureCode::HeaderTooLarge {
                write_local_response(&mut downstream, 431, "CONNECT head too large", true)
                    .await?;
            }
            return Ok(
                Closed::new(CloseReasonCode::ConnectParseFailed).with_detail(parse_code.as_str())
            );
        }
    };

    let connect = match parse_connect_request_head_with_mode(&input, config.connect_parse_mode) {
        Ok((connect, _)) => connect,
        Err(parse_error) => {
            let parse_code = ParseFailureCode::Parser(parse_error);
            emit_connect_parse_failed(runtime, context, parse_code, None);
            write_local_response(&mut downstream, 400, "invalid CONNECT request", true).await?;
            return Ok(
                Closed::new(CloseReasonCode::ConnectParseFailed).with_detail(parse_code.as_str())
            );
        }
    };
    context.server_host = connect.host;
    context.server_port = connect.port;

    if should_tunnel(config, &context.server_host) {
        tunnel_connection(runtime, context, downstream).await
    } else {
        intercept_connection(runtime, context, downstream).await
    }
}

/// Reads byte by byte so nothing past the CONNECT head is consumed.
async fn read_connect_head(
    stream: &mut TcpStream,
    max_connect_head_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut data = Vec::with_capacity(1024);
    let mut byte = [0_u8; 1];

    while !data.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            if data.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before CONNECT headers completed",
            ));
        }

        data.push(byte[0]);
        if data.len() > max_connect_head_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT header exceeded configured limit",
            ));
        }
    }

    Ok(Some(data))
}

async fn tunnel_connection(
    runtime: &Arc<ProxyRuntime>,
    context: &FlowContext,
    mut downstream: TcpStream,
) -> io::Result<Closed> {
    let mut upstream = match runtime
        .upstream
        .connect_tcp(&context.server_host, context.server_port, |attempt, error| {
            emit_upstream_retry(runtime, context, attempt, error)
        })
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            emit_upstream_failed(runtime, context, &error);
            write_local_response(&mut downstream, error.status(), &error.to_string(), true)
                .await?;
            return Ok(
                Closed::new(CloseReasonCode::UpstreamConnectFailed).with_detail(error.to_string())
            );
        }
    };

    downstream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    runtime.emit(
        Event::new(EventType::TunnelOpened, context.clone()).with_attribute("route", "passthrough"),
    );

    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((from_client, from_server)) => {
            Ok(Closed::new(CloseReasonCode::RelayEof).with_bytes(from_client, from_server))
        }
        Err(error) => Ok(Closed::new(CloseReasonCode::RelayError).with_detail(error.to_string())),
    }
}

async fn intercept_connection(
    runtime: &Arc<ProxyRuntime>,
    context: &FlowContext,
    mut downstream: TcpStream,
) -> io::Result<Closed> {
    downstream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), downstream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(error) => {
            emit_tls_failed(runtime, context, "client_hello", error.to_string());
            return Ok(tls_closed(format!("client hello rejected: {error}")));
        }
    };
    let leaf_host = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| context.server_host.clone());

    let ca = Arc::clone(&runtime.ca);
    let issued = tokio::task::spawn_blocking(move || ca.leaf_for(&leaf_host)).await?;
    let leaf = match issued {
        Ok(leaf) => leaf,
        Err(error) => {
            emit_tls_failed(runtime, context, "leaf_issuance", error.to_string());
            return Ok(tls_closed(format!("leaf issuance failed: {error}")));
        }
    };

    let downstream_tls = match start.into_stream(Arc::clone(&leaf.server_config)).await {
        Ok(stream) => stream,
        Err(error) => {
            emit_tls_failed(runtime, context, "downstream", error.to_string());
            return Ok(tls_closed(format!("downstream handshake failed: {error}")));
        }
    };
    runtime.emit(
        Event::new(EventType::TlsHandshakeSucceeded, context.clone())
            .with_attribute("peer", "downstream")
            .with_attribute("leaf_host", leaf.host.clone()),
    );

    serve_exchanges(runtime, context, downstream_tls).await
}

fn tls_closed(detail: String) -> Closed {
    Closed::new(CloseReasonCode::TlsHandshakeFailed).with_detail(detail)
}

/// Runs request/response exchanges on one intercepted connection until
/// either side closes.
async fn serve_exchanges(
    runtime: &Arc<ProxyRuntime>,
    context: &FlowContext,
    downstream_tls: DownstreamTls,
) -> io::Result<Closed> {
    let max_head = runtime.config.max_http_head_bytes;
    let host = context.server_host.as_str();
    let mut downstream = BufferedConn::new(downstream_tls);
    let mut upstream: Option<BufferedConn<UpstreamTls>> = None;
    let mut bytes_from_client = 0_u64;
    let mut bytes_from_server = 0_u64;

    loop {
        let request_raw = match read_until_pattern(&mut downstream, b"\r\n\r\n", max_head).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Ok(Closed::new(CloseReasonCode::HttpCompleted)
                    .with_bytes(bytes_from_client, bytes_from_server))
            }
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                let error = ExchangeError::MalformedRequest(error.to_string());
                emit_malformed(runtime, context, "header_too_large", &error);
                write_local_response(&mut downstream.stream, 431, "request head too large", true)
                    .await?;
                return Ok(malformed_closed(&error));
            }
            Err(error) => return Err(error),
        };

        let mut request = match parse_http_request_head(&request_raw) {
            Ok(request) => request,
            Err(parse_error) => {
                let error = ExchangeError::MalformedRequest(parse_error.to_string());
                emit_malformed(runtime, context, parse_error.code(), &error);
                write_local_response(
                    &mut downstream.stream,
                    error.status(),
                    "malformed request",
                    true,
                )
                .await?;
                return Ok(malformed_closed(&error));
            }
        };
        runtime.emit(
            Event::new(EventType::RequestHeaders, context.clone())
                .with_attribute("method", request.method.clone())
                .with_attribute("path", request.path().to_string()),
        );

        let snapshot = runtime.coordinator.snapshot();
        let decision = runtime
            .rewriter
            .rewrite(&mut request, host, snapshot.as_deref());
        emit_decision(runtime, context, &decision);

        if runtime.response_policy.wants_settings_reload(&request, host) {
            let settings = Arc::clone(runtime.response_policy.settings());
            match tokio::task::spawn_blocking(move || settings.reload()).await? {
                Ok(_) => {}
                Err(error) => tracing::warn!(error = %error, "user settings reload failed"),
            }
        }

        if let RewriteAction::LocalResponse { status } = decision.action {
            bytes_from_client += drain_body(&mut downstream, request.body_mode).await?;
            write_local_response(&mut downstream.stream, status, "", request.connection_close)
                .await?;
            if request.connection_close {
                return Ok(Closed::new(CloseReasonCode::HttpCompleted)
                    .with_bytes(bytes_from_client, bytes_from_server));
            }
            continue;
        }

        let head = match decision.action {
            RewriteAction::Rewritten { .. } => request.encode(),
            _ => request.raw.clone(),
        };
        let mut reconnected = false;
        let (upstream_conn, response) = loop {
            let (conn, reused) =
                match send_request_head(runtime, context, &mut upstream, &head).await {
                    Ok(sent) => sent,
                    Err(error) => {
                        emit_upstream_failed(runtime, context, &error);
                        write_local_response(
                            &mut downstream.stream,
                            error.status(),
                            &error.to_string(),
                            true,
                        )
                        .await?;
                        return Ok(Closed::new(CloseReasonCode::UpstreamConnectFailed)
                            .with_detail(error.to_string())
                            .with_bytes(bytes_from_client, bytes_from_server));
                    }
                };

            bytes_from_client +=
                relay_body(&mut downstream, &mut conn.stream, request.body_mode).await?;

            let detail = match read_final_response(&mut downstream, conn, &request, max_head).await?
            {
                FinalResponse::Head(response) => break (conn, response),
                FinalResponse::Closed(detail)
                    if reused && !reconnected && request.body_mode == HttpBodyMode::None =>
                {
                    tracing::debug!(
                        host = %context.server_host,
                        detail = %detail,
                        "kept upstream connection closed before responding; reconnecting"
                    );
                    emit_upstream_retry(
                        runtime,
                        context,
                        1,
                        &io::Error::new(io::ErrorKind::UnexpectedEof, detail),
                    );
                    upstream = None;
                    reconnected = true;
                    continue;
                }
                FinalResponse::Closed(detail) | FinalResponse::Unusable(detail) => detail,
            };
            let error = ExchangeError::Upstream {
                authority: format!("{}:{}", context.server_host, context.server_port),
                status: 502,
                detail,
            };
            emit_upstream_failed(runtime, context, &error);
            write_local_response(&mut downstream.stream, error.status(), "bad upstream response", true)
                .await?;
            return Ok(Closed::new(CloseReasonCode::UpstreamProtocolError)
                .with_detail(error.to_string())
                .with_bytes(bytes_from_client, bytes_from_server));
        };
        runtime.emit(
            Event::new(EventType::ResponseHeaders, context.clone())
                .with_attribute("status_code", response.status_code.to_string()),
        );

        if response.status_code == 101 {
            downstream.stream.write_all(&response.raw).await?;
            let (from_client, from_server) =
                relay_upgraded(&mut downstream, upstream_conn).await?;
            return Ok(Closed::new(CloseReasonCode::Upgraded).with_bytes(
                bytes_from_client + from_client,
                bytes_from_server + from_server,
            ));
        }

        let action = runtime
            .response_policy
            .inspect(&request, host, &response, &decision);
        bytes_from_server += match action {
            ResponseAction::ReplaceBody(body) => {
                drain_body(upstream_conn, response.body_mode).await?;
                let mut head = response.clone();
                head.remove_header("transfer-encoding");
                head.remove_header("content-encoding");
                head.set_header("Content-Length", body.len().to_string());
                head.set_header("Content-Type", "application/json");
                downstream.stream.write_all(&head.encode()).await?;
                downstream.stream.write_all(&body).await?;
                downstream.stream.flush().await?;
                runtime.emit(
                    Event::new(EventType::ResponseBodyReplaced, context.clone())
                        .with_attribute("bytes", body.len().to_string()),
                );
                body.len() as u64
            }
            other => {
                apply_account_action(runtime, context, other).await;
                downstream.stream.write_all(&response.raw).await?;
                relay_body(upstream_conn, &mut downstream.stream, response.body_mode).await?
            }
        };

        if request.connection_close
            || response.connection_close
            || response.body_mode == HttpBodyMode::CloseDelimited
        {
            return Ok(Closed::new(CloseReasonCode::HttpCompleted)
                .with_bytes(bytes_from_client, bytes_from_server));
        }
    }
}

fn malformed_closed(error: &ExchangeError) -> Closed {
    Closed::new(CloseReasonCode::MalformedRequest).with_detail(error.to_string())
}

/// Writes `head` on the kept upstream connection, reconnecting once when
/// that write fails or no connection is open yet. The flag tells whether the
/// kept connection was used.
async fn send_request_head<'a>(
    runtime: &ProxyRuntime,
    context: &FlowContext,
    slot: &'a mut Option<BufferedConn<UpstreamTls>>,
    head: &[u8],
) -> Result<(&'a mut BufferedConn<UpstreamTls>, bool), ExchangeError> {
    if let Some(mut conn) = slot.take() {
        if write_head(&mut conn, head).await.is_ok() {
            return Ok((slot.insert(conn), true));
        }
        tracing::debug!(
            host = %context.server_host,
            "kept upstream connection failed; reconnecting"
        );
    }

    let stream = runtime
        .upstream
        .connect_tls(&context.server_host, context.server_port, |attempt, error| {
            emit_upstream_retry(runtime, context, attempt, error)
        })
        .await?;
    let conn = slot.insert(BufferedConn::new(stream));
    write_head(conn, head)
        .await
        .map_err(|error| ExchangeError::Upstream {
            authority: format!("{}:{}", context.server_host, context.server_port),
            status: 502,
            detail: error.to_string(),
        })?;
    Ok((conn, false))
}

async fn write_head(conn: &mut BufferedConn<UpstreamTls>, head: &[u8]) -> io::Result<()> {
    conn.stream.write_all(head).await?;
    conn.stream.flush().await
}

enum FinalResponse {
    Head(HttpResponseHead),
    /// The upstream went away before sending a single response byte.
    Closed(String),
    Unusable(String),
}

/// Reads response heads, forwarding interim `1xx` heads, until a final head
/// or `101 Switching Protocols` arrives.
async fn read_final_response(
    downstream: &mut BufferedConn<DownstreamTls>,
    upstream: &mut BufferedConn<UpstreamTls>,
    request: &HttpRequestHead,
    max_head: usize,
) -> io::Result<FinalResponse> {
    let mut interim_forwarded = false;
    loop {
        let raw = match read_until_pattern(upstream, b"\r\n\r\n", max_head).await {
            Ok(Some(raw)) => raw,
            Ok(None) if !interim_forwarded => {
                return Ok(FinalResponse::Closed(
                    "upstream closed before response headers".to_string(),
                ))
            }
            Ok(None) => {
                return Ok(FinalResponse::Unusable(
                    "upstream closed before final response headers".to_string(),
                ))
            }
            Err(error)
                if !interim_forwarded
                    && upstream.read_buf.is_empty()
                    && is_connection_gone(&error) =>
            {
                return Ok(FinalResponse::Closed(format!(
                    "upstream connection lost before response headers: {error}"
                )))
            }
            Err(error) => {
                return Ok(FinalResponse::Unusable(format!(
                    "response head read failed: {error}"
                )))
            }
        };
        let response = match parse_http_response_head(&raw, &request.method) {
            Ok(response) => response,
            Err(error) => {
                return Ok(FinalResponse::Unusable(format!(
                    "response parse error: {error}"
                )))
            }
        };
        if (100..200).contains(&response.status_code) && response.status_code != 101 {
            downstream.stream.write_all(&response.raw).await?;
            downstream.stream.flush().await?;
            interim_forwarded = true;
            continue;
        }
        return Ok(FinalResponse::Head(response));
    }
}

fn is_connection_gone(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

async fn relay_upgraded(
    downstream: &mut BufferedConn<DownstreamTls>,
    upstream: &mut BufferedConn<UpstreamTls>,
) -> io::Result<(u64, u64)> {
    let from_client = downstream.read_buf.len() as u64;
    let from_server = upstream.read_buf.len() as u64;
    if !downstream.read_buf.is_empty() {
        upstream.stream.write_all(&downstream.read_buf).await?;
        downstream.read_buf.clear();
    }
    if !upstream.read_buf.is_empty() {
        downstream.stream.write_all(&upstream.read_buf).await?;
        upstream.read_buf.clear();
    }
    upstream.stream.flush().await?;
    downstream.stream.flush().await?;

    let (client, server) =
        tokio::io::copy_bidirectional(&mut downstream.stream, &mut upstream.stream).await?;
    Ok((from_client + client, from_server + server))
}

async fn apply_account_action(
    runtime: &Arc<ProxyRuntime>,
    context: &FlowContext,
    action: ResponseAction,
) {
    match action {
        ResponseAction::MarkBlocked { account_id } => {
            let coordinator = Arc::clone(&runtime.coordinator);
            let blocked_id = account_id.clone();
            match tokio::task::spawn_blocking(move || coordinator.block_active(&blocked_id)).await
            {
                Ok(Ok(selection_cleared)) => {
                    tracing::warn!(
                        account_id = %account_id,
                        selection_cleared,
                        "upstream refused account; marked blocked"
                    );
                    runtime.emit(
                        Event::new(EventType::AccountBlocked, context.clone())
                            .with_attribute("account_id", account_id)
                            .with_attribute("selection_cleared", selection_cleared.to_string()),
                    );
                }
                Ok(Err(error)) => {
                    tracing::warn!(account_id = %account_id, error = %error, "failed to block account")
                }
                Err(error) => {
                    tracing::warn!(account_id = %account_id, error = %error, "block task failed")
                }
            }
        }
        ResponseAction::RefreshCredentials { account_id } => match &runtime.keeper {
            Some(keeper) => keeper.request_refresh(&account_id),
            None => tracing::debug!(account_id = %account_id, "token refresh disabled"),
        },
        ResponseAction::Forward | ResponseAction::ReplaceBody(_) => {}
    }
}

fn emit_decision(runtime: &ProxyRuntime, context: &FlowContext, decision: &RewriteDecision) {
    let event = match &decision.action {
        RewriteAction::LocalResponse { status } => {
            Event::new(EventType::LocalResponse, context.clone())
                .with_attribute("status_code", status.to_string())
        }
        RewriteAction::PassThrough => Event::new(EventType::RequestPassedThrough, context.clone()),
        RewriteAction::Rewritten {
            account_id,
            rule_id,
        } => Event::new(EventType::CredentialSubstituted, context.clone())
            .with_attribute("account_id", account_id.clone())
            .with_attribute("rule_id", rule_id.clone()),
    };
    runtime.emit(event.with_attribute("reason", decision.reason.as_str()));
}

fn emit_malformed(
    runtime: &ProxyRuntime,
    context: &FlowContext,
    code: &str,
    error: &ExchangeError,
) {
    runtime.emit(
        Event::new(EventType::MalformedRequest, context.clone())
            .with_attribute("parse_error_code", code)
            .with_attribute("parse_error_detail", error.to_string()),
    );
}

fn emit_upstream_retry(runtime: &ProxyRuntime, context: &FlowContext, attempt: u32, error: &io::Error) {
    runtime.emit(
        Event::new(EventType::UpstreamRetry, context.clone())
            .with_attribute("attempt", attempt.to_string())
            .with_attribute("error", error.to_string()),
    );
}

fn emit_upstream_failed(runtime: &ProxyRuntime, context: &FlowContext, error: &ExchangeError) {
    runtime.emit(
        Event::new(EventType::UpstreamFailed, context.clone())
            .with_attribute("status_code", error.status().to_string())
            .with_attribute("detail", error.to_string()),
    );
}

fn emit_tls_failed(runtime: &ProxyRuntime, context: &FlowContext, stage: &str, detail: String) {
    runtime.emit(
        Event::new(EventType::TlsHandshakeFailed, context.clone())
            .with_attribute("stage", stage)
            .with_attribute("detail", detail),
    );
}

fn emit_connect_parse_failed(
    runtime: &ProxyRuntime,
    context: &FlowContext,
    parse_failure: ParseFailureCode,
    parse_detail: Option<String>,
) {
    let mut event = Event::new(EventType::ConnectParseFailed, context.clone())
        .with_attribute("parse_error_code", parse_failure.as_str());
    if let Some(detail) = parse_detail {
        event = event.with_attribute("parse_error_detail", detail);
    }
    runtime.emit(event);
}

fn emit_stream_closed(runtime: &ProxyRuntime, context: FlowContext, closed: Closed) {
    let mut event = Event::new(EventType::StreamClosed, context)
        .with_attribute("reason_code", closed.code.as_str());
    if let Some(detail) = closed.detail {
        event = event.with_attribute("reason_detail", detail);
    }
    if let Some(value) = closed.bytes_from_client {
        event = event.with_attribute("bytes_from_client", value.to_string());
    }
    if let Some(value) = closed.bytes_from_server {
        event = event.with_attribute("bytes_from_server", value.to_string());
    }
    runtime.emit(event);
}

fn unknown_context(flow_id: u64, client_addr: String) -> FlowContext {
    FlowContext {
        flow_id,
        client_addr,
        server_host: "<unknown>".to_string(),
        server_port: 0,
    }
}
