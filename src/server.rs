//! The connection core: accept loop, connection registry, request parsing,
//! prepare-hook invocation, handler dispatch, and statistics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::parse_proxy_authorization;
use crate::error::{ProxyError, RequestError};
use crate::events::{
    ConnectionClosedEvent, EventReceiver, EventSender, ProxyEvent, RequestFailedEvent,
};
use crate::handlers::{chain, custom, direct, forward, write_status_response, write_status_response_with_headers};
use crate::headers::{default_port_for_scheme, parse_authority};
use crate::prepare::{
    DispatchMode, HandlerOptions, PrepareRequestFn, PrepareRequestInput, PrepareRequestResult,
    ResponseBody,
};
use crate::stats::{ByteCounters, ConnectionStats, CountingStream, ServerStats};

/// Configuration the server itself needs, independent of any one request.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub auth_realm: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_realm: "proxychain".to_string(),
        }
    }
}

struct ConnectionEntry {
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
    /// Filled in synchronously right after `tokio::spawn` returns. Briefly
    /// `None` between registration and spawn; a `closeConnection` that lands
    /// in that window is a no-op, which is an accepted race (see DESIGN.md).
    abort_handle: Option<AbortHandle>,
}

struct ServerInner {
    options: ServerOptions,
    prepare: Option<PrepareRequestFn>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    stats: ServerStats,
    events: EventSender,
    bound_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

/// A running (or not-yet-started) proxy server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(options: ServerOptions, prepare: Option<PrepareRequestFn>) -> Self {
        let (events, _rx) = crate::events::channel(256);
        Self {
            inner: Arc::new(ServerInner {
                options,
                prepare,
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stats: ServerStats::default(),
                events,
                bound_addr: RwLock::new(None),
                shutdown_tx: RwLock::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Bind the listening socket and spawn the accept loop. Returns the
    /// bound address (useful when `port` was 0).
    pub async fn listen(&self) -> Result<SocketAddr, ProxyError> {
        let listener = TcpListener::bind((self.inner.options.host.as_str(), self.inner.options.port))
            .await?;
        let addr = listener.local_addr()?;
        *self.inner.bound_addr.write().await = Some(addr);

        let (tx, mut rx) = oneshot::channel();
        *self.inner.shutdown_tx.write().await = Some(tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => {
                        info!("proxy listener shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let inner = inner.clone();
                                let connection_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                                let client_counters = Arc::new(ByteCounters::default());
                                let target_counters = Arc::new(ByteCounters::default());
                                inner.connections.lock().unwrap().insert(
                                    connection_id,
                                    ConnectionEntry {
                                        client_counters: client_counters.clone(),
                                        target_counters: target_counters.clone(),
                                        abort_handle: None,
                                    },
                                );

                                let spawn_inner = inner.clone();
                                let spawn_client_counters = client_counters.clone();
                                let spawn_target_counters = target_counters.clone();
                                let join = tokio::spawn(async move {
                                    if let Err(err) = handle_connection(
                                        spawn_inner,
                                        stream,
                                        peer,
                                        connection_id,
                                        spawn_client_counters,
                                        spawn_target_counters,
                                    )
                                    .await
                                    {
                                        warn!(%err, "connection handling failed");
                                    }
                                });
                                if let Some(entry) = inner.connections.lock().unwrap().get_mut(&connection_id) {
                                    entry.abort_handle = Some(join.abort_handle());
                                }
                            }
                            Err(err) => {
                                error!(%err, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(addr)
    }

    pub async fn addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.read().await
    }

    pub async fn connection_stats(&self, id: u64) -> Option<ConnectionStats> {
        let connections = self.inner.connections.lock().unwrap();
        connections.get(&id).map(|entry| {
            let (tx, rx) = entry.client_counters.snapshot();
            let (trg_tx, trg_rx) = entry.target_counters.snapshot();
            ConnectionStats {
                src_tx_bytes: tx,
                src_rx_bytes: rx,
                trg_tx_bytes: trg_tx,
                trg_rx_bytes: trg_rx,
            }
        })
    }

    pub async fn connection_ids(&self) -> Vec<u64> {
        self.inner.connections.lock().unwrap().keys().copied().collect()
    }

    pub fn stats_snapshot(&self) -> (u64, u64, u64) {
        self.inner.stats.snapshot()
    }

    /// Forcibly terminate one connection by id. The connection's task is
    /// aborted mid-flight, so unlike a connection that runs to completion,
    /// this is the one path that does *not* go through the handler's own
    /// cleanup — the `connectionClosed` event is emitted here instead, using
    /// whatever byte counts had accumulated at the moment of the abort.
    pub async fn close_connection(&self, id: u64) -> bool {
        let entry = self.inner.connections.lock().unwrap().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(handle) = &entry.abort_handle {
                    handle.abort();
                }
                emit_forced_close(&self.inner, id, &entry);
                true
            }
            None => false,
        }
    }

    /// Forcibly terminate every connection currently tracked.
    pub async fn close_connections(&self) {
        let entries: Vec<(u64, ConnectionEntry)> =
            self.inner.connections.lock().unwrap().drain().collect();
        for (id, entry) in entries {
            if let Some(handle) = &entry.abort_handle {
                handle.abort();
            }
            emit_forced_close(&self.inner, id, &entry);
        }
    }

    /// Stop accepting new connections. When `close_connections` is true,
    /// also forcibly terminates every connection currently in flight;
    /// otherwise existing connections run to completion.
    pub async fn close(&self, close_connections: bool) {
        if let Some(tx) = self.inner.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        if close_connections {
            self.close_connections().await;
        }
    }
}

fn emit_forced_close(inner: &Arc<ServerInner>, connection_id: u64, entry: &ConnectionEntry) {
    let (tx, rx) = entry.client_counters.snapshot();
    let (trg_tx, trg_rx) = entry.target_counters.snapshot();
    let stats = ConnectionStats {
        src_tx_bytes: tx,
        src_rx_bytes: rx,
        trg_tx_bytes: trg_tx,
        trg_rx_bytes: trg_rx,
    };
    inner
        .stats
        .traffic_used_in_bytes
        .fetch_add(tx + rx + trg_tx + trg_rx, Ordering::Relaxed);
    let _ = inner
        .events
        .send(ProxyEvent::ConnectionClosed(ConnectionClosedEvent {
            connection_id,
            stats,
        }));
}

#[instrument(skip(inner, stream, client_counters, target_counters), fields(peer = %peer))]
async fn handle_connection(
    inner: Arc<ServerInner>,
    mut stream: TcpStream,
    peer: SocketAddr,
    connection_id: u64,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
) -> Result<(), ProxyError> {
    let mut peek_buf = [0u8; 8];
    let peeked = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let is_connect = peeked >= 7 && &peek_buf[..7] == b"CONNECT";

    let result = if is_connect {
        inner
            .stats
            .connect_request_count
            .fetch_add(1, Ordering::Relaxed);
        handle_connect_connection(
            &inner,
            stream,
            connection_id,
            client_counters.clone(),
            target_counters.clone(),
        )
        .await
    } else {
        handle_http_connection(
            &inner,
            stream,
            connection_id,
            client_counters.clone(),
            target_counters.clone(),
        )
        .await
    };

    // A concurrent `closeConnection`/`closeConnections` may already have
    // removed this entry and emitted its own `connectionClosed`; only do so
    // here when this task is the one that actually owns the removal.
    let removed = inner.connections.lock().unwrap().remove(&connection_id);
    if removed.is_some() {
        let (tx, rx) = client_counters.snapshot();
        let (trg_tx, trg_rx) = target_counters.snapshot();
        let stats = ConnectionStats {
            src_tx_bytes: tx,
            src_rx_bytes: rx,
            trg_tx_bytes: trg_tx,
            trg_rx_bytes: trg_rx,
        };
        inner
            .stats
            .traffic_used_in_bytes
            .fetch_add(tx + rx + trg_tx + trg_rx, Ordering::Relaxed);
        let _ = inner
            .events
            .send(ProxyEvent::ConnectionClosed(ConnectionClosedEvent {
                connection_id,
                stats,
            }));
    }

    if let Err(err) = &result {
        debug!(connection_id, %err, "connection ended with an error");
    }
    result
}

async fn handle_connect_connection(
    inner: &Arc<ServerInner>,
    mut stream: TcpStream,
    connection_id: u64,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
) -> Result<(), ProxyError> {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            debug!(connection_id, %err, "failed to read CONNECT request head");
            return Ok(());
        }
    };

    let authority = head.request_uri.clone();
    let Some((hostname, port)) = parse_authority(&authority) else {
        write_status_response(&mut stream, 400, "Bad Request", "malformed CONNECT target").await?;
        return Ok(());
    };

    let auth = parse_proxy_authorization(head.headers.get("proxy-authorization").and_then(|v| v.to_str().ok()));

    let prepare_input = PrepareRequestInput {
        connection_id,
        method: "CONNECT".to_string(),
        url: format!("{hostname}:{port}"),
        headers: head.headers.clone(),
        username: auth.username,
        password: auth.password,
        hostname: hostname.clone(),
        port,
        is_http: false,
    };

    let decision = match run_prepare(inner, prepare_input).await {
        Ok(d) => d,
        Err(req_err) => {
            let mut headers = req_err.headers.clone();
            let has_proxy_authenticate = headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("proxy-authenticate"));
            if req_err.status == 407 && !has_proxy_authenticate {
                headers.push((
                    "Proxy-Authenticate".to_string(),
                    format!("Basic realm=\"{}\"", inner.options.auth_realm),
                ));
            }
            write_status_response_with_headers(
                &mut stream,
                req_err.status,
                "Request Error",
                &headers,
                &req_err.message,
            )
            .await?;
            return Ok(());
        }
    };

    if decision.request_authentication {
        let body = decision.fail_msg.unwrap_or_default();
        write_status_response(&mut stream, 407, "Proxy Authentication Required", &body).await?;
        return Ok(());
    }

    let local_address = decision.local_address;
    let ip_family = decision.ip_family;
    let dns_lookup = decision.dns_lookup.clone();

    let opts = HandlerOptions {
        hostname,
        port,
        is_http: false,
        upstream_proxy_url: decision
            .upstream_proxy_url
            .and_then(|u| url::Url::parse(&u).ok()),
        ignore_upstream_proxy_certificate: decision.ignore_upstream_proxy_certificate,
        custom_response_function: decision.custom_response_function,
        custom_connect_server: decision.custom_connect_server,
        dns_lookup,
        custom_tag: decision.custom_tag,
    };

    match opts.dispatch_mode() {
        // A `customResponseFunction` is ignored on CONNECT (see
        // `HandlerOptions::dispatch_mode`), so this mode is unreachable
        // with `is_http: false` above.
        DispatchMode::Custom => unreachable!("custom response is ignored on CONNECT"),
        DispatchMode::CustomConnect => {
            let server_fn = opts.custom_connect_server.unwrap();
            custom::handle_connect_server(stream, &server_fn).await?;
        }
        DispatchMode::Direct => {
            direct::handle(
                stream,
                &opts.hostname,
                opts.port,
                local_address,
                ip_family,
                opts.dns_lookup.clone(),
                None,
                client_counters,
                target_counters,
            )
            .await?;
        }
        DispatchMode::ChainHttp => {
            let upstream = opts.upstream_proxy_url.unwrap();
            chain::handle_http_upstream(
                stream,
                &upstream,
                &opts.hostname,
                opts.port,
                chain::FramingMode::Http,
                None,
                client_counters,
                target_counters,
                inner.events.clone(),
                connection_id,
                opts.custom_tag,
                opts.ignore_upstream_proxy_certificate,
            )
            .await?;
        }
        DispatchMode::ChainSocks => {
            let upstream = opts.upstream_proxy_url.unwrap();
            chain::handle_socks_upstream(
                stream,
                &upstream,
                &opts.hostname,
                opts.port,
                chain::FramingMode::Http,
                None,
                client_counters,
                target_counters,
            )
            .await?;
        }
    }

    Ok(())
}

async fn handle_http_connection(
    inner: &Arc<ServerInner>,
    stream: TcpStream,
    connection_id: u64,
    client_counters: Arc<ByteCounters>,
    _target_counters: Arc<ByteCounters>,
) -> Result<(), ProxyError> {
    let io = TokioIo::new(CountingStream::new(stream, client_counters));
    let inner = inner.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let inner = inner.clone();
        async move {
            inner
                .stats
                .http_request_count
                .fetch_add(1, Ordering::Relaxed);
            let response = handle_forwarded_request(&inner, connection_id, req).await;
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
        .map_err(|err| ProxyError::Io(std::io::Error::other(err.to_string())))
}

async fn handle_forwarded_request(
    inner: &Arc<ServerInner>,
    connection_id: u64,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let method = req.method().to_string();
    let url = req.uri().to_string();
    let Some(host) = req.uri().host().map(|h| h.to_string()) else {
        return plain_error(400, "request URI must be absolute-form");
    };
    let scheme = req.uri().scheme_str().unwrap_or("http");
    let port = req
        .uri()
        .port_u16()
        .or_else(|| default_port_for_scheme(scheme))
        .unwrap_or(80);

    let auth = parse_proxy_authorization(
        req.headers()
            .get("proxy-authorization")
            .and_then(|v| v.to_str().ok()),
    );

    let prepare_input = PrepareRequestInput {
        connection_id,
        method: method.clone(),
        url: url.clone(),
        headers: req.headers().clone(),
        username: auth.username,
        password: auth.password,
        hostname: host.clone(),
        port,
        is_http: true,
    };

    let decision = match run_prepare(inner, prepare_input).await {
        Ok(d) => d,
        Err(req_err) => {
            let _ = inner
                .events
                .send(ProxyEvent::RequestFailed(RequestFailedEvent {
                    connection_id,
                    method,
                    url,
                    error: req_err.message.clone(),
                }));
            return request_error_response(&req_err, &inner.options.auth_realm);
        }
    };

    if decision.request_authentication {
        let mut response = plain_error(407, &decision.fail_msg.unwrap_or_default());
        response.headers_mut().insert(
            hyper::header::PROXY_AUTHENTICATE,
            HeaderValue::from_str(&format!("Basic realm=\"{}\"", inner.options.auth_realm))
                .unwrap_or_else(|_| HeaderValue::from_static("Basic")),
        );
        return response;
    }

    if let Some(custom_fn) = &decision.custom_response_function {
        return custom::build_response(custom_fn).await;
    }

    match decision.upstream_proxy_url.as_deref().map(url::Url::parse) {
        Some(Ok(upstream)) => match upstream.scheme() {
            "socks4" | "socks4a" => {
                let upstream_host = upstream.host_str().unwrap_or_default().to_string();
                let upstream_port = upstream.port().unwrap_or(1080);
                forward::forward_via_socks4(&upstream_host, upstream_port, req).await
            }
            "socks" | "socks5" | "socks5h" => {
                match forward::client_with_socks5_upstream(
                    &upstream,
                    decision.ignore_upstream_proxy_certificate,
                ) {
                    Ok(client) => forward::forward(&client, req, false).await,
                    Err(err) => plain_error(599, &err.to_string()),
                }
            }
            _ => match forward::client_with_http_upstream(
                &upstream,
                decision.ignore_upstream_proxy_certificate,
            ) {
                Ok(client) => forward::forward(&client, req, false).await,
                Err(err) => plain_error(599, &err.to_string()),
            },
        },
        Some(Err(_)) => plain_error(599, "invalid upstream proxy URL"),
        None => {
            let client = reqwest::Client::new();
            forward::forward(&client, req, true).await
        }
    }
}

async fn run_prepare(
    inner: &Arc<ServerInner>,
    input: PrepareRequestInput,
) -> Result<PrepareRequestResult, RequestError> {
    match &inner.prepare {
        None => Ok(PrepareRequestResult::default()),
        Some(hook) => hook(input).await,
    }
}

fn request_error_response(err: &RequestError, auth_realm: &str) -> Response<ResponseBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "text/plain; charset=utf-8");
    let has_proxy_authenticate = err
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("proxy-authenticate"));
    for (name, value) in &err.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if err.status == 407 && !has_proxy_authenticate {
        builder = builder.header(
            hyper::header::PROXY_AUTHENTICATE,
            format!("Basic realm=\"{auth_realm}\""),
        );
    }
    builder
        .body(
            Full::new(Bytes::copy_from_slice(err.message.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| plain_error(500, "malformed error headers"))
}

fn plain_error(status: u16, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::copy_from_slice(message.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("status code and static header are always valid")
}

struct RequestHead {
    #[allow(dead_code)]
    method: String,
    request_uri: String,
    headers: HeaderMap,
}

/// Read a request line + headers off a raw socket, up to the terminating
/// blank line. Used only for CONNECT, which this server handles outside of
/// hyper's own request loop so the socket can be upgraded to a raw tunnel.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<RequestHead> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head completed",
            ));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let request_uri = parts.next().unwrap_or_default().to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':')
            && let (Ok(n), Ok(v)) = (
                hyper::header::HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            )
        {
            headers.append(n, v);
        }
    }

    Ok(RequestHead {
        method,
        request_uri,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn connection_stats_is_none_for_an_id_that_was_never_registered() {
        let server = Server::new(ServerOptions::default(), None);
        assert!(tokio_test::block_on(server.connection_stats(999)).is_none());
    }

    #[test]
    fn request_error_response_auto_adds_proxy_authenticate_for_407() {
        let err = RequestError::new("auth please", 407);
        let response = request_error_response(&err, "myrealm");
        assert_eq!(
            response.headers().get("proxy-authenticate").unwrap(),
            "Basic realm=\"myrealm\""
        );
    }

    #[test]
    fn request_error_response_does_not_override_an_explicit_proxy_authenticate() {
        let err = RequestError::with_headers(
            "auth please",
            407,
            vec![("Proxy-Authenticate".to_string(), "Custom scheme".to_string())],
        );
        let response = request_error_response(&err, "myrealm");
        assert_eq!(
            response.headers().get("proxy-authenticate").unwrap(),
            "Custom scheme"
        );
    }

    #[tokio::test]
    async fn connect_prepare_hook_rejection_carries_an_auto_added_proxy_authenticate() {
        let prepare: PrepareRequestFn = Arc::new(|_input| {
            Box::pin(async { Err(RequestError::new("nope", 407)) })
        });

        let server = Server::new(ServerOptions::default(), Some(prepare));
        let addr = server.listen().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.read_to_end(&mut buf),
        )
        .await;
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 407"), "got: {text}");
        assert!(text.to_lowercase().contains("proxy-authenticate: basic realm=\"proxychain\""));

        server.close(true).await;
    }

    #[tokio::test]
    async fn direct_connect_end_to_end_establishes_and_pipes() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut sock, _) = origin_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let server = Server::new(ServerOptions::default(), None);
        let addr = server.listen().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut established = [0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client);
        origin.await.unwrap();
        server.close(false).await;
    }

    #[tokio::test]
    async fn forward_end_to_end_relays_origin_response() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut sock, _) = origin_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("GET /hello"));
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let server = Server::new(ServerOptions::default(), None);
        let addr = server.listen().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{}/hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.read_to_end(&mut buf),
        )
        .await;
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("hello"));

        origin.await.unwrap();
        server.close(false).await;
    }

    #[tokio::test]
    async fn close_connections_forcibly_ends_an_in_flight_tunnel() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut sock, _) = origin_listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            let _ = sock.read(&mut buf).await;
        });

        let server = Server::new(ServerOptions::default(), None);
        let addr = server.listen().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut established = [0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        // Give the accept loop's abort-handle registration a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut events = server.subscribe();
        server.close_connections().await;

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ProxyEvent::ConnectionClosed(_) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }

        assert!(server.connection_ids().await.is_empty());

        // The client's half of the socket should observe the forced close.
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        origin.abort();
    }
}
