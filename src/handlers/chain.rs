//! §4.5 chain handler (CONNECT through an upstream HTTP/HTTPS proxy) and
//! §4.6 chainSocks (CONNECT through a SOCKS4/4a/5/5h upstream).

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::credentials_from_url;
use crate::error::ProxyStatus;
use crate::events::{EventSender, ProxyEvent, TunnelConnectEvent, TunnelConnectOutcome};
use crate::handlers::{pipe_bidirectional, write_connection_established, write_proxy_status};
use crate::socks::{dial as socks_dial, status_for_dial_error, version_for_scheme};
use crate::stats::ByteCounters;

/// Either a plain TCP connection to the upstream proxy or, when the
/// upstream URL scheme is `https`, a TLS session wrapping it. Unifies the
/// two so the rest of the handshake and relay code stays generic over the
/// transport.
enum UpstreamTransport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamTransport {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamTransport::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            UpstreamTransport::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamTransport {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamTransport::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            UpstreamTransport::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamTransport::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            UpstreamTransport::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamTransport::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            UpstreamTransport::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Outcome mode: an HTTP client expects the `200 Connection Established`
/// framing; a plain TCP tunnel (`createTunnel`) does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Http,
    Plain,
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_http_upstream<C>(
    mut client: C,
    upstream: &url::Url,
    target_host: &str,
    target_port: u16,
    framing: FramingMode,
    head: Option<Bytes>,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
    events: EventSender,
    proxy_chain_id: u64,
    custom_tag: Option<String>,
    ignore_upstream_proxy_certificate: bool,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let upstream_host = upstream.host_str().unwrap_or_default();
    let upstream_port = upstream
        .port_or_known_default()
        .unwrap_or(if upstream.scheme() == "https" { 443 } else { 80 });

    let tcp = match TcpStream::connect((upstream_host, upstream_port)).await {
        Ok(s) => s,
        Err(err) => {
            let status = ProxyStatus::from_io_error(&err);
            warn!(%err, status = status.code(), "upstream proxy connect failed");
            if framing == FramingMode::Http {
                write_proxy_status(&mut client, status).await?;
            }
            return Ok(());
        }
    };

    let mut upstream_stream = if upstream.scheme() == "https" {
        match crate::tls::connect(tcp, upstream_host, ignore_upstream_proxy_certificate).await {
            Ok(tls) => UpstreamTransport::Tls(Box::new(tls)),
            Err(err) => {
                let status = ProxyStatus::from_io_error(&err);
                warn!(%err, status = status.code(), "upstream proxy TLS handshake failed");
                if framing == FramingMode::Http {
                    write_proxy_status(&mut client, status).await?;
                }
                return Ok(());
            }
        }
    } else {
        UpstreamTransport::Plain(tcp)
    };

    let dest = format!("{target_host}:{target_port}");
    let mut request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n");
    if let Some((user, pass)) = credentials_from_url(upstream) {
        match crate::auth::build_basic_auth_header(&user, &pass) {
            Ok(header) => request.push_str(&format!("Proxy-Authorization: {header}\r\n")),
            Err(err) => {
                warn!(%err, "invalid upstream proxy credentials");
                if framing == FramingMode::Http {
                    write_proxy_status(&mut client, ProxyStatus::AuthFailed).await?;
                }
                return Ok(());
            }
        }
    }
    request.push_str("\r\n");

    if let Err(err) = upstream_stream.write_all(request.as_bytes()).await {
        let status = ProxyStatus::from_io_error(&err);
        if framing == FramingMode::Http {
            write_proxy_status(&mut client, status).await?;
        }
        return Ok(());
    }

    let handshake = match read_connect_handshake(&mut upstream_stream).await {
        Ok(h) => h,
        Err(err) => {
            let status = ProxyStatus::from_io_error(&err);
            if framing == FramingMode::Http {
                write_proxy_status(&mut client, status).await?;
            }
            return Ok(());
        }
    };

    match handshake {
        HandshakeResult::Success => {
            let _ = events.send(ProxyEvent::TunnelConnect(TunnelConnectEvent {
                proxy_chain_id,
                outcome: TunnelConnectOutcome::Responded,
                status_code: 200,
                head: Bytes::new(),
                custom_tag: custom_tag.clone(),
            }));
            debug!(target_host, target_port, "upstream CONNECT succeeded");
            if framing == FramingMode::Http {
                write_connection_established(&mut client).await?;
            }
            pipe_bidirectional(
                client,
                upstream_stream,
                client_counters,
                target_counters,
                head,
            )
            .await
        }
        HandshakeResult::AuthRequired(code) => {
            let _ = events.send(ProxyEvent::TunnelConnect(TunnelConnectEvent {
                proxy_chain_id,
                outcome: TunnelConnectOutcome::Failed,
                status_code: code,
                head: Bytes::new(),
                custom_tag,
            }));
            if framing == FramingMode::Http {
                write_proxy_status(&mut client, ProxyStatus::AuthFailed).await?;
            }
            Ok(())
        }
        HandshakeResult::OtherFailure(code) => {
            let _ = events.send(ProxyEvent::TunnelConnect(TunnelConnectEvent {
                proxy_chain_id,
                outcome: TunnelConnectOutcome::Failed,
                status_code: code,
                head: Bytes::new(),
                custom_tag,
            }));
            if framing == FramingMode::Http {
                write_proxy_status(&mut client, ProxyStatus::UpstreamTunnelFailed).await?;
            }
            Ok(())
        }
    }
}

enum HandshakeResult {
    Success,
    AuthRequired(u16),
    OtherFailure(u16),
}

/// Read the upstream's response to our nested CONNECT, one byte at a time
/// until the terminating blank line, mirroring the raw-socket handshake
/// used when chaining through another HTTP proxy.
async fn read_connect_handshake(
    stream: &mut UpstreamTransport,
) -> std::io::Result<HandshakeResult> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before completing CONNECT handshake",
            ));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream CONNECT response too large",
            ));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let code: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(590);
    if text.starts_with("HTTP/1.1 200") || text.starts_with("HTTP/1.0 200") {
        Ok(HandshakeResult::Success)
    } else if code == 401 || code == 407 {
        Ok(HandshakeResult::AuthRequired(code))
    } else {
        Ok(HandshakeResult::OtherFailure(code))
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_socks_upstream<C>(
    mut client: C,
    upstream: &url::Url,
    target_host: &str,
    target_port: u16,
    framing: FramingMode,
    head: Option<Bytes>,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let upstream_host = upstream.host_str().unwrap_or_default();
    let upstream_port = upstream.port().unwrap_or(1080);
    let version = version_for_scheme(upstream.scheme());
    let auth = credentials_from_url(upstream);
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    match socks_dial(
        (upstream_host, upstream_port),
        target_host,
        target_port,
        version,
        auth_ref,
    )
    .await
    {
        Ok(target) => {
            debug!(target_host, target_port, "socks tunnel established");
            if framing == FramingMode::Http {
                write_connection_established(&mut client).await?;
            }
            pipe_bidirectional(client, target, client_counters, target_counters, head).await
        }
        Err(err) => {
            let status = status_for_dial_error(&err);
            warn!(%err, status = status.code(), "socks dial failed");
            if framing == FramingMode::Http {
                write_proxy_status(&mut client, status).await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_upstream_chain_relays_after_200_handshake() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]);
            assert!(req.starts_with("CONNECT "));
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            let mut echo = [0u8; 4];
            sock.read_exact(&mut echo).await.unwrap();
            sock.write_all(&echo).await.unwrap();
        });

        let upstream_url = url::Url::parse(&format!("http://{upstream_addr}")).unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(256);
        let (tx, _rx) = crate::events::channel(4);

        let handler = tokio::spawn(async move {
            handle_http_upstream(
                proxy_side,
                &upstream_url,
                "example.com",
                443,
                FramingMode::Http,
                None,
                Arc::new(ByteCounters::default()),
                Arc::new(ByteCounters::default()),
                tx,
                1,
                None,
                false,
            )
            .await
        });

        let mut established = [0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        drop(client);
        upstream.await.unwrap();
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http_upstream_chain_maps_407_to_597() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let upstream_url = url::Url::parse(&format!("http://{upstream_addr}")).unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(256);
        let (tx, mut rx) = crate::events::channel(4);

        let handler = tokio::spawn(async move {
            handle_http_upstream(
                proxy_side,
                &upstream_url,
                "example.com",
                443,
                FramingMode::Http,
                None,
                Arc::new(ByteCounters::default()),
                Arc::new(ByteCounters::default()),
                tx,
                1,
                None,
                false,
            )
            .await
        });

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 597 "));

        match rx.recv().await.unwrap() {
            ProxyEvent::TunnelConnect(e) => {
                assert_eq!(e.outcome, TunnelConnectOutcome::Failed);
                assert_eq!(e.status_code, 407);
            }
            other => panic!("unexpected event {other:?}"),
        }

        upstream.await.unwrap();
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http_upstream_chain_maps_401_to_597_too() {
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 401 Unauthorized\r\n\r\n")
                .await
                .unwrap();
        });

        let upstream_url = url::Url::parse(&format!("http://{upstream_addr}")).unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(256);
        let (tx, mut rx) = crate::events::channel(4);

        let handler = tokio::spawn(async move {
            handle_http_upstream(
                proxy_side,
                &upstream_url,
                "example.com",
                443,
                FramingMode::Http,
                None,
                Arc::new(ByteCounters::default()),
                Arc::new(ByteCounters::default()),
                tx,
                1,
                None,
                false,
            )
            .await
        });

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 597 "));

        match rx.recv().await.unwrap() {
            ProxyEvent::TunnelConnect(e) => {
                assert_eq!(e.outcome, TunnelConnectOutcome::Failed);
                assert_eq!(e.status_code, 401);
            }
            other => panic!("unexpected event {other:?}"),
        }

        upstream.await.unwrap();
        handler.await.unwrap().unwrap();
    }
}
