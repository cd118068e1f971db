//! Dispatch handlers: one module per §4.2-4.7 mode.

pub mod chain;
pub mod custom;
pub mod direct;
pub mod forward;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyStatus;
use crate::stats::{ByteCounters, CountingStream};

/// Write a complete, self-contained HTTP status response directly to a
/// socket — used whenever a handler fails before (or instead of) ever
/// upgrading to a tunnel.
pub async fn write_status_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    write_status_response_with_headers(writer, status, reason, &[], body).await
}

/// Same contract as [`write_status_response`], plus caller-supplied extra
/// headers (e.g. a prepare-hook `RequestError`'s own headers, or an
/// auto-added `Proxy-Authenticate` for a 407).
pub async fn write_status_response_with_headers<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    extra_headers: &[(String, String)],
    body: &str,
) -> std::io::Result<()> {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nConnection: close\r\nDate: {date}\r\n"
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

pub async fn write_proxy_status<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: ProxyStatus,
) -> std::io::Result<()> {
    write_status_response(writer, status.code(), status.reason(), status.reason()).await
}

/// Write the literal `200 Connection Established` line CONNECT tunnels
/// reply with on success.
pub async fn write_connection_established<W: AsyncWrite + Unpin>(
    writer: &mut W,
) -> std::io::Result<()> {
    writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    writer.flush().await
}

/// Pipe bytes bidirectionally between a client and a target stream, each
/// side wrapped in a [`CountingStream`] so the connection's cumulative byte
/// totals are correct regardless of which side closes first. Any `head`
/// bytes already read off the client (e.g. from a CONNECT request's
/// trailing buffer) are written to the target before piping begins.
pub async fn pipe_bidirectional<C, T>(
    client: C,
    target: T,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
    head: Option<Bytes>,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = CountingStream::new(client, client_counters);
    let mut target = CountingStream::new(target, target_counters);

    if let Some(head) = head
        && !head.is_empty()
    {
        target.write_all(&head).await?;
    }

    match tokio::io::copy_bidirectional(&mut client, &mut target).await {
        Ok(_) => Ok(()),
        Err(err) if matches!(err.kind(), std::io::ErrorKind::UnexpectedEof) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_status_response_has_a_well_formed_status_line() {
        let mut buf = Vec::new();
        write_status_response(&mut buf, 404, "Not Found", "gone").await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("gone"));
    }

    #[tokio::test]
    async fn write_connection_established_matches_the_literal_scenario() {
        let mut buf = Vec::new();
        write_connection_established(&mut buf).await.unwrap();
        assert_eq!(buf, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    }
}
