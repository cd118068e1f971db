//! Byte accounting and the public stats types.
//!
//! Target sockets can be reused across requests (HTTP keep-alive through a
//! connection pool), so a source's cumulative counters are only ever
//! incremented by the *delta* since a target was attached, not by the
//! target's lifetime total.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Per-connection byte totals, as returned by `Server::connection_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub src_tx_bytes: u64,
    pub src_rx_bytes: u64,
    pub trg_tx_bytes: u64,
    pub trg_rx_bytes: u64,
}

/// Server-wide monotonic counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub http_request_count: AtomicU64,
    pub connect_request_count: AtomicU64,
    pub traffic_used_in_bytes: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.http_request_count.load(Ordering::Relaxed),
            self.connect_request_count.load(Ordering::Relaxed),
            self.traffic_used_in_bytes.load(Ordering::Relaxed),
        )
    }
}

/// Cumulative counters for one connection, shared between the connection
/// registry entry and every [`CountingStream`] attached to it over its
/// lifetime.
#[derive(Debug, Default)]
pub struct ByteCounters {
    pub tx: AtomicU64,
    pub rx: AtomicU64,
}

impl ByteCounters {
    pub fn add(&self, tx: u64, rx: u64) {
        if tx > 0 {
            self.tx.fetch_add(tx, Ordering::Relaxed);
        }
        if rx > 0 {
            self.rx.fetch_add(rx, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.tx.load(Ordering::Relaxed),
            self.rx.load(Ordering::Relaxed),
        )
    }
}

/// An `AsyncRead + AsyncWrite` wrapper that tracks bytes flowing through it
/// and flushes the delta into a shared [`ByteCounters`] on drop, so that a
/// target socket reused across requests only ever attributes bytes to the
/// connection that was actually using it at the time.
pub struct CountingStream<S> {
    inner: S,
    counters: Arc<ByteCounters>,
    read_since_attach: u64,
    written_since_attach: u64,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counters: Arc<ByteCounters>) -> Self {
        Self {
            inner,
            counters,
            read_since_attach: 0,
            written_since_attach: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.read_since_attach
    }

    pub fn bytes_written(&self) -> u64 {
        self.written_since_attach
    }
}

impl<S> Drop for CountingStream<S> {
    fn drop(&mut self) {
        self.counters
            .add(self.written_since_attach, self.read_since_attach);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut this.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            this.read_since_attach += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = std::pin::Pin::new(&mut this.inner).poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = &poll {
            this.written_since_attach += *n as u64;
        }
        poll
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
