//! Status taxonomy and the public [`RequestError`] type.
//!
//! The proxy core never lets a transport failure become an opaque 502; every
//! failure mode it can observe maps to one of a small set of reserved status
//! codes so callers can branch on `response.status()` instead of parsing
//! prose. See [`ProxyStatus`] for the full table.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Reserved custom HTTP statuses the core may write back to a client.
///
/// These sit outside the IANA-registered range on purpose: nothing a real
/// origin server returns should collide with them, so a client can trust
/// that a 59x came from the proxy itself, not from whatever it was trying
/// to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Upstream connect attempt timed out.
    Timeout,
    /// Upstream CONNECT replied with a non-200, non-auth status.
    UpstreamTunnelFailed,
    /// Upstream HTTP response had a status line outside 100-999.
    OutOfRangeStatus,
    /// DNS resolution of the target host failed.
    DnsFailure,
    /// Target or upstream actively refused the connection.
    ConnectionRefused,
    /// Connection was reset by the peer mid-flight.
    ConnectionReset,
    /// Write to a socket that the peer had already closed.
    BrokenPipe,
    /// Upstream demanded (and we couldn't satisfy) authentication.
    AuthFailed,
    /// Catch-all transport failure with no more specific mapping.
    Generic,
}

impl ProxyStatus {
    pub const fn code(self) -> u16 {
        match self {
            ProxyStatus::Timeout => 504,
            ProxyStatus::UpstreamTunnelFailed => 590,
            ProxyStatus::OutOfRangeStatus => 592,
            ProxyStatus::DnsFailure => 593,
            ProxyStatus::ConnectionRefused => 594,
            ProxyStatus::ConnectionReset => 595,
            ProxyStatus::BrokenPipe => 596,
            ProxyStatus::AuthFailed => 597,
            ProxyStatus::Generic => 599,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            ProxyStatus::Timeout => "Gateway Timeout",
            ProxyStatus::UpstreamTunnelFailed => "Non-Successful Upstream Response",
            ProxyStatus::OutOfRangeStatus => "Out-of-Range Upstream Status",
            ProxyStatus::DnsFailure => "Target Host Not Found",
            ProxyStatus::ConnectionRefused => "Target Connection Refused",
            ProxyStatus::ConnectionReset => "Target Connection Reset",
            ProxyStatus::BrokenPipe => "Target Connection Closed Mid-Write",
            ProxyStatus::AuthFailed => "Upstream Proxy Authentication Failed",
            ProxyStatus::Generic => "Tunneling Socket Closed",
        }
    }

    /// Map an [`io::Error`] observed while dialing or writing to a target
    /// socket onto the reserved status it corresponds to.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => ProxyStatus::DnsFailure,
            io::ErrorKind::ConnectionRefused => ProxyStatus::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ProxyStatus::ConnectionReset,
            io::ErrorKind::BrokenPipe => ProxyStatus::BrokenPipe,
            io::ErrorKind::TimedOut => ProxyStatus::Timeout,
            _ => ProxyStatus::Generic,
        }
    }

    /// Map a SOCKS client error string onto a reserved status, following the
    /// same prefix-matching contract as OS error codes.
    pub fn from_socks_error(message: &str) -> Self {
        if message.contains("timed out") {
            ProxyStatus::Timeout
        } else if message.contains("Authentication failed") || message.contains("auth") {
            ProxyStatus::AuthFailed
        } else {
            ProxyStatus::Generic
        }
    }
}

/// An error a prepare-request hook (or the core itself) wants surfaced
/// directly to the client, verbatim, instead of mapped through
/// [`ProxyStatus`].
#[derive(Debug, Error)]
#[error("request error {status}: {message}")]
pub struct RequestError {
    pub message: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl RequestError {
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(
        message: impl Into<String>,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            message: message.into(),
            status,
            headers,
        }
    }
}

/// Top-level error type for operations that aren't simply "write a status
/// to the client" — listener setup, config resolution, connection-registry
/// lookups.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("prepare-request hook rejected the request")]
    Request(#[from] RequestError),

    #[error("connection {0} not found")]
    ConnectionNotFound(u64),

    #[error("invalid upstream proxy URL: {0}")]
    InvalidUpstreamUrl(String),

    #[error("invalid target host:port {0:?}")]
    InvalidTarget(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
