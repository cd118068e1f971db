//! §4.4 direct handler — CONNECT with no upstream: dial the target
//! straight and pipe.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ProxyStatus;
use crate::handlers::{pipe_bidirectional, write_connection_established, write_proxy_status};
use crate::prepare::{DnsLookupFn, IpFamily};
use crate::stats::ByteCounters;

/// Dial `(host, port)` directly, optionally bound to `local_address` and/or
/// restricted to `ip_family`, and pipe `client` to it once connected. On
/// dial failure, writes a mapped synthetic status to `client` instead.
#[allow(clippy::too_many_arguments)]
pub async fn handle<C>(
    mut client: C,
    host: &str,
    port: u16,
    local_address: Option<std::net::IpAddr>,
    ip_family: Option<IpFamily>,
    dns_lookup: Option<DnsLookupFn>,
    head: Option<Bytes>,
    client_counters: Arc<ByteCounters>,
    target_counters: Arc<ByteCounters>,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let target = match dial(host, port, local_address, ip_family, dns_lookup).await {
        Ok(stream) => stream,
        Err(err) => {
            let status = ProxyStatus::from_io_error(&err);
            warn!(host, port, %err, status = status.code(), "direct dial failed");
            write_proxy_status(&mut client, status).await?;
            return Ok(());
        }
    };

    debug!(host, port, "direct tunnel established");
    write_connection_established(&mut client).await?;
    pipe_bidirectional(client, target, client_counters, target_counters, head).await
}

async fn dial(
    host: &str,
    port: u16,
    local_address: Option<std::net::IpAddr>,
    ip_family: Option<IpFamily>,
    dns_lookup: Option<DnsLookupFn>,
) -> std::io::Result<TcpStream> {
    let host = crate::headers::strip_ipv6_brackets(host);

    // A bound local address pins the family implicitly; an explicit
    // `ip_family` override only matters when no local address was given.
    let family = local_address.map(|addr| match addr {
        std::net::IpAddr::V4(_) => IpFamily::V4,
        std::net::IpAddr::V6(_) => IpFamily::V6,
    }).or(ip_family);

    if dns_lookup.is_none() && local_address.is_none() && family.is_none() {
        return TcpStream::connect((host, port)).await;
    }

    let mut addrs: Vec<std::net::IpAddr> = match &dns_lookup {
        Some(resolver) => resolver(host.to_string()).await?,
        None => tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect(),
    };
    if let Some(family) = family {
        addrs.retain(|addr| match family {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        });
    }
    let target_ip = addrs.into_iter().next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses for requested family")
    })?;
    let target_addr = std::net::SocketAddr::new(target_ip, port);

    let socket = match target_addr {
        std::net::SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        std::net::SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    if let Some(bind_addr) = local_address {
        socket.bind(std::net::SocketAddr::new(bind_addr, 0))?;
    }
    socket.connect(target_addr).await
}
