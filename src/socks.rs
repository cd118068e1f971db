//! SOCKS4 / SOCKS4a / SOCKS5 / SOCKS5h upstream dialing.
//!
//! SOCKS5 goes through `async_socks5`, which already speaks the
//! negotiation and auth sub-protocol correctly. SOCKS4/4a has no crate in
//! the dependency tree worth pulling in for a handful of bytes, so it's
//! hand-rolled here the same way the byte-level protocol work elsewhere in
//! this crate is hand-rolled.

use async_socks5::AddrKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProxyError, ProxyStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

pub fn version_for_scheme(scheme: &str) -> SocksVersion {
    match scheme {
        "socks4" | "socks4a" => SocksVersion::V4,
        _ => SocksVersion::V5,
    }
}

/// Open a TCP connection to `upstream_addr` and negotiate a CONNECT tunnel
/// to `(target_host, target_port)`. Returns the connected stream, ready to
/// be piped bidirectionally.
pub async fn dial(
    upstream_addr: (&str, u16),
    target_host: &str,
    target_port: u16,
    version: SocksVersion,
    auth: Option<(&str, &str)>,
) -> Result<TcpStream, ProxyError> {
    let mut stream = TcpStream::connect(upstream_addr).await?;
    match version {
        SocksVersion::V5 => {
            let socks_auth = auth.map(|(u, p)| async_socks5::Auth {
                username: u.to_string(),
                password: p.to_string(),
            });
            async_socks5::connect(
                &mut stream,
                AddrKind::Domain(target_host.to_string(), target_port),
                socks_auth,
            )
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::other(e.to_string())))?;
        }
        SocksVersion::V4 => {
            socks4_connect(&mut stream, target_host, target_port).await?;
        }
    }
    Ok(stream)
}

async fn socks4_connect(
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
) -> Result<(), ProxyError> {
    // SOCKS4a: when the host isn't a dotted-quad IPv4 address, encode the
    // "invalid IP" sentinel 0.0.0.1 and append the hostname (NUL
    // terminated) after the empty userid.
    let ipv4 = target_host.parse::<std::net::Ipv4Addr>().ok();

    let mut request = Vec::with_capacity(9 + target_host.len() + 1);
    request.push(0x04); // version
    request.push(0x01); // CONNECT
    request.extend_from_slice(&target_port.to_be_bytes());
    match ipv4 {
        Some(addr) => request.extend_from_slice(&addr.octets()),
        None => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    request.push(0x00); // empty userid, NUL terminated
    if ipv4.is_none() {
        request.extend_from_slice(target_host.as_bytes());
        request.push(0x00);
    }

    stream.write_all(&request).await?;

    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    if response[0] != 0x00 {
        return Err(ProxyError::Io(std::io::Error::other(
            "malformed SOCKS4 response",
        )));
    }
    if response[1] != 0x5a {
        return Err(ProxyError::Io(std::io::Error::other(format!(
            "SOCKS4 request rejected, code {}",
            response[1]
        ))));
    }
    Ok(())
}

/// Map a dial failure's message onto the reserved status taxonomy, the way
/// the chainSocks handler needs to when it falls back to a synthetic
/// response.
pub fn status_for_dial_error(err: &ProxyError) -> ProxyStatus {
    match err {
        ProxyError::Io(io_err) => {
            let msg = io_err.to_string();
            if msg.contains("timed out") || msg.contains("Authentication") {
                ProxyStatus::from_socks_error(&msg)
            } else {
                ProxyStatus::from_io_error(io_err)
            }
        }
        _ => ProxyStatus::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_for_scheme_maps_socks4_variants() {
        assert_eq!(version_for_scheme("socks4"), SocksVersion::V4);
        assert_eq!(version_for_scheme("socks4a"), SocksVersion::V4);
        assert_eq!(version_for_scheme("socks5"), SocksVersion::V5);
        assert_eq!(version_for_scheme("socks5h"), SocksVersion::V5);
        assert_eq!(version_for_scheme("socks"), SocksVersion::V5);
    }

    #[tokio::test]
    async fn socks4_connect_errors_on_short_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            // close without writing a response
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = socks4_connect(&mut stream, "93.184.216.34", 80).await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
