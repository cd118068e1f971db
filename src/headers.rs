//! Header filtering and URL/host utilities shared by every dispatch handler.

use hyper::HeaderMap;
use hyper::header::{HeaderName, HeaderValue};

/// Headers that describe the hop between client and proxy (or proxy and
/// upstream), not the end-to-end exchange with the origin. These never
/// cross the proxy in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
}

/// Copy `src` into `dst`, dropping hop-by-hop headers, invalid name/value
/// pairs, and every `Host` header after the first.
pub fn copy_filtered_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    let mut seen_host = false;
    for (name, value) in src.iter() {
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        if name.as_str().eq_ignore_ascii_case("host") {
            if seen_host {
                continue;
            }
            seen_host = true;
        }
        if let (Ok(n), Ok(_v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            dst.append(n, value.clone());
        }
    }
}

/// Default port for a URL scheme, per RFC 7230 plus the non-HTTP schemes
/// this proxy is allowed to see in upstream URLs.
pub fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

/// Strip the brackets from an IPv6 literal host (`[::1]` -> `::1`). Leaves
/// any other host untouched.
pub fn strip_ipv6_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Parse a `host:port` authority, as seen in a CONNECT request line. The
/// host portion may be an IPv6 literal in brackets, in which case its
/// embedded colons are not mistaken for the port separator.
pub fn parse_authority(authority: &str) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port_str = rest.strip_prefix(':')?;
        let port = port_str.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port_str) = authority.rsplit_once(':')?;
    let port = port_str.parse().ok()?;
    Some((host.to_string(), port))
}
