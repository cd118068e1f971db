//! The prepare-request hook contract: per-request input, the caller's
//! decision, and the resolved [`HandlerOptions`] a dispatch handler acts on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::HeaderMap;
use std::convert::Infallible;

use crate::error::RequestError;

pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Address family a prepare hook may pin a direct dial to, independent of
/// any `localAddress` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Everything the prepare hook is told about an inbound request before any
/// dispatch decision is made.
#[derive(Debug, Clone)]
pub struct PrepareRequestInput {
    pub connection_id: u64,
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub is_http: bool,
}

/// Caller-supplied synthetic response, returned by a `customResponseFunction`.
#[derive(Debug, Clone, Default)]
pub struct CustomResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CustomResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }
}

pub type CustomResponseFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = CustomResponse> + Send>> + Send + Sync>;

/// A raw, already-upgraded CONNECT socket, type-erased so a
/// `customConnectServer` doesn't need to be generic over the concrete
/// stream type the server happened to accept.
pub trait ConnectSocket: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> ConnectSocket for T {}

/// A caller-supplied handler that receives the raw socket of a CONNECT
/// request after the proxy has written `200 Connection Established`,
/// instead of the proxy dialing a target or upstream itself.
pub type CustomConnectServerFn = Arc<
    dyn Fn(Box<dyn ConnectSocket>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// A caller-supplied resolver that replaces the system DNS lookup a direct
/// dial would otherwise perform, returning the addresses to try for `host`.
pub type DnsLookupFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<std::net::IpAddr>>> + Send>>
        + Send
        + Sync,
>;

/// What the prepare hook decided for one request. All fields optional; the
/// default value is "allow, dispatch direct, no interception".
#[derive(Clone, Default)]
pub struct PrepareRequestResult {
    pub request_authentication: bool,
    pub fail_msg: Option<String>,
    pub upstream_proxy_url: Option<String>,
    pub ignore_upstream_proxy_certificate: bool,
    pub custom_response_function: Option<CustomResponseFn>,
    pub custom_connect_server: Option<CustomConnectServerFn>,
    pub local_address: Option<std::net::IpAddr>,
    pub ip_family: Option<IpFamily>,
    pub dns_lookup: Option<DnsLookupFn>,
    pub custom_tag: Option<String>,
}

impl std::fmt::Debug for PrepareRequestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareRequestResult")
            .field("request_authentication", &self.request_authentication)
            .field("fail_msg", &self.fail_msg)
            .field("upstream_proxy_url", &self.upstream_proxy_url)
            .field(
                "ignore_upstream_proxy_certificate",
                &self.ignore_upstream_proxy_certificate,
            )
            .field(
                "custom_response_function",
                &self.custom_response_function.is_some(),
            )
            .field(
                "custom_connect_server",
                &self.custom_connect_server.is_some(),
            )
            .field("local_address", &self.local_address)
            .field("ip_family", &self.ip_family)
            .field("dns_lookup", &self.dns_lookup.is_some())
            .field("custom_tag", &self.custom_tag)
            .finish()
    }
}

/// The future-returning hook signature itself. Registered once on the
/// server; invoked for every request (HTTP or CONNECT).
pub type PrepareRequestFn = Arc<
    dyn Fn(PrepareRequestInput) -> Pin<Box<dyn Future<Output = Result<PrepareRequestResult, RequestError>> + Send>>
        + Send
        + Sync,
>;

/// Dispatch mode a request resolves to, derived from a
/// [`PrepareRequestResult`] plus whether the request is CONNECT or forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Direct,
    ChainHttp,
    ChainSocks,
    Custom,
    CustomConnect,
}

/// Fully resolved per-request options a handler acts on, combining the
/// parsed target with the prepare hook's decision.
#[derive(Clone)]
pub struct HandlerOptions {
    pub hostname: String,
    pub port: u16,
    pub is_http: bool,
    pub upstream_proxy_url: Option<url::Url>,
    pub ignore_upstream_proxy_certificate: bool,
    pub custom_response_function: Option<CustomResponseFn>,
    pub custom_connect_server: Option<CustomConnectServerFn>,
    pub dns_lookup: Option<DnsLookupFn>,
    pub custom_tag: Option<String>,
}

impl HandlerOptions {
    /// Resolve which handler a request dispatches to. A
    /// `customResponseFunction` takes precedence over an upstream for a
    /// forwarded (non-CONNECT) request, but is ignored on CONNECT — there
    /// is no body to write back once the tunnel has been established, so
    /// CONNECT falls through to `customConnectServer`, then direct/chain
    /// dispatch instead.
    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.is_http && self.custom_response_function.is_some() {
            return DispatchMode::Custom;
        }
        if !self.is_http && self.custom_connect_server.is_some() {
            return DispatchMode::CustomConnect;
        }
        match &self.upstream_proxy_url {
            None => DispatchMode::Direct,
            Some(url) => match url.scheme() {
                "socks" | "socks4" | "socks4a" | "socks5" | "socks5h" => DispatchMode::ChainSocks,
                _ => DispatchMode::ChainHttp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(upstream: Option<&str>, custom: bool) -> HandlerOptions {
        opts_with_mode(upstream, custom, true)
    }

    fn opts_with_mode(upstream: Option<&str>, custom: bool, is_http: bool) -> HandlerOptions {
        HandlerOptions {
            hostname: "example.com".into(),
            port: 443,
            is_http,
            upstream_proxy_url: upstream.map(|u| url::Url::parse(u).unwrap()),
            ignore_upstream_proxy_certificate: false,
            custom_response_function: if custom {
                Some(Arc::new(|| Box::pin(async { CustomResponse::new(200) })))
            } else {
                None
            },
            custom_connect_server: None,
            dns_lookup: None,
            custom_tag: None,
        }
    }

    #[test]
    fn dispatch_mode_direct_when_no_upstream() {
        assert_eq!(opts(None, false).dispatch_mode(), DispatchMode::Direct);
    }

    #[test]
    fn dispatch_mode_chain_http_for_http_scheme() {
        assert_eq!(
            opts(Some("http://proxy:8080"), false).dispatch_mode(),
            DispatchMode::ChainHttp
        );
    }

    #[test]
    fn dispatch_mode_chain_socks_for_socks_schemes() {
        for scheme in ["socks", "socks4", "socks4a", "socks5", "socks5h"] {
            let url = format!("{scheme}://proxy:1080");
            assert_eq!(
                opts(Some(&url), false).dispatch_mode(),
                DispatchMode::ChainSocks,
                "scheme {scheme} should chain via socks"
            );
        }
    }

    #[test]
    fn custom_response_takes_precedence_over_upstream_for_forwarded_requests() {
        assert_eq!(
            opts(Some("http://proxy:8080"), true).dispatch_mode(),
            DispatchMode::Custom
        );
    }

    #[test]
    fn custom_response_is_ignored_on_connect() {
        assert_eq!(
            opts_with_mode(Some("http://proxy:8080"), true, false).dispatch_mode(),
            DispatchMode::ChainHttp
        );
    }

    #[test]
    fn custom_connect_server_takes_precedence_over_upstream_on_connect() {
        let mut opts = opts_with_mode(Some("http://proxy:8080"), false, false);
        opts.custom_connect_server = Some(Arc::new(|_socket| Box::pin(async {})));
        assert_eq!(opts.dispatch_mode(), DispatchMode::CustomConnect);
    }

    #[test]
    fn custom_connect_server_is_ignored_on_forwarded_requests() {
        let mut opts = opts_with_mode(None, false, true);
        opts.custom_connect_server = Some(Arc::new(|_socket| Box::pin(async {})));
        assert_eq!(opts.dispatch_mode(), DispatchMode::Direct);
    }
}
