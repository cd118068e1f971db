//! §4.2 forward handler (plain HTTP forwarding to the origin or an
//! upstream HTTP proxy) and §4.3 forwardSocks (same, dialed through SOCKS).

use std::convert::Infallible;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::warn;

use crate::error::ProxyStatus;
use crate::headers::copy_filtered_headers;
use crate::prepare::ResponseBody;

/// Forward `req` to its absolute-URI target using `client`, which may
/// already be configured with an upstream HTTP or SOCKS5 proxy (the two
/// dispatch modes share this body — only how `client` was built differs).
/// `is_direct` is true when there is no upstream at all (a plain
/// `reqwest::Client`): a direct forward's DNS failure is reported as a
/// plain `404` rather than the `593` synthetic status a chained dispatch
/// uses for the same failure.
pub async fn forward(
    client: &reqwest::Client,
    req: Request<hyper::body::Incoming>,
    is_direct: bool,
) -> Response<ResponseBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let incoming_headers = req.headers().clone();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(%err, "failed to read request body");
            return error_response(ProxyStatus::Generic.code(), "failed to read request body");
        }
    };

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(400, "invalid method"),
    };

    let mut builder = client.request(reqwest_method, uri.to_string());
    let mut filtered = HeaderMap::new();
    copy_filtered_headers(&incoming_headers, &mut filtered);
    for (name, value) in filtered.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder = builder.body(body);

    match builder.send().await {
        Ok(upstream_response) => build_client_response(upstream_response).await,
        Err(err) => {
            let status = classify_reqwest_error(&err);
            warn!(%err, status = status.code(), "forward request failed");
            if is_direct && status == ProxyStatus::DnsFailure {
                return error_response(404, "Not Found");
            }
            error_response(status.code(), status.reason())
        }
    }
}

async fn build_client_response(upstream: reqwest::Response) -> Response<ResponseBody> {
    let raw_status = upstream.status().as_u16();
    if raw_status == 407 {
        // Never let an upstream auth challenge leak to our own client.
        return error_response(
            ProxyStatus::AuthFailed.code(),
            "upstream demanded authentication",
        );
    }
    let status = if (100..=999).contains(&raw_status) {
        raw_status
    } else {
        ProxyStatus::OutOfRangeStatus.code()
    };

    let mut response_headers = HeaderMap::new();
    copy_filtered_headers(upstream.headers(), &mut response_headers);

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    *builder.headers_mut().unwrap() = response_headers;
    builder
        .body(streaming_body(upstream))
        .expect("status was validated as 100-999 above")
}

/// Wrap an upstream response's body as a streamed [`ResponseBody`], honoring
/// the client's own read-side backpressure instead of buffering the whole
/// response up front. A mid-stream read error from the upstream ends the
/// body where it is rather than propagating — the client simply sees a
/// truncated response, mirroring a mid-stream pipe tear-down on the tunneled
/// dispatch modes.
fn streaming_body(upstream: reqwest::Response) -> ResponseBody {
    truncating_stream_body(upstream.bytes_stream())
}

/// Adapt any byte-chunk stream into the same truncate-on-error [`ResponseBody`]
/// shape [`streaming_body`] produces, split out so that behavior can be
/// exercised against a synthetic stream instead of a live upstream response.
fn truncating_stream_body<S, E>(stream: S) -> ResponseBody
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    let frames = stream.map(|chunk| match chunk {
        Ok(bytes) => Some(Ok::<_, Infallible>(Frame::data(bytes))),
        Err(err) => {
            warn!(%err, "upstream response body ended with an error mid-stream");
            None
        }
    });
    // `take_while` keeps consuming until the first `None`, then stops —
    // exactly the "truncate, don't propagate" behavior a mid-stream error
    // needs here.
    let frames = frames
        .take_while(|frame| std::future::ready(frame.is_some()))
        .map(|frame| frame.unwrap());
    StreamBody::new(frames).boxed()
}

fn classify_reqwest_error(err: &reqwest::Error) -> ProxyStatus {
    if err.is_timeout() {
        return ProxyStatus::Timeout;
    }
    if err.is_connect() {
        // reqwest doesn't expose the underlying io::ErrorKind directly;
        // a connect-phase failure is either DNS or refusal, and the
        // message text is the only signal left to distinguish them.
        let msg = err.to_string();
        if msg.contains("dns") || msg.contains("resolve") {
            return ProxyStatus::DnsFailure;
        }
        return ProxyStatus::ConnectionRefused;
    }
    ProxyStatus::Generic
}

fn error_response(status: u16, message: &str) -> Response<ResponseBody> {
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

/// Build a `reqwest::Client` that dials through an HTTP(S) upstream proxy.
pub fn client_with_http_upstream(
    upstream: &url::Url,
    ignore_upstream_proxy_certificate: bool,
) -> reqwest::Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(upstream.as_str())?;
    reqwest::Client::builder()
        .proxy(proxy)
        .danger_accept_invalid_certs(ignore_upstream_proxy_certificate)
        .build()
}

/// Build a `reqwest::Client` that dials through a SOCKS5/5h upstream.
/// reqwest's SOCKS support speaks SOCKS5 only; SOCKS4/4a forwarding goes
/// through [`forward_via_socks4`] instead of this client.
pub fn client_with_socks5_upstream(
    upstream: &url::Url,
    ignore_upstream_proxy_certificate: bool,
) -> reqwest::Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(upstream.as_str())?;
    reqwest::Client::builder()
        .proxy(proxy)
        .danger_accept_invalid_certs(ignore_upstream_proxy_certificate)
        .build()
}

/// Forward one HTTP request over a manually-dialed SOCKS4/4a connection to
/// `upstream_host:upstream_port`. No connection pooling here (unlike the
/// reqwest-backed path) — each call dials, sends one request, and reads
/// exactly one response, parsed by hand the same way the upstream CONNECT
/// handshake in `handlers::chain` is.
pub async fn forward_via_socks4(
    upstream_host: &str,
    upstream_port: u16,
    req: Request<hyper::body::Incoming>,
) -> Response<ResponseBody> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let uri = req.uri().clone();
    let Some(target_host) = uri.host() else {
        return error_response(400, "request URI has no host");
    };
    let target_host = target_host.to_string();
    let target_port = uri.port_u16().unwrap_or(80);
    let method = req.method().clone();
    let incoming_headers = req.headers().clone();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(%err, "failed to read request body");
            return error_response(ProxyStatus::Generic.code(), "failed to read request body");
        }
    };

    let mut stream = match crate::socks::dial(
        (upstream_host, upstream_port),
        &target_host,
        target_port,
        crate::socks::SocksVersion::V4,
        None,
    )
    .await
    {
        Ok(s) => s,
        Err(err) => {
            let status = crate::socks::status_for_dial_error(&err);
            return error_response(status.code(), status.reason());
        }
    };

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut request = format!("{method} {path} HTTP/1.1\r\n");
    let mut filtered = HeaderMap::new();
    copy_filtered_headers(&incoming_headers, &mut filtered);
    for (name, value) in filtered.iter() {
        request.push_str(&format!(
            "{}: {}\r\n",
            name.as_str(),
            value.to_str().unwrap_or("")
        ));
    }
    request.push_str(&format!("content-length: {}\r\n\r\n", body.len()));

    if let Err(err) = stream.write_all(request.as_bytes()).await {
        let status = ProxyStatus::from_io_error(&err);
        return error_response(status.code(), status.reason());
    }
    if let Err(err) = stream.write_all(&body).await {
        let status = ProxyStatus::from_io_error(&err);
        return error_response(status.code(), status.reason());
    }

    let mut response_bytes = Vec::new();
    if let Err(err) = stream.read_to_end(&mut response_bytes).await {
        let status = ProxyStatus::from_io_error(&err);
        return error_response(status.code(), status.reason());
    }

    parse_raw_http_response(&response_bytes)
}

/// Split a raw HTTP/1.x response into status code, headers, and body by
/// hand — no strict parser, matching the non-strict-response tolerance the
/// rest of this proxy relies on.
fn parse_raw_http_response(raw: &[u8]) -> Response<ResponseBody> {
    let Some(header_end) = find_subslice(raw, b"\r\n\r\n") else {
        return error_response(
            ProxyStatus::UpstreamTunnelFailed.code(),
            "malformed upstream response",
        );
    };
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.split("\r\n");
    let Some(status_line) = lines.next() else {
        return error_response(
            ProxyStatus::UpstreamTunnelFailed.code(),
            "malformed upstream response",
        );
    };
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(ProxyStatus::OutOfRangeStatus.code());
    let status = if (100..=999).contains(&status) {
        status
    } else {
        ProxyStatus::OutOfRangeStatus.code()
    };

    let mut response_headers = HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':')
            && let (Ok(n), Ok(v)) = (
                hyper::header::HeaderName::from_bytes(name.trim().as_bytes()),
                hyper::header::HeaderValue::from_str(value.trim()),
            )
        {
            response_headers.append(n, v);
        }
    }
    let mut filtered = HeaderMap::new();
    copy_filtered_headers(&response_headers, &mut filtered);
    let body = Bytes::copy_from_slice(&raw[header_end + 4..]);

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    *builder.headers_mut().unwrap() = filtered;
    builder
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("status was validated as 100-999 above")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_response_carries_the_mapped_status_and_body() {
        let response = error_response(594, "refused");
        assert_eq!(response.status(), 594);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"refused");
    }

    #[test]
    fn socks5_upstream_client_builds_for_a_valid_url() {
        let url = url::Url::parse("socks5://127.0.0.1:1080").unwrap();
        assert!(client_with_socks5_upstream(&url, false).is_ok());
    }

    #[test]
    fn raw_response_parsing_extracts_status_headers_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
        let response = parse_raw_http_response(raw);
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers().get("content-length").unwrap(), "5");
    }

    #[test]
    fn raw_response_parsing_rewrites_out_of_range_status() {
        let raw = b"HTTP/1.1 1200 Bonkers\r\n\r\n";
        let response = parse_raw_http_response(raw);
        assert_eq!(response.status(), 592);
    }

    #[tokio::test]
    async fn truncating_stream_body_passes_every_chunk_through_on_a_clean_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let body = truncating_stream_body(futures::stream::iter(chunks));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn truncating_stream_body_stops_at_the_first_error_without_failing() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
            Ok(Bytes::from_static(b"never seen")),
        ];
        let body = truncating_stream_body(futures::stream::iter(chunks));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"partial");
    }
}
