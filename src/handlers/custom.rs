//! §4.7 custom response / custom CONNECT — the prepare hook intercepts the
//! request entirely instead of dispatching to an origin or upstream.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use hyper::header::{HeaderName, HeaderValue};

use crate::error::ProxyStatus;
use crate::handlers::write_connection_established;
use crate::prepare::{ConnectSocket, CustomConnectServerFn, CustomResponse, CustomResponseFn, ResponseBody};

/// Build the hyper response for a forwarded (non-CONNECT) request whose
/// prepare hook supplied a `customResponseFunction`.
pub async fn build_response(f: &CustomResponseFn) -> Response<ResponseBody> {
    let custom = f().await;
    to_hyper_response(custom)
}

fn to_hyper_response(custom: CustomResponse) -> Response<ResponseBody> {
    let status = if (100..=999).contains(&custom.status_code) {
        custom.status_code
    } else {
        ProxyStatus::OutOfRangeStatus.code()
    };
    let mut builder = Response::builder().status(status);
    let headers = builder.headers_mut().unwrap();
    let mut has_content_type = false;
    for (name, value) in &custom.headers {
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(n, v);
        }
    }
    if !has_content_type {
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    builder
        .body(Full::new(custom.body).map_err(|never| match never {}).boxed())
        .expect("status and headers were validated above")
}

/// For a CONNECT request intercepted by a `customConnectServer`, write the
/// success line and hand the raw socket to the caller-supplied handler. This
/// is the server dispatch path's entry point into this module, against the
/// type-erased [`CustomConnectServerFn`] a prepare hook returns — it never
/// knows the handler's concrete socket type.
pub async fn handle_connect_server<W>(
    mut client: W,
    on_connect: &CustomConnectServerFn,
) -> std::io::Result<()>
where
    W: ConnectSocket + 'static,
{
    write_connection_established(&mut client).await?;
    on_connect(Box::new(client)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn handle_connect_server_writes_established_then_hands_off_the_socket() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::io::AsyncReadExt;

        let (mut peer, proxy_side) = tokio::io::duplex(256);
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = invoked.clone();
        let server_fn: CustomConnectServerFn = Arc::new(move |_socket| {
            let invoked = invoked_clone.clone();
            Box::pin(async move {
                invoked.store(true, Ordering::SeqCst);
            })
        });

        handle_connect_server(proxy_side, &server_fn).await.unwrap();

        let mut established = [0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        peer.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.1 200 Connection Established\r\n\r\n");
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn default_custom_response_is_200_with_text_content_type() {
        let f: CustomResponseFn = Arc::new(|| Box::pin(async { CustomResponse::new(200) }));
        let response = build_response(&f).await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn custom_response_honors_supplied_status_and_body() {
        let f: CustomResponseFn = Arc::new(|| {
            Box::pin(async {
                CustomResponse {
                    status_code: 418,
                    headers: vec![("X-Teapot".to_string(), "yes".to_string())],
                    body: Bytes::from_static(b"short and stout"),
                }
            })
        });
        let response = build_response(&f).await;
        assert_eq!(response.status(), 418);
        assert_eq!(response.headers().get("x-teapot").unwrap(), "yes");
    }

    #[tokio::test]
    async fn out_of_range_status_is_clamped_to_the_taxonomys_out_of_range_code() {
        let custom = CustomResponse {
            status_code: 1200,
            ..CustomResponse::new(1200)
        };
        let response = to_hyper_response(custom);
        assert_eq!(response.status(), ProxyStatus::OutOfRangeStatus.code());
    }
}
