//! Plain HTTP/1.1 exchange over an established SOCKS tunnel.

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HOST, HeaderValue, USER_AGENT};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ProxyError, ProxyRequest, RawResponse};

/// Aborts the connection driver when the exchange ends or is dropped.
struct ConnTask(JoinHandle<()>);

impl Drop for ConnTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn map_hyper_error(e: hyper::Error) -> ProxyError {
    if e.is_parse() || e.is_incomplete_message() {
        ProxyError::MalformedResponse(e.to_string())
    } else {
        ProxyError::Io(e.to_string())
    }
}

fn build_request(
    req: &ProxyRequest,
    user_agent: &str,
) -> Result<hyper::Request<Full<Bytes>>, ProxyError> {
    let mut request = hyper::Request::new(Full::new(req.body.clone().unwrap_or_default()));
    *request.method_mut() = req.method.clone();
    *request.uri_mut() = req
        .target
        .path_and_query()
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("bad request path: {e}")))?;
    *request.headers_mut() = req.headers.clone();

    let headers = request.headers_mut();
    if !headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&req.target.host_header())
            .map_err(|_| ProxyError::InvalidTarget("host is not a valid header value".into()))?;
        headers.insert(HOST, host);
    }
    if !headers.contains_key(USER_AGENT) {
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }
    }
    Ok(request)
}

/// Send `req` over `stream` and read the response, capping the body at
/// `max_body` bytes.
pub(super) async fn exchange(
    stream: TcpStream,
    req: &ProxyRequest,
    user_agent: &str,
    max_body: usize,
) -> Result<RawResponse, ProxyError> {
    let request = build_request(req, user_agent)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(map_hyper_error)?;
    let _conn = ConnTask(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "tunnelled HTTP connection ended with error");
        }
    }));

    let response = sender.send_request(request).await.map_err(map_hyper_error)?;
    let (parts, body) = response.into_parts();

    let body = Limited::new(body, max_body)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ProxyError::MalformedResponse(format!("body exceeds {max_body} bytes"))
            } else {
                ProxyError::MalformedResponse(format!("failed to read body: {e}"))
            }
        })?
        .to_bytes();

    Ok(RawResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
