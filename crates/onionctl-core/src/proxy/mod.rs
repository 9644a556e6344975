//! HTTP(S) requests routed through the daemon's SOCKS port.
//!
//! ## Transports
//!
//! | Scheme | Path |
//! |--------|------|
//! | `http://` | hand-negotiated SOCKS5 stream + hyper HTTP/1.1 client connection |
//! | `https://` | reqwest with a `socks5h://` proxy (resolution inside Tor), no pooling |
//!
//! Every request opens its own SOCKS stream. Hostnames, onion or
//! clearnet, only ever travel inside the SOCKS CONNECT request.

mod http;
pub mod socks;
pub mod target;
mod tls;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use onionctl_config::ProxyConfig;

pub use socks::{SocksAuth, SocksReply};
pub use target::{OnionAddress, TargetHost, TargetUrl};

/// Errors from proxied requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("SOCKS port {0} refused the connection")]
    ConnectionRefused(u16),

    #[error("SOCKS port {port} did not accept within {after:?}")]
    ConnectTimeout { port: u16, after: Duration },

    #[error("no response through the circuit within {0:?}")]
    CircuitTimeout(Duration),

    #[error("SOCKS request failed: {0}")]
    Socks(SocksReply),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("tunnel failed: {0}")]
    Tunnel(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request aborted by proxy shutdown")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(String),
}

/// An HTTP request to send through Tor. Validated on construction.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub target: TargetUrl,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// End-to-end timeout; the client default applies when unset.
    pub timeout: Option<Duration>,
}

impl ProxyRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            method,
            target: TargetUrl::parse(url)?,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, ProxyError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: impl Into<Bytes>) -> Result<Self, ProxyError> {
        Ok(Self::new(Method::POST, url)?.with_body(body))
    }

    pub fn delete(url: &str) -> Result<Self, ProxyError> {
        Self::new(Method::DELETE, url)
    }

    /// Append a header. Repeated names are kept.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ProxyError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::InvalidTarget(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProxyError::InvalidTarget(format!("invalid value for header {name}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProxyError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProxyError::MalformedResponse(format!("invalid JSON body: {e}")))
    }

    /// Media type from `Content-Type`, without parameters.
    pub fn mime_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)?
            .to_str()
            .ok()?
            .split(';')
            .next()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

/// Status, headers and body as read off the wire.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Counts one open stream for as long as it lives.
struct StreamGuard<'a>(&'a watch::Sender<usize>);

impl<'a> StreamGuard<'a> {
    fn new(active: &'a watch::Sender<usize>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active)
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn aborted(mut cancel: watch::Receiver<bool>) {
    let _ = cancel.wait_for(|aborted| *aborted).await;
}

/// Issues requests through a local SOCKS port.
///
/// One client serves one Ready session; after [`shutdown`](Self::shutdown)
/// every request fails with [`ProxyError::Aborted`].
pub struct ProxyClient {
    settings: ProxyConfig,
    accepting: AtomicBool,
    cancel: watch::Sender<bool>,
    active: watch::Sender<usize>,
    isolation_counter: AtomicU64,
}

impl ProxyClient {
    pub fn new(settings: ProxyConfig) -> Self {
        Self {
            settings,
            accepting: AtomicBool::new(true),
            cancel: watch::Sender::new(false),
            active: watch::Sender::new(0),
            isolation_counter: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ProxyConfig {
        &self.settings
    }

    /// Requests currently in flight.
    pub fn active_streams(&self) -> usize {
        *self.active.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Send `req` through the SOCKS listener on `127.0.0.1:socks_port`.
    pub async fn request(
        &self,
        req: &ProxyRequest,
        socks_port: u16,
    ) -> Result<ProxyResponse, ProxyError> {
        let _stream = StreamGuard::new(&self.active);
        if !self.is_accepting() {
            return Err(ProxyError::Aborted);
        }

        let started = Instant::now();
        let timeout = req.timeout.unwrap_or_else(|| self.settings.request_timeout());
        let auth = self.isolation_auth();
        debug!(
            method = %req.method,
            host = %req.target.host().hostname(),
            socks_port,
            isolated = auth.is_some(),
            "proxying request"
        );

        let exchange = async {
            if req.target.is_https() {
                tokio::time::timeout(
                    timeout,
                    tls::exchange(req, socks_port, auth.as_ref(), &self.settings, timeout),
                )
                .await
                .unwrap_or(Err(ProxyError::CircuitTimeout(timeout)))
            } else {
                self.plain_exchange(req, socks_port, auth.as_ref(), timeout).await
            }
        };

        let raw = tokio::select! {
            result = exchange => result,
            _ = aborted(self.cancel.subscribe()) => Err(ProxyError::Aborted),
        };

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "request failed");
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        debug!(
            status = raw.status.as_u16(),
            bytes = raw.body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request complete"
        );
        Ok(ProxyResponse {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            elapsed,
        })
    }

    /// Stop accepting requests, let in-flight ones drain for up to
    /// `grace`, then abort the rest. Returns once no stream is open.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut active = self.active.subscribe();

        let drained = tokio::time::timeout(grace, active.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            warn!(
                remaining = self.active_streams(),
                ?grace,
                "aborting in-flight requests"
            );
            self.cancel.send_replace(true);
            let _ = active.wait_for(|n| *n == 0).await;
        }
        debug!("proxy client shut down");
    }

    fn isolation_auth(&self) -> Option<SocksAuth> {
        if !self.settings.isolate_streams {
            return None;
        }
        let n = self.isolation_counter.fetch_add(1, Ordering::Relaxed);
        let tag = format!("onionctl-{}-{n}", std::process::id());
        Some(SocksAuth {
            username: tag.clone(),
            password: Zeroizing::new(tag),
        })
    }

    async fn connect_socks(&self, port: u16) -> Result<TcpStream, ProxyError> {
        let after = self.settings.connect_timeout();
        match tokio::time::timeout(after, TcpStream::connect(("127.0.0.1", port))).await {
            Err(_) => Err(ProxyError::ConnectTimeout { port, after }),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(ProxyError::ConnectionRefused(port))
            }
            Ok(Err(e)) => Err(ProxyError::Io(e.to_string())),
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
        }
    }

    async fn plain_exchange(
        &self,
        req: &ProxyRequest,
        socks_port: u16,
        auth: Option<&SocksAuth>,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError> {
        let started = Instant::now();
        let mut stream = self.connect_socks(socks_port).await?;

        let tunnel = async {
            socks::handshake(&mut stream, req.target.host(), req.target.port(), auth).await?;
            http::exchange(
                stream,
                req,
                &self.settings.user_agent,
                self.settings.max_body_bytes,
            )
            .await
        };

        tokio::time::timeout(timeout.saturating_sub(started.elapsed()), tunnel)
            .await
            .unwrap_or(Err(ProxyError::CircuitTimeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ONION: &str = "2gzyxa5ihm7nsggfxnu52rck2vv4rvmdlkiu3zzui5du4xyclen53wid.onion";

    fn response(content_type: Option<&str>, body: &str) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(body.to_string()),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_request_builders() {
        let req = ProxyRequest::post(&format!("http://{ONION}/api"), "{}")
            .unwrap()
            .with_header("Authorization", "Bearer abc")
            .unwrap()
            .with_header("X-Tag", "a")
            .unwrap()
            .with_header("X-Tag", "b")
            .unwrap()
            .with_timeout(Duration::from_secs(3));

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(req.headers.get_all("x-tag").iter().count(), 2);
        assert_eq!(req.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let req = ProxyRequest::get("http://example.com/").unwrap();
        assert!(matches!(
            req.clone().with_header("bad header", "x"),
            Err(ProxyError::InvalidTarget(_))
        ));
        assert!(req.with_header("x-ok", "line\nbreak").is_err());
    }

    #[test]
    fn test_invalid_target_rejected_at_build() {
        assert!(matches!(
            ProxyRequest::get("http://nope.onion/"),
            Err(ProxyError::InvalidTarget(_))
        ));
        assert!(ProxyRequest::delete("gopher://example.com/").is_err());
    }

    #[test]
    fn test_response_helpers() {
        let resp = response(Some("application/json; charset=utf-8"), r#"{"ok":true}"#);
        assert!(resp.is_success());
        assert_eq!(resp.mime_type(), Some("application/json"));
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);

        let plain = response(None, "not json");
        assert_eq!(plain.mime_type(), None);
        assert_eq!(plain.text(), "not json");
        assert!(matches!(
            plain.json::<serde_json::Value>(),
            Err(ProxyError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_isolation_credentials_are_unique() {
        let client = ProxyClient::new(ProxyConfig {
            isolate_streams: true,
            ..ProxyConfig::default()
        });
        let a = client.isolation_auth().unwrap();
        let b = client.isolation_auth().unwrap();
        assert_ne!(a.username, b.username);

        let shared = ProxyClient::new(ProxyConfig::default());
        assert!(shared.isolation_auth().is_none());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ProxyClient::new(ProxyConfig::default());
        let req = ProxyRequest::get("http://example.com/").unwrap();
        assert_eq!(
            client.request(&req, port).await.unwrap_err(),
            ProxyError::ConnectionRefused(port)
        );
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let client = ProxyClient::new(ProxyConfig::default());
        client.shutdown(Duration::from_millis(10)).await;
        assert!(!client.is_accepting());

        let req = ProxyRequest::get("http://example.com/").unwrap();
        assert_eq!(client.request(&req, 1).await.unwrap_err(), ProxyError::Aborted);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_request() {
        // A SOCKS server that accepts and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = std::sync::Arc::new(ProxyClient::new(ProxyConfig::default()));
        let req = ProxyRequest::get("http://example.com/").unwrap();
        let inflight = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&req, port).await })
        };

        let mut active = client.active.subscribe();
        active.wait_for(|n| *n == 1).await.unwrap();

        client.shutdown(Duration::from_millis(50)).await;
        assert_eq!(client.active_streams(), 0);
        assert_eq!(inflight.await.unwrap().unwrap_err(), ProxyError::Aborted);
    }
}
