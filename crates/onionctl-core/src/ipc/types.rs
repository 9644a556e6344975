//! Shared request/response types for controller IPC.
//!
//! These types are serialized as JSON over the Unix domain socket
//! transport. Both the IPC server (controller) and client (CLI) use
//! these types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyError, ProxyRequest, ProxyResponse};
use crate::state::DaemonState;

/// Controller health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
}

/// Controller and daemon status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: DaemonState,
    pub socks_port: Option<u16>,
    /// `None` while a start, stop or restart is running.
    #[serde(default)]
    pub daemon_alive: Option<bool>,
    pub backend: String,
    pub version: String,
    pub git_hash: String,
    pub uptime_secs: u64,
    pub pid: u32,
    pub log_level: String,
}

/// Result of a start, stop or restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub state: DaemonState,
    pub socks_port: Option<u16>,
}

/// A request to proxy through Tor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    /// Validate into a [`ProxyRequest`]. The method is case-insensitive.
    pub fn to_proxy_request(&self) -> Result<ProxyRequest, ProxyError> {
        let method = hyper::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::InvalidTarget(format!("invalid method {:?}", self.method)))?;
        let mut proxied = ProxyRequest::new(method, &self.url)?;
        for (name, value) in &self.headers {
            proxied = proxied.with_header(name, value)?;
        }
        if let Some(body) = &self.body {
            proxied = proxied.with_body(body.clone());
        }
        if let Some(ms) = self.timeout_ms {
            proxied = proxied.with_timeout(Duration::from_millis(ms));
        }
        Ok(proxied)
    }
}

/// A proxied response. Non-UTF-8 bytes in the body are replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub mime_type: Option<String>,
    pub elapsed_ms: u64,
}

impl From<&ProxyResponse> for FetchResponse {
    fn from(resp: &ProxyResponse) -> Self {
        let headers = resp
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: resp.status.as_u16(),
            headers,
            body: resp.text(),
            mime_type: resp.mime_type().map(str::to_string),
            elapsed_ms: resp.elapsed.as_millis() as u64,
        }
    }
}

/// Controller shutdown response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub acknowledged: bool,
    pub message: String,
}

/// Configuration response (serialized TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub toml: String,
}

/// Generic error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
    use hyper::{Method, StatusCode};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fetch_request_conversion() {
        let req = FetchRequest {
            method: "delete".into(),
            url: "http://example.com/items/1".into(),
            headers: vec![("X-Trace".into(), "abc".into())],
            body: Some("gone".into()),
            timeout_ms: Some(750),
        };
        let proxied = req.to_proxy_request().unwrap();
        assert_eq!(proxied.method, Method::DELETE);
        assert_eq!(proxied.headers["x-trace"], "abc");
        assert_eq!(proxied.body.as_deref(), Some(&b"gone"[..]));
        assert_eq!(proxied.timeout, Some(Duration::from_millis(750)));
    }

    #[test]
    fn test_fetch_request_rejects_bad_method() {
        let req = FetchRequest {
            method: "GE T".into(),
            url: "http://example.com/".into(),
            ..FetchRequest::default()
        };
        assert!(matches!(
            req.to_proxy_request(),
            Err(ProxyError::InvalidTarget(msg)) if msg.contains("method")
        ));
    }

    #[test]
    fn test_fetch_response_from_proxy_response() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        let resp = ProxyResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"<p>ok</p>"),
            elapsed: Duration::from_millis(42),
        };

        let fetched = FetchResponse::from(&resp);
        assert_eq!(fetched.status, 201);
        assert_eq!(fetched.body, "<p>ok</p>");
        assert_eq!(fetched.mime_type.as_deref(), Some("text/html"));
        assert_eq!(fetched.elapsed_ms, 42);
        assert_eq!(
            fetched.headers,
            vec![("content-type".to_string(), "text/html; charset=utf-8".to_string())]
        );
    }
}
