//! IPC client — connects to the controller over a Unix domain socket.
//!
//! Provides a typed client for the CLI to query status, drive the daemon
//! lifecycle and proxy requests. Uses `hyper` for HTTP/1.1 over the Unix
//! socket.

use std::path::PathBuf;

use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::debug;

use super::types::*;

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to controller socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("controller is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("controller returned {status}: {message}")]
    ControllerError { status: u16, message: String },
}

/// Client for communicating with a running controller via Unix socket.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Check if the controller socket exists.
    pub fn controller_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send an HTTP request over the Unix socket and return the response body.
    async fn request(
        &self,
        method: hyper::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, IpcClientError> {
        if !self.controller_available() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }

        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| IpcClientError::Connect {
                    path: self.socket_path.clone(),
                    source: e,
                })?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, http_body_util::Full<Bytes>>(
                TokioIo::new(stream),
            )
            .await
            .map_err(|e| IpcClientError::Request(format!("HTTP handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!(error = %e, "IPC connection error");
            }
        });

        debug!(%method, path, "IPC request");

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }

        let req = builder
            .body(http_body_util::Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| IpcClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| IpcClientError::Request(format!("request failed: {e}")))?;

        let status = resp.status();
        let resp_body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&resp_body)
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("unexpected status: {status}"));
            return Err(IpcClientError::ControllerError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp_body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IpcClientError> {
        let body = self.request(hyper::Method::GET, path, None).await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("{path}: {e}")))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, IpcClientError> {
        let body = self.request(hyper::Method::POST, path, body).await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("{path}: {e}")))
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Health check — is the controller running and responsive?
    pub async fn health(&self) -> Result<HealthResponse, IpcClientError> {
        self.get_json("/health").await
    }

    pub async fn status(&self) -> Result<StatusResponse, IpcClientError> {
        self.get_json("/status").await
    }

    /// The controller's effective config as TOML.
    pub async fn config(&self) -> Result<ConfigResponse, IpcClientError> {
        self.get_json("/config").await
    }

    /// Start Tor and wait for bootstrap.
    pub async fn start(&self) -> Result<LifecycleResponse, IpcClientError> {
        self.post_json("/daemon/start", None).await
    }

    pub async fn stop(&self) -> Result<LifecycleResponse, IpcClientError> {
        self.post_json("/daemon/stop", None).await
    }

    pub async fn restart(&self) -> Result<LifecycleResponse, IpcClientError> {
        self.post_json("/daemon/restart", None).await
    }

    /// Proxy a request through the controller's Tor session.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, IpcClientError> {
        let body = serde_json::to_vec(req)
            .map_err(|e| IpcClientError::Parse(format!("failed to serialize request: {e}")))?;
        self.post_json("/fetch", Some(body)).await
    }

    /// Ask the controller to stop Tor and exit.
    pub async fn shutdown(&self) -> Result<ShutdownResponse, IpcClientError> {
        self.post_json("/shutdown", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_creation() {
        let client = IpcClient::new("/tmp/test-onionctl-absent.sock");
        assert!(!client.controller_available());
    }

    #[tokio::test]
    async fn test_client_not_running_error() {
        let client = IpcClient::new("/tmp/nonexistent-onionctl.sock");
        let result = client.health().await;
        assert!(matches!(result, Err(IpcClientError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_integration_server_client() {
        use std::sync::Arc;
        use std::time::Instant;
        use tokio::sync::broadcast;

        use super::super::server;
        use crate::facade::ControlFacade;
        use crate::state::DaemonState;

        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = onionctl_config::AppConfig::default();
        config.tor.binary = "/nonexistent/tor".to_string();
        config.tor.data_dir = tmp.path().join("tor").to_string_lossy().to_string();
        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(server::IpcState {
            facade: ControlFacade::new(&config),
            config,
            shutdown_tx: shutdown_tx.clone(),
            started_at: Instant::now(),
        });

        let sock_path = tmp.path().join("onionctl.sock");
        let sock_path_clone = sock_path.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let server_handle = tokio::spawn(async move {
            server::serve(&sock_path_clone, state, shutdown_rx)
                .await
                .unwrap();
        });

        // Give server time to bind
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let client = IpcClient::new(&sock_path);
        assert!(client.controller_available());

        let health = client.health().await.unwrap();
        assert_eq!(health.status, "ok");

        let status = client.status().await.unwrap();
        assert_eq!(status.state, DaemonState::Stopped);

        let err = client
            .fetch(&FetchRequest {
                method: "GET".into(),
                url: "http://example.com/".into(),
                ..FetchRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IpcClientError::ControllerError { status: 503, .. }));

        let stopped = client.stop().await.unwrap();
        assert_eq!(stopped.state, DaemonState::Stopped);

        let shutdown = client.shutdown().await.unwrap();
        assert!(shutdown.acknowledged);

        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), server_handle).await;
    }
}
