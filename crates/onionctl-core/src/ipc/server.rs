//! IPC server — axum HTTP router over a Unix domain socket.
//!
//! The controller binds a Unix socket and exposes a JSON API for the
//! CLI to query status, drive the daemon lifecycle, proxy requests and
//! request shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use onionctl_config::AppConfig;

use super::types::*;
use crate::facade::{ControlFacade, FacadeError};
use crate::proxy::ProxyError;
use crate::service::ShutdownSignal;

/// Shared state accessible to all IPC route handlers.
pub struct IpcState {
    pub facade: ControlFacade,
    pub config: AppConfig,
    pub shutdown_tx: broadcast::Sender<ShutdownSignal>,
    pub started_at: Instant,
}

/// Default Unix socket path for controller IPC.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/onionctl.sock";

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Build the axum router with all IPC routes.
pub fn router(state: Arc<IpcState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/config", get(handle_config))
        .route("/daemon/start", post(handle_start))
        .route("/daemon/stop", post(handle_stop))
        .route("/daemon/restart", post(handle_restart))
        .route("/fetch", post(handle_fetch))
        .route("/shutdown", post(handle_shutdown))
        .with_state(state)
}

/// Start the IPC server on the given Unix socket path.
///
/// Removes any stale socket file before binding. Runs until the
/// shutdown signal is received.
pub async fn serve(
    socket_path: &Path,
    state: Arc<IpcState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "IPC server listening");

    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("IPC server shutting down");
        })
        .await?;

    std::fs::remove_file(socket_path).ok();
    Ok(())
}

/// Resolve the socket path from config or use the default.
pub fn socket_path_from_config(config: &AppConfig) -> PathBuf {
    if config.ipc.socket_path.is_empty() {
        PathBuf::from(DEFAULT_SOCKET_PATH)
    } else {
        PathBuf::from(&config.ipc.socket_path)
    }
}

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// HTTP status for a facade failure.
pub fn status_for(err: &FacadeError) -> StatusCode {
    match err {
        FacadeError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        FacadeError::StartInProgress | FacadeError::OperationInProgress => StatusCode::CONFLICT,
        FacadeError::Proxy(ProxyError::InvalidTarget(_)) => StatusCode::BAD_REQUEST,
        FacadeError::Proxy(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn facade_error(err: FacadeError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "IPC request failed");
    }
    api_error(status, err)
}

fn lifecycle(facade: &ControlFacade) -> Json<LifecycleResponse> {
    Json(LifecycleResponse {
        state: facade.state(),
        socks_port: facade.socks_port(),
    })
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        build_profile: crate::build_info::BUILD_PROFILE.to_string(),
    })
}

async fn handle_status(State(state): State<Arc<IpcState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.facade.state(),
        socks_port: state.facade.socks_port(),
        daemon_alive: state.facade.daemon_alive(),
        backend: state.facade.backend_name().to_string(),
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        pid: std::process::id(),
        log_level: state.config.logging.level.clone(),
    })
}

async fn handle_config(State(state): State<Arc<IpcState>>) -> Result<Json<ConfigResponse>, ApiError> {
    toml::to_string_pretty(&state.config)
        .map(|toml| Json(ConfigResponse { toml }))
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize config: {e}"),
            )
        })
}

async fn handle_start(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    info!("start requested via IPC");
    state.facade.start().await.map_err(facade_error)?;
    Ok(lifecycle(&state.facade))
}

async fn handle_stop(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    info!("stop requested via IPC");
    state.facade.stop().await.map_err(facade_error)?;
    Ok(lifecycle(&state.facade))
}

async fn handle_restart(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    info!("restart requested via IPC");
    state.facade.restart().await.map_err(facade_error)?;
    Ok(lifecycle(&state.facade))
}

async fn handle_fetch(
    State(state): State<Arc<IpcState>>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>, ApiError> {
    let proxied = req
        .to_proxy_request()
        .map_err(|e| facade_error(e.into()))?;
    let resp = state.facade.fetch(proxied).await.map_err(facade_error)?;
    Ok(Json(FetchResponse::from(&resp)))
}

async fn handle_shutdown(State(state): State<Arc<IpcState>>) -> Json<ShutdownResponse> {
    info!("shutdown requested via IPC");
    let _ = state.shutdown_tx.send(ShutdownSignal);
    Json(ShutdownResponse {
        acknowledged: true,
        message: "Shutdown initiated".to_string(),
    })
}
