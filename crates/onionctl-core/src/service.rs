//! Long-running controller — owns a [`ControlFacade`], serves IPC, and
//! tears the daemon down on shutdown.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use onionctl_config::AppConfig;

use crate::facade::ControlFacade;
use crate::ipc::IpcState;
use crate::ipc::server::{self, socket_path_from_config};
use crate::supervisor::DaemonBackend;

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The `onionctl run` controller.
pub struct ControlService {
    config: AppConfig,
    facade: ControlFacade,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl ControlService {
    /// Controller driving the configured `tor` binary.
    pub fn new(config: AppConfig) -> Self {
        let facade = ControlFacade::new(&config);
        Self::with_facade(config, facade)
    }

    pub fn with_backend(config: AppConfig, backend: Box<dyn DaemonBackend>) -> Self {
        let facade = ControlFacade::with_backend(&config, backend);
        Self::with_facade(config, facade)
    }

    fn with_facade(config: AppConfig, facade: ControlFacade) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            facade,
            shutdown_tx,
        }
    }

    /// Serve IPC until a shutdown signal or Ctrl-C, then stop the daemon.
    ///
    /// With `start_daemon` the daemon is started in the background as soon
    /// as the socket is bound; a failed start is logged and the controller
    /// keeps serving.
    pub async fn run(&self, start_daemon: bool) -> Result<(), ServiceError> {
        let socket_path = socket_path_from_config(&self.config);
        info!(
            socket = %socket_path.display(),
            backend = self.facade.backend_name(),
            "onionctl controller starting"
        );

        let state = Arc::new(IpcState {
            facade: self.facade.clone(),
            config: self.config.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            started_at: Instant::now(),
        });
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let ipc_rx = self.shutdown_tx.subscribe();
        let mut ipc = tokio::spawn(async move { server::serve(&socket_path, state, ipc_rx).await });

        let starter = start_daemon.then(|| {
            let facade = self.facade.clone();
            tokio::spawn(async move {
                match facade.start().await {
                    Ok(port) => info!(socks_port = port, "Tor ready"),
                    Err(e) => error!(error = %e, "Tor failed to start"),
                }
            })
        });

        // Set when the IPC task exits before any shutdown was requested.
        let mut ipc_exited = None;
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping controller");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.shutdown_tx.send(ShutdownSignal);
            }
            joined = &mut ipc => {
                error!("IPC server exited, stopping controller");
                ipc_exited = Some(joined);
            }
        }

        if let Some(starter) = starter {
            starter.abort();
        }
        if let Err(e) = self.facade.stop().await {
            warn!(error = %e, "Tor did not stop cleanly");
        }

        let early = ipc_exited.is_some();
        let joined = match ipc_exited {
            Some(joined) => joined,
            None => ipc.await,
        };
        match joined {
            Ok(Ok(())) if early => {
                return Err(ServiceError::Startup(
                    "IPC server exited without a shutdown request".to_string(),
                ));
            }
            Ok(result) => result?,
            Err(e) => return Err(ServiceError::Startup(format!("IPC task failed: {e}"))),
        }
        info!("Controller stopped");
        Ok(())
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    pub fn facade(&self) -> &ControlFacade {
        &self.facade
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Errors from the controller runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("controller startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::state::DaemonState;

    fn config(tmp: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.tor.binary = "/nonexistent/tor".to_string();
        config.tor.data_dir = tmp.path().join("tor").to_string_lossy().to_string();
        config.ipc.socket_path = tmp.path().join("ctl.sock").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_service_creation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let service = ControlService::new(config(&tmp));
        assert_eq!(service.facade().state(), DaemonState::Stopped);
        assert_eq!(service.config().tor.binary, "/nonexistent/tor");
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let tmp = tempfile::TempDir::new().unwrap();
        let service = Arc::new(ControlService::new(config(&tmp)));
        let socket = tmp.path().join("ctl.sock");

        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.run(false).await })
        };

        // The socket appears once IPC is bound
        tokio::time::timeout(Duration::from_secs(5), async {
            while !socket.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        service.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        assert_eq!(service.facade().state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_unbindable_socket_fails_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = config(&tmp);
        config.ipc.socket_path = blocker.join("ctl.sock").to_string_lossy().to_string();
        let service = ControlService::new(config);

        let result = tokio::time::timeout(Duration::from_secs(3), service.run(false))
            .await
            .expect("run() kept going after the IPC bind failed");
        assert!(matches!(result, Err(ServiceError::Io(_))), "got {result:?}");
        assert_eq!(service.facade().state(), DaemonState::Stopped);
    }
}
