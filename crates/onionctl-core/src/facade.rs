//! The control API: start, stop, restart, and fetch.
//!
//! [`ControlFacade`] composes the [`ProcessSupervisor`], the
//! [`BootstrapMonitor`] and a per-session [`ProxyClient`], and is the only
//! thing that transitions [`DaemonState`].
//!
//! ## Concurrency
//!
//! - Lifecycle transitions queue on one async gate and run as spawned
//!   tasks, so a caller that goes away never leaves a transition half done.
//! - Concurrent `start()` calls share one in-flight start and all see its
//!   outcome.
//! - While a `restart()` runs, `start`/`stop`/`restart`/`fetch` fail with
//!   [`FacadeError::OperationInProgress`].
//! - The ready port and the published state change under one lock, so a
//!   `fetch` never sees a port the state does not report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::watch;
use tracing::{info, warn};

use onionctl_config::{AppConfig, ProxyConfig, TorConfig};

use crate::BoxFuture;
use crate::bootstrap::{BootstrapError, BootstrapMonitor};
use crate::proxy::{ProxyClient, ProxyError, ProxyRequest, ProxyResponse};
use crate::state::DaemonState;
use crate::supervisor::{
    DaemonBackend, ProcessHandle, ProcessSupervisor, StartError, StopError, TorBinaryBackend,
};

/// Errors surfaced by the control API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FacadeError {
    #[error("Tor is not ready")]
    NotReady,

    #[error("a start is already in progress")]
    StartInProgress,

    #[error("another lifecycle operation is in progress")]
    OperationInProgress,

    #[error("start cancelled by stop")]
    StartCancelled,

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("lifecycle task failed: {0}")]
    TaskFailed(String),
}

type StartOutcome = Shared<BoxFuture<'static, Result<u16, FacadeError>>>;

struct PendingStart {
    id: u64,
    outcome: StartOutcome,
}

#[derive(Clone)]
struct ReadySlot {
    socks_port: u16,
    proxy: Arc<ProxyClient>,
}

/// Bookkeeping guarded by the sync lock. Never held across an await.
#[derive(Default)]
struct Core {
    pending_start: Option<PendingStart>,
    restarting: bool,
    ready: Option<ReadySlot>,
}

/// Owned by whoever holds the lifecycle gate.
#[derive(Default)]
struct Lifecycle {
    handle: Option<ProcessHandle>,
}

struct Inner {
    tor: TorConfig,
    proxy: ProxyConfig,
    supervisor: ProcessSupervisor,
    gate: tokio::sync::Mutex<Lifecycle>,
    core: Mutex<Core>,
    state: watch::Sender<DaemonState>,
    /// Bumped by every `stop()`; a start launched under an older value
    /// gives up.
    stop_epoch: watch::Sender<u64>,
    next_op: AtomicU64,
    suspended_by_background: AtomicBool,
}

/// Single entry point for driving the Tor daemon. Cheap to clone.
#[derive(Clone)]
pub struct ControlFacade {
    inner: Arc<Inner>,
}

impl ControlFacade {
    /// Facade over a real `tor` binary.
    pub fn new(config: &AppConfig) -> Self {
        Self::with_backend(config, Box::new(TorBinaryBackend::new(&config.tor.binary)))
    }

    pub fn with_backend(config: &AppConfig, backend: Box<dyn DaemonBackend>) -> Self {
        let supervisor = ProcessSupervisor::new(backend, config.tor.stop_grace());
        Self {
            inner: Arc::new(Inner {
                tor: config.tor.clone(),
                proxy: config.proxy.clone(),
                supervisor,
                gate: tokio::sync::Mutex::new(Lifecycle::default()),
                core: Mutex::new(Core::default()),
                state: watch::Sender::new(DaemonState::Stopped),
                stop_epoch: watch::Sender::new(0),
                next_op: AtomicU64::new(1),
                suspended_by_background: AtomicBool::new(false),
            }),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> DaemonState {
        self.inner.state.borrow().clone()
    }

    /// Watch every state transition.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.inner.state.subscribe()
    }

    /// SOCKS port while ready.
    pub fn socks_port(&self) -> Option<u16> {
        self.inner.lock_core().ready.as_ref().map(|r| r.socks_port)
    }

    pub fn backend_name(&self) -> &str {
        self.inner.supervisor.backend_name()
    }

    /// Whether the supervised process is still running. `None` while a
    /// lifecycle transition owns the process.
    pub fn daemon_alive(&self) -> Option<bool> {
        let mut lifecycle = self.inner.gate.try_lock().ok()?;
        Some(
            lifecycle
                .handle
                .as_mut()
                .is_some_and(|handle| self.inner.supervisor.is_alive(handle)),
        )
    }

    /// Start the daemon and wait for bootstrap; returns the SOCKS port.
    ///
    /// Returns the existing port when already ready. Concurrent callers
    /// join the in-flight start.
    pub async fn start(&self) -> Result<u16, FacadeError> {
        self.begin_start(false)?.await
    }

    /// Like [`start`](Self::start) but fails with
    /// [`FacadeError::StartInProgress`] instead of joining a pending start.
    pub async fn try_start(&self) -> Result<u16, FacadeError> {
        self.begin_start(true)?.await
    }

    fn begin_start(&self, fail_fast: bool) -> Result<StartOutcome, FacadeError> {
        let mut core = self.inner.lock_core();
        if core.restarting {
            return Err(FacadeError::OperationInProgress);
        }
        if let Some(ready) = &core.ready {
            let port = ready.socks_port;
            return Ok(async move { Ok(port) }.boxed().shared());
        }
        if let Some(pending) = &core.pending_start {
            if fail_fast {
                return Err(FacadeError::StartInProgress);
            }
            return Ok(pending.outcome.clone());
        }

        let id = self.inner.next_op.fetch_add(1, Ordering::Relaxed);
        let epoch = *self.inner.stop_epoch.borrow();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run_start(id, epoch).await });
        let outcome: StartOutcome = async move {
            task.await
                .unwrap_or_else(|e| Err(FacadeError::TaskFailed(e.to_string())))
        }
        .boxed()
        .shared();

        core.pending_start = Some(PendingStart {
            id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Stop the daemon. Succeeds when nothing is running.
    ///
    /// A start still in flight is cancelled and its partial process killed
    /// before the stop runs.
    pub async fn stop(&self) -> Result<(), FacadeError> {
        let pending = {
            let core = self.inner.lock_core();
            if core.restarting {
                return Err(FacadeError::OperationInProgress);
            }
            self.inner.stop_epoch.send_modify(|e| *e += 1);
            core.pending_start.as_ref().map(|p| p.outcome.clone())
        };
        if let Some(outcome) = pending {
            let _ = outcome.await;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut lifecycle = inner.gate.lock().await;
            inner.stop_locked(&mut lifecycle).await
        })
        .await
        .unwrap_or_else(|e| Err(FacadeError::TaskFailed(e.to_string())))
    }

    /// Stop then start as one transition; returns the new SOCKS port.
    pub async fn restart(&self) -> Result<u16, FacadeError> {
        {
            let mut core = self.inner.lock_core();
            if core.restarting || core.pending_start.is_some() {
                return Err(FacadeError::OperationInProgress);
            }
            core.restarting = true;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_restart().await })
            .await
            .unwrap_or_else(|e| {
                self.inner.lock_core().restarting = false;
                Err(FacadeError::TaskFailed(e.to_string()))
            })
    }

    /// Send a request through Tor.
    pub async fn fetch(&self, req: ProxyRequest) -> Result<ProxyResponse, FacadeError> {
        let slot = {
            let core = self.inner.lock_core();
            if core.restarting {
                return Err(FacadeError::OperationInProgress);
            }
            core.ready.clone().ok_or(FacadeError::NotReady)?
        };
        slot.proxy
            .request(&req, slot.socks_port)
            .await
            .map_err(|e| match e {
                ProxyError::Aborted => FacadeError::NotReady,
                other => FacadeError::Proxy(other),
            })
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ProxyResponse, FacadeError> {
        self.fetch(with_headers(ProxyRequest::get(url)?, headers)?)
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<hyper::body::Bytes>,
        headers: &[(&str, &str)],
    ) -> Result<ProxyResponse, FacadeError> {
        self.fetch(with_headers(ProxyRequest::post(url, body)?, headers)?)
            .await
    }

    pub async fn delete(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ProxyResponse, FacadeError> {
        self.fetch(with_headers(ProxyRequest::delete(url)?, headers)?)
            .await
    }

    /// The host application moved to the background.
    ///
    /// Stops the daemon unless `keep_running_in_background` is set. Fails
    /// with [`FacadeError::OperationInProgress`] during a restart.
    pub async fn on_background(&self) -> Result<(), FacadeError> {
        if self.inner.tor.keep_running_in_background {
            return Ok(());
        }
        let active = {
            let core = self.inner.lock_core();
            if core.restarting {
                return Err(FacadeError::OperationInProgress);
            }
            core.ready.is_some() || core.pending_start.is_some()
        };
        if !active {
            return Ok(());
        }
        info!("stopping Tor while in background");
        self.stop().await?;
        self.inner
            .suspended_by_background
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The host application returned to the foreground. Restarts the
    /// daemon if [`on_background`](Self::on_background) stopped it.
    pub async fn on_foreground(&self) -> Result<(), FacadeError> {
        if !self
            .inner
            .suspended_by_background
            .swap(false, Ordering::SeqCst)
        {
            return Ok(());
        }
        info!("resuming Tor after background");
        self.start().await.map(|_| ())
    }
}

fn with_headers(
    mut req: ProxyRequest,
    headers: &[(&str, &str)],
) -> Result<ProxyRequest, ProxyError> {
    for (name, value) in headers {
        req = req.with_header(name, value)?;
    }
    Ok(req)
}

async fn stopped_since(mut epochs: watch::Receiver<u64>, epoch: u64) {
    let _ = epochs.wait_for(|current| *current != epoch).await;
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: DaemonState) {
        let _core = self.lock_core();
        self.publish_locked(state);
    }

    /// Caller holds the core lock.
    fn publish_locked(&self, state: DaemonState) {
        info!(state = %state, "daemon state");
        self.state.send_replace(state);
    }

    fn make_ready(&self, core: &mut Core, socks_port: u16) {
        core.ready = Some(ReadySlot {
            socks_port,
            proxy: Arc::new(ProxyClient::new(self.proxy.clone())),
        });
        self.publish_locked(DaemonState::Ready { socks_port });
    }

    async fn run_start(&self, id: u64, epoch: u64) -> Result<u16, FacadeError> {
        let mut lifecycle = self.gate.lock().await;

        if *self.stop_epoch.borrow() != epoch {
            self.clear_pending(id);
            return Err(FacadeError::StartCancelled);
        }

        // A restart may have completed while this start was queued
        let already = self.lock_core().ready.as_ref().map(|r| r.socks_port);
        if let Some(port) = already {
            self.clear_pending(id);
            return Ok(port);
        }

        let result = self.launch(epoch).await;
        let mut core = self.lock_core();
        if core.pending_start.as_ref().is_some_and(|p| p.id == id) {
            core.pending_start = None;
        }
        match result {
            Ok((handle, port)) => {
                lifecycle.handle = Some(handle);
                self.make_ready(&mut core, port);
                Ok(port)
            }
            Err(e) => {
                self.publish_locked(DaemonState::StartFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn clear_pending(&self, id: u64) {
        let mut core = self.lock_core();
        if core.pending_start.as_ref().is_some_and(|p| p.id == id) {
            core.pending_start = None;
        }
    }

    async fn run_restart(&self) -> Result<u16, FacadeError> {
        let mut lifecycle = self.gate.lock().await;
        info!("restarting Tor daemon");

        let stopped = self.stop_locked(&mut lifecycle).await;
        let launched = match stopped {
            Ok(()) => {
                let epoch = *self.stop_epoch.borrow();
                self.launch(epoch).await
            }
            Err(e) => Err(e),
        };

        let mut core = self.lock_core();
        core.restarting = false;
        match launched {
            Ok((handle, port)) => {
                lifecycle.handle = Some(handle);
                self.make_ready(&mut core, port);
                Ok(port)
            }
            Err(e @ FacadeError::Stop(_)) => Err(e),
            Err(e) => {
                self.publish_locked(DaemonState::StartFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Spawn the daemon and wait for bootstrap. Any partial process is
    /// killed before an error is returned.
    async fn launch(&self, epoch: u64) -> Result<(ProcessHandle, u16), FacadeError> {
        self.publish(DaemonState::Starting);
        let mut handle = self.supervisor.start(&self.tor)?;

        let mut monitor = BootstrapMonitor::new();
        let bootstrap =
            monitor.await_ready_with(&mut handle, self.tor.bootstrap_timeout(), |event| {
                self.publish(DaemonState::Bootstrapping {
                    progress: event.progress,
                });
            });
        let result = tokio::select! {
            result = bootstrap => result.map_err(FacadeError::Bootstrap),
            _ = stopped_since(self.stop_epoch.subscribe(), epoch) => Err(FacadeError::StartCancelled),
        };

        match result {
            Ok(port) => Ok((handle, port)),
            Err(e) => {
                warn!(error = %e, "bootstrap failed, killing daemon");
                self.supervisor.kill(handle).await;
                Err(e)
            }
        }
    }

    /// Tear down streams, then the process. Caller holds the gate.
    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), FacadeError> {
        let Some(handle) = lifecycle.handle.take() else {
            let mut core = self.lock_core();
            core.ready = None;
            if *self.state.borrow() != DaemonState::Stopped {
                self.publish_locked(DaemonState::Stopped);
            }
            return Ok(());
        };

        let proxy = {
            let mut core = self.lock_core();
            let slot = core.ready.take();
            self.publish_locked(DaemonState::Stopping);
            slot.map(|s| s.proxy)
        };
        if let Some(proxy) = proxy {
            proxy.shutdown(self.supervisor.stop_grace()).await;
        }

        match self.supervisor.stop(handle).await {
            Ok(()) | Err(StopError::NotRunning) => {
                self.publish(DaemonState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.publish(DaemonState::StopFailed {
                    reason: e.to_string(),
                });
                Err(FacadeError::Stop(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.tor.binary = "/nonexistent/tor".to_string();
        config.tor.data_dir = tmp.path().join("tor").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_initial_state() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        assert_eq!(facade.state(), DaemonState::Stopped);
        assert_eq!(facade.socks_port(), None);
        assert_eq!(facade.backend_name(), "tor");
    }

    #[tokio::test]
    async fn test_start_with_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));

        let err = facade.start().await.unwrap_err();
        assert_eq!(
            err,
            FacadeError::Start(StartError::BinaryMissing("/nonexistent/tor".into()))
        );
        assert!(matches!(facade.state(), DaemonState::StartFailed { .. }));
        // Availability is checked before the data directory is touched
        assert!(!tmp.path().join("tor").exists());
        assert_eq!(facade.daemon_alive(), Some(false));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        facade.stop().await.unwrap();
        facade.stop().await.unwrap();
        assert_eq!(facade.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_clears_start_failure() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        let _ = facade.start().await;
        facade.stop().await.unwrap();
        assert_eq!(facade.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_fetch_while_stopped() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        let req = ProxyRequest::get("http://example.com/").unwrap();
        assert_eq!(facade.fetch(req).await.unwrap_err(), FacadeError::NotReady);
    }

    #[tokio::test]
    async fn test_get_validates_before_readiness() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        let err = facade.get("http://bogus.onion/", &[]).await.unwrap_err();
        assert!(matches!(err, FacadeError::Proxy(ProxyError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_background_noop_when_stopped() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        facade.on_background().await.unwrap();
        // Nothing was suspended, so foreground does not start anything
        facade.on_foreground().await.unwrap();
        assert_eq!(facade.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribe_sees_failure() {
        let tmp = TempDir::new().unwrap();
        let facade = ControlFacade::new(&config(&tmp));
        let mut rx = facade.subscribe();
        let _ = facade.start().await;
        rx.wait_for(|s| matches!(s, DaemonState::StartFailed { .. }))
            .await
            .unwrap();
    }
}
