//! Tor daemon process supervision.
//!
//! [`ProcessSupervisor`] owns the launch and teardown of a single daemon
//! process. The platform-specific part (which executable, which arguments,
//! how to ask it to exit) sits behind the [`DaemonBackend`] trait so tests
//! can substitute a fake daemon.
//!
//! ## Lifecycle
//!
//! ```text
//! start(config) ──▶ reserve ports ──▶ prepare data dir ──▶ backend.spawn()
//!                                                            │
//!                                                     ProcessHandle
//!                                                            │
//! stop(handle) ──▶ backend.request_shutdown() ──▶ wait ≤ grace ──▶ kill ──▶ reap
//! ```

pub mod tor;

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use onionctl_config::TorConfig;

use crate::BoxFuture;
use crate::control::ControlError;

pub use tor::TorBinaryBackend;

/// Name of the auth cookie inside the data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// How long to wait for the OS to reap a killed process.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from launching the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("daemon is already running")]
    AlreadyRunning,

    #[error("daemon binary not found: {0}")]
    BinaryMissing(String),

    #[error("port {0} is not available")]
    PortInUse(u16),

    #[error("cannot prepare data directory {path}: {reason}")]
    DataDir { path: PathBuf, reason: String },

    #[error("failed to spawn daemon: {0}")]
    Spawn(String),
}

/// Errors from stopping the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon did not exit within {0:?}")]
    TimeoutExceeded(Duration),
}

/// Everything a backend needs to launch one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub data_dir: PathBuf,
    pub control_port: u16,
    pub socks_port: u16,
    pub cookie_file: PathBuf,
    pub extra_args: Vec<String>,
    /// PID of the controlling process; the daemon exits when it dies.
    pub owner_pid: u32,
}

/// Spawns daemon processes and asks them to shut down.
///
/// Implementations must configure the child with `kill_on_drop(true)` so a
/// dropped [`ProcessHandle`] never orphans a daemon.
pub trait DaemonBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Fails when the backend cannot spawn anything on this host.
    fn check_available(&self) -> Result<(), StartError>;

    /// Launch the daemon described by `spec`.
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, StartError>;

    /// Ask the running daemon to exit on its own.
    fn request_shutdown<'a>(
        &'a self,
        handle: &'a ProcessHandle,
    ) -> BoxFuture<'a, Result<(), ControlError>>;
}

/// A live daemon process.
#[derive(Debug)]
pub struct ProcessHandle {
    id: u64,
    child: Child,
    pub pid: Option<u32>,
    pub control_port: u16,
    pub socks_port: u16,
    pub data_dir: PathBuf,
    pub cookie_file: PathBuf,
    pub started_at: Instant,
}

impl ProcessHandle {
    /// Exit status if the process has already exited, without blocking.
    pub fn try_exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(describe_exit(status)),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => status.to_string(),
    }
}

/// Launches, probes, and stops the daemon process.
pub struct ProcessSupervisor {
    backend: Box<dyn DaemonBackend>,
    live: Mutex<Option<u64>>,
    next_id: AtomicU64,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(backend: Box<dyn DaemonBackend>, stop_grace: Duration) -> Self {
        Self {
            backend,
            live: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stop_grace,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Launch the daemon.
    ///
    /// Port `0` picks a free loopback port. The chosen ports are recorded on
    /// the returned handle.
    pub fn start(&self, config: &TorConfig) -> Result<ProcessHandle, StartError> {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if live.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        self.backend.check_available()?;

        let (control_port, socks_port) = reserve_ports(config.control_port, config.socks_port)?;
        let data_dir = config.data_dir_path();
        prepare_data_dir(&data_dir)?;
        let cookie_file = data_dir.join(COOKIE_FILE_NAME);

        let spec = LaunchSpec {
            data_dir: data_dir.clone(),
            control_port,
            socks_port,
            cookie_file: cookie_file.clone(),
            extra_args: config.extra_args.clone(),
            owner_pid: std::process::id(),
        };

        let mut child = self.backend.spawn(&spec)?;
        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *live = Some(id);

        info!(
            backend = self.backend.name(),
            pid = ?pid,
            control_port,
            socks_port,
            data_dir = %data_dir.display(),
            "Tor daemon launched"
        );

        Ok(ProcessHandle {
            id,
            child,
            pid,
            control_port,
            socks_port,
            data_dir,
            cookie_file,
            started_at: Instant::now(),
        })
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        *live == Some(handle.id) && handle.try_exit_status().is_none()
    }

    /// Gracefully stop the daemon, force-killing it after the grace period.
    ///
    /// Returns once the process has been reaped.
    pub async fn stop(&self, mut handle: ProcessHandle) -> Result<(), StopError> {
        if !self.owns(&handle) {
            return Err(StopError::NotRunning);
        }
        if let Some(status) = handle.try_exit_status() {
            debug!(pid = ?handle.pid, status = %status, "daemon already exited");
            self.release(&handle);
            return Err(StopError::NotRunning);
        }

        let graceful = tokio::time::timeout(self.stop_grace, async {
            if let Err(e) = self.backend.request_shutdown(&handle).await {
                warn!(error = %e, "graceful shutdown request failed");
            }
            handle.child.wait().await
        })
        .await;

        let result = match graceful {
            Ok(Ok(status)) => {
                info!(pid = ?handle.pid, status = %describe_exit(status), "Tor daemon stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "waiting for daemon failed, killing");
                self.force_kill(&mut handle).await
            }
            Err(_) => {
                warn!(
                    pid = ?handle.pid,
                    grace = ?self.stop_grace,
                    "daemon ignored shutdown request, killing"
                );
                self.force_kill(&mut handle).await
            }
        };

        self.release(&handle);
        result
    }

    /// Immediately terminate the daemon. Used to clean up a failed start.
    pub async fn kill(&self, mut handle: ProcessHandle) {
        if handle.try_exit_status().is_none() {
            if let Err(e) = self.force_kill(&mut handle).await {
                warn!(pid = ?handle.pid, error = %e, "daemon kill did not complete");
            }
        }
        self.release(&handle);
        debug!(pid = ?handle.pid, "daemon killed");
    }

    async fn force_kill(&self, handle: &mut ProcessHandle) -> Result<(), StopError> {
        if let Err(e) = handle.child.start_kill() {
            debug!(error = %e, "kill signal not delivered");
        }
        match tokio::time::timeout(REAP_TIMEOUT, handle.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(StopError::TimeoutExceeded(self.stop_grace + REAP_TIMEOUT)),
        }
    }

    fn owns(&self, handle: &ProcessHandle) -> bool {
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) == Some(handle.id)
    }

    fn release(&self, handle: &ProcessHandle) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if *live == Some(handle.id) {
            *live = None;
        }
    }
}

/// Bind both ports at once so two auto-assigned ports never collide, then
/// release them for the daemon.
fn reserve_ports(control: u16, socks: u16) -> Result<(u16, u16), StartError> {
    let control_listener = bind_loopback(control)?;
    let socks_listener = bind_loopback(socks)?;
    let control_port = local_port(&control_listener, control)?;
    let socks_port = local_port(&socks_listener, socks)?;
    Ok((control_port, socks_port))
}

fn bind_loopback(port: u16) -> Result<TcpListener, StartError> {
    TcpListener::bind(("127.0.0.1", port)).map_err(|e| {
        debug!(port, error = %e, "port reservation failed");
        StartError::PortInUse(port)
    })
}

fn local_port(listener: &TcpListener, requested: u16) -> Result<u16, StartError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|_| StartError::PortInUse(requested))
}

fn prepare_data_dir(path: &std::path::Path) -> Result<(), StartError> {
    let err = |e: std::io::Error| StartError::DataDir {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    std::fs::create_dir_all(path).map_err(err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).map_err(err)?;
    }
    Ok(())
}

/// Forward daemon output into tracing under the `onionctl::tor` target.
async fn forward_output<R: AsyncRead + Unpin>(output: R) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("[warn]") || line.contains("[err]") {
            warn!(target: "onionctl::tor", "{line}");
        } else {
            info!(target: "onionctl::tor", "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::process::Stdio;
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Runs `sleep`; shutdown requests are either honoured by killing via
    /// `kill -TERM` or ignored.
    struct SleepBackend {
        honour_shutdown: bool,
    }

    impl DaemonBackend for SleepBackend {
        fn name(&self) -> &str {
            "sleep"
        }

        fn check_available(&self) -> Result<(), StartError> {
            Ok(())
        }

        fn spawn(&self, _spec: &LaunchSpec) -> Result<Child, StartError> {
            Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| StartError::Spawn(e.to_string()))
        }

        fn request_shutdown<'a>(
            &'a self,
            handle: &'a ProcessHandle,
        ) -> BoxFuture<'a, Result<(), ControlError>> {
            Box::pin(async move {
                if self.honour_shutdown {
                    if let Some(pid) = handle.pid {
                        Command::new("kill")
                            .args(["-TERM", &pid.to_string()])
                            .status()
                            .await?;
                    }
                }
                Ok(())
            })
        }
    }

    fn tor_config(dir: &TempDir) -> TorConfig {
        TorConfig {
            data_dir: dir.path().join("tor").to_string_lossy().to_string(),
            ..TorConfig::default()
        }
    }

    fn supervisor(honour_shutdown: bool) -> ProcessSupervisor {
        ProcessSupervisor::new(
            Box::new(SleepBackend { honour_shutdown }),
            Duration::from_millis(300),
        )
    }

    #[tokio::test]
    async fn test_start_assigns_distinct_ports() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(true);
        let mut handle = sup.start(&tor_config(&tmp)).unwrap();

        assert_ne!(handle.control_port, 0);
        assert_ne!(handle.socks_port, 0);
        assert_ne!(handle.control_port, handle.socks_port);
        assert_eq!(handle.cookie_file, tmp.path().join("tor").join(COOKIE_FILE_NAME));
        assert!(sup.is_alive(&mut handle));

        sup.stop(handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_data_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let sup = supervisor(true);
        let handle = sup.start(&tor_config(&tmp)).unwrap();
        let mode = std::fs::metadata(&handle.data_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        sup.kill(handle).await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(true);
        let handle = sup.start(&tor_config(&tmp)).unwrap();

        assert_eq!(
            sup.start(&tor_config(&tmp)).unwrap_err(),
            StartError::AlreadyRunning
        );

        sup.stop(handle).await.unwrap();
        // The slot is free again once stopped
        let again = sup.start(&tor_config(&tmp)).unwrap();
        sup.kill(again).await;
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let tmp = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = TorConfig {
            socks_port: port,
            ..tor_config(&tmp)
        };
        assert_eq!(
            supervisor(true).start(&config).unwrap_err(),
            StartError::PortInUse(port)
        );
    }

    #[tokio::test]
    async fn test_unresponsive_daemon_is_killed() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(false);
        let handle = sup.start(&tor_config(&tmp)).unwrap();

        let started = Instant::now();
        sup.stop(handle).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_stop_after_exit_reports_not_running() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(true);
        let mut handle = sup.start(&tor_config(&tmp)).unwrap();

        handle.child.start_kill().unwrap();
        handle.child.wait().await.unwrap();
        assert!(!sup.is_alive(&mut handle));
        assert_eq!(sup.stop(handle).await.unwrap_err(), StopError::NotRunning);
    }

    #[tokio::test]
    async fn test_data_dir_failure() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let config = TorConfig {
            data_dir: blocker.join("tor").to_string_lossy().to_string(),
            ..TorConfig::default()
        };
        assert!(matches!(
            supervisor(true).start(&config),
            Err(StartError::DataDir { .. })
        ));
    }
}
