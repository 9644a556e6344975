//! A [`DaemonBackend`] that launches [`FakeTor`] instead of `tor`.
//!
//! Each spawn starts a real child process (`cat` reading a pipe) so the
//! supervisor has something to wait on and kill, and serves a fake daemon
//! on the ports from the [`LaunchSpec`]. A graceful shutdown request closes
//! the pipe, which makes `cat` exit.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, Command};

use onionctl_core::control::ControlError;
use onionctl_core::{BoxFuture, DaemonBackend, LaunchSpec, ProcessHandle, StartError};

use crate::fake_tor::{FakeTor, FakeTorOptions, SocksStats};

struct Running {
    _stdin: ChildStdin,
    _fake: FakeTor,
}

struct Shared {
    options: Mutex<FakeTorOptions>,
    ignore_shutdown: bool,
    spawns: AtomicUsize,
    pids: Mutex<Vec<u32>>,
    running: Mutex<HashMap<u16, Running>>,
    stats: Arc<SocksStats>,
}

/// Fake daemon backend. Clones share state, so a test can keep one clone
/// and hand another to the facade.
#[derive(Clone)]
pub struct FakeTorBackend {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeTorBackend {
    pub fn new(options: FakeTorOptions) -> Self {
        Self::build(options, false)
    }

    /// A backend whose daemons never honour a shutdown request, so every
    /// stop runs into the grace period.
    pub fn ignoring_shutdown(options: FakeTorOptions) -> Self {
        Self::build(options, true)
    }

    fn build(options: FakeTorOptions, ignore_shutdown: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                options: Mutex::new(options),
                ignore_shutdown,
                spawns: AtomicUsize::new(0),
                pids: Mutex::new(Vec::new()),
                running: Mutex::new(HashMap::new()),
                stats: Arc::new(SocksStats::default()),
            }),
        }
    }

    /// Behavior for daemons spawned from now on.
    pub fn set_options(&self, options: FakeTorOptions) {
        *lock(&self.shared.options) = options;
    }

    /// Number of daemon processes spawned.
    pub fn spawn_count(&self) -> usize {
        self.shared.spawns.load(Ordering::SeqCst)
    }

    /// PIDs of every spawned process, oldest first.
    pub fn pids(&self) -> Vec<u32> {
        lock(&self.shared.pids).clone()
    }

    /// SOCKS activity across every spawned daemon.
    pub fn socks(&self) -> &SocksStats {
        &self.shared.stats
    }

    pub fn boxed(&self) -> Box<dyn DaemonBackend> {
        Box::new(self.clone())
    }
}

fn listener(port: u16) -> Result<TcpListener, StartError> {
    let std_listener =
        std::net::TcpListener::bind(("127.0.0.1", port)).map_err(|_| StartError::PortInUse(port))?;
    std_listener
        .set_nonblocking(true)
        .map_err(|e| StartError::Spawn(e.to_string()))?;
    TcpListener::from_std(std_listener).map_err(|e| StartError::Spawn(e.to_string()))
}

impl DaemonBackend for FakeTorBackend {
    fn name(&self) -> &str {
        "fake-tor"
    }

    fn check_available(&self) -> Result<(), StartError> {
        Ok(())
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, StartError> {
        let options = lock(&self.shared.options).clone();
        let fake = FakeTor::serve(
            listener(spec.control_port)?,
            listener(spec.socks_port)?,
            options,
            self.shared.stats.clone(),
        )
        .map_err(|e| StartError::Spawn(e.to_string()))?;

        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StartError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StartError::Spawn("no stdin pipe".into()))?;

        self.shared.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(pid) = child.id() {
            lock(&self.shared.pids).push(pid);
        }
        lock(&self.shared.running).insert(
            spec.control_port,
            Running {
                _stdin: stdin,
                _fake: fake,
            },
        );
        Ok(child)
    }

    fn request_shutdown<'a>(
        &'a self,
        handle: &'a ProcessHandle,
    ) -> BoxFuture<'a, Result<(), ControlError>> {
        Box::pin(async move {
            if !self.shared.ignore_shutdown {
                lock(&self.shared.running).remove(&handle.control_port);
            }
            Ok(())
        })
    }
}

/// Whether `pid` is still a live process.
pub async fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
