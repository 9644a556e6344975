#![deny(unsafe_code)]

//! onionctl core runtime.
//!
//! Supervises an external Tor daemon, follows its bootstrap over the
//! control port, and routes HTTP(S) requests through its SOCKS port.
//! [`ControlFacade`] is the entry point; [`service::ControlService`] wraps
//! it in a long-running controller reachable over IPC.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future. Used where a trait consumed
/// as `dyn Trait` needs an async method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bootstrap progress tracking over control-port events.
pub mod bootstrap;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Tor control-protocol client.
pub mod control;
/// The start/stop/restart/fetch control API.
pub mod facade;
/// Controller IPC over a Unix domain socket.
pub mod ipc;
/// HTTP(S) through the SOCKS port, and target validation.
pub mod proxy;
/// Long-running controller runtime.
pub mod service;
/// Observable daemon lifecycle state.
pub mod state;
/// Daemon process supervision and backends.
pub mod supervisor;

pub use bootstrap::{BootstrapError, BootstrapMonitor};
pub use control::{ControlConnection, ControlError};
pub use facade::{ControlFacade, FacadeError};
pub use proxy::{OnionAddress, ProxyClient, ProxyError, ProxyRequest, ProxyResponse};
pub use service::ControlService;
pub use state::DaemonState;
pub use supervisor::{
    DaemonBackend, LaunchSpec, ProcessHandle, ProcessSupervisor, StartError, StopError,
    TorBinaryBackend,
};
