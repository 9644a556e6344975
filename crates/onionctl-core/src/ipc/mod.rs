//! Controller IPC — Unix domain socket transport for the CLI.
//!
//! The controller exposes an HTTP/JSON API over a Unix socket. The CLI
//! connects as a client to query status, drive the daemon lifecycle,
//! proxy requests and request shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐         Unix socket        ┌──────────────┐
//! │   CLI    │───────────────────────────▶│  IPC Server  │
//! │          │  HTTP/1.1 + JSON           │  (axum)      │
//! └──────────┘                            └──────┬───────┘
//!                                                │
//!                                         ┌──────▼───────┐
//!                                         │ControlFacade │
//!                                         └──────┬───────┘
//!                                                │ SOCKS / control port
//!                                         ┌──────▼───────┐
//!                                         │     tor      │
//!                                         └──────────────┘
//! ```

pub mod client;
pub mod server;
pub mod types;

pub use client::IpcClient;
pub use server::{DEFAULT_SOCKET_PATH, IpcState};
pub use types::*;
