#![deny(unsafe_code)]

//! Shared test utilities for the onionctl workspace.
//!
//! Provides a fake Tor daemon (control port, SOCKS5 listener and HTTP
//! origin), a [`DaemonBackend`](onionctl_core::DaemonBackend) that launches
//! it, config builders, and tracing helpers.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! onionctl-test-utils = { workspace = true }
//! ```

pub mod backend;
pub mod config;
pub mod fake_tor;
pub mod tracing_setup;

pub use backend::FakeTorBackend;
pub use config::TestConfigBuilder;
pub use fake_tor::{FakeTor, FakeTorOptions, SocksRecord, SocksStats};

/// A valid v3 onion hostname derived from `seed`.
pub fn fake_onion_address(seed: u8) -> String {
    onionctl_core::OnionAddress::from_public_key(&[seed; 32])
        .hostname()
        .to_string()
}
