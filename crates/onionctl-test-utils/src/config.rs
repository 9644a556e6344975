//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use onionctl_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let tmp = tempfile::TempDir::new().unwrap();
/// let config = TestConfigBuilder::in_dir(tmp.path())
///     .bootstrap_timeout_ms(5_000)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Data directory and IPC socket under `dir`, with short timeouts.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new()
            .data_dir(&dir.join("tor").to_string_lossy())
            .socket_path(&dir.join("onionctl.sock").to_string_lossy())
            .bootstrap_timeout_ms(10_000)
            .stop_grace_ms(1_000)
            .request_timeout_ms(5_000)
            .connect_timeout_ms(1_000)
    }

    pub fn binary(mut self, binary: &str) -> Self {
        self.config.tor.binary = binary.to_string();
        self
    }

    pub fn data_dir(mut self, dir: &str) -> Self {
        self.config.tor.data_dir = dir.to_string();
        self
    }

    pub fn control_port(mut self, port: u16) -> Self {
        self.config.tor.control_port = port;
        self
    }

    pub fn socks_port(mut self, port: u16) -> Self {
        self.config.tor.socks_port = port;
        self
    }

    pub fn bootstrap_timeout_ms(mut self, ms: u64) -> Self {
        self.config.tor.bootstrap_timeout_ms = ms;
        self
    }

    pub fn stop_grace_ms(mut self, ms: u64) -> Self {
        self.config.tor.stop_grace_ms = ms;
        self
    }

    pub fn keep_running_in_background(mut self, keep: bool) -> Self {
        self.config.tor.keep_running_in_background = keep;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.proxy.request_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.proxy.connect_timeout_ms = ms;
        self
    }

    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.proxy.max_body_bytes = bytes;
        self
    }

    pub fn isolate_streams(mut self, isolate: bool) -> Self {
        self.config.proxy.isolate_streams = isolate;
        self
    }

    pub fn socket_path(mut self, path: &str) -> Self {
        self.config.ipc.socket_path = path.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
