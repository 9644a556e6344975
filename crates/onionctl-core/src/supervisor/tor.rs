//! Backend that runs a real `tor` executable.
//!
//! | Concern | Launch argument |
//! |---------|-----------------|
//! | Config file | `--ignore-missing-torrc -f <data_dir>/torrc` |
//! | State | `--DataDirectory <data_dir>` |
//! | Control port | `--ControlPort 127.0.0.1:<port>` + cookie auth |
//! | SOCKS port | `--SocksPort 127.0.0.1:<port>` |
//! | Orphan protection | `--__OwningControllerProcess <pid>` |
//! | Logging | `--Log "notice stdout"` |
//!
//! Shutdown goes through the control port (`SIGNAL SHUTDOWN`).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::BoxFuture;
use crate::control::{ControlConnection, ControlError};

use super::{DaemonBackend, LaunchSpec, ProcessHandle, StartError};

/// Runs the `tor` binary found on disk or on `PATH`.
pub struct TorBinaryBackend {
    binary: String,
}

impl TorBinaryBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolve the configured binary to an existing file. Bare names are
    /// searched for on `PATH`.
    pub fn resolve_binary(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.binary);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.binary))
            .find(|p| p.is_file())
    }

    /// Build the `tor` argument list for a launch.
    pub fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let data_dir = spec.data_dir.to_string_lossy().to_string();
        let mut args = vec![
            "--ignore-missing-torrc".to_string(),
            "-f".to_string(),
            spec.data_dir.join("torrc").to_string_lossy().to_string(),
            "--DataDirectory".to_string(),
            data_dir,
        ];

        args.extend([
            "--ControlPort".to_string(),
            format!("127.0.0.1:{}", spec.control_port),
            "--SocksPort".to_string(),
            format!("127.0.0.1:{}", spec.socks_port),
        ]);

        args.extend([
            "--CookieAuthentication".to_string(),
            "1".to_string(),
            "--CookieAuthFile".to_string(),
            spec.cookie_file.to_string_lossy().to_string(),
        ]);

        args.extend([
            "--__OwningControllerProcess".to_string(),
            spec.owner_pid.to_string(),
            "--Log".to_string(),
            "notice stdout".to_string(),
            "--ClientOnly".to_string(),
            "1".to_string(),
        ]);

        args.extend(spec.extra_args.iter().cloned());
        args
    }
}

impl DaemonBackend for TorBinaryBackend {
    fn name(&self) -> &str {
        "tor"
    }

    fn check_available(&self) -> Result<(), StartError> {
        self.resolve_binary()
            .map(|_| ())
            .ok_or_else(|| StartError::BinaryMissing(self.binary.clone()))
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, StartError> {
        let binary = self
            .resolve_binary()
            .ok_or_else(|| StartError::BinaryMissing(self.binary.clone()))?;
        let args = self.build_args(spec);
        debug!(binary = %binary.display(), ?args, "spawning tor");

        Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StartError::BinaryMissing(binary.display().to_string())
                }
                _ => StartError::Spawn(e.to_string()),
            })
    }

    fn request_shutdown<'a>(
        &'a self,
        handle: &'a ProcessHandle,
    ) -> BoxFuture<'a, Result<(), ControlError>> {
        Box::pin(async move {
            let mut conn = ControlConnection::connect(handle.control_port).await?;
            conn.authenticate_auto(&handle.cookie_file).await?;
            conn.signal("SHUTDOWN").await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            data_dir: PathBuf::from("/var/lib/onionctl/tor"),
            control_port: 9151,
            socks_port: 9150,
            cookie_file: PathBuf::from("/var/lib/onionctl/tor/control_auth_cookie"),
            extra_args: vec!["--UseBridges".into(), "0".into()],
            owner_pid: 4242,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_build_args_binds_loopback() {
        let args = TorBinaryBackend::new("tor").build_args(&spec());
        assert_eq!(value_after(&args, "--ControlPort"), Some("127.0.0.1:9151"));
        assert_eq!(value_after(&args, "--SocksPort"), Some("127.0.0.1:9150"));
    }

    #[test]
    fn test_build_args_data_dir_and_cookie() {
        let args = TorBinaryBackend::new("tor").build_args(&spec());
        assert_eq!(value_after(&args, "--DataDirectory"), Some("/var/lib/onionctl/tor"));
        assert_eq!(value_after(&args, "-f"), Some("/var/lib/onionctl/tor/torrc"));
        assert_eq!(value_after(&args, "--CookieAuthentication"), Some("1"));
        assert_eq!(
            value_after(&args, "--CookieAuthFile"),
            Some("/var/lib/onionctl/tor/control_auth_cookie")
        );
    }

    #[test]
    fn test_build_args_owner_and_logging() {
        let args = TorBinaryBackend::new("tor").build_args(&spec());
        assert_eq!(value_after(&args, "--__OwningControllerProcess"), Some("4242"));
        assert_eq!(value_after(&args, "--Log"), Some("notice stdout"));
    }

    #[test]
    fn test_build_args_extra_args_last() {
        let args = TorBinaryBackend::new("tor").build_args(&spec());
        assert_eq!(&args[args.len() - 2..], ["--UseBridges", "0"]);
    }

    #[test]
    fn test_missing_binary() {
        let backend = TorBinaryBackend::new("/nonexistent/bin/tor");
        assert_eq!(
            backend.check_available().unwrap_err(),
            StartError::BinaryMissing("/nonexistent/bin/tor".into())
        );
        assert_eq!(
            backend.spawn(&spec()).unwrap_err(),
            StartError::BinaryMissing("/nonexistent/bin/tor".into())
        );
    }

    #[test]
    fn test_resolve_binary_on_path() {
        // `sh` is present on any Unix test host
        let backend = TorBinaryBackend::new("sh");
        let resolved = backend.resolve_binary().unwrap();
        assert!(backend.check_available().is_ok());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_resolve_bare_name_missing() {
        let backend = TorBinaryBackend::new("definitely-not-a-tor-binary");
        assert_eq!(backend.resolve_binary(), None);
    }
}
