//! Build-time metadata embedded by the build script.
//!
//! Reported in the controller's startup log line and by the IPC `/health`
//! and `/status` endpoints.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("ONIONCTL_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("ONIONCTL_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("ONIONCTL_BUILD_PROFILE");

/// The target triple the binary was compiled for.
pub const BUILD_TARGET: &str = env!("ONIONCTL_BUILD_TARGET");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Build timestamp in seconds since the Unix epoch, `0` if unknown.
pub fn build_timestamp_secs() -> u64 {
    BUILD_TIMESTAMP.parse().unwrap_or(0)
}
