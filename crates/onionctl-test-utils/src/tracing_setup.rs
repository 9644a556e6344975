//! Test tracing.
//!
//! [`init_test_tracing`] routes events through the harness writer so they
//! show up only for failing tests (or with `--nocapture`). Repeated calls
//! are no-ops.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: our crates at debug, the
/// HTTP stack quiet.
const DEFAULT_FILTER: &str = "onionctl_core=debug,onionctl_test_utils=debug,hyper=warn,warn";

/// Install a test-writer subscriber once per process.
///
/// ```ignore
/// #[tokio::test]
/// async fn stalls() {
///     onionctl_test_utils::tracing_setup::init_test_tracing();
///     // bootstrap progress and SOCKS replies are now visible on failure
/// }
/// ```
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
