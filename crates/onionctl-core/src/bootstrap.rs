//! Bootstrap progress tracking over the control port.
//!
//! The monitor subscribes to `STATUS_CLIENT` events and follows the
//! daemon's `BOOTSTRAP PROGRESS=N` reports until it reaches 100%.
//!
//! ```text
//! NotStarted ──▶ Connecting ──▶ Bootstrapping(0..100) ──▶ Ready
//!                    │                   │
//!                    └───────────────────┴──────────────▶ Failed
//! ```

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::control::{ControlConnection, ControlError};
use crate::supervisor::ProcessHandle;

/// Consecutive malformed status lines tolerated before giving up.
pub const MAX_CONSECUTIVE_MALFORMED: u32 = 3;

const CONNECT_BACKOFF_START: Duration = Duration::from_millis(50);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Errors from waiting for bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap stalled at {progress}% after {after:?}")]
    Timeout { progress: u8, after: Duration },

    #[error("control channel closed before bootstrap completed")]
    ControlChannelClosed,

    #[error("unparseable bootstrap status: {0}")]
    ParseError(String),

    #[error("control port authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("daemon exited during bootstrap ({0})")]
    DaemonExited(String),
}

impl BootstrapError {
    fn from_control(err: ControlError) -> Self {
        match err {
            ControlError::Closed | ControlError::Io(_) | ControlError::Connect { .. } => {
                BootstrapError::ControlChannelClosed
            }
            ControlError::Protocol(msg) => BootstrapError::ParseError(msg),
            ControlError::Rejected { code, message } => {
                BootstrapError::ParseError(format!("unexpected {code} reply: {message}"))
            }
        }
    }
}

/// One accepted bootstrap status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEvent {
    pub timestamp: SystemTime,
    pub progress: u8,
    pub tag: String,
    pub summary: Option<String>,
}

/// Where the monitor is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    NotStarted,
    Connecting,
    Bootstrapping(u8),
    Ready,
    Failed,
}

/// Split a status line into space-separated tokens, keeping quoted
/// strings (with `\"` escapes) intact.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a `STATUS_CLIENT` event body or a `status/bootstrap-phase` value.
///
/// Returns `Ok(None)` for well-formed status lines that are not bootstrap
/// reports.
pub fn parse_bootstrap_status(line: &str) -> Result<Option<BootstrapEvent>, BootstrapError> {
    let body = match line.strip_prefix("STATUS_CLIENT") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    let tokens = tokenize(body);
    let (severity, action) = match (tokens.first(), tokens.get(1)) {
        (Some(severity), Some(action)) => (severity, action),
        _ => return Err(BootstrapError::ParseError(line.to_string())),
    };
    if !matches!(severity.as_str(), "NOTICE" | "WARN" | "ERR") {
        return Err(BootstrapError::ParseError(line.to_string()));
    }
    if action != "BOOTSTRAP" {
        return Ok(None);
    }

    let args: HashMap<&str, String> = tokens[2..]
        .iter()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| (k, unquote(v)))
        .collect();

    let progress = args
        .get("PROGRESS")
        .and_then(|p| p.parse::<u8>().ok())
        .filter(|p| *p <= 100)
        .ok_or_else(|| BootstrapError::ParseError(line.to_string()))?;

    Ok(Some(BootstrapEvent {
        timestamp: SystemTime::now(),
        progress,
        tag: args.get("TAG").cloned().unwrap_or_default(),
        summary: args.get("SUMMARY").cloned(),
    }))
}

/// Extract the first port from a `net/listeners/socks` value such as
/// `"127.0.0.1:9050" "[::1]:9050"`.
pub fn parse_socks_listener(value: &str) -> Option<u16> {
    value
        .split_whitespace()
        .next()
        .map(|addr| addr.trim_matches('"'))
        .and_then(|addr| addr.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
}

/// Follows one daemon's bootstrap until ready or failed.
#[derive(Debug)]
pub struct BootstrapMonitor {
    phase: BootstrapPhase,
    last_progress: Option<u8>,
    malformed: u32,
}

impl Default for BootstrapMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapMonitor {
    pub fn new() -> Self {
        Self {
            phase: BootstrapPhase::NotStarted,
            last_progress: None,
            malformed: 0,
        }
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    /// Highest progress accepted so far.
    pub fn progress(&self) -> u8 {
        self.last_progress.unwrap_or(0)
    }

    /// Feed one status line. Returns the event if it advanced (or held)
    /// progress; regressive and non-bootstrap lines yield `None`.
    pub fn observe(&mut self, line: &str) -> Result<Option<BootstrapEvent>, BootstrapError> {
        let event = match parse_bootstrap_status(line) {
            Ok(event) => {
                self.malformed = 0;
                event
            }
            Err(e) => {
                self.malformed += 1;
                warn!(line, malformed = self.malformed, "skipping malformed bootstrap status");
                if self.malformed > MAX_CONSECUTIVE_MALFORMED {
                    self.phase = BootstrapPhase::Failed;
                    return Err(e);
                }
                return Ok(None);
            }
        };

        let Some(event) = event else {
            return Ok(None);
        };

        if let Some(last) = self.last_progress {
            if event.progress < last {
                warn!(
                    progress = event.progress,
                    last, "ignoring regressive bootstrap progress"
                );
                return Ok(None);
            }
        }

        self.last_progress = Some(event.progress);
        self.phase = if event.progress == 100 {
            BootstrapPhase::Ready
        } else {
            BootstrapPhase::Bootstrapping(event.progress)
        };
        debug!(progress = event.progress, tag = %event.tag, "bootstrap progress");
        Ok(Some(event))
    }

    /// Wait until the daemon reports 100% and return its SOCKS port.
    pub async fn await_ready(
        &mut self,
        handle: &mut ProcessHandle,
        timeout: Duration,
    ) -> Result<u16, BootstrapError> {
        self.await_ready_with(handle, timeout, |_| {}).await
    }

    /// Like [`await_ready`](Self::await_ready), calling `on_event` for every
    /// accepted progress report.
    pub async fn await_ready_with<F>(
        &mut self,
        handle: &mut ProcessHandle,
        timeout: Duration,
        mut on_event: F,
    ) -> Result<u16, BootstrapError>
    where
        F: FnMut(&BootstrapEvent) + Send,
    {
        let result = tokio::time::timeout(timeout, self.run(handle, &mut on_event)).await;
        match result {
            Ok(Ok(port)) => {
                self.phase = BootstrapPhase::Ready;
                info!(socks_port = port, "Tor bootstrap complete");
                Ok(port)
            }
            Ok(Err(e)) => {
                self.phase = BootstrapPhase::Failed;
                Err(e)
            }
            Err(_) => {
                self.phase = BootstrapPhase::Failed;
                Err(BootstrapError::Timeout {
                    progress: self.progress(),
                    after: timeout,
                })
            }
        }
    }

    async fn run<F>(&mut self, handle: &mut ProcessHandle, on_event: &mut F) -> Result<u16, BootstrapError>
    where
        F: FnMut(&BootstrapEvent) + Send,
    {
        self.phase = BootstrapPhase::Connecting;
        let mut conn = connect_with_backoff(handle).await?;

        conn.authenticate_auto(&handle.cookie_file)
            .await
            .map_err(|e| match e {
                ControlError::Rejected { message, .. } => {
                    BootstrapError::AuthenticationFailed(message)
                }
                other => BootstrapError::from_control(other),
            })?;

        conn.set_events(&["STATUS_CLIENT"])
            .await
            .map_err(BootstrapError::from_control)?;

        // Catch up on phases reached before the subscription
        match conn.get_info("status/bootstrap-phase").await {
            Ok(phase) => {
                if let Some(event) = self.observe(&phase)? {
                    on_event(&event);
                }
            }
            Err(ControlError::Closed) => return Err(BootstrapError::ControlChannelClosed),
            Err(e) => debug!(error = %e, "status/bootstrap-phase unavailable"),
        }

        while self.last_progress != Some(100) {
            let event = conn.next_event().await.map_err(BootstrapError::from_control)?;
            for line in &event.lines {
                if let Some(event) = self.observe(line)? {
                    on_event(&event);
                }
            }
        }

        let port = match conn.get_info("net/listeners/socks").await {
            Ok(value) => parse_socks_listener(&value).unwrap_or(handle.socks_port),
            Err(e) => {
                debug!(error = %e, "net/listeners/socks unavailable, using launch port");
                handle.socks_port
            }
        };
        Ok(port)
    }
}

async fn connect_with_backoff(handle: &mut ProcessHandle) -> Result<ControlConnection, BootstrapError> {
    let mut delay = CONNECT_BACKOFF_START;
    loop {
        match ControlConnection::connect(handle.control_port).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                if let Some(status) = handle.try_exit_status() {
                    return Err(BootstrapError::DaemonExited(status));
                }
                debug!(error = %e, retry_in = ?delay, "control port not open yet");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_BACKOFF_MAX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_status_client_event() {
        let event = parse_bootstrap_status(
            r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn_done SUMMARY="Connected to a relay to build circuits""#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.progress, 85);
        assert_eq!(event.tag, "ap_conn_done");
        assert_eq!(
            event.summary.as_deref(),
            Some("Connected to a relay to build circuits")
        );
    }

    #[test]
    fn test_parse_bootstrap_phase_value() {
        let event = parse_bootstrap_status(r#"NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#)
            .unwrap()
            .unwrap();
        assert_eq!(event.progress, 100);
        assert_eq!(event.tag, "done");
    }

    #[test]
    fn test_parse_other_status_events() {
        assert_eq!(
            parse_bootstrap_status("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED").unwrap(),
            None
        );
        assert_eq!(
            parse_bootstrap_status("STATUS_CLIENT WARN DANGEROUS_SOCKS PROTOCOL=SOCKS4 ADDRESS=x:80")
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_malformed() {
        for line in [
            "",
            "STATUS_CLIENT",
            "STATUS_CLIENT NOTICE",
            "STATUS_CLIENT LOUD BOOTSTRAP PROGRESS=5",
            "STATUS_CLIENT NOTICE BOOTSTRAP TAG=x",
            "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=abc",
            "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=101",
        ] {
            assert!(parse_bootstrap_status(line).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_summary_with_escaped_quotes() {
        let event = parse_bootstrap_status(
            r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=5 TAG=conn SUMMARY="say \"hi\" now""#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.summary.as_deref(), Some(r#"say "hi" now"#));
    }

    #[test]
    fn test_monitor_ignores_regression() {
        let mut monitor = BootstrapMonitor::new();
        assert!(monitor.observe("NOTICE BOOTSTRAP PROGRESS=50 TAG=a").unwrap().is_some());
        assert!(monitor.observe("NOTICE BOOTSTRAP PROGRESS=20 TAG=b").unwrap().is_none());
        assert_eq!(monitor.progress(), 50);
        assert_eq!(monitor.phase(), BootstrapPhase::Bootstrapping(50));

        // Equal progress is accepted
        assert!(monitor.observe("NOTICE BOOTSTRAP PROGRESS=50 TAG=c").unwrap().is_some());
        monitor.observe("NOTICE BOOTSTRAP PROGRESS=100 TAG=done").unwrap();
        assert_eq!(monitor.phase(), BootstrapPhase::Ready);
    }

    #[test]
    fn test_monitor_tolerates_three_malformed_lines() {
        let mut monitor = BootstrapMonitor::new();
        for _ in 0..MAX_CONSECUTIVE_MALFORMED {
            assert_eq!(monitor.observe("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=?").unwrap(), None);
        }
        assert!(matches!(
            monitor.observe("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=?"),
            Err(BootstrapError::ParseError(_))
        ));
        assert_eq!(monitor.phase(), BootstrapPhase::Failed);
    }

    #[test]
    fn test_monitor_malformed_streak_resets() {
        let mut monitor = BootstrapMonitor::new();
        for _ in 0..10 {
            for _ in 0..MAX_CONSECUTIVE_MALFORMED {
                monitor.observe("garbage").unwrap();
            }
            monitor.observe("NOTICE BOOTSTRAP PROGRESS=10 TAG=x").unwrap();
        }
        assert_eq!(monitor.progress(), 10);
    }

    #[test]
    fn test_parse_socks_listener() {
        assert_eq!(parse_socks_listener(r#""127.0.0.1:9050""#), Some(9050));
        assert_eq!(parse_socks_listener(r#""127.0.0.1:39151" "[::1]:39151""#), Some(39151));
        assert_eq!(parse_socks_listener(""), None);
        assert_eq!(parse_socks_listener(r#""unix:/run/tor/socks""#), None);
    }
}
