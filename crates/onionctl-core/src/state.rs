//! Observable daemon lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised Tor daemon.
///
/// Exactly one value is live per [`ControlFacade`](crate::ControlFacade);
/// only the facade transitions it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DaemonState {
    /// No daemon process.
    #[default]
    Stopped,
    /// The process is being launched.
    Starting,
    /// The process is up and building circuits.
    Bootstrapping { progress: u8 },
    /// Bootstrap finished; requests may be routed through `socks_port`.
    Ready { socks_port: u16 },
    /// Streams are being drained and the process stopped.
    Stopping,
    /// The process could not be stopped within the grace period.
    StopFailed { reason: String },
    /// The last start attempt failed; any partial process was killed.
    StartFailed { reason: String },
}

impl DaemonState {
    pub fn is_ready(&self) -> bool {
        matches!(self, DaemonState::Ready { .. })
    }

    /// SOCKS port, only while ready.
    pub fn socks_port(&self) -> Option<u16> {
        match self {
            DaemonState::Ready { socks_port } => Some(*socks_port),
            _ => None,
        }
    }

    /// True while a start or stop is underway.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            DaemonState::Starting | DaemonState::Bootstrapping { .. } | DaemonState::Stopping
        )
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Stopped => write!(f, "stopped"),
            DaemonState::Starting => write!(f, "starting"),
            DaemonState::Bootstrapping { progress } => write!(f, "bootstrapping ({progress}%)"),
            DaemonState::Ready { socks_port } => write!(f, "ready (socks port {socks_port})"),
            DaemonState::Stopping => write!(f, "stopping"),
            DaemonState::StopFailed { reason } => write!(f, "stop failed: {reason}"),
            DaemonState::StartFailed { reason } => write!(f, "start failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_socks_port_only_when_ready() {
        assert_eq!(DaemonState::Ready { socks_port: 9050 }.socks_port(), Some(9050));
        assert_eq!(DaemonState::Bootstrapping { progress: 99 }.socks_port(), None);
        assert_eq!(DaemonState::Stopped.socks_port(), None);
    }

    #[test]
    fn test_transitioning() {
        assert!(DaemonState::Starting.is_transitioning());
        assert!(DaemonState::Stopping.is_transitioning());
        assert!(!DaemonState::Stopped.is_transitioning());
        assert!(
            !DaemonState::StartFailed {
                reason: "x".into()
            }
            .is_transitioning()
        );
    }

    #[test]
    fn test_serde_tagged_form() {
        let json = serde_json::to_string(&DaemonState::Bootstrapping { progress: 45 }).unwrap();
        assert_eq!(json, r#"{"state":"bootstrapping","progress":45}"#);

        let back: DaemonState = serde_json::from_str(r#"{"state":"ready","socks_port":9150}"#).unwrap();
        assert_eq!(back, DaemonState::Ready { socks_port: 9150 });
    }

    #[test]
    fn test_display() {
        assert_eq!(DaemonState::Stopped.to_string(), "stopped");
        assert_eq!(
            DaemonState::Ready { socks_port: 9050 }.to_string(),
            "ready (socks port 9050)"
        );
    }
}
