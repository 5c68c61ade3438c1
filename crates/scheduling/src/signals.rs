//! Operator signals accepted by the connection manager

use serde::{Deserialize, Serialize};

/// A fire-and-forget signal for one connection's manager
///
/// Signals are queued by the runtime and applied at the manager's next
/// checkpoint, never in the middle of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionSignal {
    /// Run a sync now instead of waiting for the schedule
    SubmitManualSync,

    /// Cancel the running job, if any
    CancelJob,

    /// Stop the manager permanently
    DeleteConnection,

    /// The connection configuration changed and must be reloaded
    ConnectionUpdated,

    /// Run a reset (clear destination state and resync) next
    ResetConnection {
        /// Also suppress the next regularly scheduled run
        skip_next_scheduling: bool,
    },
}

impl ConnectionSignal {
    /// `resetConnection`
    pub fn reset() -> Self {
        Self::ResetConnection {
            skip_next_scheduling: false,
        }
    }

    /// `resetConnectionAndSkipNextScheduling`
    pub fn reset_and_skip_next_scheduling() -> Self {
        Self::ResetConnection {
            skip_next_scheduling: true,
        }
    }

    /// Stable name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubmitManualSync => "submit_manual_sync",
            Self::CancelJob => "cancel_job",
            Self::DeleteConnection => "delete_connection",
            Self::ConnectionUpdated => "connection_updated",
            Self::ResetConnection {
                skip_next_scheduling: false,
            } => "reset_connection",
            Self::ResetConnection {
                skip_next_scheduling: true,
            } => "reset_connection_and_skip_next_scheduling",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_constructors() {
        assert_eq!(ConnectionSignal::reset().name(), "reset_connection");
        assert_eq!(
            ConnectionSignal::reset_and_skip_next_scheduling().name(),
            "reset_connection_and_skip_next_scheduling"
        );
    }

    #[test]
    fn test_signal_wire_format() {
        let signal = ConnectionSignal::reset_and_skip_next_scheduling();
        let json = serde_json::to_value(signal).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "reset_connection", "skip_next_scheduling": true})
        );

        let parsed: ConnectionSignal =
            serde_json::from_value(serde_json::json!({"type": "cancel_job"})).unwrap();
        assert_eq!(parsed, ConnectionSignal::CancelJob);
    }
}
