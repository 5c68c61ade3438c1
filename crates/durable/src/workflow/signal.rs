//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope for an external signal sent to a running workflow instance
///
/// Signals are fire-and-forget. The runtime queues them in the instance
/// mailbox and the workflow drains them at its next checkpoint; the
/// envelope records when the signal was sent so the delay can be traced.
///
/// # Example
///
/// ```ignore
/// runtime.signal("connection-42", ConnectionSignal::CancelJob)?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal<S> {
    /// Typed signal payload
    pub payload: S,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl<S> WorkflowSignal<S> {
    /// Wrap a payload, stamping the send time
    pub fn new(payload: S) -> Self {
        Self {
            payload,
            sent_at: Utc::now(),
        }
    }

    /// How long the signal has been queued, in milliseconds
    pub fn queued_ms(&self) -> i64 {
        (Utc::now() - self.sent_at).num_milliseconds().max(0)
    }

    /// Unwrap the payload
    pub fn into_payload(self) -> S {
        self.payload
    }
}
