//! Time-to-wait decisions for the next scheduled run

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncwarden_durable::serde_duration::{duration_millis, option_duration_millis};
use syncwarden_durable::{ActivityError, RetryPolicy};
use tracing::{debug, instrument};

use crate::activities::{ConfigFetchActivities, ScheduleRetrieverInput};
use crate::schedule::SUSPENDED_WAIT;
use crate::state::ConnectionId;

/// Errors from schedule computation
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// An activity call failed even after retries
    #[error("schedule lookup failed in {activity}: {source}")]
    Activity {
        activity: &'static str,
        #[source]
        source: ActivityError,
    },
}

/// Why the scheduler picked a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// Regular schedule (zero if overdue or never run)
    Scheduled,

    /// Connection is inactive or deprecated
    ConnectionDisabled,

    /// Workspace was tombstoned
    WorkspaceTombstoned,
}

/// How long to wait before the next scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    #[serde(with = "duration_millis")]
    pub time_to_wait: Duration,
    pub reason: WaitReason,

    /// Schedule interval; a skipped run pushes the next one this far out
    #[serde(default, with = "option_duration_millis")]
    pub interval: Option<Duration>,
}

impl ScheduleDecision {
    fn suspended(reason: WaitReason) -> Self {
        Self {
            time_to_wait: SUSPENDED_WAIT,
            reason,
            interval: None,
        }
    }

    /// True when scheduling is suspended rather than merely far away
    pub fn is_suspended(&self) -> bool {
        self.reason != WaitReason::Scheduled
    }
}

/// Computes the wait before a connection's next scheduled run
#[derive(Clone)]
pub struct Scheduler {
    activities: Arc<dyn ConfigFetchActivities>,
    retry: RetryPolicy,
}

impl Scheduler {
    pub fn new(activities: Arc<dyn ConfigFetchActivities>, retry: RetryPolicy) -> Self {
        Self { activities, retry }
    }

    /// Remaining wait for `connection_id`
    ///
    /// A tombstoned workspace or a disabled connection suspends scheduling
    /// (an effectively infinite wait) without being an error. Activity
    /// failures that survive the retry policy are returned so the caller can
    /// fall back to its own retry interval.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn compute_wait_time(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ScheduleDecision, SchedulerError> {
        let activities: &dyn ConfigFetchActivities = self.activities.as_ref();

        let tombstoned = self
            .retry
            .execute("is_workspace_tombstone", move || {
                activities.is_workspace_tombstone(connection_id)
            })
            .await
            .map_err(|source| SchedulerError::Activity {
                activity: "is_workspace_tombstone",
                source,
            })?;
        if tombstoned {
            debug!("workspace tombstoned, scheduling suspended");
            return Ok(ScheduleDecision::suspended(WaitReason::WorkspaceTombstoned));
        }

        let status = self
            .retry
            .execute("get_status", move || activities.get_status(connection_id))
            .await
            .map_err(|source| SchedulerError::Activity {
                activity: "get_status",
                source,
            })?;
        if status.is_some_and(|status| status.is_disabled()) {
            debug!(?status, "connection disabled, scheduling suspended");
            return Ok(ScheduleDecision::suspended(WaitReason::ConnectionDisabled));
        }

        let output = self
            .retry
            .execute("get_time_to_wait", move || {
                activities.get_time_to_wait(ScheduleRetrieverInput { connection_id })
            })
            .await
            .map_err(|source| SchedulerError::Activity {
                activity: "get_time_to_wait",
                source,
            })?;

        Ok(ScheduleDecision {
            time_to_wait: output.time_to_wait,
            reason: WaitReason::Scheduled,
            interval: output.interval,
        })
    }
}
