//! External collaborators of the connection manager
//!
//! Every call may fail. The manager wraps each call in the configured
//! [`RetryPolicy`](syncwarden_durable::RetryPolicy), so implementations must
//! tolerate being invoked more than once for the same request.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use syncwarden_durable::serde_duration::{duration_millis, option_duration_millis};
use syncwarden_durable::{ActivityContext, ActivityError};
use uuid::Uuid;

use crate::state::{ConnectionId, RunKind};

pub use memory::{
    AttemptRecord, AttemptStatus, ConnectionRecord, InMemoryConfigFetch, InMemoryJobTracker,
    JobRecord, JobStatus, SimulatedSyncRunner,
};

/// Status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Deprecated,
}

impl ConnectionStatus {
    /// Whether scheduling is suspended for this status
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Inactive | Self::Deprecated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRetrieverInput {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRetrieverOutput {
    #[serde(with = "duration_millis")]
    pub time_to_wait: Duration,

    /// Length of the interval the next run closes, if the schedule has one
    #[serde(default, with = "option_duration_millis")]
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxAttemptOutput {
    pub max_attempt: u32,
}

/// Lookups of connection configuration and scheduling state
#[async_trait]
pub trait ConfigFetchActivities: Send + Sync {
    /// Source the connection reads from, if it still has one
    async fn get_source_id(&self, connection_id: ConnectionId)
        -> Result<Option<Uuid>, ActivityError>;

    /// Opaque configuration document of a source
    async fn get_source_config(&self, source_id: Uuid) -> Result<serde_json::Value, ActivityError>;

    /// Current connection status, if the connection is known
    async fn get_status(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<ConnectionStatus>, ActivityError>;

    /// Remaining wait before the connection's next scheduled run
    async fn get_time_to_wait(
        &self,
        input: ScheduleRetrieverInput,
    ) -> Result<ScheduleRetrieverOutput, ActivityError>;

    /// Attempts allowed per job
    async fn get_max_attempt(&self) -> Result<MaxAttemptOutput, ActivityError>;

    /// Whether the connection's workspace has been tombstoned
    async fn is_workspace_tombstone(&self, connection_id: ConnectionId)
        -> Result<bool, ActivityError>;
}

/// Job and attempt lifecycle bookkeeping
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Create a job, returning its id
    async fn create_job(
        &self,
        connection_id: ConnectionId,
        kind: RunKind,
    ) -> Result<i64, ActivityError>;

    /// Create the next attempt of a job, returning its id
    async fn create_attempt(&self, job_id: i64) -> Result<i32, ActivityError>;

    async fn attempt_failed(
        &self,
        job_id: i64,
        attempt_id: i32,
        reason: String,
    ) -> Result<(), ActivityError>;

    async fn job_succeeded(&self, job_id: i64, attempt_id: i32) -> Result<(), ActivityError>;

    /// Mark a job permanently failed after its attempts ran out
    async fn job_failed(&self, job_id: i64, reason: String) -> Result<(), ActivityError>;

    async fn job_cancelled(&self, job_id: i64, reason: String) -> Result<(), ActivityError>;
}

/// Input of one sync attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunInput {
    pub connection_id: ConnectionId,
    pub job_id: i64,
    pub attempt_id: i32,
    /// 1-based attempt number within the job
    pub attempt_number: u32,
    pub kind: RunKind,
    pub source_config: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunOutput {
    pub records_synced: u64,
}

/// Executes sync attempts
///
/// Implementations must watch `ctx` for cancellation and return promptly
/// (usually with [`ActivityError::cancelled`]) once it fires; attempts that
/// outlive the grace period are dropped.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_attempt(
        &self,
        ctx: &ActivityContext,
        input: &SyncRunInput,
    ) -> Result<SyncRunOutput, ActivityError>;
}
