//! In-memory collaborators
//!
//! Used by the worker binary and the tests. Records are kept in process and
//! failures can be injected per activity name.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use syncwarden_durable::activity::error_types;
use syncwarden_durable::serde_duration::saturating_millis;
use syncwarden_durable::{ActivityContext, ActivityError};
use tracing::debug;
use uuid::Uuid;

use super::{
    ConfigFetchActivities, ConnectionStatus, JobTracker, MaxAttemptOutput,
    ScheduleRetrieverInput, ScheduleRetrieverOutput, SyncRunInput, SyncRunOutput, SyncRunner,
};
use crate::schedule::{compute_time_to_wait, Clock, ConnectionSchedule, SystemClock};
use crate::state::{ConnectionId, RunKind};

/// Error type of injected failures
const INJECTED: &str = "INJECTED";

/// Remaining injected failures per activity name
#[derive(Debug, Default)]
struct FailureInjector {
    remaining: Mutex<HashMap<&'static str, u32>>,
}

impl FailureInjector {
    fn fail_next(&self, activity: &'static str, times: u32) {
        self.remaining.lock().insert(activity, times);
    }

    fn check(&self, activity: &'static str) -> Result<(), ActivityError> {
        let mut remaining = self.remaining.lock();
        match remaining.get_mut(activity) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(ActivityError::retryable(format!("injected failure in {activity}"))
                    .with_type(INJECTED))
            }
            _ => Ok(()),
        }
    }
}

fn not_found(what: impl std::fmt::Display) -> ActivityError {
    ActivityError::non_retryable(format!("{what} not found")).with_type(error_types::NOT_FOUND)
}

// =============================================================================
// Config fetch
// =============================================================================

/// Connection as seen by the config fetch activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub source_id: Option<Uuid>,
    pub source_config: serde_json::Value,
    pub status: ConnectionStatus,
    pub schedule: ConnectionSchedule,
    /// Start of the last job that reached a terminal state
    pub last_terminal_job_start: Option<DateTime<Utc>>,
    pub workspace_tombstoned: bool,
}

impl ConnectionRecord {
    /// An active connection with a fresh source and an empty config
    pub fn new(schedule: ConnectionSchedule) -> Self {
        Self {
            source_id: Some(Uuid::now_v7()),
            source_config: serde_json::json!({}),
            status: ConnectionStatus::Active,
            schedule,
            last_terminal_job_start: None,
            workspace_tombstoned: false,
        }
    }

    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_source_config(mut self, config: serde_json::Value) -> Self {
        self.source_config = config;
        self
    }

    pub fn with_last_terminal_job_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.last_terminal_job_start = Some(started_at);
        self
    }

    pub fn tombstoned(mut self) -> Self {
        self.workspace_tombstoned = true;
        self
    }
}

/// In-memory [`ConfigFetchActivities`]
#[derive(Debug)]
pub struct InMemoryConfigFetch {
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
    max_attempt: RwLock<u32>,
    clock: Arc<dyn Clock>,
    failures: FailureInjector,
}

impl InMemoryConfigFetch {
    pub fn new(max_attempt: u32) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_attempt: RwLock::new(max_attempt),
            clock: Arc::new(SystemClock),
            failures: FailureInjector::default(),
        }
    }

    /// Measure time-to-wait against `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register or replace a connection
    pub fn insert(&self, connection_id: ConnectionId, record: ConnectionRecord) {
        self.connections.write().insert(connection_id, record);
    }

    /// Modify a connection in place; returns false if it is unknown
    pub fn update<F>(&self, connection_id: ConnectionId, f: F) -> bool
    where
        F: FnOnce(&mut ConnectionRecord),
    {
        match self.connections.write().get_mut(&connection_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn record(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.read().get(&connection_id).cloned()
    }

    pub fn set_max_attempt(&self, max_attempt: u32) {
        *self.max_attempt.write() = max_attempt;
    }

    /// Fail the next `times` calls of `activity` with a retryable error
    pub fn fail_next(&self, activity: &'static str, times: u32) {
        self.failures.fail_next(activity, times);
    }

    /// Remember when the latest terminal job of a connection started
    pub fn record_terminal_job(&self, connection_id: ConnectionId, started_at: DateTime<Utc>) {
        self.update(connection_id, |record| {
            if record
                .last_terminal_job_start
                .map_or(true, |previous| previous < started_at)
            {
                record.last_terminal_job_start = Some(started_at);
            }
        });
    }
}

#[async_trait]
impl ConfigFetchActivities for InMemoryConfigFetch {
    async fn get_source_id(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Uuid>, ActivityError> {
        self.failures.check("get_source_id")?;
        Ok(self
            .connections
            .read()
            .get(&connection_id)
            .and_then(|record| record.source_id))
    }

    async fn get_source_config(&self, source_id: Uuid) -> Result<serde_json::Value, ActivityError> {
        self.failures.check("get_source_config")?;
        self.connections
            .read()
            .values()
            .find(|record| record.source_id == Some(source_id))
            .map(|record| record.source_config.clone())
            .ok_or_else(|| not_found(format_args!("source {source_id}")))
    }

    async fn get_status(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<ConnectionStatus>, ActivityError> {
        self.failures.check("get_status")?;
        Ok(self
            .connections
            .read()
            .get(&connection_id)
            .map(|record| record.status))
    }

    async fn get_time_to_wait(
        &self,
        input: ScheduleRetrieverInput,
    ) -> Result<ScheduleRetrieverOutput, ActivityError> {
        self.failures.check("get_time_to_wait")?;
        let connections = self.connections.read();
        let record = connections
            .get(&input.connection_id)
            .ok_or_else(|| not_found(format_args!("connection {}", input.connection_id)))?;

        let now = self.clock.now();
        let anchor = record.last_terminal_job_start.unwrap_or(now);
        Ok(ScheduleRetrieverOutput {
            time_to_wait: compute_time_to_wait(
                &record.schedule,
                record.last_terminal_job_start,
                now,
            ),
            interval: record.schedule.interval_after(anchor),
        })
    }

    async fn get_max_attempt(&self) -> Result<MaxAttemptOutput, ActivityError> {
        self.failures.check("get_max_attempt")?;
        Ok(MaxAttemptOutput {
            max_attempt: *self.max_attempt.read(),
        })
    }

    async fn is_workspace_tombstone(
        &self,
        connection_id: ConnectionId,
    ) -> Result<bool, ActivityError> {
        self.failures.check("is_workspace_tombstone")?;
        Ok(self
            .connections
            .read()
            .get(&connection_id)
            .is_some_and(|record| record.workspace_tombstoned))
    }
}

// =============================================================================
// Job tracker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: i32,
    pub status: AttemptStatus,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: i64,
    pub connection_id: ConnectionId,
    pub kind: RunKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<AttemptRecord>,
    pub reason: Option<String>,
}

/// In-memory [`JobTracker`]
///
/// With schedule feedback attached, every job that reaches a terminal state
/// updates the connection's last terminal job start so the next time-to-wait
/// is measured from it.
#[derive(Debug)]
pub struct InMemoryJobTracker {
    jobs: RwLock<BTreeMap<i64, JobRecord>>,
    next_job_id: AtomicI64,
    schedule_feedback: Option<Arc<InMemoryConfigFetch>>,
    clock: Arc<dyn Clock>,
    failures: FailureInjector,
}

impl Default for InMemoryJobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobTracker {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_job_id: AtomicI64::new(1),
            schedule_feedback: None,
            clock: Arc::new(SystemClock),
            failures: FailureInjector::default(),
        }
    }

    /// Stamp job creation times from `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_schedule_feedback(mut self, config: Arc<InMemoryConfigFetch>) -> Self {
        self.schedule_feedback = Some(config);
        self
    }

    /// Fail the next `times` calls of `activity` with a retryable error
    pub fn fail_next(&self, activity: &'static str, times: u32) {
        self.failures.fail_next(activity, times);
    }

    pub fn job(&self, job_id: i64) -> Option<JobRecord> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Every job, oldest first
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.read().values().cloned().collect()
    }

    pub fn jobs_for(&self, connection_id: ConnectionId) -> Vec<JobRecord> {
        self.jobs
            .read()
            .values()
            .filter(|job| job.connection_id == connection_id)
            .cloned()
            .collect()
    }

    fn finish(
        &self,
        job_id: i64,
        status: JobStatus,
        attempt: Option<(i32, AttemptStatus)>,
        reason: Option<String>,
    ) -> Result<(), ActivityError> {
        let (connection_id, created_at) = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(&job_id)
                .ok_or_else(|| not_found(format_args!("job {job_id}")))?;

            // already terminal: repeated delivery of the same call
            if job.status.is_terminal() {
                return Ok(());
            }

            for record in job.attempts.iter_mut() {
                if record.status != AttemptStatus::Running {
                    continue;
                }
                record.status = match attempt {
                    Some((attempt_id, attempt_status)) if attempt_id == record.attempt_id => {
                        attempt_status
                    }
                    _ => AttemptStatus::Failed,
                };
                if record.status == AttemptStatus::Failed && record.failure.is_none() {
                    record.failure = reason.clone();
                }
            }
            job.status = status;
            job.reason = reason;
            (job.connection_id, job.created_at)
        };

        debug!(job_id, ?status, "job finished");
        if let Some(config) = &self.schedule_feedback {
            config.record_terminal_job(connection_id, created_at);
        }
        Ok(())
    }
}

#[async_trait]
impl JobTracker for InMemoryJobTracker {
    async fn create_job(
        &self,
        connection_id: ConnectionId,
        kind: RunKind,
    ) -> Result<i64, ActivityError> {
        self.failures.check("create_job")?;
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        self.jobs.write().insert(
            job_id,
            JobRecord {
                job_id,
                connection_id,
                kind,
                status: JobStatus::Pending,
                created_at: self.clock.now(),
                attempts: Vec::new(),
                reason: None,
            },
        );
        Ok(job_id)
    }

    async fn create_attempt(&self, job_id: i64) -> Result<i32, ActivityError> {
        self.failures.check("create_attempt")?;
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| not_found(format_args!("job {job_id}")))?;

        let attempt_id = i32::try_from(job.attempts.len())
            .map_err(|_| ActivityError::non_retryable("too many attempts"))?;
        job.attempts.push(AttemptRecord {
            attempt_id,
            status: AttemptStatus::Running,
            failure: None,
        });
        job.status = JobStatus::Running;
        Ok(attempt_id)
    }

    async fn attempt_failed(
        &self,
        job_id: i64,
        attempt_id: i32,
        reason: String,
    ) -> Result<(), ActivityError> {
        self.failures.check("attempt_failed")?;
        let mut jobs = self.jobs.write();
        let attempt = jobs
            .get_mut(&job_id)
            .and_then(|job| {
                job.attempts
                    .iter_mut()
                    .find(|attempt| attempt.attempt_id == attempt_id)
            })
            .ok_or_else(|| not_found(format_args!("attempt {job_id}/{attempt_id}")))?;

        attempt.status = AttemptStatus::Failed;
        attempt.failure = Some(reason);
        Ok(())
    }

    async fn job_succeeded(&self, job_id: i64, attempt_id: i32) -> Result<(), ActivityError> {
        self.failures.check("job_succeeded")?;
        self.finish(
            job_id,
            JobStatus::Succeeded,
            Some((attempt_id, AttemptStatus::Succeeded)),
            None,
        )
    }

    async fn job_failed(&self, job_id: i64, reason: String) -> Result<(), ActivityError> {
        self.failures.check("job_failed")?;
        self.finish(job_id, JobStatus::Failed, None, Some(reason))
    }

    async fn job_cancelled(&self, job_id: i64, reason: String) -> Result<(), ActivityError> {
        self.failures.check("job_cancelled")?;
        self.finish(job_id, JobStatus::Cancelled, None, Some(reason))
    }
}

// =============================================================================
// Sync runner
// =============================================================================

/// [`SyncRunner`] that sleeps for a random duration and sometimes fails
#[derive(Debug, Clone)]
pub struct SimulatedSyncRunner {
    min_duration: Duration,
    max_duration: Duration,
    failure_rate: f64,
}

impl Default for SimulatedSyncRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(10), 0.1)
    }
}

impl SimulatedSyncRunner {
    pub fn new(min_duration: Duration, max_duration: Duration, failure_rate: f64) -> Self {
        Self {
            min_duration: min_duration.min(max_duration),
            max_duration,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    fn pick_duration(&self) -> Duration {
        let min = saturating_millis(self.min_duration);
        let max = saturating_millis(self.max_duration);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl SyncRunner for SimulatedSyncRunner {
    async fn run_attempt(
        &self,
        ctx: &ActivityContext,
        input: &SyncRunInput,
    ) -> Result<SyncRunOutput, ActivityError> {
        let duration = self.pick_duration();
        debug!(
            connection_id = %input.connection_id,
            job_id = input.job_id,
            attempt_id = input.attempt_id,
            kind = ?input.kind,
            duration_ms = saturating_millis(duration),
            "simulated sync started"
        );

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.cancelled() => return Err(ActivityError::cancelled()),
        }

        let failed = rand::thread_rng().gen_bool(self.failure_rate);
        if failed {
            return Err(ActivityError::retryable("simulated sync failure"));
        }
        Ok(SyncRunOutput {
            records_synced: rand::thread_rng().gen_range(0..10_000),
        })
    }
}
