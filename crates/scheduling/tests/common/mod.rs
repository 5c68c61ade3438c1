//! Shared harness for connection manager integration tests
//!
//! All tests run on a paused clock, so schedule waits of hours complete
//! instantly while the manager is otherwise idle. The in-memory schedule
//! reads a [`TokioClock`], so time-to-wait shrinks as paused time advances.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use syncwarden_durable::{ActivityContext, ActivityError, InstanceStatus, RetryPolicy};
use syncwarden_scheduling::activities::{
    ConnectionRecord, InMemoryConfigFetch, InMemoryJobTracker, JobRecord,
};
use syncwarden_scheduling::{
    Clock, ConnectionId, ConnectionManagerQuery, ConnectionManagerService, ConnectionSchedule,
    ManagerConfig, ManagerDeps, ManagerExit, SyncRunInput, SyncRunOutput, SyncRunner, TimeUnit,
    TokioClock,
};
use tokio::sync::Notify;

/// What the next sync attempt does
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Succeed after the given time
    Succeed(Duration),

    /// Fail with a retryable error after the given time
    Fail(Duration),

    /// Run until released or cancelled
    Block,

    /// Run forever, ignoring cancellation
    Stubborn,
}

/// Sync runner driven by a script of steps
///
/// Once the script runs out every attempt succeeds after one second.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<Step>>,
    started: Mutex<Vec<SyncRunInput>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicUsize,
    release: Notify,
}

impl ScriptedRunner {
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// Let one blocked attempt finish successfully
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn started(&self) -> Vec<SyncRunInput> {
        self.started.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncRunner for ScriptedRunner {
    async fn run_attempt(
        &self,
        ctx: &ActivityContext,
        input: &SyncRunInput,
    ) -> Result<SyncRunOutput, ActivityError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.lock().push(input.clone());

        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Step::Succeed(Duration::from_secs(1)));

        let result = match step {
            Step::Succeed(after) | Step::Fail(after) => {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        if matches!(step, Step::Fail(_)) {
                            Err(ActivityError::retryable("scripted failure"))
                        } else {
                            Ok(SyncRunOutput { records_synced: 10 })
                        }
                    }
                    _ = ctx.cancelled() => Err(ActivityError::cancelled()),
                }
            }
            Step::Block => {
                tokio::select! {
                    _ = self.release.notified() => Ok(SyncRunOutput { records_synced: 10 }),
                    _ = ctx.cancelled() => Err(ActivityError::cancelled()),
                }
            }
            Step::Stubborn => std::future::pending().await,
        };

        if result.as_ref().is_err_and(ActivityError::is_cancelled) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Config with short, deterministic waits
pub fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_schedule_retry_interval(Duration::from_secs(60))
        .with_default_max_attempt(2)
        .with_attempt_backoff(RetryPolicy::fixed(Duration::from_secs(10), 1))
        .with_activity_retry(RetryPolicy::fixed(Duration::from_secs(1), 3))
        .with_cancellation_grace_period(Duration::from_secs(5))
}

/// Connection that ran just now on a daily schedule
pub fn idle_record() -> ConnectionRecord {
    ConnectionRecord::new(ConnectionSchedule::every(24, TimeUnit::Hours))
        .with_last_terminal_job_start(Utc::now())
}

pub struct Harness {
    pub connection_id: ConnectionId,
    pub service: ConnectionManagerService,
    pub config: Arc<InMemoryConfigFetch>,
    pub jobs: Arc<InMemoryJobTracker>,
    pub runner: Arc<ScriptedRunner>,
    pub clock: Arc<TokioClock>,
}

impl Harness {
    /// Harness for one connection, not yet started
    pub fn new(record: ConnectionRecord) -> Self {
        Self::with_config(record, test_config())
    }

    pub fn with_config(record: ConnectionRecord, manager_config: ManagerConfig) -> Self {
        let connection_id = ConnectionId::new();
        let clock = Arc::new(TokioClock::new());
        let config = Arc::new(InMemoryConfigFetch::new(3).with_clock(clock.clone()));
        config.insert(connection_id, record);
        let jobs = Arc::new(
            InMemoryJobTracker::new()
                .with_clock(clock.clone())
                .with_schedule_feedback(config.clone()),
        );
        let runner = Arc::new(ScriptedRunner::default());

        let service = ConnectionManagerService::new(ManagerDeps {
            activities: config.clone(),
            jobs: jobs.clone(),
            runner: runner.clone(),
            config: manager_config,
        });

        Self {
            connection_id,
            service,
            config,
            jobs,
            runner,
            clock,
        }
    }

    /// Idle harness with the manager started
    pub fn started() -> Self {
        let harness = Self::new(idle_record());
        harness.start();
        harness
    }

    pub fn start(&self) {
        self.service
            .start_connection(self.connection_id)
            .expect("manager should start");
    }

    pub fn snapshot(&self) -> ConnectionManagerQuery {
        self.service
            .snapshot(self.connection_id)
            .expect("manager should be registered")
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.jobs_for(self.connection_id)
    }

    /// Wait until the manager publishes a matching snapshot
    pub async fn wait_for<P>(&self, predicate: P) -> ConnectionManagerQuery
    where
        P: FnMut(&ConnectionManagerQuery) -> bool,
    {
        tokio::time::timeout(
            Duration::from_secs(60 * 60),
            self.service.wait_for(self.connection_id, predicate),
        )
        .await
        .expect("snapshot not reached within an hour")
        .expect("manager closed before reaching snapshot")
    }

    /// Wait until an attempt is in flight
    pub async fn wait_for_attempt(&self) -> ConnectionManagerQuery {
        self.wait_for(|q| q.state.running && q.job.attempt_id >= 0)
            .await
    }

    /// Wait until the manager is back to waiting with nothing pending
    pub async fn wait_for_idle(&self) -> ConnectionManagerQuery {
        self.wait_for(|q| {
            !q.state.running && !q.state.reset_requested && q.job.job_id < 0
        })
        .await
    }

    /// Wall time as seen by the in-memory schedule
    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    /// Poll the runtime status until the manager reaches `incarnation`
    pub async fn wait_for_incarnation(&self, incarnation: u32) -> InstanceStatus<ManagerExit> {
        for _ in 0..6_000 {
            let status = self
                .service
                .status(self.connection_id)
                .expect("manager should be registered");
            if matches!(status, InstanceStatus::Running { incarnation: n } if n >= incarnation) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("incarnation {incarnation} not reached within ten minutes");
    }

    /// Poll the job records until `condition` holds
    pub async fn wait_for_jobs<F>(&self, mut condition: F) -> Vec<JobRecord>
    where
        F: FnMut(&[JobRecord]) -> bool,
    {
        for _ in 0..6_000 {
            let jobs = self.jobs();
            if condition(&jobs) {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job condition not reached within ten minutes: {:?}", self.jobs());
    }
}
