//! Connection manager workflow
//!
//! One long-lived instance per connection. Each cycle it either picks up a
//! run requested by a signal (reset first, then manual sync) or waits for the
//! schedule, then drives the job's attempt loop. Signals are only applied at
//! checkpoints: between cycles, while waiting, between attempts, and while an
//! attempt is in flight (where cancel, reset and delete interrupt it).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncwarden_durable::prelude::*;
use syncwarden_durable::serde_duration::{option_duration_millis, saturating_millis};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activities::{ConfigFetchActivities, JobTracker, SyncRunInput, SyncRunner};
use crate::config::ManagerConfig;
use crate::scheduler::Scheduler;
use crate::signals::ConnectionSignal;
use crate::state::{
    AttemptCounter, ConnectionId, ConnectionManagerQuery, ControllerState, Phase, RunKind,
    SignalEffect,
};

type ManagerContext = WorkflowContext<ConnectionSignal, ConnectionManagerQuery>;

/// Collaborators shared by every manager instance
#[derive(Clone)]
pub struct ManagerDeps {
    pub activities: Arc<dyn ConfigFetchActivities>,
    pub jobs: Arc<dyn JobTracker>,
    pub runner: Arc<dyn SyncRunner>,
    pub config: ManagerConfig,
}

/// State carried from one incarnation to the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarriedState {
    pub state: ControllerState,

    /// Scheduled runs coming due within this window are suppressed
    ///
    /// Set when a run is skipped: the window closes one full interval after
    /// the skipped run, measured from the hand-off.
    #[serde(default, with = "option_duration_millis")]
    pub skip_window: Option<Duration>,

    /// Job creation failed; wait the fallback interval before the next try
    #[serde(default)]
    pub retry_after_failure: bool,
}

/// Startup input of a manager incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionManagerInput {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub carried: Option<CarriedState>,
}

impl ConnectionManagerInput {
    /// Fresh start for a connection
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            carried: None,
        }
    }

    /// Resume from state carried forward by a previous incarnation
    pub fn with_carried(mut self, carried: CarriedState) -> Self {
        self.carried = Some(carried);
        self
    }
}

/// Why a manager stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerExit {
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitPlan {
    /// Regular schedule; elapsing starts a sync unless the run is skipped
    Scheduled { interval: Option<Duration> },

    /// Scheduling suspended or unknown; recompute when elapsed
    Recheck,

    /// Job creation failed; signalled runs wait for this to elapse
    Backoff,
}

#[derive(Debug, Clone, Copy)]
struct ArmedWait {
    deadline: Instant,
    plan: WaitPlan,
}

impl ArmedWait {
    fn after(wait: Duration, plan: WaitPlan) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(wait)
            .unwrap_or_else(|| now + crate::schedule::SUSPENDED_WAIT);
        Self { deadline, plan }
    }
}

/// Per-connection controller
pub struct ConnectionManagerWorkflow {
    connection_id: ConnectionId,
    state: ControllerState,
    skip_until: Option<Instant>,
    retry_after_failure: bool,
    armed: Option<ArmedWait>,
    cycles: u32,
    deps: ManagerDeps,
    scheduler: Scheduler,
}

impl ConnectionManagerWorkflow {
    pub fn new(input: ConnectionManagerInput, deps: ManagerDeps) -> Self {
        let carried = input.carried.unwrap_or_default();
        let scheduler = Scheduler::new(
            deps.activities.clone(),
            deps.config.activity_retry.clone(),
        );
        Self {
            connection_id: input.connection_id,
            state: carried.state,
            skip_until: carried
                .skip_window
                .and_then(|window| Instant::now().checked_add(window)),
            retry_after_failure: carried.retry_after_failure,
            armed: None,
            cycles: 0,
            deps,
            scheduler,
        }
    }

    fn backing_off(&self) -> bool {
        matches!(
            self.armed,
            Some(ArmedWait {
                plan: WaitPlan::Backoff,
                ..
            })
        )
    }

    fn carry(&self) -> ConnectionManagerInput {
        ConnectionManagerInput::new(self.connection_id).with_carried(CarriedState {
            state: self.state,
            skip_window: self
                .skip_until
                .map(|until| until.saturating_duration_since(Instant::now()))
                .filter(|window| !window.is_zero()),
            retry_after_failure: self.retry_after_failure || self.backing_off(),
        })
    }

    /// Apply every queued signal and publish the result
    fn checkpoint(&mut self, ctx: &mut ManagerContext) {
        for signal in ctx.drain_signals() {
            apply_signal(&mut self.state, self.connection_id, signal);
        }
        ctx.publish(self.state.query());
    }

    fn terminate(&mut self, ctx: &mut ManagerContext) -> WorkflowResult<Self> {
        self.state.mark_terminated();
        ctx.publish(self.state.query());
        info!(connection_id = %self.connection_id, "connection deleted, manager terminated");
        Ok(WorkflowOutcome::Completed(ManagerExit::Deleted))
    }

    /// Close out a job left behind by an incarnation that stopped mid-run
    async fn recover(&mut self) {
        let abandoned = self.state.job();
        if !self.state.recover() {
            return;
        }
        warn!(
            connection_id = %self.connection_id,
            job_id = abandoned.job_id,
            "previous incarnation stopped mid-run, abandoning the run"
        );
        if abandoned.job_id >= 0 {
            let jobs = self.deps.jobs.as_ref();
            let job_id = abandoned.job_id;
            report(&self.deps.config.activity_retry, "job_cancelled", move || {
                jobs.job_cancelled(job_id, "abandoned by previous incarnation".to_string())
            })
            .await;
        }
    }

    /// Wait for the schedule or a signal
    ///
    /// Returns the kind of run to start, or `None` if the loop should go
    /// around again (a signal arrived, or a non-run wait elapsed).
    async fn wait_for_trigger(&mut self, ctx: &mut ManagerContext) -> Option<RunKind> {
        let armed = match self.armed {
            Some(armed) => armed,
            None => {
                let armed = self.arm().await;
                self.armed = Some(armed);
                armed
            }
        };

        match ctx.sleep_until_or_signal(armed.deadline).await {
            Wake::Signal(signal) => {
                apply_signal(&mut self.state, self.connection_id, signal);
                ctx.publish(self.state.query());
                None
            }
            Wake::Elapsed => {
                self.armed = None;
                match armed.plan {
                    WaitPlan::Recheck | WaitPlan::Backoff => None,
                    WaitPlan::Scheduled { interval } if self.state.intents.skip_next_scheduling => {
                        self.state.intents.skip_next_scheduling = false;
                        self.skip_until = interval.and_then(|i| armed.deadline.checked_add(i));
                        ctx.publish(self.state.query());
                        info!(connection_id = %self.connection_id, "skipping scheduled run");
                        None
                    }
                    WaitPlan::Scheduled { .. } => {
                        self.skip_until = None;
                        Some(RunKind::Sync)
                    }
                }
            }
        }
    }

    /// Ask the scheduler for the next wait
    ///
    /// A regular wait never ends before the window of a skipped run closes.
    async fn arm(&mut self) -> ArmedWait {
        let fallback = self.deps.config.schedule_retry_interval;
        match self.scheduler.compute_wait_time(self.connection_id).await {
            Ok(decision) if decision.is_suspended() => {
                info!(
                    connection_id = %self.connection_id,
                    reason = ?decision.reason,
                    "scheduling suspended"
                );
                ArmedWait::after(decision.time_to_wait, WaitPlan::Recheck)
            }
            Ok(decision) => {
                let mut wait = decision.time_to_wait;
                if let Some(until) = self.skip_until {
                    let remaining = until.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.skip_until = None;
                    }
                    wait = wait.max(remaining);
                }
                debug!(
                    connection_id = %self.connection_id,
                    wait_ms = saturating_millis(wait),
                    "next run scheduled"
                );
                ArmedWait::after(
                    wait,
                    WaitPlan::Scheduled {
                        interval: decision.interval,
                    },
                )
            }
            Err(error) => {
                warn!(
                    connection_id = %self.connection_id,
                    error = %error,
                    fallback_ms = saturating_millis(fallback),
                    "could not compute time to wait, retrying after fallback interval"
                );
                ArmedWait::after(fallback, WaitPlan::Recheck)
            }
        }
    }

    /// Create a job and drive its attempts until it succeeds, fails or is
    /// interrupted
    async fn run_job(&mut self, ctx: &mut ManagerContext, kind: RunKind) {
        self.armed = None;
        let deps = self.deps.clone();
        let retry = &deps.config.activity_retry;
        let connection_id = self.connection_id;
        let jobs = deps.jobs.as_ref();

        let job_id = match retry
            .execute("create_job", move || jobs.create_job(connection_id, kind))
            .await
        {
            Ok(job_id) => job_id,
            Err(error) => {
                warn!(
                    %connection_id,
                    ?kind,
                    error = %error,
                    "could not create job, retrying after fallback interval"
                );
                self.armed = Some(ArmedWait::after(
                    deps.config.schedule_retry_interval,
                    WaitPlan::Backoff,
                ));
                return;
            }
        };

        self.state.begin_run(kind, job_id);
        ctx.publish(self.state.query());
        info!(%connection_id, job_id, ?kind, "job started");

        let source_config = match fetch_source_config(&deps, connection_id).await {
            Ok(config) => config,
            Err(reason) => {
                warn!(%connection_id, job_id, %reason, "could not load source config");
                report(retry, "job_failed", move || jobs.job_failed(job_id, reason.clone())).await;
                self.state.finish_run();
                ctx.publish(self.state.query());
                return;
            }
        };

        let activities = deps.activities.as_ref();
        let max_attempt = match retry
            .execute("get_max_attempt", move || activities.get_max_attempt())
            .await
        {
            Ok(output) => output.max_attempt,
            Err(error) => {
                warn!(
                    %connection_id,
                    error = %error,
                    fallback = deps.config.default_max_attempt,
                    "could not load max attempt, using fallback"
                );
                deps.config.default_max_attempt
            }
        };
        let mut counter = AttemptCounter::new(max_attempt);

        loop {
            self.checkpoint(ctx);
            if self.is_interrupted() {
                self.finish_interrupted(ctx, &deps, job_id).await;
                return;
            }

            let attempt_number = counter.record_attempt();
            let attempt_id = match retry
                .execute("create_attempt", move || jobs.create_attempt(job_id))
                .await
            {
                Ok(attempt_id) => attempt_id,
                Err(error) => {
                    let reason = format!("could not create attempt: {error}");
                    warn!(%connection_id, job_id, %reason, "job failed");
                    report(retry, "job_failed", move || jobs.job_failed(job_id, reason.clone()))
                        .await;
                    self.state.finish_run();
                    ctx.publish(self.state.query());
                    return;
                }
            };
            self.state.set_attempt(attempt_id);
            ctx.publish(self.state.query());
            info!(
                %connection_id,
                job_id,
                attempt_id,
                attempt_number,
                max_attempt = counter.max_attempt(),
                "attempt started"
            );

            let input = SyncRunInput {
                connection_id,
                job_id,
                attempt_id,
                attempt_number,
                kind,
                source_config: source_config.clone(),
            };
            let token = CancellationToken::new();
            let attempt_ctx = ActivityContext::new(
                ctx.instance_id(),
                format!("sync-{job_id}-{attempt_id}"),
                attempt_number,
                counter.max_attempt(),
            )
            .with_cancellation(token.clone());

            let runner = deps.runner.as_ref();
            let publisher = ctx.publisher();
            let state = &mut self.state;
            let outcome = ctx
                .run_interruptible(
                    runner.run_attempt(&attempt_ctx, &input),
                    &token,
                    deps.config.cancellation_grace_period,
                    |signal| {
                        let effect = apply_signal(state, connection_id, signal);
                        publisher.publish(state.query());
                        match effect {
                            SignalEffect::Interrupt(reason) => Some(reason),
                            _ => None,
                        }
                    },
                )
                .await;

            match outcome {
                Interruptible::Completed(Ok(output)) => {
                    info!(
                        %connection_id,
                        job_id,
                        attempt_id,
                        records_synced = output.records_synced,
                        "attempt succeeded"
                    );
                    report(retry, "job_succeeded", move || {
                        jobs.job_succeeded(job_id, attempt_id)
                    })
                    .await;
                    self.state.finish_run();
                    ctx.publish(self.state.query());
                    return;
                }
                Interruptible::Completed(Err(error)) => {
                    let reason = error.to_string();
                    warn!(
                        %connection_id,
                        job_id,
                        attempt_id,
                        attempt_number,
                        retryable = error.retryable,
                        error = %reason,
                        "attempt failed"
                    );
                    let attempt_reason = reason.clone();
                    report(retry, "attempt_failed", move || {
                        jobs.attempt_failed(job_id, attempt_id, attempt_reason.clone())
                    })
                    .await;

                    if counter.is_exhausted() {
                        let reason =
                            format!("failed after {} attempts: {reason}", counter.attempts());
                        warn!(%connection_id, job_id, %reason, "job failed");
                        report(retry, "job_failed", move || jobs.job_failed(job_id, reason.clone()))
                            .await;
                        self.state.finish_run();
                        ctx.publish(self.state.query());
                        return;
                    }

                    let delay = deps.config.attempt_backoff.delay_for_attempt(attempt_number + 1);
                    self.backoff(ctx, delay).await;
                }
                Interruptible::Interrupted { reason, unwound } => {
                    if unwound.is_none() {
                        warn!(
                            %connection_id,
                            job_id,
                            attempt_id,
                            ?reason,
                            "attempt dropped after grace period"
                        );
                    } else {
                        debug!(%connection_id, job_id, attempt_id, ?reason, "attempt unwound");
                    }
                    self.finish_interrupted(ctx, &deps, job_id).await;
                    return;
                }
            }
        }
    }

    fn is_interrupted(&self) -> bool {
        matches!(
            self.state.phase,
            Phase::Cancelling { .. } | Phase::Deleting { .. }
        )
    }

    /// Sleep between attempts; a signal that interrupts the job ends it early
    async fn backoff(&mut self, ctx: &mut ManagerContext, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        debug!(
            connection_id = %self.connection_id,
            delay_ms = saturating_millis(delay),
            "backing off before next attempt"
        );
        let deadline = Instant::now() + delay;
        loop {
            match ctx.sleep_until_or_signal(deadline).await {
                Wake::Elapsed => return,
                Wake::Signal(signal) => {
                    let effect = apply_signal(&mut self.state, self.connection_id, signal);
                    ctx.publish(self.state.query());
                    if matches!(effect, SignalEffect::Interrupt(_)) {
                        return;
                    }
                }
            }
        }
    }

    /// Record the interrupted job as cancelled and leave the run
    async fn finish_interrupted(
        &mut self,
        ctx: &mut ManagerContext,
        deps: &ManagerDeps,
        job_id: i64,
    ) {
        let reason = match self.state.phase {
            Phase::Cancelling { reason, .. } => reason.describe(),
            Phase::Deleting { .. } => "connection deleted",
            _ => "cancelled",
        };
        let jobs = deps.jobs.as_ref();
        report(&deps.config.activity_retry, "job_cancelled", move || {
            jobs.job_cancelled(job_id, reason.to_string())
        })
        .await;
        info!(connection_id = %self.connection_id, job_id, reason, "job cancelled");

        self.state.finish_run();
        ctx.publish(self.state.query());
    }
}

#[async_trait]
impl Workflow for ConnectionManagerWorkflow {
    const TYPE: &'static str = "connection_manager";
    type Input = ConnectionManagerInput;
    type Signal = ConnectionSignal;
    type Query = ConnectionManagerQuery;
    type Output = ManagerExit;

    fn query(&self) -> ConnectionManagerQuery {
        self.state.query()
    }

    async fn run(&mut self, ctx: &mut ManagerContext) -> WorkflowResult<Self> {
        self.recover().await;
        if self.state.phase == Phase::Terminated {
            return self.terminate(ctx);
        }
        if self.retry_after_failure {
            self.retry_after_failure = false;
            self.armed = Some(ArmedWait::after(
                self.deps.config.schedule_retry_interval,
                WaitPlan::Backoff,
            ));
        }

        info!(
            connection_id = %self.connection_id,
            incarnation = ctx.incarnation(),
            "connection manager running"
        );

        loop {
            self.checkpoint(ctx);

            if self.state.is_deleted() {
                return self.terminate(ctx);
            }
            if self.state.intents.config_updated {
                self.state.intents.config_updated = false;
                info!(connection_id = %self.connection_id, "connection updated, reloading");
                return Ok(WorkflowOutcome::ContinueAsNew(self.carry()));
            }
            if self.cycles >= self.deps.config.cycles_before_handoff {
                debug!(
                    connection_id = %self.connection_id,
                    cycles = self.cycles,
                    "handing off to a new incarnation"
                );
                return Ok(WorkflowOutcome::ContinueAsNew(self.carry()));
            }

            let trigger = match self.state.next_trigger() {
                Some(kind) if !self.backing_off() => Some(kind),
                _ => self.wait_for_trigger(ctx).await,
            };

            if let Some(kind) = trigger {
                self.run_job(ctx, kind).await;
            }
            self.cycles += 1;
        }
    }
}

/// Apply one signal to the state, logging the effect
fn apply_signal(
    state: &mut ControllerState,
    connection_id: ConnectionId,
    signal: ConnectionSignal,
) -> SignalEffect {
    let effect = state.apply(signal);
    match effect {
        SignalEffect::Ignored => debug!(
            %connection_id,
            signal = signal.name(),
            phase = ?state.manager_phase(),
            "signal ignored"
        ),
        effect => info!(
            %connection_id,
            signal = signal.name(),
            ?effect,
            phase = ?state.manager_phase(),
            "signal applied"
        ),
    }
    effect
}

/// Resolve the source configuration passed to every attempt of a job
async fn fetch_source_config(
    deps: &ManagerDeps,
    connection_id: ConnectionId,
) -> Result<serde_json::Value, String> {
    let retry = &deps.config.activity_retry;
    let activities = deps.activities.as_ref();

    let source_id = retry
        .execute("get_source_id", move || activities.get_source_id(connection_id))
        .await
        .map_err(|e| format!("could not resolve source: {e}"))?
        .ok_or_else(|| "connection has no source".to_string())?;

    retry
        .execute("get_source_config", move || activities.get_source_config(source_id))
        .await
        .map_err(|e| format!("could not load source config: {e}"))
}

/// Job bookkeeping call whose failure must not stop the manager
async fn report<F, Fut>(retry: &RetryPolicy, activity: &'static str, op: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ActivityError>>,
{
    if let Err(error) = retry.execute(activity, op).await {
        warn!(activity, error = %error, "job bookkeeping failed, continuing");
    }
}
