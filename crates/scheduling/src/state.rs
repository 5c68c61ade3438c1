//! Connection manager state model
//!
//! Internally the manager tracks a single [`Phase`] plus a record of
//! [`PendingIntents`]. The flag view operators see ([`WorkflowState`]) is
//! derived from those two, so combinations such as "running and deleted"
//! cannot be represented.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signals::ConnectionSignal;

/// Job id reported while no job is running
pub const NON_RUNNING_JOB_ID: i64 = -1;

/// Attempt id reported while no attempt is running
pub const NON_RUNNING_ATTEMPT_ID: i32 = -1;

/// Identifier of a replication connection
///
/// This is the partition key of the manager: exactly one live manager
/// instance exists per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new, time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Runtime instance id of this connection's manager
    pub fn instance_id(&self) -> String {
        format!("connection_manager_{}", self.0)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job and attempt currently run by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInformation {
    pub job_id: i64,
    pub attempt_id: i32,
}

impl JobInformation {
    /// Sentinel reported while idle
    pub const IDLE: Self = Self {
        job_id: NON_RUNNING_JOB_ID,
        attempt_id: NON_RUNNING_ATTEMPT_ID,
    };

    pub fn new(job_id: i64, attempt_id: i32) -> Self {
        Self { job_id, attempt_id }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::IDLE
    }
}

impl Default for JobInformation {
    fn default() -> Self {
        Self::IDLE
    }
}

/// Operator-facing flag view of a manager
///
/// `deleted` is permanent and forces every other flag to false; `running`
/// and `deleted` are never both set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub running: bool,
    pub cancelled: bool,
    pub deleted: bool,
    pub updated: bool,
    pub reset_requested: bool,
    pub skip_next_scheduling: bool,
}

/// What a run does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Regular incremental sync
    Sync,

    /// Clear destination state, then resync
    Reset,
}

/// Why a running job is being cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// `cancelJob`
    Operator,

    /// A reset was requested while a regular sync was running
    Reset,
}

impl CancelReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Operator => "cancelled by operator",
            Self::Reset => "cancelled for reset",
        }
    }
}

/// Internal lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    /// Idle until the schedule elapses or a signal asks for a run
    Waiting,

    /// An attempt of `job` is (or is about to be) in flight
    Running { job: JobInformation, kind: RunKind },

    /// The in-flight attempt is being interrupted; the job will be cancelled
    Cancelling {
        job: JobInformation,
        kind: RunKind,
        reason: CancelReason,
    },

    /// The connection was deleted; in-flight work is being interrupted
    Deleting { job: JobInformation },

    /// Permanently stopped
    Terminated,
}

/// Requests recorded by signals and consumed by the control loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingIntents {
    pub manual_sync: bool,
    pub reset: bool,
    pub skip_next_scheduling: bool,
    pub config_updated: bool,
}

/// Coarse phase reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerPhase {
    Waiting,
    Running,
    Cancelling,
    Resetting,
    Deleting,
    Terminated,
}

/// Why a signal interrupts the in-flight attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Cancel,
    Reset,
    Delete,
}

/// Result of applying a signal to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEffect {
    /// The signal is a no-op in the current phase
    Ignored,

    /// The signal was recorded and takes effect at a later checkpoint
    Recorded,

    /// The in-flight attempt must be interrupted
    Interrupt(InterruptReason),
}

/// Snapshot served to queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionManagerQuery {
    pub state: WorkflowState,
    pub job: JobInformation,
    pub phase: ManagerPhase,
}

impl Default for ConnectionManagerQuery {
    fn default() -> Self {
        ControllerState::default().query()
    }
}

/// Full controller state carried across hand-offs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub phase: Phase,
    #[serde(default)]
    pub intents: PendingIntents,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            phase: Phase::Waiting,
            intents: PendingIntents::default(),
        }
    }
}

impl ControllerState {
    /// Apply an operator signal
    pub fn apply(&mut self, signal: ConnectionSignal) -> SignalEffect {
        if matches!(self.phase, Phase::Deleting { .. } | Phase::Terminated) {
            return SignalEffect::Ignored;
        }

        match signal {
            ConnectionSignal::DeleteConnection => {
                self.intents = PendingIntents::default();
                let interrupt = self.is_running();
                self.phase = Phase::Deleting { job: self.job() };
                if interrupt {
                    SignalEffect::Interrupt(InterruptReason::Delete)
                } else {
                    SignalEffect::Recorded
                }
            }
            ConnectionSignal::SubmitManualSync => match self.phase {
                Phase::Waiting => {
                    self.intents.manual_sync = true;
                    SignalEffect::Recorded
                }
                _ => SignalEffect::Ignored,
            },
            ConnectionSignal::CancelJob => match self.phase {
                Phase::Running { job, kind } => {
                    self.phase = Phase::Cancelling {
                        job,
                        kind,
                        reason: CancelReason::Operator,
                    };
                    SignalEffect::Interrupt(InterruptReason::Cancel)
                }
                _ => SignalEffect::Ignored,
            },
            ConnectionSignal::ConnectionUpdated => {
                self.intents.config_updated = true;
                SignalEffect::Recorded
            }
            ConnectionSignal::ResetConnection {
                skip_next_scheduling,
            } => {
                if skip_next_scheduling {
                    self.intents.skip_next_scheduling = true;
                }
                match self.phase {
                    Phase::Running {
                        job,
                        kind: RunKind::Sync,
                    } => {
                        self.intents.reset = true;
                        self.phase = Phase::Cancelling {
                            job,
                            kind: RunKind::Sync,
                            reason: CancelReason::Reset,
                        };
                        SignalEffect::Interrupt(InterruptReason::Reset)
                    }
                    // coalesces with the reset already running
                    Phase::Running {
                        kind: RunKind::Reset,
                        ..
                    } => SignalEffect::Recorded,
                    _ => {
                        self.intents.reset = true;
                        SignalEffect::Recorded
                    }
                }
            }
        }
    }

    /// Derived operator flag view
    pub fn workflow_state(&self) -> WorkflowState {
        match self.phase {
            Phase::Deleting { .. } | Phase::Terminated => WorkflowState {
                deleted: true,
                ..WorkflowState::default()
            },
            phase => {
                let (running, cancelled, run_kind) = match phase {
                    Phase::Running { kind, .. } => (true, false, Some(kind)),
                    Phase::Cancelling { kind, .. } => (true, true, Some(kind)),
                    _ => (false, false, None),
                };
                WorkflowState {
                    running,
                    cancelled,
                    deleted: false,
                    updated: self.intents.config_updated,
                    reset_requested: self.intents.reset || run_kind == Some(RunKind::Reset),
                    skip_next_scheduling: self.intents.skip_next_scheduling,
                }
            }
        }
    }

    /// Current job, or the idle sentinel
    pub fn job(&self) -> JobInformation {
        match self.phase {
            Phase::Running { job, .. }
            | Phase::Cancelling { job, .. }
            | Phase::Deleting { job } => job,
            Phase::Waiting | Phase::Terminated => JobInformation::IDLE,
        }
    }

    pub fn manager_phase(&self) -> ManagerPhase {
        match self.phase {
            Phase::Waiting => ManagerPhase::Waiting,
            Phase::Running {
                kind: RunKind::Sync,
                ..
            } => ManagerPhase::Running,
            Phase::Running {
                kind: RunKind::Reset,
                ..
            } => ManagerPhase::Resetting,
            Phase::Cancelling { .. } => ManagerPhase::Cancelling,
            Phase::Deleting { .. } => ManagerPhase::Deleting,
            Phase::Terminated => ManagerPhase::Terminated,
        }
    }

    pub fn query(&self) -> ConnectionManagerQuery {
        ConnectionManagerQuery {
            state: self.workflow_state(),
            job: self.job(),
            phase: self.manager_phase(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. } | Phase::Cancelling { .. })
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.phase, Phase::Deleting { .. } | Phase::Terminated)
    }

    /// Run requested by a signal, reset first
    pub fn next_trigger(&self) -> Option<RunKind> {
        if self.phase != Phase::Waiting {
            return None;
        }
        if self.intents.reset {
            Some(RunKind::Reset)
        } else if self.intents.manual_sync {
            Some(RunKind::Sync)
        } else {
            None
        }
    }

    /// Enter `Running` for a freshly created job, consuming its intent
    pub fn begin_run(&mut self, kind: RunKind, job_id: i64) {
        match kind {
            RunKind::Reset => self.intents.reset = false,
            RunKind::Sync => self.intents.manual_sync = false,
        }
        self.phase = Phase::Running {
            job: JobInformation::new(job_id, NON_RUNNING_ATTEMPT_ID),
            kind,
        };
    }

    /// Record the attempt now in flight
    pub fn set_attempt(&mut self, attempt_id: i32) {
        if let Phase::Running { job, .. } = &mut self.phase {
            job.attempt_id = attempt_id;
        }
    }

    /// Leave the current run: back to `Waiting`, or `Terminated` if deleted
    pub fn finish_run(&mut self) {
        self.phase = match self.phase {
            Phase::Deleting { .. } | Phase::Terminated => Phase::Terminated,
            _ => Phase::Waiting,
        };
    }

    pub fn mark_terminated(&mut self) {
        self.phase = Phase::Terminated;
        self.intents = PendingIntents::default();
    }

    /// Normalize a state restored from a hand-off payload
    ///
    /// Hand-offs only happen while idle; anything else means the previous
    /// incarnation stopped mid-run, so the run is abandoned.
    pub fn recover(&mut self) -> bool {
        let recovered = match self.phase {
            Phase::Running { .. } | Phase::Cancelling { .. } => Phase::Waiting,
            Phase::Deleting { .. } => Phase::Terminated,
            phase => phase,
        };
        let changed = recovered != self.phase;
        self.phase = recovered;
        changed
    }
}

/// Attempts made for the current job, bounded by the max attempt policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounter {
    attempts: u32,
    max_attempt: u32,
}

impl AttemptCounter {
    pub fn new(max_attempt: u32) -> Self {
        Self {
            attempts: 0,
            max_attempt: max_attempt.max(1),
        }
    }

    /// Count a new attempt, returning its 1-based number
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempt(&self) -> u32 {
        self.max_attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempt
    }
}
