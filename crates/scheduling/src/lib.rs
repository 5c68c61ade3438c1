//! # Connection Scheduling
//!
//! One long-lived [`ConnectionManagerWorkflow`] per connection, hosted on the
//! `syncwarden-durable` runtime. A manager decides when the connection's next
//! sync job runs, drives the job's attempts up to the max attempt policy, and
//! reacts to operator signals:
//!
//! - `submitManualSync`: run now if idle
//! - `cancelJob`: cancel the running job
//! - `deleteConnection`: cancel any running job and stop for good
//! - `connectionUpdated`: reload configuration at the next idle point
//! - `resetConnection`: run a reset, optionally skipping the next scheduled run
//!
//! Queries ([`ConnectionManagerService::get_state`],
//! [`ConnectionManagerService::get_job_information`]) are answered from the
//! manager's last published snapshot and never wait on it.

pub mod activities;
pub mod config;
pub mod manager;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod signals;
pub mod state;

pub use activities::{
    ConfigFetchActivities, ConnectionStatus, JobTracker, SyncRunInput, SyncRunOutput, SyncRunner,
};
pub use config::{ConfigError, ManagerConfig};
pub use manager::{
    CarriedState, ConnectionManagerInput, ConnectionManagerWorkflow, ManagerDeps, ManagerExit,
};
pub use schedule::{Clock, ConnectionSchedule, SystemClock, TimeUnit, TokioClock};
pub use scheduler::{ScheduleDecision, Scheduler, SchedulerError, WaitReason};
pub use service::ConnectionManagerService;
pub use signals::ConnectionSignal;
pub use state::{
    ConnectionId, ConnectionManagerQuery, JobInformation, ManagerPhase, WorkflowState,
    NON_RUNNING_ATTEMPT_ID, NON_RUNNING_JOB_ID,
};
