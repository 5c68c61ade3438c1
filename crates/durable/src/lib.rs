//! # Durable Execution Substrate
//!
//! An in-process runtime for long-lived, signal-driven workflow instances.
//!
//! ## Features
//!
//! - **One instance per id**: the runtime registry rejects duplicate starts
//! - **Checkpointed signals**: signals queue in a mailbox and are observed only
//!   where the workflow drains them, sleeps, or runs interruptible work
//! - **Non-suspending queries**: queries read the latest published snapshot
//! - **Cooperative cancellation**: interrupted work gets a grace period to
//!   unwind before it is dropped
//! - **Continue-as-new**: incarnations hand off a serialized payload to bound
//!   accumulated state
//! - **Automatic retries**: configurable retry policies with exponential
//!   backoff and jitter for every activity call
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRuntime                        │
//! │  (registry of instances, signal routing, query snapshots)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ one task per instance
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowContext                        │
//! │  (mailbox, timers, interruptible work, query publisher)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Activities (wrapped in RetryPolicy)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use syncwarden_durable::prelude::*;
//!
//! let runtime = WorkflowRuntime::new(MyWorkflow::new);
//! runtime.start("instance-1", MyInput::default())?;
//! runtime.signal("instance-1", MySignal::Poke)?;
//! let snapshot = runtime.query("instance-1")?;
//! ```

pub mod activity;
pub mod engine;
pub mod reliability;
pub mod serde_duration;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityContext, ActivityError};
    pub use crate::engine::{InstanceStatus, RuntimeError, WorkflowRuntime};
    pub use crate::reliability::RetryPolicy;
    pub use crate::workflow::{
        Interruptible, QueryPublisher, Wake, Workflow, WorkflowContext, WorkflowError,
        WorkflowOutcome, WorkflowResult, WorkflowSignal,
    };
    pub use async_trait::async_trait;
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use activity::{ActivityContext, ActivityError};
pub use engine::{InstanceStatus, RuntimeError, WorkflowRuntime};
pub use reliability::RetryPolicy;
pub use workflow::{
    Interruptible, QueryPublisher, Wake, Workflow, WorkflowContext, WorkflowError,
    WorkflowOutcome, WorkflowResult, WorkflowSignal,
};
