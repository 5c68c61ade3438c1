//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for long-lived, signal-driven workflows
//! - [`WorkflowContext`] handed to each incarnation (mailbox, timers, queries)
//! - [`WorkflowOutcome`] for completion or continue-as-new
//! - [`WorkflowSignal`] envelope for external communication

mod context;
mod definition;
mod signal;

pub use context::{Interruptible, QueryPublisher, Wake, WorkflowContext};
pub use definition::{Workflow, WorkflowError, WorkflowOutcome, WorkflowResult};
pub use signal::WorkflowSignal;
