//! Workflow execution engine
//!
//! The engine module provides the `WorkflowRuntime` which hosts long-lived
//! workflow instances, routes signals to them and serves their queries.

mod runtime;

pub use runtime::{InstanceStatus, RuntimeError, WorkflowRuntime};
