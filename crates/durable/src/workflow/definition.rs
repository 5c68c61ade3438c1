//! Workflow trait definition

use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::WorkflowContext;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// How one incarnation of a workflow ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome<I, O> {
    /// The workflow finished for good
    Completed(O),

    /// Restart as a fresh incarnation seeded with this input
    ///
    /// The runtime round-trips the input through JSON before handing it to
    /// the next incarnation, so anything not serialized is lost.
    ContinueAsNew(I),
}

/// A long-lived workflow driven by the runtime
///
/// One incarnation runs `run` to completion. Between its own steps the
/// workflow drains signals from the [`WorkflowContext`], publishes a query
/// snapshot, and sleeps or runs interruptible work through the context. It
/// ends either by completing or by asking for a fresh incarnation
/// ([`WorkflowOutcome::ContinueAsNew`]), which bounds the state any single
/// incarnation accumulates.
///
/// # Example
///
/// ```ignore
/// use syncwarden_durable::prelude::*;
///
/// struct Heartbeat { beats: u32 }
///
/// #[async_trait]
/// impl Workflow for Heartbeat {
///     const TYPE: &'static str = "heartbeat";
///     type Input = u32;
///     type Signal = ();
///     type Query = u32;
///     type Output = u32;
///
///     fn query(&self) -> u32 {
///         self.beats
///     }
///
///     async fn run(&mut self, ctx: &mut WorkflowContext<(), u32>) -> WorkflowResult<Self> {
///         ctx.sleep_or_signal(Duration::from_secs(1)).await;
///         self.beats += 1;
///         Ok(WorkflowOutcome::ContinueAsNew(self.beats))
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + 'static {
    /// Unique type identifier for this workflow, used in logs
    const TYPE: &'static str;

    /// Input that seeds an incarnation (and carries state across hand-offs)
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Signals accepted by the workflow
    type Signal: fmt::Debug + Send + 'static;

    /// Snapshot served to queries
    type Query: Clone + Send + Sync + 'static;

    /// Result once the workflow completes
    type Output: Clone + fmt::Debug + Send + Sync + 'static;

    /// Current query snapshot
    ///
    /// Must be cheap and must not block; the runtime serves queries from the
    /// last snapshot the workflow published.
    fn query(&self) -> Self::Query;

    /// Run one incarnation
    async fn run(
        &mut self,
        ctx: &mut WorkflowContext<Self::Signal, Self::Query>,
    ) -> WorkflowResult<Self>;
}

/// Result of one incarnation of workflow `W`
pub type WorkflowResult<W> = Result<
    WorkflowOutcome<<W as Workflow>::Input, <W as Workflow>::Output>,
    WorkflowError,
>;
