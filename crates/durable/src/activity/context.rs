//! Activity execution context

use tokio_util::sync::CancellationToken;

/// Context provided to a long-running activity (a sync attempt) during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Cooperative cancellation detection
///
/// Cancellation is cooperative: the owner cancels the token and gives the
/// activity a grace period to unwind before dropping it.
///
/// # Example
///
/// ```ignore
/// async fn run_attempt(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for batch in batches {
///         tokio::select! {
///             result = copy_batch(batch) => result?,
///             _ = ctx.cancelled() => return Err(ActivityError::cancelled()),
///         }
///     }
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Workflow instance that owns this activity
    pub instance_id: String,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context with a fresh cancellation token
    pub fn new(
        instance_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            activity_id: activity_id.into(),
            attempt,
            max_attempts,
            cancellation: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this activity
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Get a future that resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
