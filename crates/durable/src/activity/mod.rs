//! Activity abstractions
//!
//! Activities are the side-effecting calls a workflow makes. They:
//! - May fail and be retried according to a [`RetryPolicy`](crate::RetryPolicy)
//! - Report failures as [`ActivityError`], flagged retryable or not
//! - Observe cooperative cancellation through their [`ActivityContext`]

mod context;
mod error;

pub use context::ActivityContext;
pub use error::{error_types, ActivityError};
