//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff, and the
//!   uniform wrapper ([`RetryPolicy::execute`]) applied to every activity call

mod retry;

pub use retry::RetryPolicy;
