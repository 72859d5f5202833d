//! Broker-free review task execution.
//!
//! - [`Executor`]: bounded worker pool driving tasks through
//!   `PENDING -> RUNNING -> SUCCEEDED | FAILED`
//! - [`TaskStore`]: compare-and-swap task records
//! - [`ConnectionPool`]: per-endpoint-class call limits with leak detection
//! - [`run_with_retry`]: exponential backoff with jitter
//! - [`NotificationDispatcher`]: terminal-event broadcast and channel fan-out

pub mod executor;
pub mod notify;
pub mod pool;
pub mod retry;
pub mod store;

pub use executor::{Executor, ExecutorBuilder};
pub use notify::{summarize, NotificationDispatcher};
pub use pool::{ConnectionPool, Lease};
pub use retry::{
    bounded_call, default_classifier, run_with_retry, Retried, RetryContext, RetryError, RetryPolicy,
    Retryability,
};
pub use store::{StatusCounts, TaskStore, TransitionFields};
