//! Durable background task queue.
//!
//! ## Components
//!
//! - `TaskQueue`: enqueueing, worker pool lifecycle and statistics
//! - `TaskHandler`: executes a decoded `TaskKind`; `EngineTaskHandler` is the
//!   production dispatch table
//! - `RetryPolicy`: exponential backoff between attempts
//!
//! Delivery is at-least-once: a task whose worker disappears is returned to
//! pending by the stale sweep and runs again.

pub(crate) mod executor;
pub mod handler;
pub mod queue;
pub mod types;

pub use handler::{EngineTaskHandler, TaskHandler};
pub use queue::TaskQueue;
pub use types::{QueueError, QueueStats, RetryPolicy, TaskError};
