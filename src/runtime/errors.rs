//! Runtime error types
//!
//! Memory errors live next to the allocators in [`crate::runtime::memory`];
//! everything the concurrency layer reports is defined here.

use thiserror::Error;

/// Errors reported by [`Channel`](crate::runtime::channel::Channel) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel was closed before or while sending.
    #[error("send on closed channel")]
    Closed,
}

/// Errors carried by tasks, promises and the event loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task (or its context) was cancelled.
    #[error("task cancelled")]
    Cancelled,
    /// The task body panicked.
    #[error("panic: {0}")]
    Panicked(String),
    /// The task body returned an error.
    #[error("{0}")]
    Failed(String),
    /// Scheduling on a loop that was never started.
    #[error("event loop not running")]
    NotRunning,
    /// Scheduling on a loop that stopped during submission.
    #[error("event loop stopped")]
    Stopped,
    /// A promise resolver was dropped without settling.
    #[error("promise abandoned without resolution")]
    Abandoned,
}

impl TaskError {
    /// Build a `Failed` error from any displayable value.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

impl From<ChannelError> for TaskError {
    fn from(err: ChannelError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", err))
    }
}

/// Result of a task body.
pub type TaskResult<T> = Result<T, TaskError>;

/// Error returned by a select case whose completion handler failed.
#[derive(Debug, Error)]
#[error("select case {index} failed: {source}")]
pub struct SelectError {
    /// Declaration index of the failing case.
    pub index: usize,
    /// Error produced by the case handler.
    #[source]
    pub source: anyhow::Error,
}

/// Render a panic payload into a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
