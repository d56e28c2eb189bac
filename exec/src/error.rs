use thiserror::Error;

/// A specialized `Result` type for executor operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur during executor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation observed a tripped cancellation token.
    ///
    /// Never fatal for a pool; the caller may retry or give up.
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline expired before the operation completed.
    ///
    /// Reported as a distinct outcome, never as [`Error::Cancelled`].
    #[error("deadline expired")]
    Timeout,

    /// The submission was refused because the pool is no longer accepting
    /// work.
    #[error("submission rejected: pool is shutting down")]
    Rejected,

    /// The API was used out of lifecycle order.
    ///
    /// This is a programming bug in the caller, not a recoverable outcome.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A failure raised by a task body.
    ///
    /// Surfaced through the task's handle; never terminates other tasks.
    #[error(transparent)]
    Task(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a domain failure raised by a task body.
    pub fn task(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Task(Box::new(error))
    }
}
