use super::*;
use thiserror::Error;

/// A specialized `Result` type for page processing.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by a [`PageProcessor`].
#[derive(Debug, Error)]
pub enum Error {
    /// The transport under the processor was closed.
    ///
    /// When the task's own cancel hook closed it, the crawl treats this as
    /// a cancellation outcome rather than a failure.
    #[error("connection closed")]
    Closed,

    /// Any other processing failure.
    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Collaborator that fetches and indexes one page.
///
/// The core performs no I/O itself: it hands each page identity to this
/// trait and feeds the returned successors back into the crawl.
#[async_trait]
pub trait PageProcessor: Send + Sync {
    /// Processes `page` and returns the newly discovered successor pages.
    ///
    /// Implementations doing blocking I/O that cannot observe the task's
    /// token directly should install a close hook via
    /// [`TaskContext::on_cancel`] and report the resulting failure as
    /// [`Error::Closed`].
    async fn process_page(&self, ctx: &TaskContext, page: &str) -> Result<Vec<PageId>>;
}
