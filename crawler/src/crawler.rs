use super::*;
use crate::config::Config;
use crate::processor::{self, PageProcessor};
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

/// A specialized `Result` type for crawler operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur during crawl orchestration.
#[derive(Debug, Error)]
pub enum Error {
    /// `start()` was called while a crawl is already running.
    #[error("crawler already started")]
    AlreadyRunning,

    /// `stop()` was called with no crawl running.
    #[error("crawler is not running")]
    NotRunning,

    /// A failure surfaced by the execution layer.
    #[error(transparent)]
    Exec(#[from] scour_exec::Error),
}

/// State shared into every crawl task.
///
/// Tasks borrow the pool through a weak handle: the orchestrator owns it,
/// and a task racing a released pool simply requeues its page.
#[derive(Clone)]
struct CrawlShared {
    processor: Arc<dyn PageProcessor>,
    seen: Arc<Mutex<HashSet<PageId>>>,
    pending: Arc<Mutex<HashSet<PageId>>>,
    pool: Weak<TrackingPool<PageId>>,
}

/// Orchestrates a resumable crawl over a tracking worker pool.
///
/// # State
///
/// - `pending`: pages awaiting a (re)crawl, guarded by the orchestrator
///   lock. The lock is never held across a pool or queue operation.
/// - `seen`: pages dispatched at least once, used to deduplicate discovery.
///   Check-and-insert is atomic per page.
/// - One [`TrackingPool`] per run, built by [`start()`](Crawler::start) and
///   released by [`stop()`](Crawler::stop). No process-wide executor state.
///
/// # Invariant
///
/// No page is lost across a stop/start cycle unless it successfully
/// completed: `stop()` folds the never-started and cancelled-in-flight
/// pages back into `pending`.
pub struct Crawler {
    config: Config,
    processor: Arc<dyn PageProcessor>,
    seen: Arc<Mutex<HashSet<PageId>>>,
    pending: Arc<Mutex<HashSet<PageId>>>,
    pool: Mutex<Option<Arc<TrackingPool<PageId>>>>,
}

impl Crawler {
    /// Creates a crawler seeded with `seeds`.
    pub fn new(
        config: Config,
        processor: Arc<dyn PageProcessor>,
        seeds: impl IntoIterator<Item = PageId>,
    ) -> Self {
        static METRICS_INIT: std::sync::Once = std::sync::Once::new();
        METRICS_INIT.call_once(|| {
            metrics::describe_counter!(
                "crawler_pages_crawled",
                metrics::Unit::Count,
                "Total pages processed to completion"
            );
            metrics::describe_counter!(
                "crawler_pages_discovered",
                metrics::Unit::Count,
                "Total new pages discovered and dispatched"
            );
            metrics::describe_counter!(
                "crawler_pages_failed",
                metrics::Unit::Count,
                "Total pages whose processing failed"
            );
            metrics::describe_counter!(
                "crawler_pages_requeued",
                metrics::Unit::Count,
                "Total pages folded back into the pending set"
            );
        });

        Self {
            config,
            processor,
            seen: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(Mutex::new(seeds.into_iter().collect())),
            pool: Mutex::new(None),
        }
    }

    /// Starts (or resumes) the crawl.
    ///
    /// Builds a fresh pool, submits every pending page, and clears the
    /// pending set. Pages completed in an earlier run stay deduplicated
    /// through `seen` and are not crawled again.
    pub async fn start(&self) -> Result<()> {
        let pool = {
            let mut slot = self.pool.lock().trace_expect("Failed to lock mutex");
            if slot.is_some() {
                return Err(Error::AlreadyRunning);
            }
            let pool = Arc::new(TrackingPool::new(&self.config.pool));
            *slot = Some(pool.clone());
            pool
        };

        let batch: Vec<PageId> = {
            let mut pending = self.pending.lock().trace_expect("Failed to lock mutex");
            pending.drain().collect()
        };

        let shared = CrawlShared {
            processor: self.processor.clone(),
            seen: self.seen.clone(),
            pending: self.pending.clone(),
            pool: Arc::downgrade(&pool),
        };

        debug!(pages = batch.len(), "Starting crawl");

        // Submissions happen with no orchestrator lock held
        for page in batch {
            self.seen
                .lock()
                .trace_expect("Failed to lock mutex")
                .insert(page.clone());
            submit_crawl(&pool, page, shared.clone()).await;
        }
        Ok(())
    }

    /// Stops the crawl and returns the new pending set.
    ///
    /// Shuts the pool down abruptly, waits for the workers to exit, and
    /// folds the never-started pages and the pages cancelled mid-flight
    /// back into `pending`.
    pub async fn stop(&self) -> Result<Vec<PageId>> {
        // Take the pool out under its lock; every pool call below happens
        // with no lock held
        let pool = self
            .pool
            .lock()
            .trace_expect("Failed to lock mutex")
            .take()
            .ok_or(Error::NotRunning)?;

        let unstarted = pool.shutdown_now().await;
        if !pool
            .await_termination(Some(self.config.stop_grace_period))
            .await
        {
            // Cancellation is cooperative; all we can do is keep waiting
            warn!("Crawl workers outlived the grace period, waiting for cooperative exit");
            pool.await_termination(None).await;
        }
        let cancelled = pool.cancelled_at_shutdown()?;

        debug!(
            unstarted = unstarted.len(),
            cancelled = cancelled.len(),
            "Crawl stopped"
        );
        metrics::counter!("crawler_pages_requeued")
            .increment((unstarted.len() + cancelled.len()) as u64);

        let mut pending = self.pending.lock().trace_expect("Failed to lock mutex");
        pending.extend(unstarted);
        pending.extend(cancelled);
        Ok(pending.iter().cloned().collect())
    }

    /// Pages known to the orchestrator and not yet crawled to completion.
    pub fn pending_snapshot(&self) -> Vec<PageId> {
        self.pending
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .cloned()
            .collect()
    }

    /// Returns `true` while a crawl is running.
    pub fn is_running(&self) -> bool {
        self.pool
            .lock()
            .trace_expect("Failed to lock mutex")
            .is_some()
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("running", &self.is_running())
            .field(
                "pending",
                &self.pending.lock().trace_expect("Failed to lock mutex").len(),
            )
            .finish()
    }
}

fn submit_crawl(
    pool: &TrackingPool<PageId>,
    page: PageId,
    shared: CrawlShared,
) -> BoxFuture<'_, ()> {
    async move {
        let task_page = page.clone();
        let task_shared = shared.clone();
        let submitted = pool
            .submit(
                page.clone(),
                move |ctx| -> BoxFuture<'static, scour_exec::Result<()>> {
                    crawl(ctx, task_page, task_shared).boxed()
                },
            )
            .await;

        if submitted.is_err() {
            // The pool stopped accepting work under us; keep the page
            requeue(&shared.pending, page);
        }
    }
    .boxed()
}

fn requeue(pending: &Mutex<HashSet<PageId>>, page: PageId) {
    trace!(%page, "Requeueing page");
    pending
        .lock()
        .trace_expect("Failed to lock mutex")
        .insert(page);
    metrics::counter!("crawler_pages_requeued").increment(1);
}

/// One crawl task: process the page, then fan its successors back into the
/// pool.
async fn crawl(ctx: TaskContext, page: PageId, shared: CrawlShared) -> scour_exec::Result<()> {
    let successors = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(scour_exec::Error::Cancelled),
        result = shared.processor.process_page(&ctx, &page) => match result {
            Ok(successors) => successors,
            Err(processor::Error::Closed) if ctx.is_cancelled() => {
                // The cancel hook closed the transport under the read
                return Err(scour_exec::Error::Cancelled);
            }
            Err(error) => {
                metrics::counter!("crawler_pages_failed").increment(1);
                return Err(scour_exec::Error::Task(error.into()));
            }
        },
    };

    metrics::counter!("crawler_pages_crawled").increment(1);

    for successor in successors {
        // Stop fanning out once cancellation is observed: this task is then
        // recorded for requeue, and its re-run rediscovers the rest
        if ctx.is_cancelled() {
            return Err(scour_exec::Error::Cancelled);
        }

        if !shared
            .seen
            .lock()
            .trace_expect("Failed to lock mutex")
            .insert(successor.clone())
        {
            continue;
        }
        metrics::counter!("crawler_pages_discovered").increment(1);

        let Some(pool) = shared.pool.upgrade() else {
            // The orchestrator released the pool; keep the page for the
            // next run
            requeue(&shared.pending, successor);
            continue;
        };
        submit_crawl(&pool, successor, shared.clone()).await;
    }
    Ok(())
}
