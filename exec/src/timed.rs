//! Run a single task against a deadline.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::pool::{Pool, TaskContext, TaskHandle};
use std::time::Duration;

/// Cancels the underlying task when dropped.
///
/// Scoped acquisition: the cancel runs on every exit path, including the
/// caller dropping the outer future mid-wait.
struct CancelOnDrop<T> {
    handle: TaskHandle<T>,
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        // Idempotent, and a no-op for a task that already completed
        self.handle.cancel(true);
    }
}

/// Submits `task` to `pool` and waits up to `timeout` for its result.
///
/// On expiry the task is cancelled with interrupt - releasing its worker
/// slot - and the call fails with [`Error::Timeout`]. An optional outer
/// `token` propagates cancellation into the task and surfaces as
/// [`Error::Cancelled`]. A failure raised by the task body is returned
/// unchanged.
///
/// The pool itself is untouched: it keeps running whatever the outcome.
pub async fn timed_run<I, F, Fut, T>(
    pool: &Pool<I>,
    identity: I,
    timeout: Duration,
    token: Option<&CancelToken>,
    task: F,
) -> Result<T>
where
    I: Clone + std::fmt::Debug + Send + 'static,
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut guard = CancelOnDrop {
        handle: pool.submit(identity, task).await?,
    };

    match token {
        None => guard.handle.wait(Some(timeout)).await,
        Some(token) => {
            token.check()?;
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                r = guard.handle.wait(Some(timeout)) => r,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Config, Lifecycle};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> Config {
        Config {
            workers: std::num::NonZeroUsize::new(1).unwrap(),
            queue_depth: std::num::NonZeroUsize::new(4).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_run_success() {
        let pool = Pool::new(&config());

        let result = timed_run(
            &pool,
            "fast",
            Duration::from_millis(200),
            None,
            |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7)
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(pool.lifecycle(), Lifecycle::Running);

        pool.shutdown_graceful().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_run_timeout_cancels_task() {
        let pool = Pool::new(&config());
        let observed_cancel = Arc::new(AtomicBool::new(false));

        let observer = observed_cancel.clone();
        let result = timed_run(
            &pool,
            "slow",
            Duration::from_millis(100),
            None,
            move |ctx| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => Ok(0),
                    _ = ctx.cancelled() => {
                        observer.store(true, Ordering::SeqCst);
                        Err(Error::Cancelled)
                    }
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(pool.lifecycle(), Lifecycle::Running);

        // The worker slot was released: the single worker takes new work
        let mut next = pool.submit("next", |_ctx| async move { Ok(1) }).await.unwrap();
        assert_eq!(next.wait(None).await.unwrap(), 1);
        assert!(observed_cancel.load(Ordering::SeqCst));

        pool.shutdown_graceful().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_run_propagates_task_failure() {
        let pool = Pool::new(&config());

        let result: Result<()> = timed_run(
            &pool,
            "broken",
            Duration::from_millis(100),
            None,
            |_ctx| async move { Err(Error::task(std::io::Error::other("boom"))) },
        )
        .await;

        assert!(matches!(result, Err(Error::Task(_))));
        assert_eq!(pool.lifecycle(), Lifecycle::Running);

        pool.shutdown_graceful().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_run_outer_cancellation() {
        let pool = Pool::new(&config());
        let outer = CancelToken::new();

        let tripper = outer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tripper.trip();
        });

        let result: Result<()> = timed_run(
            &pool,
            "outer",
            Duration::from_secs(1),
            Some(&outer),
            |ctx| async move {
                ctx.cancelled().await;
                Err(Error::Cancelled)
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));

        pool.shutdown_graceful().await;
    }
}
