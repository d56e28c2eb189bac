//! Worker pool with graceful and abrupt shutdown.
//!
//! This module provides [`Pool`], which encapsulates the pattern of:
//! - A fixed set of workers consuming submitted tasks from a bounded queue
//! - Per-task cancellation layered under a pool-wide cancellation token
//! - Graceful shutdown that drains queued work, and abrupt shutdown that
//!   hands queued work back
//!
//! # Lifecycle
//!
//! A pool moves through [`Lifecycle`] states exactly once:
//!
//! 1. **Running**: submissions are accepted and executed
//! 2. **Draining** (graceful) or **Stopping** (abrupt): submissions are
//!    rejected; draining runs the backlog to completion, stopping trips the
//!    pool token and returns the backlog unexecuted
//! 3. **Terminated**: every worker has exited
//!
//! # Hazard
//!
//! A task that waits on the result of another task submitted to the *same*
//! pool can deadlock once all workers are occupied by such waiters
//! (thread-starvation deadlock). The pool does not attempt to detect this;
//! do not block a worker on work the same pool has yet to start.

mod handle;
mod worker;

pub use handle::TaskHandle;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::queue::Queue;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot, watch};
use tokio_util::task::TaskTracker;
use trace_err::*;
use tracing::{error, trace, warn};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers.
    #[cfg_attr(feature = "serde", serde(default = "default_workers"))]
    pub workers: std::num::NonZeroUsize,

    /// Capacity of the submission queue.
    #[cfg_attr(feature = "serde", serde(default = "default_queue_depth"))]
    pub queue_depth: std::num::NonZeroUsize,
}

fn default_workers() -> std::num::NonZeroUsize {
    std::num::NonZeroUsize::new(
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
            * 4,
    )
    .unwrap()
}

fn default_queue_depth() -> std::num::NonZeroUsize {
    std::num::NonZeroUsize::new(16).unwrap()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Pool lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting and executing submissions.
    Running,
    /// Graceful shutdown: no new submissions, the backlog runs to
    /// completion.
    Draining,
    /// Abrupt shutdown: no new submissions, the pool token is tripped and
    /// the backlog is handed back unexecuted.
    Stopping,
    /// Every worker has exited.
    Terminated,
}

/// Tagged outcome of a task body, as seen by the `after_execute` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The body returned a value.
    Ok,
    /// The body returned [`Error::Cancelled`].
    Cancelled,
    /// The body returned any other error.
    Error,
}

/// Optional worker callbacks, supplied at construction.
///
/// Expressed as a capability set rather than inheritance: each hook runs in
/// the worker's context. A hook that observes a cancellation signal but does
/// not act on it must leave the signal in place (tokens are monotonic, so
/// this holds by construction).
pub struct Hooks<I> {
    /// Runs before the task body. Failure skips the body *and*
    /// `after_execute`; other tasks are unaffected.
    pub before_execute: Option<Box<dyn Fn(&I) -> Result<()> + Send + Sync>>,

    /// Runs after the task body with its tagged outcome.
    pub after_execute: Option<Box<dyn Fn(&I, TaskOutcome) + Send + Sync>>,

    /// Runs exactly once, when the pool reaches [`Lifecycle::Terminated`].
    pub terminated: Option<Box<dyn FnOnce() + Send>>,
}

impl<I> Default for Hooks<I> {
    fn default() -> Self {
        Self {
            before_execute: None,
            after_execute: None,
            terminated: None,
        }
    }
}

impl<I> std::fmt::Debug for Hooks<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_execute", &self.before_execute.is_some())
            .field("after_execute", &self.after_execute.is_some())
            .field("terminated", &self.terminated.is_some())
            .finish()
    }
}

/// Handed to each task body; carries the task's own cancellation
/// observation.
///
/// The context's token is a child of the pool token: abrupt pool shutdown
/// trips it, as does [`TaskHandle::cancel`] with interrupt.
#[derive(Clone, Debug)]
pub struct TaskContext {
    token: CancelToken,
}

impl TaskContext {
    /// The task's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Wait-free cancellation poll.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_tripped()
    }

    /// Fails with [`Error::Cancelled`] if the task has been cancelled.
    pub fn check(&self) -> Result<()> {
        self.token.check()
    }

    /// Waits for the task to be cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Installs a one-shot hook that runs when the task is cancelled.
    ///
    /// For blocking I/O that cannot observe the token directly, register a
    /// hook that closes the underlying resource and treat the resulting
    /// resource-closed failure as a cancellation outcome.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.token.register(hook)
    }
}

/// One queued submission: the work-item identity plus the type-erased body.
pub(crate) struct Entry<I> {
    pub(crate) identity: I,
    pub(crate) token: CancelToken,
    pub(crate) cancel_requested: Arc<AtomicBool>,
    pub(crate) run: Box<dyn FnOnce() -> BoxFuture<'static, TaskOutcome> + Send>,
}

pub(crate) struct Shared<I> {
    pub(crate) queue: Queue<Entry<I>>,
    pub(crate) cancel_token: CancelToken,
    pub(crate) lifecycle: watch::Sender<Lifecycle>,
    accepting: AtomicBool,
    submissions_in_flight: AtomicUsize,
    submissions_settled: Notify,
    pub(crate) live_workers: AtomicUsize,
    pub(crate) before_execute: Option<Box<dyn Fn(&I) -> Result<()> + Send + Sync>>,
    pub(crate) after_execute: Option<Box<dyn Fn(&I, TaskOutcome) + Send + Sync>>,
    pub(crate) terminated: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<I> Shared<I> {
    /// Waits until no submission that observed the pool accepting is still
    /// between its admission check and its enqueue.
    async fn settle_submissions(&self) {
        loop {
            let notified = self.submissions_settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.submissions_in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct SubmitGuard<'a> {
    in_flight: &'a AtomicUsize,
    settled: &'a Notify,
}

impl<'a> SubmitGuard<'a> {
    fn new(in_flight: &'a AtomicUsize, settled: &'a Notify) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self { in_flight, settled }
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settled.notify_waiters();
        }
    }
}

/// A worker pool consuming task submissions from a bounded queue.
///
/// Shut the pool down before dropping it: a pool dropped while `Running`
/// leaves its workers parked on an empty queue.
pub struct Pool<I> {
    shared: Arc<Shared<I>>,
    tracker: TaskTracker,
}

impl<I> Pool<I>
where
    I: Clone + std::fmt::Debug + Send + 'static,
{
    /// Creates a pool with no hooks.
    pub fn new(config: &Config) -> Self {
        Self::with_hooks(config, Hooks::default())
    }

    /// Creates a pool and starts its workers.
    pub fn with_hooks(config: &Config, hooks: Hooks<I>) -> Self {
        static METRICS_INIT: std::sync::Once = std::sync::Once::new();
        METRICS_INIT.call_once(|| {
            metrics::describe_counter!(
                "executor_tasks_submitted",
                metrics::Unit::Count,
                "Total tasks accepted by worker pools"
            );
            metrics::describe_counter!(
                "executor_tasks_completed",
                metrics::Unit::Count,
                "Total tasks that ran to completion"
            );
            metrics::describe_counter!(
                "executor_tasks_cancelled",
                metrics::Unit::Count,
                "Total tasks whose bodies observed cancellation"
            );
            metrics::describe_counter!(
                "executor_tasks_failed",
                metrics::Unit::Count,
                "Total tasks that failed with an unhandled error"
            );
            metrics::describe_counter!(
                "executor_tasks_skipped",
                metrics::Unit::Count,
                "Total tasks cancelled before they started"
            );
            metrics::describe_counter!(
                "executor_tasks_unstarted",
                metrics::Unit::Count,
                "Total queued tasks handed back by abrupt shutdown"
            );
        });

        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let shared = Arc::new(Shared {
            queue: Queue::bounded(config.queue_depth.get()),
            cancel_token: CancelToken::new(),
            lifecycle,
            accepting: AtomicBool::new(true),
            submissions_in_flight: AtomicUsize::new(0),
            submissions_settled: Notify::new(),
            live_workers: AtomicUsize::new(config.workers.get()),
            before_execute: hooks.before_execute,
            after_execute: hooks.after_execute,
            terminated: Mutex::new(hooks.terminated),
        });

        let tracker = TaskTracker::new();
        for worker in 0..config.workers.get() {
            tracker.spawn(worker::run(shared.clone(), worker));
        }

        Self { shared, tracker }
    }

    /// Submits a task carrying `identity`.
    ///
    /// Waits for queue space if the submission queue is full. Fails with
    /// [`Error::Rejected`] once shutdown has begun; a submission that
    /// observed the pool running either executes, or is handed back by
    /// [`shutdown_now()`](Pool::shutdown_now), or fails with `Rejected` -
    /// it is never silently dropped.
    ///
    /// The returned [`TaskHandle`] resolves with the body's result, or with
    /// [`Error::Cancelled`] if the task was discarded before it started.
    pub async fn submit<F, Fut, T>(&self, identity: I, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = SubmitGuard::new(
            &self.shared.submissions_in_flight,
            &self.shared.submissions_settled,
        );
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::Rejected);
        }

        let token = self.shared.cancel_token.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let ctx = TaskContext {
            token: token.clone(),
        };
        let task_done = done.clone();
        let log_identity = identity.clone();
        let run: Box<dyn FnOnce() -> BoxFuture<'static, TaskOutcome> + Send> = Box::new(move || {
            async move {
                let result = task(ctx).await;
                let outcome = match &result {
                    Ok(_) => TaskOutcome::Ok,
                    Err(Error::Cancelled) => TaskOutcome::Cancelled,
                    Err(error) => {
                        error!(task = ?log_identity, %error, "Task failed with unhandled error");
                        TaskOutcome::Error
                    }
                };
                task_done.store(true, Ordering::Release);
                let _ = tx.send(result);
                outcome
            }
            .boxed()
        });

        let entry = Entry {
            identity,
            token: token.clone(),
            cancel_requested: cancel_requested.clone(),
            run,
        };

        // The pool token unblocks this put if an abrupt shutdown lands while
        // the queue is full
        self.shared
            .queue
            .put(entry, Some(&self.shared.cancel_token))
            .await
            .map_err(|_| Error::Rejected)?;

        metrics::counter!("executor_tasks_submitted").increment(1);
        Ok(TaskHandle::new(rx, token, done, cancel_requested))
    }

    /// Initiates graceful shutdown and waits for termination.
    ///
    /// New submissions are rejected, queued tasks run to completion, and
    /// the method returns once every worker has exited.
    pub async fn shutdown_graceful(&self) {
        self.shared.accepting.store(false, Ordering::Release);

        // Let submissions that already observed the pool accepting land
        // before the workers start treating an empty queue as the end
        self.shared.settle_submissions().await;

        self.shared.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Running {
                *state = Lifecycle::Draining;
                true
            } else {
                false
            }
        });

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Initiates abrupt shutdown, returning the identities of queued tasks
    /// that never started.
    ///
    /// Trips the pool token (and with it every per-task token), wakes all
    /// blocked queue operations, and drains the backlog. Currently executing
    /// tasks observe the trip at their next suspension or poll; use
    /// [`await_termination()`](Pool::await_termination) to wait for them.
    pub async fn shutdown_now(&self) -> Vec<I> {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.lifecycle.send_if_modified(|state| {
            if matches!(*state, Lifecycle::Running | Lifecycle::Draining) {
                *state = Lifecycle::Stopping;
                true
            } else {
                false
            }
        });
        self.shared.cancel_token.trip();

        // In-flight submissions either land (and are drained below) or fail
        // with Rejected once the trip wakes their blocked put
        self.shared.settle_submissions().await;
        self.tracker.close();

        let unstarted: Vec<I> = self
            .shared
            .queue
            .drain()
            .into_iter()
            .map(|entry| entry.identity)
            .collect();

        metrics::counter!("executor_tasks_unstarted").increment(unstarted.len() as u64);
        unstarted
    }

    /// Waits until the pool is terminated, or the timeout expires.
    ///
    /// Returns `true` if the pool terminated.
    pub async fn await_termination(&self, timeout: Option<std::time::Duration>) -> bool {
        let mut lifecycle = self.shared.lifecycle.subscribe();
        let terminated = lifecycle.wait_for(|state| *state == Lifecycle::Terminated);
        match timeout {
            None => {
                terminated.await.trace_expect("Pool state channel closed");
                true
            }
            Some(timeout) => match tokio::time::timeout(timeout, terminated).await {
                Ok(result) => {
                    result.trace_expect("Pool state channel closed");
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// The pool's current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.borrow()
    }

    /// Returns `true` while an abrupt shutdown is in progress.
    pub fn is_stopping(&self) -> bool {
        self.lifecycle() == Lifecycle::Stopping
    }

    /// The pool-wide cancellation token.
    ///
    /// Tasks that need to listen for abrupt shutdown can observe it, but the
    /// per-task token in [`TaskContext`] is usually the right seam.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.cancel_token
    }

    pub(crate) fn lifecycle_watch(&self) -> watch::Receiver<Lifecycle> {
        self.shared.lifecycle.subscribe()
    }
}

impl<I> std::fmt::Debug for Pool<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("lifecycle", &*self.shared.lifecycle.borrow())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config(workers: usize, queue_depth: usize) -> Config {
        Config {
            workers: std::num::NonZeroUsize::new(workers).unwrap(),
            queue_depth: std::num::NonZeroUsize::new(queue_depth).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let pool = Pool::new(&config(2, 4));

        let mut handle = pool
            .submit("a", |_ctx| async move { Ok(7) })
            .await
            .unwrap();

        assert_eq!(handle.wait(None).await.unwrap(), 7);
        assert!(handle.is_done());
        assert_eq!(pool.lifecycle(), Lifecycle::Running);

        pool.shutdown_graceful().await;
        assert_eq!(pool.lifecycle(), Lifecycle::Terminated);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = Pool::<&str>::new(&config(1, 4));
        pool.shutdown_graceful().await;

        let result = pool.submit("late", |_ctx| async move { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Rejected)));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_runs_backlog() {
        let pool = Pool::new(&config(1, 16));
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let completed = completed.clone();
            pool.submit(i, move |_ctx| async move {
                tokio::task::yield_now().await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        pool.shutdown_graceful().await;
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_shutdown_now_returns_unstarted() {
        let pool = Pool::new(&config(1, 16));

        // Occupy the only worker until cancelled
        let gate = Arc::new(tokio::sync::Notify::new());
        let entered = gate.clone();
        pool.submit("blocker", move |ctx| async move {
            entered.notify_one();
            ctx.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        })
        .await
        .unwrap();

        gate.notified().await;

        let mut queued = Vec::new();
        for name in ["b", "c", "d"] {
            queued.push(
                pool.submit(name, |_ctx| async move { Ok(()) })
                    .await
                    .unwrap(),
            );
        }

        let unstarted = pool.shutdown_now().await;
        assert_eq!(unstarted, vec!["b", "c", "d"]);

        assert!(pool.await_termination(Some(Duration::from_secs(5))).await);

        // Handles of unstarted tasks resolve as cancelled
        for mut handle in queued {
            assert!(matches!(handle.wait(None).await, Err(Error::Cancelled)));
        }
    }

    #[tokio::test]
    async fn test_task_failure_does_not_kill_worker() {
        let pool = Pool::new(&config(1, 4));

        let mut failed = pool
            .submit("bad", |_ctx| async move {
                Err::<(), _>(Error::task(std::io::Error::other("boom")))
            })
            .await
            .unwrap();
        assert!(matches!(failed.wait(None).await, Err(Error::Task(_))));

        let mut ok = pool.submit("good", |_ctx| async move { Ok(1) }).await.unwrap();
        assert_eq!(ok.wait(None).await.unwrap(), 1);

        pool.shutdown_graceful().await;
    }

    #[tokio::test]
    async fn test_hooks_run_around_task() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let hooks = Hooks::<&str> {
            before_execute: Some(Box::new({
                let before = before.clone();
                move |_identity: &&str| {
                    before.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
            after_execute: Some(Box::new({
                let after = after.clone();
                move |_identity: &&str, outcome| {
                    assert_eq!(outcome, TaskOutcome::Ok);
                    after.fetch_add(1, Ordering::SeqCst);
                }
            })),
            terminated: None,
        };

        let pool = Pool::with_hooks(&config(1, 4), hooks);
        let mut handle = pool.submit("a", |_ctx| async move { Ok(()) }).await.unwrap();
        handle.wait(None).await.unwrap();

        pool.shutdown_graceful().await;
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_before_execute_failure_skips_task_and_after_hook() {
        let ran = Arc::new(AtomicBool::new(false));
        let after = Arc::new(AtomicBool::new(false));

        let hooks = Hooks::<&str> {
            before_execute: Some(Box::new(|_identity: &&str| {
                Err(Error::IllegalState("nope"))
            })),
            after_execute: Some(Box::new({
                let after = after.clone();
                move |_identity: &&str, _outcome| {
                    after.store(true, Ordering::SeqCst);
                }
            })),
            terminated: None,
        };

        let pool = Pool::with_hooks(&config(1, 4), hooks);
        let body = ran.clone();
        let mut handle = pool
            .submit("a", move |_ctx| async move {
                body.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        // The skipped task's handle resolves as cancelled
        assert!(matches!(handle.wait(None).await, Err(Error::Cancelled)));

        pool.shutdown_graceful().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!after.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_terminated_hook_runs_once() {
        let fired = Arc::new(AtomicUsize::new(0));

        let hooks = Hooks::<&str> {
            before_execute: None,
            after_execute: None,
            terminated: Some(Box::new({
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })),
        };

        let pool = Pool::with_hooks(&config(4, 4), hooks);
        pool.shutdown_graceful().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_cancel_skips_queued_task() {
        let pool = Pool::new(&config(1, 16));

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        {
            let entered = entered.clone();
            let release = release.clone();
            pool.submit("blocker", move |_ctx| async move {
                entered.notify_one();
                release.notified().await;
                Ok(())
            })
            .await
            .unwrap();
        }
        entered.notified().await;

        let ran = Arc::new(AtomicBool::new(false));
        let body = ran.clone();
        let mut queued = pool
            .submit("queued", move |_ctx| async move {
                body.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        // Cancelled while still queued: the worker discards it on pickup
        queued.cancel(false);
        release.notify_one();

        assert!(matches!(queued.wait(None).await, Err(Error::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));

        pool.shutdown_graceful().await;
    }

    // A blocking read that cannot observe the token is cancelled through a
    // trip hook that closes the underlying resource.
    #[tokio::test]
    async fn test_cancel_hook_closes_resource() {
        let pool = Pool::new(&config(1, 4));

        let (resource_tx, resource_rx) = flume::bounded::<u32>(1);
        let resource_tx = Arc::new(Mutex::new(Some(resource_tx)));

        let mut handle = pool
            .submit("reader", move |ctx| async move {
                ctx.on_cancel({
                    let resource_tx = resource_tx.clone();
                    move || {
                        // Closing the write half fails the in-progress read
                        drop(resource_tx.lock().unwrap().take());
                    }
                });

                match resource_rx.recv_async().await {
                    Ok(value) => Ok(value),
                    Err(_) if ctx.is_cancelled() => Err(Error::Cancelled),
                    Err(_) => Err(Error::IllegalState("resource closed unexpectedly")),
                }
            })
            .await
            .unwrap();

        pool.shutdown_now().await;
        assert!(matches!(handle.wait(None).await, Err(Error::Cancelled)));
        assert!(pool.await_termination(Some(Duration::from_secs(5))).await);
    }
}
