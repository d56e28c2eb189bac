//! Pool wrapper that records tasks cancelled by an abrupt shutdown.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::pool::{Config, Hooks, Lifecycle, Pool, TaskContext, TaskHandle};
use std::sync::{Arc, Mutex};
use trace_err::*;

/// A worker pool that tracks which tasks exited under an abrupt shutdown.
///
/// On each submission a finalization shim is installed around the task body:
/// when the body returns with the pool `Stopping` and the task's own token
/// tripped, the task's identity is recorded. Together with the unstarted
/// list returned by [`shutdown_now()`](TrackingPool::shutdown_now), the
/// record lets a caller reconstruct exactly which work a stop left
/// unfinished.
///
/// The record grows only from worker finalization and is readable only after
/// termination, so readers always see a stable snapshot.
pub struct TrackingPool<I> {
    inner: Pool<I>,
    cancelled_at_shutdown: Arc<Mutex<Vec<I>>>,
}

impl<I> TrackingPool<I>
where
    I: Clone + std::fmt::Debug + Send + 'static,
{
    /// Creates a tracking pool with no hooks.
    pub fn new(config: &Config) -> Self {
        Self::with_hooks(config, Hooks::default())
    }

    /// Creates a tracking pool and starts its workers.
    pub fn with_hooks(config: &Config, hooks: Hooks<I>) -> Self {
        Self {
            inner: Pool::with_hooks(config, hooks),
            cancelled_at_shutdown: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Submits a task carrying `identity`, with the tracking shim installed.
    ///
    /// See [`Pool::submit`] for the submission contract.
    pub async fn submit<F, Fut, T>(&self, identity: I, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let recorded = self.cancelled_at_shutdown.clone();
        let lifecycle = self.inner.lifecycle_watch();
        let shim_identity = identity.clone();

        self.inner
            .submit(identity, move |ctx| {
                let body = task(ctx.clone());
                async move {
                    let result = body.await;
                    // Record only a body that exited under an abrupt
                    // shutdown it had a chance to observe
                    if *lifecycle.borrow() == Lifecycle::Stopping && ctx.is_cancelled() {
                        recorded
                            .lock()
                            .trace_expect("Failed to lock mutex")
                            .push(shim_identity);
                    }
                    result
                }
            })
            .await
    }

    /// Identities of tasks whose bodies exited with the pool stopping and
    /// their own cancellation tripped.
    ///
    /// Fails with [`Error::IllegalState`] unless the pool is
    /// [`Lifecycle::Terminated`], so the returned snapshot is final.
    pub fn cancelled_at_shutdown(&self) -> Result<Vec<I>> {
        if self.inner.lifecycle() != Lifecycle::Terminated {
            return Err(Error::IllegalState(
                "cancelled-at-shutdown set read before the pool terminated",
            ));
        }
        Ok(self
            .cancelled_at_shutdown
            .lock()
            .trace_expect("Failed to lock mutex")
            .clone())
    }

    /// See [`Pool::shutdown_graceful`].
    pub async fn shutdown_graceful(&self) {
        self.inner.shutdown_graceful().await
    }

    /// See [`Pool::shutdown_now`].
    pub async fn shutdown_now(&self) -> Vec<I> {
        self.inner.shutdown_now().await
    }

    /// See [`Pool::await_termination`].
    pub async fn await_termination(&self, timeout: Option<std::time::Duration>) -> bool {
        self.inner.await_termination(timeout).await
    }

    /// The pool's current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    /// Returns `true` while an abrupt shutdown is in progress.
    pub fn is_stopping(&self) -> bool {
        self.inner.is_stopping()
    }

    /// The pool-wide cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        self.inner.cancel_token()
    }
}

impl<I> std::fmt::Debug for TrackingPool<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingPool")
            .field("inner", &self.inner)
            .finish()
    }
}
