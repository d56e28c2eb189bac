use super::*;

/// A handle to a submitted task.
///
/// The handle observes the task's result and carries its cancellation
/// controls. Dropping the handle detaches the task; it keeps running.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    token: CancelToken,
    done: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    taken: bool,
}

impl<T> TaskHandle<T> {
    pub(super) fn new(
        rx: oneshot::Receiver<Result<T>>,
        token: CancelToken,
        done: Arc<AtomicBool>,
        cancel_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            token,
            done,
            cancel_requested,
            taken: false,
        }
    }

    /// Waits for the task's result.
    ///
    /// With a timeout, expiry fails with [`Error::Timeout`] *and cancels the
    /// task with interrupt* so the worker slot is released; the timeout is
    /// never reported as cancellation. A task discarded before it started
    /// resolves as [`Error::Cancelled`].
    ///
    /// The result can be taken once; later calls fail with
    /// [`Error::IllegalState`].
    pub async fn wait(&mut self, timeout: Option<std::time::Duration>) -> Result<T> {
        if self.taken {
            return Err(Error::IllegalState("task result already taken"));
        }

        let result = match timeout {
            None => (&mut self.rx).await,
            Some(timeout) => {
                let received = tokio::time::timeout(timeout, &mut self.rx).await;
                match received {
                    Ok(result) => result,
                    Err(_) => {
                        // Deadline expired: release the worker slot
                        self.cancel(true);
                        return Err(Error::Timeout);
                    }
                }
            }
        };

        self.taken = true;
        match result {
            Ok(result) => result,
            // The task was discarded without running
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Requests cancellation. Idempotent.
    ///
    /// A task that has not started yet is discarded at pickup. With
    /// `interrupt`, the task's token is tripped as well, waking a running
    /// body at its current suspension point.
    pub fn cancel(&self, interrupt: bool) {
        self.cancel_requested.store(true, Ordering::Release);
        if interrupt {
            self.token.trip();
        }
    }

    /// Returns `true` once the task body has returned.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The task's own cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.token.is_tripped())
            .finish()
    }
}
