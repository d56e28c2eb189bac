use super::*;

/// The worker loop.
///
/// Workers consume entries while the pool is `Running`, drain the backlog
/// without blocking while it is `Draining`, and exit as soon as they observe
/// `Stopping` or a tripped pool token. The last worker out marks the pool
/// `Terminated` and fires the `terminated` hook.
pub(super) async fn run<I>(shared: Arc<Shared<I>>, worker: usize)
where
    I: std::fmt::Debug,
{
    trace!(worker, "Worker started");

    let mut lifecycle = shared.lifecycle.subscribe();
    loop {
        let state = *lifecycle.borrow_and_update();
        match state {
            Lifecycle::Running => {
                tokio::select! {
                    r = shared.queue.take(Some(&shared.cancel_token)) => match r {
                        Ok(entry) => execute(&shared, entry).await,
                        // The pool token only trips for abrupt shutdown
                        Err(_) => break,
                    },
                    _ = lifecycle.changed() => {}
                }
            }
            Lifecycle::Draining => match shared.queue.try_take() {
                Ok(entry) => execute(&shared, entry).await,
                Err(_) => break,
            },
            Lifecycle::Stopping | Lifecycle::Terminated => break,
        }
    }

    trace!(worker, "Worker exiting");

    if shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        let hook = shared
            .terminated
            .lock()
            .trace_expect("Failed to lock mutex")
            .take();
        if let Some(hook) = hook {
            hook();
        }
        shared
            .lifecycle
            .send_modify(|state| *state = Lifecycle::Terminated);
    }
}

async fn execute<I>(shared: &Shared<I>, entry: Entry<I>)
where
    I: std::fmt::Debug,
{
    let Entry {
        identity,
        token,
        cancel_requested,
        run,
    } = entry;

    if cancel_requested.load(Ordering::Acquire) || token.is_tripped() {
        // Cancelled before it started; dropping the body resolves the
        // handle as cancelled
        trace!(task = ?identity, "Discarding cancelled task");
        metrics::counter!("executor_tasks_skipped").increment(1);
        return;
    }

    if let Some(before) = &shared.before_execute {
        if let Err(error) = before(&identity) {
            warn!(task = ?identity, %error, "before_execute hook failed, skipping task");
            return;
        }
    }

    trace!(task = ?identity, "Executing task");
    let outcome = run().await;

    if let Some(after) = &shared.after_execute {
        after(&identity, outcome);
    }

    match outcome {
        TaskOutcome::Ok => metrics::counter!("executor_tasks_completed").increment(1),
        TaskOutcome::Cancelled => metrics::counter!("executor_tasks_cancelled").increment(1),
        TaskOutcome::Error => metrics::counter!("executor_tasks_failed").increment(1),
    }
}
