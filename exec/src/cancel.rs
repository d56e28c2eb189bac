//! One-shot cooperative cancellation.
//!
//! This module provides [`CancelToken`], the signal that threads every
//! blocking operation in this crate. A token is *armed* at construction and
//! moves to *tripped* exactly once; the transition is one-way and idempotent.
//!
//! # Pattern
//!
//! Code that may block observes the token at each suspension point:
//!
//! ```no_run
//! use scour_exec::CancelToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let token = CancelToken::new();
//!
//! let worker = token.clone();
//! tokio::spawn(async move {
//!     loop {
//!         if worker.is_tripped() {
//!             break;
//!         }
//!         // Work here
//!         # break;
//!     }
//! });
//!
//! token.trip();
//! # });
//! ```
//!
//! # Monotonicity
//!
//! Observing a trip never consumes it. A helper that catches a `Cancelled`
//! outcome and handles it internally leaves the token tripped, so the next
//! suspension point up the stack still observes cancellation. Code acting on
//! behalf of a task it does not own must not assume otherwise.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use trace_err::*;

type Hook = Box<dyn FnOnce() + Send>;

/// A one-shot token for cooperative cancellation.
///
/// Cloning is cheap and every clone observes the same state. Tripping wakes
/// all tasks suspended in [`cancelled()`](CancelToken::cancelled), runs any
/// registered hooks exactly once, and trips every child token.
///
/// # Key Methods
///
/// - [`trip()`](CancelToken::trip) - Signal cancellation; idempotent
/// - [`is_tripped()`](CancelToken::is_tripped) - Wait-free observation
/// - [`check()`](CancelToken::check) - Fail with `Cancelled` if tripped
/// - [`cancelled()`](CancelToken::cancelled) - Wait for the trip
/// - [`register()`](CancelToken::register) - Install a one-shot trip hook
/// - [`child_token()`](CancelToken::child_token) - Hierarchical cancellation
///
/// # Ordering
///
/// `trip()` establishes a happens-before edge to any subsequent
/// `is_tripped()` observing `true`.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tripped: AtomicBool,
    notify: tokio::sync::Notify,
    hooks: Mutex<Vec<Hook>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl CancelToken {
    /// Creates a new, armed token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation.
    ///
    /// Idempotent: only the first call has any effect. Wakes all current
    /// waiters, runs registered hooks, and trips child tokens. Hooks never
    /// run while an internal lock is held.
    pub fn trip(&self) {
        Inner::trip(&self.inner);
    }

    /// Returns `true` once the token has tripped. Wait-free.
    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// Fails with [`Error::Cancelled`] if the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_tripped() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Waits for the token to trip.
    ///
    /// Returns immediately if the token has already tripped.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);

        // Register interest before checking the flag, so a trip that lands
        // between the check and the await is not missed.
        notified.as_mut().enable();
        if self.is_tripped() {
            return;
        }
        notified.await;
    }

    /// Registers a one-shot hook to run when the token trips.
    ///
    /// If the token has already tripped the hook runs immediately, on the
    /// calling thread. Hooks run at most once and never under any lock held
    /// by the token.
    ///
    /// This is the attachment point for cancelling blocking I/O: register a
    /// hook that closes the underlying resource, and treat the resulting
    /// resource-closed failure as a cancellation outcome.
    pub fn register<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.inner.hooks.lock().trace_expect("Failed to lock mutex");
            if !self.is_tripped() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        // Already tripped; run the hook now, outside the lock
        hook();
    }

    /// Creates a child token.
    ///
    /// Tripping the parent trips the child; tripping the child leaves the
    /// parent armed. A child created from an already-tripped parent starts
    /// tripped.
    pub fn child_token(&self) -> CancelToken {
        let child = CancelToken::new();
        let parent_tripped = {
            let mut children = self
                .inner
                .children
                .lock()
                .trace_expect("Failed to lock mutex");
            if self.is_tripped() {
                true
            } else {
                // Children deregister by dropping; prune the dead ones so a
                // long-lived token does not accumulate them
                children.retain(|child| child.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                false
            }
        };
        if parent_tripped {
            child.trip();
        }
        child
    }
}

impl Inner {
    fn trip(this: &Arc<Inner>) {
        if this.tripped.swap(true, Ordering::AcqRel) {
            return;
        }

        let hooks = std::mem::take(&mut *this.hooks.lock().trace_expect("Failed to lock mutex"));
        let children =
            std::mem::take(&mut *this.children.lock().trace_expect("Failed to lock mutex"));

        for hook in hooks {
            hook();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                Inner::trip(&child);
            }
        }
        this.notify.notify_waiters();
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_trip_is_idempotent() {
        let token = CancelToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        token.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.trip();
        token.trip();
        token.trip();

        assert!(token.is_tripped());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_reports_cancelled() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        token.trip();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_register_after_trip_runs_immediately() {
        let token = CancelToken::new();
        token.trip();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        token.register(move || {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::task::yield_now().await;
        token.trip();

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_tripped() {
        let token = CancelToken::new();
        token.trip();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_parent_trips_child() {
        let parent = CancelToken::new();
        let child = parent.child_token();

        parent.trip();

        assert!(child.is_tripped());
    }

    #[tokio::test]
    async fn test_child_trip_leaves_parent_armed() {
        let parent = CancelToken::new();
        let child = parent.child_token();

        child.trip();

        assert!(child.is_tripped());
        assert!(!parent.is_tripped());
    }

    #[tokio::test]
    async fn test_child_of_tripped_parent_starts_tripped() {
        let parent = CancelToken::new();
        parent.trip();

        assert!(parent.child_token().is_tripped());
    }

    #[tokio::test]
    async fn test_child_hooks_run_on_parent_trip() {
        let parent = CancelToken::new();
        let child = parent.child_token();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        child.register(move || {
            flag.store(true, Ordering::SeqCst);
        });

        parent.trip();

        assert!(ran.load(Ordering::SeqCst));
    }

    // A helper that swallows a cancellation outcome for its own purposes
    // cannot clear the signal: the next observation still sees it.
    #[tokio::test]
    async fn test_swallowed_cancellation_is_still_observed() {
        fn helper(token: &CancelToken) -> bool {
            match token.check() {
                Err(Error::Cancelled) => true,
                _ => false,
            }
        }

        let token = CancelToken::new();
        token.trip();

        assert!(helper(&token));

        // The next suspension point still observes the trip
        token.cancelled().await;
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
