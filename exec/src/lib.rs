//! Cooperative cancellation and worker-pool primitives.
//!
//! This crate provides the execution layer for the scour crawler:
//!
//! - **[`CancelToken`]**: a one-shot cancellation signal with wait-free
//!   polling, awaitable trips, one-shot trip hooks, and hierarchical child
//!   tokens
//! - **[`Queue`]**: a cancellation-aware bounded FIFO queue
//! - **[`Pool`](pool::Pool)**: a worker pool with graceful and abrupt
//!   shutdown
//! - **[`TrackingPool`]**: a pool wrapper that records which tasks were
//!   cancelled by an abrupt shutdown
//! - **[`timed_run`](timed::timed_run)**: run a single task against a
//!   deadline
//! - **[`Pipeline`](pipeline::Pipeline)**: a poison-pill producer/consumer
//!   driver
//!
//! # Example
//!
//! ```no_run
//! use scour_exec::pool::{Config, Pool};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pool: Pool<String> = Pool::new(&Config::default());
//!
//! let mut handle = pool
//!     .submit("item-1".to_string(), |ctx| async move {
//!         ctx.check()?;
//!         Ok(42)
//!     })
//!     .await
//!     .unwrap();
//!
//! let result = handle.wait(None).await.unwrap();
//! assert_eq!(result, 42);
//!
//! pool.shutdown_graceful().await;
//! # });
//! ```

pub mod cancel;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod timed;
pub mod tracking;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use queue::Queue;
pub use tracking::TrackingPool;

// Re-export for consistency
pub use async_trait::async_trait;
