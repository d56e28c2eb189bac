//! Resumable crawl orchestration over cancellable worker pools.
//!
//! The [`Crawler`] owns a tracking pool per run and a *pending* set of pages
//! awaiting a crawl. Crawl tasks hand each page to an injected
//! [`processor::PageProcessor`] collaborator and fan the discovered
//! successors back into the pool, deduplicating through a *seen* set.
//!
//! Stopping the crawl shuts the pool down abruptly and folds everything that
//! did not complete - queued-but-unstarted pages and pages cancelled
//! mid-flight - back into the pending set. A later [`Crawler::start`]
//! resumes exactly where the crawl left off: no page that was dispatched and
//! did not complete is ever lost.

mod crawler;

pub mod config;
pub mod processor;

pub use crawler::{Crawler, Error, Result};

// Re-export for consistency
pub use scour_exec::async_trait;

use scour_exec::TrackingPool;
use scour_exec::pool::TaskContext;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use trace_err::*;
use tracing::{debug, trace, warn};

/// Identity of a page awaiting or undergoing a crawl.
pub type PageId = Arc<str>;
