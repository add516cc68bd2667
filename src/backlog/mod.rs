//! Backlog resolution and batch scheduling.
//!
//! A backlog is a declarative list of device, session and file references.
//! It is expanded into concrete raw log files, deduplicated, and split into
//! bounded batches that can be decoded independently.

pub mod config;
pub mod dedup;
pub mod processor;
pub mod resolver;
pub mod scheduler;

pub use config::{BacklogFile, BatchSize};
pub use processor::{BacklogProcessor, BacklogReport, load_backlog, plan};
pub use resolver::{BacklogEntry, PathResolver, ResolvedFile};
pub use scheduler::{Batch, BatchScheduler};
