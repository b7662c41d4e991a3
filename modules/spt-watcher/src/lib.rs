//! Watcher: follows the `queue_activity` bus to track which session holds
//! which job, presumes workers without a live session dead, deletes exhausted
//! queue rows, and announces when the last job of a feature finishes.
//!
//! The watcher never writes values and never touches a live claim. Dead
//! workers' rows are left to age out and be reclaimed by the next pop.

pub mod config;
pub mod state;
pub mod watcher;

pub use config::WatcherConfig;
pub use state::{CompletionRecord, WorkerJobs};
pub use watcher::{SweepReport, Watcher, WatcherDeps, WatcherStats};
