//! Worker: claims queued (feature, specimen) jobs, runs the metric kernel and
//! writes the value.
//!
//! A failed or timed-out job leaves its queue row in place. The claim ages out
//! and another worker retries it, up to the retry cap.

pub mod config;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::{JobOutcome, Worker, WorkerDeps, WorkerStats};
