//! The on-demand metrics service and its client.
//!
//! Counts are answered synchronously from the in-memory expression store.
//! Every other metric is looked up in the feature tables; missing specimens
//! are enqueued for the workers and reported as pending.

pub mod client;
pub mod config;
pub mod protocol;
pub mod response;
pub mod service;

pub use client::MetricsClient;
pub use config::OndemandConfig;
pub use protocol::Request;
pub use response::{ChannelCount, CountsResponse, ErrorResponse, MetricsResponse, StudyStatus};
pub use service::{OndemandService, ServiceDeps};
