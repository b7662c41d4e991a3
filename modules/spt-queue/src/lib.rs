//! Postgres-resident job queue for on-demand feature computation, the feature
//! specification tables it keys on, and the `queue_activity` notification bus.
//!
//! Row state is authoritative. Notifications are hints that save polling.

pub mod bus;
pub mod queue;
pub mod schema;
pub mod sessions;
pub mod specification;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use bus::{ActivityListener, ActivitySink, Notice, PgNotifier, RecordingSink};
pub use queue::{ClaimedJob, FeatureSnapshot, JobQueue, QueueEntry};
pub use schema::{ensure_schema, register_study, study_lookup};
pub use sessions::{backend_pid, live_backend_pids};
pub use specification::FeatureSpecifications;
