pub mod backoff;
pub mod config;
pub mod error;
pub mod feature;
pub mod job;
pub mod notification;
pub mod phenotype;
pub mod telemetry;

pub use backoff::Backoff;
pub use config::{DatabaseConfig, ServiceAddress};
pub use error::{Error, Result};
pub use feature::{json_compliant, FeatureClass, FeatureSpecification, Specifier};
pub use job::{JobReference, StudySchema};
pub use notification::{QueueActivity, QUEUE_ACTIVITY_CHANNEL};
pub use phenotype::{sanitize_token, PhenotypeCriteria};

/// Claims are retried at most this many times before the row is abandoned.
pub const MAX_RETRIES: i32 = 3;

/// Age after which a claimed row is presumed to belong to a dead worker.
pub const RETRY_INTERVAL_SECONDS: u64 = 180;
