//! The `queue_activity` NOTIFY/LISTEN channel.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use spt_common::{QueueActivity, Result, QUEUE_ACTIVITY_CHANNEL};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, warn};

/// Destination for queue activity notifications.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Publish one notification. Delivery is best-effort; failures are logged,
    /// never returned.
    async fn publish(&self, activity: &QueueActivity);
}

/// Publishes through `pg_notify` on a pooled connection.
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for PgNotifier {
    async fn publish(&self, activity: &QueueActivity) {
        let payload = activity.encode();
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(QUEUE_ACTIVITY_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            warn!(error = %e, payload = payload.as_str(), "PG NOTIFY failed (non-fatal)");
        }
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<QueueActivity>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<QueueActivity> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivitySink for RecordingSink {
    async fn publish(&self, activity: &QueueActivity) {
        if let Ok(mut published) = self.published.lock() {
            published.push(activity.clone());
        }
    }
}

/// A notification together with the backend pid of the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub pid: i32,
    pub activity: QueueActivity,
}

/// Dedicated LISTEN connection on `queue_activity`.
pub struct ActivityListener {
    listener: PgListener,
}

impl ActivityListener {
    pub async fn connect(pool: &PgPool) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(QUEUE_ACTIVITY_CHANNEL).await?;
        Ok(Self { listener })
    }

    /// Next well-formed notification. Malformed payloads are logged and
    /// skipped. The listener reconnects on its own after a dropped connection;
    /// notifications sent in the gap are lost.
    pub async fn recv(&mut self) -> Result<Notice> {
        loop {
            let notification = self.listener.recv().await?;
            match QueueActivity::parse(notification.payload()) {
                Ok(activity) => {
                    return Ok(Notice {
                        pid: notification.process_id() as i32,
                        activity,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed queue activity notification");
                }
            }
        }
    }

    /// Discard notifications that have already arrived, without waiting for
    /// more. Returns how many were dropped.
    pub fn drain(&mut self) -> Result<usize> {
        let mut drained = 0;
        while let Some(notice) = self.recv().now_or_never() {
            notice?;
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Dropped buffered notifications");
        }
        Ok(drained)
    }

    /// Wait up to `timeout` for a notification satisfying `wanted`. Returns
    /// whether one arrived.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        wanted: impl Fn(&QueueActivity) -> bool,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Err(_) => return Ok(false),
                Ok(notice) => {
                    let notice = notice?;
                    if wanted(&notice.activity) {
                        return Ok(true);
                    }
                    debug!(tag = notice.activity.tag(), "Ignoring notification while idle");
                }
            }
        }
    }
}
