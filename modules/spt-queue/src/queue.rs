//! JobQueue: claim/complete/retry over `quantitative_feature_value_queue`.
//!
//! A queue row `(feature, subject)` exists from enqueue until its value is
//! written (or it is abandoned). Claims stamp `computation_start`; a claim
//! older than the retry interval is presumed dead and may be reclaimed, which
//! bumps `retries`. Rows at the retry cap are never claimed again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use spt_common::{
    Error, JobReference, QueueActivity, Result, StudySchema, MAX_RETRIES, RETRY_INTERVAL_SECONDS,
};
use sqlx::PgPool;
use tracing::{debug, error, warn};

use crate::bus::{ActivitySink, PgNotifier};

/// Rows at the retry cap with no live claim. `$1` is the cap, `$2` the retry
/// interval in seconds.
const ABANDONED_PREDICATE: &str = "retries >= $1 AND (computation_start IS NULL OR computation_start < now() - make_interval(secs => $2))";

/// A job claimed by this process.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: JobReference,
    pub schema: StudySchema,
    /// Retry count after this claim.
    pub retries: i32,
    pub computation_start: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueueEntry {
    pub feature: i32,
    pub subject: String,
    pub computation_start: Option<NaiveDateTime>,
    pub retries: i32,
}

impl QueueEntry {
    /// The row is at the retry cap and will not be claimed again. A claim
    /// taken on the last retry may still be live.
    pub fn is_exhausted(&self) -> bool {
        self.retries >= MAX_RETRIES
    }
}

/// Everything known about one feature in one study: written values and
/// outstanding queue rows, keyed by specimen.
#[derive(Debug, Default, Clone)]
pub struct FeatureSnapshot {
    pub values: HashMap<String, Option<f64>>,
    pub queued: HashMap<String, QueueEntry>,
    /// Queued specimens whose rows are at the retry cap with no live claim.
    /// They will never get a value.
    pub abandoned: HashSet<String>,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    sink: Arc<dyn ActivitySink>,
}

impl JobQueue {
    /// Queue publishing notifications through the same pool.
    pub fn new(pool: PgPool) -> Self {
        let sink = Arc::new(PgNotifier::new(pool.clone()));
        Self { pool, sink }
    }

    pub fn with_sink(pool: PgPool, sink: Arc<dyn ActivitySink>) -> Self {
        Self { pool, sink }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publish on this queue's sink.
    pub async fn publish(&self, activity: &QueueActivity) {
        self.sink.publish(activity).await;
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Insert a fresh queue row unless one exists or the value is already
    /// written. Returns whether a row was inserted.
    pub async fn enqueue(&self, schema: &StudySchema, job: &JobReference) -> Result<bool> {
        let inserted = self
            .enqueue_all(schema, &job.study, job.feature, std::slice::from_ref(&job.specimen))
            .await?;
        Ok(!inserted.is_empty())
    }

    /// Insert fresh queue rows for every specimen of `feature` that has
    /// neither a row nor a value, in a single statement. Returns the
    /// specimens that were inserted.
    ///
    /// The rows of one batch become visible together, so a worker can never
    /// drain the first of them before the rest exist. Publishes one
    /// `new items` wake-up when anything was inserted.
    pub async fn enqueue_all(
        &self,
        schema: &StudySchema,
        study: &str,
        feature: i32,
        specimens: &[String],
    ) -> Result<Vec<String>> {
        if specimens.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (String,)>(&format!(
            r#"
            INSERT INTO {schema}.quantitative_feature_value_queue (feature, subject, computation_start, retries)
            SELECT $1, s.subject, NULL, 0
            FROM unnest($2::text[]) AS s(subject)
            WHERE NOT EXISTS (
                SELECT 1 FROM {schema}.quantitative_feature_value v
                WHERE v.feature = $1 AND v.subject = s.subject
            )
            ON CONFLICT (feature, subject) DO NOTHING
            RETURNING subject
            "#
        ))
        .bind(feature)
        .bind(specimens)
        .fetch_all(&self.pool)
        .await?;

        let inserted: Vec<String> = rows.into_iter().map(|(subject,)| subject).collect();
        if !inserted.is_empty() {
            debug!(study, feature, inserted = inserted.len(), "Enqueued jobs");
            self.sink
                .publish(&QueueActivity::NewItems {
                    feature,
                    study: study.to_string(),
                })
                .await;
        }
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim one active job from the given studies, in order. Returns `None`
    /// when every queue is empty or fully claimed.
    pub async fn pop_one(&self, studies: &[(String, StudySchema)]) -> Result<Option<ClaimedJob>> {
        for (study, schema) in studies {
            if let Some(claim) = self.pop_one_in(study, schema).await? {
                return Ok(Some(claim));
            }
        }
        Ok(None)
    }

    /// Claim one active job from a single study.
    ///
    /// The row is deleted and re-inserted with `computation_start = now()` in
    /// one transaction. `SKIP LOCKED` lets concurrent claimers pass over a row
    /// another claimer holds instead of waiting on it.
    pub async fn pop_one_in(&self, study: &str, schema: &StudySchema) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let popped = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            DELETE FROM {schema}.quantitative_feature_value_queue q1
            USING (
                SELECT feature, subject
                FROM {schema}.quantitative_feature_value_queue
                WHERE retries < $1
                  AND (
                      computation_start IS NULL
                      OR computation_start < now() - make_interval(secs => $2)
                  )
                ORDER BY computation_start ASC NULLS FIRST
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) q
            WHERE q1.feature = q.feature AND q1.subject = q.subject
            RETURNING q1.feature, q1.subject, q1.computation_start, q1.retries
            "#
        ))
        .bind(MAX_RETRIES)
        .bind(RETRY_INTERVAL_SECONDS as f64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(popped) = popped else {
            tx.rollback().await?;
            return Ok(None);
        };

        // A previous claim that aged out counts as a failed attempt.
        let retries = popped.retries + i32::from(popped.computation_start.is_some());

        let (computation_start,) = sqlx::query_as::<_, (NaiveDateTime,)>(&format!(
            r#"
            INSERT INTO {schema}.quantitative_feature_value_queue (feature, subject, computation_start, retries)
            VALUES ($1, $2, now(), $3)
            RETURNING computation_start
            "#
        ))
        .bind(popped.feature)
        .bind(&popped.subject)
        .bind(retries)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let job = JobReference::new(popped.feature, study, popped.subject);
        if popped.computation_start.is_some() {
            warn!(job = %job, retries, "Reclaimed job from a presumed-dead worker");
        }
        self.sink.publish(&QueueActivity::QueuePop(job.clone())).await;

        Ok(Some(ClaimedJob {
            job,
            schema: schema.clone(),
            retries,
            computation_start,
        }))
    }

    /// Refresh the claim timestamp of a long-running job. Returns false if the
    /// row is gone.
    pub async fn renew(&self, schema: &StudySchema, job: &JobReference) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {schema}.quantitative_feature_value_queue
            SET computation_start = now()
            WHERE feature = $1 AND subject = $2
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // -----------------------------------------------------------------------
    // Complete / abandon
    // -----------------------------------------------------------------------

    /// Write the job's value and delete its queue row in one transaction, then
    /// publish `job complete`. `None` records a known-missing value.
    ///
    /// A value already present for the pair is an invariant violation: the
    /// transaction is rolled back and the error returned.
    pub async fn complete(
        &self,
        schema: &StudySchema,
        job: &JobReference,
        value: Option<f64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.quantitative_feature_value (feature, subject, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (feature, subject) DO NOTHING
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            error!(job = %job, "Feature value already written; refusing to overwrite");
            return Err(Error::InvariantViolation(format!(
                "duplicate feature value for {job}"
            )));
        }

        sqlx::query(&format!(
            r#"
            DELETE FROM {schema}.quantitative_feature_value_queue
            WHERE feature = $1 AND subject = $2
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.sink.publish(&QueueActivity::JobComplete(job.clone())).await;
        Ok(())
    }

    /// Delete a queue row without writing a value.
    pub async fn abandon(&self, schema: &StudySchema, job: &JobReference) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM {schema}.quantitative_feature_value_queue
            WHERE feature = $1 AND subject = $2
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .execute(&self.pool)
        .await?;

        let abandoned = result.rows_affected() == 1;
        if abandoned {
            warn!(job = %job, "Abandoned job without a value");
        }
        Ok(abandoned)
    }

    /// Delete rows at the retry cap that nobody holds a live claim on. Returns
    /// the abandoned jobs.
    pub async fn cleanup_exhausted(&self, study: &str, schema: &StudySchema) -> Result<Vec<JobReference>> {
        let rows = sqlx::query_as::<_, (i32, String)>(&format!(
            r#"
            DELETE FROM {schema}.quantitative_feature_value_queue
            WHERE {ABANDONED_PREDICATE}
            RETURNING feature, subject
            "#
        ))
        .bind(MAX_RETRIES)
        .bind(RETRY_INTERVAL_SECONDS as f64)
        .fetch_all(&self.pool)
        .await?;

        let abandoned: Vec<JobReference> = rows
            .into_iter()
            .map(|(feature, subject)| JobReference::new(feature, study, subject))
            .collect();
        for job in &abandoned {
            warn!(job = %job, retries = MAX_RETRIES, "Abandoned job after exhausting retries");
        }
        Ok(abandoned)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Queue rows and values for one feature.
    ///
    /// The queue is read before the values: a row that disappears between the
    /// two reads has had its value committed first, so the value read sees it.
    pub async fn snapshot(&self, schema: &StudySchema, feature: i32) -> Result<FeatureSnapshot> {
        let queued = sqlx::query_as::<_, (i32, String, Option<NaiveDateTime>, i32, bool)>(&format!(
            r#"
            SELECT feature, subject, computation_start, retries, ({ABANDONED_PREDICATE}) AS abandoned
            FROM {schema}.quantitative_feature_value_queue
            WHERE feature = $3
            "#
        ))
        .bind(MAX_RETRIES)
        .bind(RETRY_INTERVAL_SECONDS as f64)
        .bind(feature)
        .fetch_all(&self.pool)
        .await?;

        let values = sqlx::query_as::<_, (String, Option<f64>)>(&format!(
            r#"
            SELECT subject, value
            FROM {schema}.quantitative_feature_value
            WHERE feature = $1
            "#
        ))
        .bind(feature)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = FeatureSnapshot {
            values: values.into_iter().collect(),
            ..FeatureSnapshot::default()
        };
        for (feature, subject, computation_start, retries, abandoned) in queued {
            if abandoned {
                snapshot.abandoned.insert(subject.clone());
            }
            snapshot.queued.insert(
                subject.clone(),
                QueueEntry {
                    feature,
                    subject,
                    computation_start,
                    retries,
                },
            );
        }
        Ok(snapshot)
    }

    pub async fn entry(&self, schema: &StudySchema, job: &JobReference) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            SELECT feature, subject, computation_start, retries
            FROM {schema}.quantitative_feature_value_queue
            WHERE feature = $1 AND subject = $2
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// `Some(value)` if the job's value row exists (the inner value may be
    /// null).
    pub async fn value(&self, schema: &StudySchema, job: &JobReference) -> Result<Option<Option<f64>>> {
        let row = sqlx::query_as::<_, (Option<f64>,)>(&format!(
            r#"
            SELECT value
            FROM {schema}.quantitative_feature_value
            WHERE feature = $1 AND subject = $2
            "#
        ))
        .bind(job.feature)
        .bind(&job.specimen)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Number of outstanding queue rows for a feature.
    pub async fn pending_count(&self, schema: &StudySchema, feature: i32) -> Result<i64> {
        let (count,) = sqlx::query_as::<_, (i64,)>(&format!(
            r#"
            SELECT COUNT(*)
            FROM {schema}.quantitative_feature_value_queue
            WHERE feature = $1
            "#
        ))
        .bind(feature)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
