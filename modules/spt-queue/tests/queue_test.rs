//! Integration tests for JobQueue and FeatureSpecifications.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.
//!
//! Each test works in its own schema so tests can run in parallel.

use std::sync::Arc;

use spt_common::{
    Error, FeatureClass, FeatureSpecification, JobReference, PhenotypeCriteria, QueueActivity,
    StudySchema,
};
use spt_queue::{ensure_schema, FeatureSpecifications, JobQueue, RecordingSink};
use sqlx::PgPool;

const STUDY: &str = "Queue study";

/// Get a test database pool with a fresh copy of `schema`, or skip if no test
/// DB is available.
async fn test_pool(schema: &str) -> Option<(PgPool, StudySchema)> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let schema = StudySchema::new(schema).ok()?;

    // Clean slate for each test
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&pool)
        .await
        .ok()?;
    ensure_schema(&pool, &schema).await.ok()?;

    Some((pool, schema))
}

fn recording_queue(pool: &PgPool) -> (JobQueue, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (JobQueue::with_sink(pool.clone(), sink.clone()), sink)
}

fn job(feature: i32, specimen: &str) -> JobReference {
    JobReference::new(feature, STUDY, specimen)
}

fn studies(schema: &StudySchema) -> Vec<(String, StudySchema)> {
    vec![(STUDY.to_string(), schema.clone())]
}

fn proximity_spec(radius: f64) -> FeatureSpecification {
    let cd3 = PhenotypeCriteria::new(["CD3"], ["CD20"]).unwrap();
    let cd20 = PhenotypeCriteria::new(["CD20"], Vec::<&str>::new()).unwrap();
    FeatureSpecification::new(FeatureClass::Proximity, vec![cd3, cd20], Some(radius)).unwrap()
}

async fn set_claim(pool: &PgPool, schema: &StudySchema, job: &JobReference, age_secs: i32, retries: i32) {
    sqlx::query(&format!(
        r#"
        UPDATE {schema}.quantitative_feature_value_queue
        SET computation_start = now() - make_interval(secs => $3), retries = $4
        WHERE feature = $1 AND subject = $2
        "#
    ))
    .bind(job.feature)
    .bind(&job.specimen)
    .bind(age_secs as f64)
    .bind(retries)
    .execute(pool)
    .await
    .unwrap();
}

// =========================================================================
// Enqueue
// =========================================================================

#[tokio::test]
async fn enqueue_is_idempotent() {
    let Some((pool, schema)) = test_pool("spt_queue_test_enqueue").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);
    let job = job(1, "spec1");

    assert!(queue.enqueue(&schema, &job).await.unwrap());
    assert!(!queue.enqueue(&schema, &job).await.unwrap());

    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 1);
    let entry = queue.entry(&schema, &job).await.unwrap().unwrap();
    assert_eq!(entry.retries, 0);
    assert!(entry.computation_start.is_none());

    // Only the insert announces work.
    assert_eq!(
        sink.published(),
        vec![QueueActivity::NewItems {
            feature: 1,
            study: STUDY.to_string(),
        }]
    );
}

#[tokio::test]
async fn enqueue_all_inserts_the_batch_together() {
    let Some((pool, schema)) = test_pool("spt_queue_test_enqueue_all").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);
    queue.enqueue(&schema, &job(1, "spec1")).await.unwrap();
    queue.enqueue(&schema, &job(1, "spec2")).await.unwrap();
    queue.complete(&schema, &job(1, "spec2"), Some(1.0)).await.unwrap();
    let published = sink.published().len();

    let specimens: Vec<String> = ["spec1", "spec2", "spec3", "spec4"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut inserted = queue.enqueue_all(&schema, STUDY, 1, &specimens).await.unwrap();
    inserted.sort();

    assert_eq!(inserted, vec!["spec3".to_string(), "spec4".to_string()]);
    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 3);
    assert_eq!(queue.value(&schema, &job(1, "spec2")).await.unwrap(), Some(Some(1.0)));
    assert_eq!(
        sink.published()[published..],
        [QueueActivity::NewItems {
            feature: 1,
            study: STUDY.to_string(),
        }]
    );

    // Nothing new: no rows, no wake-up.
    assert!(queue.enqueue_all(&schema, STUDY, 1, &specimens).await.unwrap().is_empty());
    assert!(queue.enqueue_all(&schema, STUDY, 1, &[]).await.unwrap().is_empty());
    assert_eq!(sink.published().len(), published + 1);
}

#[tokio::test]
async fn concurrent_enqueues_leave_one_row() {
    let Some((pool, schema)) = test_pool("spt_queue_test_concurrent_enqueue").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");

    let results = futures::future::join_all((0..8).map(|_| queue.enqueue(&schema, &job))).await;
    let inserted = results.into_iter().map(|r| r.unwrap()).filter(|i| *i).count();

    assert_eq!(inserted, 1);
    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 1);
}

#[tokio::test]
async fn enqueue_after_complete_keeps_the_value() {
    let Some((pool, schema)) = test_pool("spt_queue_test_enqueue_after_complete").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");

    queue.enqueue(&schema, &job).await.unwrap();
    queue.complete(&schema, &job, Some(2.5)).await.unwrap();

    assert!(!queue.enqueue(&schema, &job).await.unwrap());
    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 0);
    assert_eq!(queue.value(&schema, &job).await.unwrap(), Some(Some(2.5)));
}

// =========================================================================
// Claim
// =========================================================================

#[tokio::test]
async fn pop_claims_a_fresh_row() {
    let Some((pool, schema)) = test_pool("spt_queue_test_pop_fresh").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();

    let claim = queue.pop_one(&studies(&schema)).await.unwrap().unwrap();
    assert_eq!(claim.job, job);
    assert_eq!(claim.schema, schema);
    assert_eq!(claim.retries, 0);

    let entry = queue.entry(&schema, &job).await.unwrap().unwrap();
    assert_eq!(entry.computation_start, Some(claim.computation_start));

    // Claimed and still fresh: nothing left to pop.
    assert!(queue.pop_one(&studies(&schema)).await.unwrap().is_none());
    assert_eq!(sink.published().len(), 2);
}

#[tokio::test]
async fn pop_on_empty_queue_returns_none() {
    let Some((pool, schema)) = test_pool("spt_queue_test_pop_empty").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);

    assert!(queue.pop_one(&studies(&schema)).await.unwrap().is_none());
    assert!(sink.published().is_empty());
}

#[tokio::test]
async fn stale_claim_is_reclaimed_with_a_retry() {
    let Some((pool, schema)) = test_pool("spt_queue_test_stale_claim").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    set_claim(&pool, &schema, &job, 200, 0).await;

    let claim = queue.pop_one(&studies(&schema)).await.unwrap().unwrap();
    assert_eq!(claim.job, job);
    assert_eq!(claim.retries, 1);

    let entry = queue.entry(&schema, &job).await.unwrap().unwrap();
    assert_eq!(entry.retries, 1);
    assert_eq!(entry.computation_start, Some(claim.computation_start));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_claim_a_row_once() {
    let Some((pool, schema)) = test_pool("spt_queue_test_concurrent_pop").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();

    let poppers = (0..8).map(|_| {
        let queue = queue.clone();
        let studies = studies(&schema);
        tokio::spawn(async move { queue.pop_one(&studies).await })
    });
    let claims: Vec<_> = futures::future::join_all(poppers)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].job, job);
    assert_eq!(claims[0].retries, 0);
    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 1);
}

#[tokio::test]
async fn recent_claim_is_not_reclaimed() {
    let Some((pool, schema)) = test_pool("spt_queue_test_recent_claim").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    set_claim(&pool, &schema, &job, 60, 0).await;

    assert!(queue.pop_one(&studies(&schema)).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_rows_are_skipped_then_cleaned_up() {
    let Some((pool, schema)) = test_pool("spt_queue_test_exhausted").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    set_claim(&pool, &schema, &job, 200, 3).await;

    assert!(queue.pop_one(&studies(&schema)).await.unwrap().is_none());
    assert!(queue.entry(&schema, &job).await.unwrap().unwrap().is_exhausted());

    let abandoned = queue.cleanup_exhausted(STUDY, &schema).await.unwrap();
    assert_eq!(abandoned, vec![job.clone()]);
    assert!(queue.entry(&schema, &job).await.unwrap().is_none());
    assert_eq!(queue.value(&schema, &job).await.unwrap(), None);
}

#[tokio::test]
async fn renew_refreshes_the_claim() {
    let Some((pool, schema)) = test_pool("spt_queue_test_renew").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    set_claim(&pool, &schema, &job, 170, 0).await;

    assert!(queue.renew(&schema, &job).await.unwrap());
    set_claim(&pool, &schema, &job, 0, 0).await;
    assert!(queue.pop_one(&studies(&schema)).await.unwrap().is_none());

    queue.abandon(&schema, &job).await.unwrap();
    assert!(!queue.renew(&schema, &job).await.unwrap());
}

// =========================================================================
// Complete
// =========================================================================

#[tokio::test]
async fn complete_writes_value_and_deletes_row() {
    let Some((pool, schema)) = test_pool("spt_queue_test_complete").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    queue.pop_one(&studies(&schema)).await.unwrap().unwrap();

    queue.complete(&schema, &job, Some(0.25)).await.unwrap();

    assert_eq!(queue.value(&schema, &job).await.unwrap(), Some(Some(0.25)));
    assert!(queue.entry(&schema, &job).await.unwrap().is_none());
    assert_eq!(
        sink.published().last(),
        Some(&QueueActivity::JobComplete(job))
    );
}

#[tokio::test]
async fn complete_records_known_missing_values() {
    let Some((pool, schema)) = test_pool("spt_queue_test_complete_null").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();

    queue.complete(&schema, &job, None).await.unwrap();

    assert_eq!(queue.value(&schema, &job).await.unwrap(), Some(None));
}

#[tokio::test]
async fn duplicate_complete_is_rejected() {
    let Some((pool, schema)) = test_pool("spt_queue_test_duplicate_complete").await else {
        return;
    };
    let (queue, sink) = recording_queue(&pool);
    let job = job(1, "spec1");
    queue.enqueue(&schema, &job).await.unwrap();
    queue.complete(&schema, &job, Some(1.0)).await.unwrap();
    let published = sink.published().len();

    let err = queue.complete(&schema, &job, Some(9.0)).await.unwrap_err();

    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_eq!(queue.value(&schema, &job).await.unwrap(), Some(Some(1.0)));
    assert_eq!(sink.published().len(), published);
}

// =========================================================================
// Reads
// =========================================================================

#[tokio::test]
async fn snapshot_separates_values_and_queue_rows() {
    let Some((pool, schema)) = test_pool("spt_queue_test_snapshot").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    for specimen in ["spec1", "spec2", "spec3"] {
        queue.enqueue(&schema, &job(1, specimen)).await.unwrap();
    }
    queue.enqueue(&schema, &job(2, "spec1")).await.unwrap();
    queue.complete(&schema, &job(1, "spec1"), Some(3.0)).await.unwrap();
    queue.complete(&schema, &job(1, "spec2"), None).await.unwrap();

    let snapshot = queue.snapshot(&schema, 1).await.unwrap();

    assert_eq!(snapshot.values.len(), 2);
    assert_eq!(snapshot.values["spec1"], Some(3.0));
    assert_eq!(snapshot.values["spec2"], None);
    assert_eq!(snapshot.queued.len(), 1);
    assert!(snapshot.queued.contains_key("spec3"));
    assert!(snapshot.abandoned.is_empty());
    assert_eq!(queue.pending_count(&schema, 1).await.unwrap(), 1);
    assert_eq!(queue.pending_count(&schema, 2).await.unwrap(), 1);
}

#[tokio::test]
async fn snapshot_flags_only_dead_exhausted_rows() {
    let Some((pool, schema)) = test_pool("spt_queue_test_snapshot_abandoned").await else {
        return;
    };
    let (queue, _sink) = recording_queue(&pool);
    for specimen in ["live", "dead", "fresh"] {
        queue.enqueue(&schema, &job(1, specimen)).await.unwrap();
    }
    // A claim taken on the last retry is still running.
    set_claim(&pool, &schema, &job(1, "live"), 5, 3).await;
    set_claim(&pool, &schema, &job(1, "dead"), 200, 3).await;

    let snapshot = queue.snapshot(&schema, 1).await.unwrap();

    assert_eq!(snapshot.queued.len(), 3);
    assert!(snapshot.queued["live"].is_exhausted());
    assert_eq!(
        snapshot.abandoned,
        std::collections::HashSet::from(["dead".to_string()])
    );
}

// =========================================================================
// Feature specifications
// =========================================================================

#[tokio::test]
async fn resolve_reuses_equal_specifications() {
    let Some((pool, schema)) = test_pool("spt_queue_test_resolve").await else {
        return;
    };
    let specs = FeatureSpecifications::new(pool);

    let first = specs.resolve(STUDY, &schema, &proximity_spec(100.0)).await.unwrap();
    let again = specs.resolve(STUDY, &schema, &proximity_spec(100.0)).await.unwrap();
    let other = specs.resolve(STUDY, &schema, &proximity_spec(50.0)).await.unwrap();
    let elsewhere = specs.resolve("Other study", &schema, &proximity_spec(100.0)).await.unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_ne!(first, elsewhere);
}

#[tokio::test]
async fn concurrent_resolves_agree() {
    let Some((pool, schema)) = test_pool("spt_queue_test_concurrent_resolve").await else {
        return;
    };
    let specs = FeatureSpecifications::new(pool.clone());
    let spec = proximity_spec(100.0);

    let ids = futures::future::join_all((0..6).map(|_| specs.resolve(STUDY, &schema, &spec))).await;
    let ids: Vec<i32> = ids.into_iter().map(|id| id.unwrap()).collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    let (rows,) = sqlx::query_as::<_, (i64,)>(&format!(
        "SELECT COUNT(*) FROM {schema}.feature_specification"
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn load_returns_the_stored_specification() {
    let Some((pool, schema)) = test_pool("spt_queue_test_load_spec").await else {
        return;
    };
    let specs = FeatureSpecifications::new(pool);
    let spec = proximity_spec(100.0);
    let count = FeatureSpecification::new(
        FeatureClass::Count,
        vec![PhenotypeCriteria::universal()],
        None,
    )
    .unwrap();

    let id = specs.resolve(STUDY, &schema, &spec).await.unwrap();
    let count_id = specs.resolve(STUDY, &schema, &count).await.unwrap();

    assert_eq!(
        specs.load(&schema, id).await.unwrap(),
        Some((STUDY.to_string(), spec))
    );
    assert_eq!(
        specs.load(&schema, count_id).await.unwrap(),
        Some((STUDY.to_string(), count))
    );
    assert_eq!(specs.load(&schema, 9999).await.unwrap(), None);
}
