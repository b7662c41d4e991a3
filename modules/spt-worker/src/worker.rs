use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use spt_common::{
    Backoff, Error, FeatureClass, JobReference, QueueActivity, Result, StudySchema,
    RETRY_INTERVAL_SECONDS,
};
use spt_expressions::StudyRegistry;
use spt_queue::{ActivityListener, ClaimedJob, FeatureSpecifications, JobQueue};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(150);
pub const DEFAULT_CELL_NUMBER_LIMIT: usize = 750_000;
pub const MAX_IDLE_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, TypedBuilder)]
pub struct WorkerDeps {
    /// Needs two connections: one held by the LISTEN session, one for queue
    /// queries. Keep it at exactly two so every notification this worker
    /// sends carries the same backend pid.
    pub pool: PgPool,
    pub registry: Arc<StudyRegistry>,
    #[builder(default = DEFAULT_JOB_TIMEOUT)]
    pub job_timeout: Duration,
    #[builder(default = DEFAULT_CELL_NUMBER_LIMIT)]
    pub cell_number_limit: usize,
    #[builder(default = MAX_IDLE_WAIT)]
    pub idle_wait: Duration,
    /// Replaces the `pg_notify` publisher, for tests.
    #[builder(default)]
    pub queue: Option<JobQueue>,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// A value (possibly null) was written and the queue row deleted.
    Completed {
        job: JobReference,
        value: Option<f64>,
    },
    /// Nothing was written. The queue row stays claimed and is retried once
    /// the claim ages out.
    Failed { job: JobReference, reason: String },
}

impl JobOutcome {
    pub fn job(&self) -> &JobReference {
        match self {
            JobOutcome::Completed { job, .. } | JobOutcome::Failed { job, .. } => job,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub null_values: u64,
    pub too_large: u64,
    pub jobs_failed: u64,
    pub idle_waits: u64,
    pub transient_errors: u64,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs_completed={} null_values={} too_large={} jobs_failed={} idle_waits={} transient_errors={}",
            self.jobs_completed,
            self.null_values,
            self.too_large,
            self.jobs_failed,
            self.idle_waits,
            self.transient_errors,
        )
    }
}

enum Computation {
    Value(Option<f64>),
    TooLarge(usize),
    Failed(String),
}

pub struct Worker {
    queue: JobQueue,
    specifications: FeatureSpecifications,
    registry: Arc<StudyRegistry>,
    studies: Vec<(String, StudySchema)>,
    job_timeout: Duration,
    cell_number_limit: usize,
    idle_wait: Duration,
    renew_interval: Duration,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(deps: WorkerDeps) -> Self {
        let queue = deps
            .queue
            .unwrap_or_else(|| JobQueue::new(deps.pool.clone()));
        let studies = deps.registry.schemas();
        Self {
            queue,
            specifications: FeatureSpecifications::new(deps.pool),
            studies,
            registry: deps.registry,
            job_timeout: deps.job_timeout,
            cell_number_limit: deps.cell_number_limit,
            idle_wait: deps.idle_wait.min(MAX_IDLE_WAIT),
            renew_interval: Duration::from_secs(RETRY_INTERVAL_SECONDS / 3),
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Claim and process jobs until `shutdown` turns true. Between jobs the
    /// worker waits on `new items` notifications, polling at least every
    /// idle-wait interval. A job in progress is finished before exiting.
    ///
    /// Notifications that piled up while a job ran are dropped before each
    /// claim attempt; the claim itself sees every row they announced.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats> {
        let mut listener = ActivityListener::connect(self.queue.pool()).await?;
        let mut backoff = Backoff::default();
        info!(studies = self.studies.len(), "Worker started");

        while !*shutdown.borrow() {
            if let Err(e) = listener.drain() {
                warn!(error = %e, "Failed to drop buffered notifications");
            }
            match self.run_once().await {
                Ok(Some(_)) => backoff.reset(),
                Ok(None) => {
                    backoff.reset();
                    self.stats.idle_waits += 1;
                    tokio::select! {
                        woke = listener.wait_for(self.idle_wait, |activity| {
                            matches!(activity, QueueActivity::NewItems { .. })
                        }) => {
                            if let Err(e) = woke {
                                self.stats.transient_errors += 1;
                                let delay = backoff.next_delay();
                                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Listener error; backing off");
                                tokio::time::sleep(delay).await;
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    self.stats.transient_errors += 1;
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Transient error; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!("Worker stopping. {}", self.stats);
        Ok(self.stats.clone())
    }

    /// Process jobs until none can be claimed.
    pub async fn drain(&mut self) -> Result<WorkerStats> {
        while self.run_once().await?.is_some() {}
        info!("Queue drained. {}", self.stats);
        Ok(self.stats.clone())
    }

    /// Claim and process at most one job.
    pub async fn run_once(&mut self) -> Result<Option<JobOutcome>> {
        let Some(claim) = self.queue.pop_one(&self.studies).await? else {
            return Ok(None);
        };
        self.process(claim).await.map(Some)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub async fn process(&mut self, claim: ClaimedJob) -> Result<JobOutcome> {
        let job = claim.job.clone();
        info!(job = %job, retries = claim.retries, "Claimed job");

        let value = match self.compute(&claim).await? {
            Computation::Value(value) => value,
            Computation::TooLarge(cells) => {
                self.stats.too_large += 1;
                info!(job = %job, cells, limit = self.cell_number_limit, "Specimen too large; recording no value");
                None
            }
            Computation::Failed(reason) => {
                self.stats.jobs_failed += 1;
                warn!(job = %job, reason = reason.as_str(), "Job failed; leaving it to be retried");
                return Ok(JobOutcome::Failed { job, reason });
            }
        };

        match self.queue.complete(&claim.schema, &job, value).await {
            Ok(()) => {}
            Err(Error::InvariantViolation(reason)) => {
                self.stats.jobs_failed += 1;
                return Ok(JobOutcome::Failed { job, reason });
            }
            Err(e) => return Err(e),
        }

        self.stats.jobs_completed += 1;
        if value.is_none() {
            self.stats.null_values += 1;
        }
        info!(job = %job, value = ?value, "Job complete");
        Ok(JobOutcome::Completed { job, value })
    }

    /// Run the job's kernel off the async runtime, renewing the claim while it
    /// runs and giving up after the job timeout.
    async fn compute(&self, claim: &ClaimedJob) -> Result<Computation> {
        let job = &claim.job;

        let spec = match self.specifications.load(&claim.schema, job.feature).await {
            Ok(Some((_, spec))) => spec,
            Ok(None) => {
                return Ok(Computation::Failed(format!(
                    "feature specification {} not found",
                    job.feature
                )))
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return Ok(Computation::Failed(e.to_string())),
        };

        let store = match self.registry.get(&job.study) {
            Ok(entry) => Arc::clone(&entry.expressions),
            Err(e) => return Ok(Computation::Failed(e.to_string())),
        };
        let cells = match store.specimen(&job.specimen) {
            Ok(view) => view.len(),
            Err(e) => return Ok(Computation::Failed(e.to_string())),
        };
        if spec.class() != FeatureClass::Count && cells > self.cell_number_limit {
            return Ok(Computation::TooLarge(cells));
        }

        debug!(job = %job, specification = %spec, cells, "Computing");
        let specimen = job.specimen.clone();
        let mut computation =
            tokio::task::spawn_blocking(move || spt_metrics::evaluate(&store, &spec, &specimen));

        let deadline = tokio::time::sleep(self.job_timeout);
        tokio::pin!(deadline);
        let mut renew = interval_at(Instant::now() + self.renew_interval, self.renew_interval);

        loop {
            tokio::select! {
                joined = &mut computation => {
                    return Ok(match joined {
                        Ok(Ok(value)) => Computation::Value(value),
                        Ok(Err(e)) => Computation::Failed(e.to_string()),
                        Err(e) => Computation::Failed(format!("kernel task failed: {e}")),
                    });
                }
                _ = &mut deadline => {
                    // The blocking thread cannot be interrupted; its result is
                    // discarded when it finishes.
                    return Ok(Computation::Failed(format!(
                        "timed out after {}s",
                        self.job_timeout.as_secs()
                    )));
                }
                _ = renew.tick() => {
                    match self.queue.renew(&claim.schema, job).await {
                        Ok(true) => debug!(job = %job, "Renewed claim"),
                        Ok(false) => warn!(job = %job, "Queue row vanished while computing"),
                        Err(e) => warn!(error = %e, job = %job, "Failed to renew claim"),
                    }
                }
            }
        }
    }
}
