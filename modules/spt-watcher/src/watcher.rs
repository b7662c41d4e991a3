use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use spt_common::{Backoff, JobReference, QueueActivity, Result, StudySchema};
use spt_queue::{live_backend_pids, study_lookup, ActivityListener, JobQueue, Notice};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::state::{CompletionRecord, WorkerJobs};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, TypedBuilder)]
pub struct WatcherDeps {
    /// Needs two connections: one held by the LISTEN session, one for
    /// queries.
    pub pool: PgPool,
    #[builder(default = DEFAULT_SWEEP_INTERVAL)]
    pub sweep_interval: Duration,
    /// Fixed study set. When unset the watcher follows `study_lookup`.
    #[builder(default)]
    pub studies: Option<Vec<(String, StudySchema)>>,
    /// Replaces the `pg_notify` publisher, for tests.
    #[builder(default)]
    pub queue: Option<JobQueue>,
}

#[derive(Debug, Default, Clone)]
pub struct WatcherStats {
    pub notices: u64,
    pub completion_warnings: u64,
    pub features_completed: u64,
    pub sweeps: u64,
    pub dead_workers: u64,
    pub abandoned: u64,
    pub pruned: u64,
    pub transient_errors: u64,
}

impl fmt::Display for WatcherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "notices={} completion_warnings={} features_completed={} sweeps={} dead_workers={} abandoned={} pruned={} transient_errors={}",
            self.notices,
            self.completion_warnings,
            self.features_completed,
            self.sweeps,
            self.dead_workers,
            self.abandoned,
            self.pruned,
            self.transient_errors,
        )
    }
}

/// What one sweep found.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Recorded pids with no live session.
    pub dead_workers: Vec<i32>,
    /// Jobs of dead workers that have no value. Their queue rows stay put and
    /// age out into a reclaim. Rows already at the retry cap are abandoned
    /// instead.
    pub orphaned: Vec<JobReference>,
    /// Exhausted queue rows deleted without a value.
    pub abandoned: Vec<JobReference>,
    /// Recorded jobs whose queue row no longer exists.
    pub pruned: Vec<JobReference>,
}

pub struct Watcher {
    queue: JobQueue,
    fixed_studies: bool,
    studies: HashMap<String, StudySchema>,
    jobs: WorkerJobs,
    sweep_interval: Duration,
    stats: WatcherStats,
}

impl Watcher {
    pub fn new(deps: WatcherDeps) -> Self {
        let queue = deps
            .queue
            .unwrap_or_else(|| JobQueue::new(deps.pool.clone()));
        let fixed_studies = deps.studies.is_some();
        Self {
            queue,
            fixed_studies,
            studies: deps.studies.unwrap_or_default().into_iter().collect(),
            jobs: WorkerJobs::new(),
            sweep_interval: deps.sweep_interval,
            stats: WatcherStats::default(),
        }
    }

    pub fn jobs(&self) -> &WorkerJobs {
        &self.jobs
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Handle notifications and sweep periodically until `shutdown` turns
    /// true. The first sweep runs immediately.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<WatcherStats> {
        let mut listener = ActivityListener::connect(self.queue.pool()).await?;
        self.refresh_studies().await?;
        info!(studies = self.studies.len(), "Watcher started");

        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::default();

        while !*shutdown.borrow() {
            let step = tokio::select! {
                notice = listener.recv() => match notice {
                    Ok(notice) => self.handle(notice).await,
                    Err(e) => Err(e),
                },
                _ = sweep.tick() => self.sweep().await.map(|_| ()),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match step {
                Ok(()) => backoff.reset(),
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

        info!("Watcher stopping. {}", self.stats);
        Ok(self.stats.clone())
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    pub async fn handle(&mut self, notice: Notice) -> Result<()> {
        self.stats.notices += 1;
        let Notice { pid, activity } = notice;

        match activity {
            // Enqueues come from the service, not from a holder.
            QueueActivity::NewItems { feature, study } => {
                debug!(study = study.as_str(), feature, pid, "New items queued");
            }
            QueueActivity::QueuePop(job) => {
                debug!(job = %job, pid, "Job popped");
                self.jobs.record_pop(job, pid);
            }
            QueueActivity::JobComplete(job) => {
                match self.jobs.record_complete(&job, pid) {
                    CompletionRecord::Cleared => debug!(job = %job, pid, "Job complete"),
                    CompletionRecord::StaleWorker => {
                        self.stats.completion_warnings += 1;
                        warn!(job = %job, pid, "Stale worker record; completing pid holds a different job");
                    }
                    CompletionRecord::PickedUpByOther { pid: holder } => {
                        self.stats.completion_warnings += 1;
                        warn!(job = %job, pid, holder, "Job was picked up by other pid");
                    }
                    CompletionRecord::Unknown => {
                        self.stats.completion_warnings += 1;
                        warn!(job = %job, pid, "Completion for a job and pid never seen popping");
                    }
                }
                self.check_feature_completion(&job.study, job.feature).await?;
            }
            QueueActivity::CheckForFailedJobs(note) => {
                info!(note = note.as_str(), "Sweep requested");
                self.sweep().await?;
            }
            QueueActivity::FeatureComplete { .. } => {}
        }
        Ok(())
    }

    /// No queue row exists for the feature and no recorded worker holds one of
    /// its jobs. Unregistered studies are never complete.
    pub async fn is_feature_complete(&mut self, study: &str, feature: i32) -> Result<bool> {
        if self.jobs.holds_feature(feature, study) {
            return Ok(false);
        }
        let Some(schema) = self.schema_for(study).await? else {
            warn!(study, feature, "Cannot check completion for an unregistered study");
            return Ok(false);
        };
        Ok(self.queue.pending_count(&schema, feature).await? == 0)
    }

    /// Publish `feature computation jobs complete` if the feature is complete.
    /// Returns whether it was published.
    pub async fn check_feature_completion(&mut self, study: &str, feature: i32) -> Result<bool> {
        if !self.is_feature_complete(study, feature).await? {
            return Ok(false);
        }

        self.queue
            .publish(&QueueActivity::FeatureComplete {
                feature,
                study: study.to_string(),
            })
            .await;
        self.stats.features_completed += 1;
        info!(study, feature, "Feature computation jobs complete");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Presume recorded workers without a live session dead, delete exhausted
    /// queue rows, and forget recorded jobs whose queue row is gone.
    pub async fn sweep(&mut self) -> Result<SweepReport> {
        self.stats.sweeps += 1;
        let mut report = SweepReport::default();

        let live = live_backend_pids(self.queue.pool()).await?;
        let mut dead: Vec<i32> = self.jobs.pids().difference(&live).copied().collect();
        dead.sort_unstable();
        for pid in dead {
            let jobs = self.jobs.take_jobs_of(pid);
            warn!(pid, jobs = jobs.len(), "Worker presumed dead");
            for job in jobs {
                let Some(schema) = self.schema_for(&job.study).await? else {
                    continue;
                };
                if self.queue.value(&schema, &job).await?.is_some() {
                    continue;
                }
                warn!(job = %job, pid, "Worker died without writing a value");
                // A row at the retry cap can never be reclaimed.
                let exhausted = self
                    .queue
                    .entry(&schema, &job)
                    .await?
                    .is_some_and(|entry| entry.is_exhausted());
                if exhausted && self.queue.abandon(&schema, &job).await? {
                    report.abandoned.push(job);
                } else {
                    report.orphaned.push(job);
                }
            }
            report.dead_workers.push(pid);
        }

        self.refresh_studies().await?;
        let mut studies: Vec<(String, StudySchema)> = self
            .studies
            .iter()
            .map(|(study, schema)| (study.clone(), schema.clone()))
            .collect();
        studies.sort_by(|a, b| a.0.cmp(&b.0));
        for (study, schema) in &studies {
            report
                .abandoned
                .extend(self.queue.cleanup_exhausted(study, schema).await?);
        }

        for job in self.jobs.jobs() {
            let Some(schema) = self.schema_for(&job.study).await? else {
                continue;
            };
            if self.queue.entry(&schema, &job).await?.is_none() {
                self.jobs.remove(&job);
                debug!(job = %job, "Pruned job with no queue row");
                report.pruned.push(job);
            }
        }

        let features: BTreeSet<(String, i32)> = report
            .abandoned
            .iter()
            .chain(&report.pruned)
            .map(|job| (job.study.clone(), job.feature))
            .collect();
        for (study, feature) in features {
            self.check_feature_completion(&study, feature).await?;
        }

        self.stats.dead_workers += report.dead_workers.len() as u64;
        self.stats.abandoned += report.abandoned.len() as u64;
        self.stats.pruned += report.pruned.len() as u64;
        info!(
            dead_workers = report.dead_workers.len(),
            orphaned = report.orphaned.len(),
            abandoned = report.abandoned.len(),
            pruned = report.pruned.len(),
            recorded = self.jobs.len(),
            "Sweep complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Studies
    // -----------------------------------------------------------------------

    async fn refresh_studies(&mut self) -> Result<()> {
        if self.fixed_studies {
            return Ok(());
        }
        self.studies = study_lookup(self.queue.pool()).await?.into_iter().collect();
        Ok(())
    }

    async fn schema_for(&mut self, study: &str) -> Result<Option<StudySchema>> {
        if !self.studies.contains_key(study) {
            self.refresh_studies().await?;
        }
        Ok(self.studies.get(study).cloned())
    }
}
