//! Which backend session holds which job, as seen on the notification bus.

use std::collections::{HashMap, HashSet};

use spt_common::JobReference;

/// How a `job complete` notification related to what was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionRecord {
    /// The sender held the job; the entry was dropped.
    Cleared,
    /// The sender is recorded against other jobs only.
    StaleWorker,
    /// The job is recorded against a different session.
    PickedUpByOther { pid: i32 },
    /// Neither the sender nor the job is recorded.
    Unknown,
}

#[derive(Debug, Default, Clone)]
pub struct WorkerJobs {
    jobs: HashMap<JobReference, i32>,
}

impl WorkerJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn holder(&self, job: &JobReference) -> Option<i32> {
        self.jobs.get(job).copied()
    }

    /// A later pop of the same job replaces the holder.
    pub fn record_pop(&mut self, job: JobReference, pid: i32) {
        self.jobs.insert(job, pid);
    }

    pub fn record_complete(&mut self, job: &JobReference, pid: i32) -> CompletionRecord {
        match self.jobs.get(job).copied() {
            Some(holder) if holder == pid => {
                self.jobs.remove(job);
                CompletionRecord::Cleared
            }
            _ if self.jobs.values().any(|&holder| holder == pid) => CompletionRecord::StaleWorker,
            Some(holder) => CompletionRecord::PickedUpByOther { pid: holder },
            None => CompletionRecord::Unknown,
        }
    }

    pub fn pids(&self) -> HashSet<i32> {
        self.jobs.values().copied().collect()
    }

    pub fn jobs(&self) -> Vec<JobReference> {
        let mut jobs: Vec<JobReference> = self.jobs.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    /// Remove and return every job recorded against `pid`.
    pub fn take_jobs_of(&mut self, pid: i32) -> Vec<JobReference> {
        let mut taken: Vec<JobReference> = self
            .jobs
            .iter()
            .filter(|(_, holder)| **holder == pid)
            .map(|(job, _)| job.clone())
            .collect();
        for job in &taken {
            self.jobs.remove(job);
        }
        taken.sort();
        taken
    }

    pub fn remove(&mut self, job: &JobReference) -> Option<i32> {
        self.jobs.remove(job)
    }

    /// Whether any recorded job belongs to `feature` in `study`.
    pub fn holds_feature(&self, feature: i32, study: &str) -> bool {
        self.jobs
            .keys()
            .any(|job| job.feature == feature && job.study == study)
    }
}
