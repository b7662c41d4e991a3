//! Payloads carried on the `queue_activity` NOTIFY channel.
//!
//! Each payload is a tab-separated tag followed by its fields. Producers and
//! consumers all go through [`QueueActivity`], so the format changes in one
//! place.

use crate::error::{Error, Result};
use crate::job::JobReference;

pub const QUEUE_ACTIVITY_CHANNEL: &str = "queue_activity";

const NEW_ITEMS: &str = "new items";
const QUEUE_POP: &str = "queue pop";
const JOB_COMPLETE: &str = "job complete";
const CHECK_FOR_FAILED_JOBS: &str = "check for failed jobs";
const FEATURE_COMPLETE: &str = "feature computation jobs complete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueActivity {
    /// Fresh queue rows were inserted for a feature. Wakes idle workers; says
    /// nothing about who holds what.
    NewItems { feature: i32, study: String },
    /// A worker claimed a job. The sender's pid is the holder.
    QueuePop(JobReference),
    /// A worker wrote a job's value.
    JobComplete(JobReference),
    /// Ask the watcher to sweep for dead workers. The payload is free text.
    CheckForFailedJobs(String),
    /// The last job of a feature finished.
    FeatureComplete { feature: i32, study: String },
}

impl QueueActivity {
    pub fn tag(&self) -> &'static str {
        match self {
            QueueActivity::NewItems { .. } => NEW_ITEMS,
            QueueActivity::QueuePop(_) => QUEUE_POP,
            QueueActivity::JobComplete(_) => JOB_COMPLETE,
            QueueActivity::CheckForFailedJobs(_) => CHECK_FOR_FAILED_JOBS,
            QueueActivity::FeatureComplete { .. } => FEATURE_COMPLETE,
        }
    }

    pub fn encode(&self) -> String {
        let fields = match self {
            QueueActivity::QueuePop(job) | QueueActivity::JobComplete(job) => vec![
                job.feature.to_string(),
                clean(&job.study),
                clean(&job.specimen),
            ],
            QueueActivity::CheckForFailedJobs(note) => vec![clean(note)],
            QueueActivity::NewItems { feature, study }
            | QueueActivity::FeatureComplete { feature, study } => {
                vec![feature.to_string(), clean(study)]
            }
        };
        let mut payload = self.tag().to_string();
        for field in fields {
            payload.push('\t');
            payload.push_str(&field);
        }
        payload
    }

    pub fn parse(payload: &str) -> Result<Self> {
        let mut parts = payload.split('\t');
        let tag = parts.next().unwrap_or_default();
        let fields: Vec<&str> = parts.collect();

        match (tag, fields.as_slice()) {
            (NEW_ITEMS, [feature, study]) => Ok(QueueActivity::NewItems {
                feature: parse_feature(feature)?,
                study: study.to_string(),
            }),
            (QUEUE_POP, [feature, study, specimen]) => Ok(QueueActivity::QueuePop(
                JobReference::new(parse_feature(feature)?, *study, *specimen),
            )),
            (JOB_COMPLETE, [feature, study, specimen]) => Ok(QueueActivity::JobComplete(
                JobReference::new(parse_feature(feature)?, *study, *specimen),
            )),
            (CHECK_FOR_FAILED_JOBS, rest) => {
                Ok(QueueActivity::CheckForFailedJobs(rest.join("\t")))
            }
            (FEATURE_COMPLETE, [feature, study]) => Ok(QueueActivity::FeatureComplete {
                feature: parse_feature(feature)?,
                study: study.to_string(),
            }),
            _ => Err(Error::client(format!(
                "unrecognized queue activity payload {payload:?}"
            ))),
        }
    }
}

fn parse_feature(raw: &str) -> Result<i32> {
    raw.parse()
        .map_err(|_| Error::client(format!("feature id {raw:?} is not an integer")))
}

fn clean(field: &str) -> String {
    field.replace('\t', " ")
}
