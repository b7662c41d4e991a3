//! The metrics TCP service: one request per connection, a task per
//! connection, counts answered from memory and asynchronous metrics answered
//! from the feature tables.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use spt_common::{
    json_compliant, Error, FeatureClass, FeatureSpecification, JobReference, PhenotypeCriteria,
    Result,
};
use spt_expressions::StudyRegistry;
use spt_queue::{FeatureSpecifications, JobQueue};
use sqlx::PgPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::protocol::{Request, END_OF_TRANSMISSION};
use crate::response::{
    ChannelCount, CountsResponse, ErrorResponse, MetricsResponse, StudyStatus,
};

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Long-lived resources the service is built from.
#[derive(Clone, TypedBuilder)]
pub struct ServiceDeps {
    pub pool: PgPool,
    pub registry: Arc<StudyRegistry>,
    #[builder(default = DEFAULT_MAX_REQUEST_BYTES)]
    pub max_request_bytes: usize,
    #[builder(default = Duration::from_secs(30))]
    pub read_timeout: Duration,
    /// Replaces the `pg_notify` publisher, for tests.
    #[builder(default)]
    pub queue: Option<JobQueue>,
}

#[derive(Clone)]
pub struct OndemandService {
    registry: Arc<StudyRegistry>,
    queue: JobQueue,
    specifications: FeatureSpecifications,
    max_request_bytes: usize,
    read_timeout: Duration,
}

impl OndemandService {
    pub fn new(deps: ServiceDeps) -> Self {
        let queue = deps
            .queue
            .unwrap_or_else(|| JobQueue::new(deps.pool.clone()));
        Self {
            registry: deps.registry,
            queue,
            specifications: FeatureSpecifications::new(deps.pool),
            max_request_bytes: deps.max_request_bytes,
            read_timeout: deps.read_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------------

    /// Accept connections until `shutdown` turns true. In-flight connections
    /// finish on their own tasks.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %listener.local_addr()?, studies = self.registry.len(), "Metrics service listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_connection(stream).await {
                                warn!(error = %e, peer = %peer, "Connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Metrics service shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let body = match tokio::time::timeout(
            self.read_timeout,
            read_request(&mut stream, self.max_request_bytes),
        )
        .await
        {
            Ok(body) => body,
            Err(_) => Err(Error::client("timed out reading request")),
        };

        let response = match body {
            Ok(body) => self.respond(&body).await,
            Err(e) => {
                warn!(error = %e, "Rejected request");
                frame(error_document(&e))
            }
        };

        stream.write_all(&response).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Answer one request body with a framed JSON document. Never fails:
    /// errors become an `{"error": ..}` document.
    pub async fn respond(&self, body: &[u8]) -> Vec<u8> {
        let document = match self.dispatch(body).await {
            Ok(document) => document,
            Err(e) => {
                if e.is_client_error() {
                    warn!(error = %e, "Rejected request");
                } else {
                    error!(error = %e, "Request failed");
                }
                error_document(&e)
            }
        };
        frame(document)
    }

    async fn dispatch(&self, body: &[u8]) -> Result<String> {
        let request = Request::parse(body)?;
        debug!(request = ?request, "Request");
        let document = match request {
            Request::Status => serde_json::to_string(&self.status())?,
            Request::Counts {
                study,
                criteria,
                cell_ids,
            } => serde_json::to_string(&self.counts(&study, criteria, cell_ids.as_ref())?)?,
            Request::Metric {
                study,
                class,
                criteria,
                radius,
            } => serde_json::to_string(&self.metric(&study, class, criteria, radius).await?)?,
        };
        Ok(document)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Vec<StudyStatus> {
        self.registry
            .iter()
            .map(|(study, entry)| {
                let store = &entry.expressions;
                StudyStatus {
                    study: study.to_string(),
                    counts_by_channel: store
                        .channels()
                        .iter()
                        .zip(store.channel_counts())
                        .map(|(channel, count)| ChannelCount {
                            channel_symbol: channel.clone(),
                            count,
                        })
                        .collect(),
                    total_number_of_cells: store.cell_count() as u64,
                }
            })
            .collect()
    }

    pub fn counts(
        &self,
        study: &str,
        criteria: PhenotypeCriteria,
        cell_ids: Option<&HashSet<u64>>,
    ) -> Result<CountsResponse> {
        let store = &self.registry.get(study)?.expressions;
        let criteria = store.expand_composite(criteria);

        let mut counts = CountsResponse::new();
        for specimen in store.specimens() {
            let result = store.count(&criteria, specimen, cell_ids)?;
            counts.insert(specimen.to_string(), (result.count, result.total));
        }
        Ok(counts)
    }

    /// Known values for a metric, enqueueing every specimen that has neither
    /// a value nor a queue row. The missing specimens go in as one batch.
    pub async fn metric(
        &self,
        study: &str,
        class: FeatureClass,
        criteria: Vec<PhenotypeCriteria>,
        radius: Option<f64>,
    ) -> Result<MetricsResponse> {
        let entry = self.registry.get(study)?;
        let store = &entry.expressions;

        let criteria = criteria
            .into_iter()
            .map(|c| store.expand_composite(c))
            .collect::<Vec<_>>();
        for c in &criteria {
            store.mask_for(c)?;
        }
        let spec = FeatureSpecification::new(class, criteria, radius)?;

        let feature = self
            .specifications
            .resolve(study, &entry.schema, &spec)
            .await?;
        let snapshot = self.queue.snapshot(&entry.schema, feature).await?;

        let mut response = MetricsResponse::default();
        let mut missing = Vec::new();
        for specimen in store.specimens() {
            if let Some(value) = snapshot.values.get(specimen) {
                response
                    .metrics
                    .insert(specimen.to_string(), json_compliant(*value));
            } else if snapshot.queued.contains_key(specimen) {
                // Only abandoned rows will never produce a value. A row on
                // its last retry may still hold a live claim.
                response.pending |= !snapshot.abandoned.contains(specimen);
                response.metrics.insert(specimen.to_string(), None);
            } else {
                missing.push(specimen.to_string());
            }
        }

        let inserted: HashSet<String> = self
            .queue
            .enqueue_all(&entry.schema, study, feature, &missing)
            .await?
            .into_iter()
            .collect();
        let enqueued = inserted.len();
        for specimen in missing {
            let value = if inserted.contains(&specimen) {
                response.pending = true;
                None
            } else {
                // Lost a race: another caller enqueued it or a worker
                // finished it since the snapshot.
                let job = JobReference::new(feature, study, specimen.as_str());
                match self.queue.value(&entry.schema, &job).await? {
                    Some(value) => json_compliant(value),
                    None => {
                        response.pending = true;
                        None
                    }
                }
            };
            response.metrics.insert(specimen, value);
        }

        info!(
            study,
            feature,
            specification = %spec,
            enqueued,
            pending = response.pending,
            "Metric request"
        );
        Ok(response)
    }
}

async fn read_request(stream: &mut TcpStream, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    stream
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .await?;
    if body.len() > limit {
        return Err(Error::RequestTooLarge { limit });
    }
    Ok(body)
}

fn error_document(e: &Error) -> String {
    let message = if e.is_client_error() {
        e.to_string()
    } else {
        "internal error".to_string()
    };
    serde_json::to_string(&ErrorResponse { error: message })
        .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string())
}

fn frame(document: String) -> Vec<u8> {
    let mut bytes = document.into_bytes();
    bytes.push(END_OF_TRANSMISSION);
    bytes
}
