//! Client for the metrics service, used by the HTTP API.

use std::collections::HashSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use spt_common::{Error, FeatureClass, PhenotypeCriteria, Result, ServiceAddress};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::{Request, END_OF_TRANSMISSION};
use crate::response::{CountsResponse, MetricsResponse, StudyStatus};

#[derive(Debug, Clone)]
pub struct MetricsClient {
    address: ServiceAddress,
    timeout: Duration,
}

impl MetricsClient {
    pub fn new(address: ServiceAddress) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(60),
        }
    }

    /// Address from `ONDEMAND_HOST` / `ONDEMAND_PORT`, or the `<SERVICE>_`
    /// overrides.
    pub fn from_env(service: Option<&str>) -> Result<Self> {
        Ok(Self::new(ServiceAddress::from_env(service)?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn counts(
        &self,
        study: &str,
        criteria: PhenotypeCriteria,
        cell_ids: Option<HashSet<u64>>,
    ) -> Result<CountsResponse> {
        self.call(&Request::Counts {
            study: study.to_string(),
            criteria,
            cell_ids,
        })
        .await
    }

    pub async fn metric(
        &self,
        study: &str,
        class: FeatureClass,
        criteria: Vec<PhenotypeCriteria>,
        radius: Option<f64>,
    ) -> Result<MetricsResponse> {
        self.call(&Request::Metric {
            study: study.to_string(),
            class,
            criteria,
            radius,
        })
        .await
    }

    pub async fn status(&self) -> Result<Vec<StudyStatus>> {
        self.call(&Request::Status).await
    }

    async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let document = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| Error::Remote(format!("no response within {:?}", self.timeout)))??;
        parse_document(&document)
    }

    /// Send one request and read the response up to EOT.
    async fn exchange(&self, request: &Request) -> Result<Vec<u8>> {
        let addr = self.address.socket_addr();
        let mut stream = TcpStream::connect(&addr).await?;
        debug!(addr = addr.as_str(), "Connected to metrics service");

        stream.write_all(&request.encode()).await?;
        stream.shutdown().await?;

        let mut reader = BufReader::new(stream);
        let mut document = Vec::new();
        reader.read_until(END_OF_TRANSMISSION, &mut document).await?;
        if document.pop() != Some(END_OF_TRANSMISSION) {
            return Err(Error::Remote("response ended before end of transmission".into()));
        }
        Ok(document)
    }
}

/// Decode a response document, turning an `{"error": ..}` document into
/// [`Error::Remote`].
pub fn parse_document<T: DeserializeOwned>(document: &[u8]) -> Result<T> {
    let value: Value = serde_json::from_slice(document)?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(Error::Remote(message.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_documents_become_remote_errors() {
        let err = parse_document::<MetricsResponse>(br#"{"error":"Unknown study: X"}"#).unwrap_err();
        assert!(matches!(err, Error::Remote(message) if message == "Unknown study: X"));
    }

    #[test]
    fn specimen_named_error_is_not_an_error_document() {
        let counts: CountsResponse = parse_document(br#"{"error":[1,2]}"#).unwrap();
        assert_eq!(counts["error"], (1, 2));
    }

    #[test]
    fn metrics_documents_decode() {
        let response: MetricsResponse =
            parse_document(br#"{"metrics":{"spec1":null,"spec2":0.5},"pending":true}"#).unwrap();
        assert!(response.pending);
        assert_eq!(response.metrics["spec1"], None);
        assert_eq!(response.metrics["spec2"], Some(0.5));
    }
}
