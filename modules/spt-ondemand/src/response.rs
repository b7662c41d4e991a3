//! JSON documents returned by the metrics service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Specimen name to `[matching, total]`.
pub type CountsResponse = BTreeMap<String, (u64, u64)>;

/// Known values for an asynchronous metric. A specimen maps to `null` while
/// its job is outstanding or when its value is known to be missing; `pending`
/// tells the two apart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: BTreeMap<String, Option<f64>>,
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    pub channel_symbol: String,
    pub count: u64,
}

/// One entry of the status document answered to an empty request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyStatus {
    pub study: String,
    #[serde(rename = "counts by channel")]
    pub counts_by_channel: Vec<ChannelCount>,
    #[serde(rename = "total number of cells")]
    pub total_number_of_cells: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
