//! Binary and JSON blob formats for persisted expression data.
//!
//! - `feature_matrix`: 16 bytes per cell, `u64` LE cell id then `u64` LE
//!   channel mask (bit `i` set means positive for channel `i`).
//! - `centroids`: 16 bytes per cell, `u64` LE cell id, `f32` LE x, `f32` LE y.
//! - `expressions_index`: JSON describing the channel order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use spt_common::{Error, Result};

use crate::store::{Cell, Point, MAX_CHANNELS};

const RECORD_BYTES: usize = 16;

pub fn decode_feature_matrix(bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
    records(bytes, "feature matrix").map(|chunks| {
        chunks
            .map(|chunk| (read_u64(&chunk[0..8]), read_u64(&chunk[8..16])))
            .collect()
    })
}

pub fn encode_feature_matrix(rows: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rows.len() * RECORD_BYTES);
    for (id, mask) in rows {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&mask.to_le_bytes());
    }
    out
}

pub fn decode_centroids(bytes: &[u8]) -> Result<Vec<(u64, Point)>> {
    records(bytes, "centroids").map(|chunks| {
        chunks
            .map(|chunk| {
                let id = read_u64(&chunk[0..8]);
                let x = read_f32(&chunk[8..12]);
                let y = read_f32(&chunk[12..16]);
                (id, Point::new(f64::from(x), f64::from(y)))
            })
            .collect()
    })
}

pub fn encode_centroids(points: &[(u64, Point)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * RECORD_BYTES);
    for (id, point) in points {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(point.x as f32).to_le_bytes());
        out.extend_from_slice(&(point.y as f32).to_le_bytes());
    }
    out
}

/// Join a specimen's feature matrix with its centroids by cell id, keeping the
/// matrix order.
pub fn assemble_cells(matrix: &[(u64, u64)], centroids: &[(u64, Point)]) -> Result<Vec<Cell>> {
    if matrix.len() != centroids.len() {
        return Err(Error::Corrupt(format!(
            "feature matrix has {} cells but centroids have {}",
            matrix.len(),
            centroids.len()
        )));
    }
    let positions: HashMap<u64, Point> = centroids.iter().copied().collect();
    matrix
        .iter()
        .map(|&(id, mask)| {
            positions
                .get(&id)
                .map(|&xy| Cell { id, mask, xy })
                .ok_or_else(|| Error::Corrupt(format!("cell {id} has no centroid")))
        })
        .collect()
}

fn records<'a>(
    bytes: &'a [u8],
    what: &str,
) -> Result<impl Iterator<Item = &'a [u8]> + 'a> {
    if bytes.len() % RECORD_BYTES != 0 {
        return Err(Error::Corrupt(format!(
            "{what} blob length {} is not a multiple of {RECORD_BYTES}",
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(RECORD_BYTES))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_f32(bytes: &[u8]) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    f32::from_le_bytes(buf)
}

// ---------------------------------------------------------------------------
// expressions_index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionsIndex {
    #[serde(rename = "")]
    pub entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "specimen measurement study name")]
    pub measurement_study: String,
    #[serde(rename = "target index lookup")]
    pub target_index_lookup: BTreeMap<String, usize>,
    #[serde(rename = "target by symbol")]
    pub target_by_symbol: BTreeMap<String, String>,
}

impl ExpressionsIndex {
    /// Single-entry index for a channel list in column order. Targets and
    /// symbols are the same names.
    pub fn for_channels(measurement_study: &str, channels: &[String]) -> Self {
        let entry = IndexEntry {
            measurement_study: measurement_study.to_string(),
            target_index_lookup: channels
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect(),
            target_by_symbol: channels.iter().map(|n| (n.clone(), n.clone())).collect(),
        };
        Self {
            entries: vec![entry],
        }
    }

    /// Channel symbols in column order.
    pub fn channel_order(&self) -> Result<Vec<String>> {
        let entry = match self.entries.as_slice() {
            [entry] => entry,
            [] => return Err(Error::Corrupt("expressions index is empty".into())),
            _ => {
                return Err(Error::Corrupt(format!(
                    "expressions index has {} measurement studies, expected one",
                    self.entries.len()
                )))
            }
        };

        let count = entry.target_by_symbol.len();
        if count > MAX_CHANNELS {
            return Err(Error::Corrupt(format!(
                "{count} channels exceed the {MAX_CHANNELS}-bit row width"
            )));
        }

        let mut slots: Vec<Option<String>> = vec![None; count];
        for (symbol, target) in &entry.target_by_symbol {
            let index = *entry.target_index_lookup.get(target).ok_or_else(|| {
                Error::Corrupt(format!("target {target:?} has no column index"))
            })?;
            let slot = slots.get_mut(index).ok_or_else(|| {
                Error::Corrupt(format!("column index {index} out of range for {count} channels"))
            })?;
            if slot.is_some() {
                return Err(Error::Corrupt(format!("column index {index} assigned twice")));
            }
            *slot = Some(symbol.clone());
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| Error::Corrupt(format!("column {i} has no channel"))))
            .collect()
    }
}
