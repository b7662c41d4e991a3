use std::collections::BTreeMap;

use spt_common::{Error, PhenotypeCriteria, Result};
use tracing::debug;

use crate::codec::{assemble_cells, decode_centroids, decode_feature_matrix, ExpressionsIndex};
use crate::store::StudyExpressions;

pub const EXPRESSIONS_INDEX: &str = "expressions_index";
pub const FEATURE_MATRIX: &str = "feature_matrix";
pub const CENTROIDS: &str = "centroids";
pub const COMPOSITE_PHENOTYPES: &str = "composite_phenotypes";

/// Collects a study's blobs in any order and assembles the store once all
/// have arrived.
#[derive(Default)]
pub struct StudyBlobs {
    index: Option<ExpressionsIndex>,
    composites: BTreeMap<String, PhenotypeCriteria>,
    matrices: BTreeMap<String, Vec<u8>>,
    centroids: BTreeMap<String, Vec<u8>>,
}

impl StudyBlobs {
    pub fn add(&mut self, specimen: &str, blob_type: &str, contents: Vec<u8>) -> Result<()> {
        match blob_type {
            EXPRESSIONS_INDEX => {
                self.index = Some(serde_json::from_slice(&contents)?);
            }
            COMPOSITE_PHENOTYPES => {
                self.composites = serde_json::from_slice(&contents)?;
            }
            FEATURE_MATRIX => {
                self.matrices.insert(specimen.to_string(), contents);
            }
            CENTROIDS => {
                self.centroids.insert(specimen.to_string(), contents);
            }
            other => {
                debug!(blob_type = other, specimen, "Ignoring unrecognized blob");
            }
        }
        Ok(())
    }

    pub fn into_store(mut self, study: &str) -> Result<StudyExpressions> {
        let index = self
            .index
            .ok_or_else(|| Error::Corrupt(format!("{study} has no {EXPRESSIONS_INDEX} blob")))?;
        let mut builder = StudyExpressions::builder(study, index.channel_order()?);

        for (specimen, matrix) in self.matrices {
            let centroids = self.centroids.remove(&specimen).ok_or_else(|| {
                Error::Corrupt(format!("specimen {specimen:?} in {study} has no {CENTROIDS} blob"))
            })?;
            let cells = assemble_cells(
                &decode_feature_matrix(&matrix)?,
                &decode_centroids(&centroids)?,
            )?;
            builder = builder.specimen(specimen, cells);
        }

        if let Some(orphan) = self.centroids.keys().next() {
            return Err(Error::Corrupt(format!(
                "specimen {orphan:?} in {study} has centroids but no {FEATURE_MATRIX}"
            )));
        }

        for (name, criteria) in self.composites {
            builder = builder.composite(name, criteria);
        }

        builder.build()
    }
}
