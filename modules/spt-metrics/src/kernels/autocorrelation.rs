use spt_common::{FeatureClass, Result};
use spt_expressions::{CriteriaMask, SpecimenView};

use crate::kernel::{masks, Kernel};
use crate::neighbors::NeighborGraph;

/// Moran's I of the phenotype indicator over the kNN graph, with binary
/// weights.
pub struct SpatialAutocorrelation {
    pub neighbors: usize,
}

impl Kernel for SpatialAutocorrelation {
    fn class(&self) -> FeatureClass {
        FeatureClass::SpatialAutocorrelation
    }

    fn compute(&self, specimen: &SpecimenView<'_>, phenotypes: &[CriteriaMask]) -> Result<Option<f64>> {
        let [phenotype] = masks::<1>(self.class(), phenotypes)?;
        let n = specimen.len();
        if n < 2 {
            return Ok(None);
        }

        let values: Vec<f64> = specimen
            .indicator(&phenotype)
            .into_iter()
            .map(|hit| if hit { 1.0 } else { 0.0 })
            .collect();
        let mean = values.iter().sum::<f64>() / n as f64;
        let deviations: Vec<f64> = values.iter().map(|v| v - mean).collect();
        let spread: f64 = deviations.iter().map(|d| d * d).sum();
        if spread == 0.0 {
            return Ok(None);
        }

        let graph = NeighborGraph::knn(specimen.xy, self.neighbors);
        let total_weight = graph.edge_count() as f64;
        if total_weight == 0.0 {
            return Ok(None);
        }
        let cross: f64 = graph
            .edges()
            .map(|(i, j)| deviations[i] * deviations[j])
            .sum();

        Ok(Some((n as f64 / total_weight) * cross / spread))
    }
}
