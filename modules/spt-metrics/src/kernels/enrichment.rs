use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use spt_common::{FeatureClass, Result};
use spt_expressions::{CriteriaMask, SpecimenView};

use crate::kernel::{masks, Kernel};
use crate::neighbors::NeighborGraph;

pub const DEFAULT_PERMUTATIONS: usize = 1000;
pub const DEFAULT_SEED: u64 = 1_618_033;

/// Permutation z-score of the number of graph edges running from a
/// first-phenotype cell to a second-phenotype cell.
///
/// Each permutation shuffles phenotype labels across cells, keeping both
/// label counts and their overlap fixed.
pub struct NeighborhoodEnrichment {
    pub neighbors: usize,
    pub permutations: usize,
    pub seed: u64,
}

impl NeighborhoodEnrichment {
    pub fn new(neighbors: usize) -> Self {
        Self {
            neighbors,
            permutations: DEFAULT_PERMUTATIONS,
            seed: DEFAULT_SEED,
        }
    }
}

impl Kernel for NeighborhoodEnrichment {
    fn class(&self) -> FeatureClass {
        FeatureClass::NeighborhoodEnrichment
    }

    fn compute(&self, specimen: &SpecimenView<'_>, phenotypes: &[CriteriaMask]) -> Result<Option<f64>> {
        let [first, second] = masks::<2>(self.class(), phenotypes)?;
        let from = specimen.indicator(&first);
        let to = specimen.indicator(&second);
        if !from.contains(&true) || !to.contains(&true) || self.permutations < 2 {
            return Ok(None);
        }

        let graph = NeighborGraph::knn(specimen.xy, self.neighbors);
        let edges: Vec<(usize, usize)> = graph.edges().collect();
        let observed = edges.iter().filter(|&&(i, j)| from[i] && to[j]).count() as f64;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut labels: Vec<usize> = (0..specimen.len()).collect();
        let mut samples = Vec::with_capacity(self.permutations);
        for _ in 0..self.permutations {
            labels.shuffle(&mut rng);
            let count = edges
                .iter()
                .filter(|&&(i, j)| from[labels[i]] && to[labels[j]])
                .count();
            samples.push(count as f64);
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let deviation = variance.sqrt();
        if deviation == 0.0 {
            return Ok(None);
        }
        Ok(Some((observed - mean) / deviation))
    }
}
