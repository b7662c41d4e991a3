use spt_common::{FeatureClass, Result};
use spt_expressions::{CriteriaMask, SpecimenView};

use crate::grid::GridIndex;
use crate::kernel::{masks, Kernel};

/// Ratio of the probability that a neighbour (within `radius`) of a
/// first-phenotype cell is a second-phenotype cell, to the probability that
/// any neighbour is.
///
/// Probabilities are taken over ordered pairs of distinct cells at distance
/// at most `radius`.
pub struct CoOccurrence {
    pub radius: f64,
}

impl Kernel for CoOccurrence {
    fn class(&self) -> FeatureClass {
        FeatureClass::CoOccurrence
    }

    fn compute(&self, specimen: &SpecimenView<'_>, phenotypes: &[CriteriaMask]) -> Result<Option<f64>> {
        let [condition, expected] = masks::<2>(self.class(), phenotypes)?;
        let conditioned = specimen.indicator(&condition);
        let target = specimen.indicator(&expected);
        let grid = GridIndex::for_radius(specimen.xy, self.radius);

        let mut pairs = 0u64;
        let mut pairs_to_target = 0u64;
        let mut conditioned_pairs = 0u64;
        let mut conditioned_pairs_to_target = 0u64;

        for i in 0..specimen.len() {
            grid.within(&specimen.xy[i], self.radius, |j| {
                if j == i {
                    return;
                }
                pairs += 1;
                if target[j] {
                    pairs_to_target += 1;
                }
                if conditioned[i] {
                    conditioned_pairs += 1;
                    if target[j] {
                        conditioned_pairs_to_target += 1;
                    }
                }
            });
        }

        if conditioned_pairs == 0 || pairs_to_target == 0 {
            return Ok(None);
        }
        let conditional = conditioned_pairs_to_target as f64 / conditioned_pairs as f64;
        let marginal = pairs_to_target as f64 / pairs as f64;
        Ok(Some(conditional / marginal))
    }
}
