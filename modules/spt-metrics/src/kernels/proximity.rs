use spt_common::{FeatureClass, Result};
use spt_expressions::{CriteriaMask, SpecimenView};

use crate::grid::GridIndex;
use crate::kernel::{masks, Kernel};

/// Mean number of second-phenotype cells within `radius` of each
/// first-phenotype cell. A cell never counts as its own neighbour.
pub struct Proximity {
    pub radius: f64,
}

impl Kernel for Proximity {
    fn class(&self) -> FeatureClass {
        FeatureClass::Proximity
    }

    fn compute(&self, specimen: &SpecimenView<'_>, phenotypes: &[CriteriaMask]) -> Result<Option<f64>> {
        let [source, target] = masks::<2>(self.class(), phenotypes)?;
        let grid = GridIndex::for_radius(specimen.xy, self.radius);

        let mut sources = 0u64;
        let mut neighbours = 0u64;
        for (i, &row) in specimen.rows.iter().enumerate() {
            if !source.matches(row) {
                continue;
            }
            sources += 1;
            grid.within(&specimen.xy[i], self.radius, |j| {
                if j != i && target.matches(specimen.rows[j]) {
                    neighbours += 1;
                }
            });
        }

        if sources == 0 {
            return Ok(None);
        }
        Ok(Some(neighbours as f64 / sources as f64))
    }
}
