use spt_common::{FeatureClass, Result};
use spt_expressions::store::count_masked;
use spt_expressions::{CriteriaMask, SpecimenView};

use crate::kernel::{masks, Kernel};

/// Number of cells matching the phenotype.
pub struct Count;

impl Kernel for Count {
    fn class(&self) -> FeatureClass {
        FeatureClass::Count
    }

    fn compute(&self, specimen: &SpecimenView<'_>, phenotypes: &[CriteriaMask]) -> Result<Option<f64>> {
        let [mask] = masks::<1>(self.class(), phenotypes)?;
        Ok(Some(count_masked(specimen, &mask, None).count as f64))
    }
}
