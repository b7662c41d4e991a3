use spt_common::{json_compliant, Error, FeatureClass, FeatureSpecification, Result};
use spt_expressions::{CriteriaMask, SpecimenView, StudyExpressions};
use tracing::debug;

use crate::kernels::{
    CoOccurrence, Count, NeighborhoodEnrichment, Proximity, SpatialAutocorrelation,
};

/// A metric computed per specimen.
pub trait Kernel: Send + Sync {
    fn class(&self) -> FeatureClass;

    /// `Ok(None)` when the metric is undefined for this specimen.
    fn compute(
        &self,
        specimen: &SpecimenView<'_>,
        phenotypes: &[CriteriaMask],
    ) -> Result<Option<f64>>;
}

pub fn kernel_for(spec: &FeatureSpecification) -> Result<Box<dyn Kernel>> {
    let radius = || {
        spec.radius()
            .ok_or_else(|| Error::Corrupt(format!("{} specification has no radius", spec.class())))
    };
    let neighbors = || {
        spec.neighbors()
            .map(|k| k as usize)
            .ok_or_else(|| Error::Corrupt(format!("{} specification has no neighbour count", spec.class())))
    };

    let kernel: Box<dyn Kernel> = match spec.class() {
        FeatureClass::Count => Box::new(Count),
        FeatureClass::Proximity => Box::new(Proximity { radius: radius()? }),
        FeatureClass::CoOccurrence => Box::new(CoOccurrence { radius: radius()? }),
        FeatureClass::NeighborhoodEnrichment => {
            Box::new(NeighborhoodEnrichment::new(neighbors()?))
        }
        FeatureClass::SpatialAutocorrelation => Box::new(SpatialAutocorrelation {
            neighbors: neighbors()?,
        }),
    };
    Ok(kernel)
}

/// Compute `spec` on one specimen. Non-finite results come back as `None`.
pub fn evaluate(
    store: &StudyExpressions,
    spec: &FeatureSpecification,
    specimen: &str,
) -> Result<Option<f64>> {
    let view = store.specimen(specimen)?;
    let masks = spec
        .criteria()
        .iter()
        .map(|criteria| store.mask_for(criteria))
        .collect::<Result<Vec<_>>>()?;
    let kernel = kernel_for(spec)?;
    debug!(specimen, specification = %spec, cells = view.len(), "Evaluating");
    let value = kernel.compute(&view, &masks)?;
    if value.is_some_and(|v| !v.is_finite()) {
        debug!(specimen, specification = %spec, value = ?value, "Non-finite result; recording no value");
    }
    Ok(json_compliant(value))
}

/// Destructure exactly `N` masks.
pub(crate) fn masks<const N: usize>(
    class: FeatureClass,
    phenotypes: &[CriteriaMask],
) -> Result<[CriteriaMask; N]> {
    phenotypes.try_into().map_err(|_| {
        Error::InvariantViolation(format!(
            "{class} takes {N} phenotype(s), got {}",
            phenotypes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spt_common::PhenotypeCriteria;
    use spt_expressions::{Cell, Point};

    fn store() -> StudyExpressions {
        let cell = |id: u64, x: f64, mask: u64| Cell {
            id,
            mask,
            xy: Point::new(x, 0.0),
        };
        StudyExpressions::builder("S", vec!["CD3".into(), "CD20".into()])
            .specimen("spec1", vec![cell(1, 0.0, 0b01), cell(2, 50.0, 0b10), cell(3, 500.0, 0b10)])
            .specimen("spec2", vec![cell(4, 0.0, 0b10), cell(5, 1.0, 0b10)])
            .build()
            .unwrap()
    }

    fn positive(name: &str) -> PhenotypeCriteria {
        PhenotypeCriteria::new([name], Vec::<&str>::new()).unwrap()
    }

    #[test]
    fn proximity_through_the_store() {
        let spec = FeatureSpecification::new(
            FeatureClass::Proximity,
            vec![positive("CD3"), positive("CD20")],
            Some(100.0),
        )
        .unwrap();
        assert_eq!(evaluate(&store(), &spec, "spec1").unwrap(), Some(1.0));
        assert_eq!(evaluate(&store(), &spec, "spec2").unwrap(), None);
    }

    #[test]
    fn count_through_the_store() {
        let spec =
            FeatureSpecification::new(FeatureClass::Count, vec![positive("CD20")], None).unwrap();
        assert_eq!(evaluate(&store(), &spec, "spec1").unwrap(), Some(2.0));
    }

    #[test]
    fn unknown_specimen_is_an_error() {
        let spec =
            FeatureSpecification::new(FeatureClass::Count, vec![positive("CD20")], None).unwrap();
        assert!(evaluate(&store(), &spec, "spec9").is_err());
    }

    #[test]
    fn every_class_has_a_kernel() {
        let two = vec![positive("CD3"), positive("CD20")];
        let specs = [
            FeatureSpecification::new(FeatureClass::Count, vec![positive("CD3")], None),
            FeatureSpecification::new(FeatureClass::Proximity, two.clone(), Some(10.0)),
            FeatureSpecification::new(FeatureClass::CoOccurrence, two.clone(), Some(10.0)),
            FeatureSpecification::new(FeatureClass::NeighborhoodEnrichment, two, None),
            FeatureSpecification::new(FeatureClass::SpatialAutocorrelation, vec![positive("CD3")], None),
        ];
        for spec in specs {
            let spec = spec.unwrap();
            assert_eq!(kernel_for(&spec).unwrap().class(), spec.class());
        }
    }

    #[test]
    fn wrong_mask_count_is_rejected() {
        let err = masks::<2>(FeatureClass::Proximity, &[CriteriaMask::default()]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
