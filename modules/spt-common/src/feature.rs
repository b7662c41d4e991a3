//! Feature classes and feature specifications.
//!
//! A specification is persisted as a derivation method (the class handle)
//! plus an ordered list of specifier strings. Specifiers are canonical JSON so
//! two logically equal specifications always produce identical rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::phenotype::PhenotypeCriteria;

/// Neighbour count for the kNN graph used by the graph-based metrics.
pub const DEFAULT_NEIGHBORS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureClass {
    Count,
    Proximity,
    NeighborhoodEnrichment,
    CoOccurrence,
    SpatialAutocorrelation,
}

impl FeatureClass {
    pub const ALL: [FeatureClass; 5] = [
        FeatureClass::Count,
        FeatureClass::Proximity,
        FeatureClass::NeighborhoodEnrichment,
        FeatureClass::CoOccurrence,
        FeatureClass::SpatialAutocorrelation,
    ];

    /// Wire verb and persisted derivation method.
    pub fn handle(&self) -> &'static str {
        match self {
            FeatureClass::Count => "count",
            FeatureClass::Proximity => "proximity",
            FeatureClass::NeighborhoodEnrichment => "neighborhood enrichment",
            FeatureClass::CoOccurrence => "co-occurrence",
            FeatureClass::SpatialAutocorrelation => "spatial autocorrelation",
        }
    }

    /// Number of phenotype criteria the class takes.
    pub fn arity(&self) -> usize {
        match self {
            FeatureClass::Count | FeatureClass::SpatialAutocorrelation => 1,
            _ => 2,
        }
    }

    pub fn takes_radius(&self) -> bool {
        matches!(self, FeatureClass::Proximity | FeatureClass::CoOccurrence)
    }

    pub fn uses_neighbor_graph(&self) -> bool {
        matches!(
            self,
            FeatureClass::NeighborhoodEnrichment | FeatureClass::SpatialAutocorrelation
        )
    }
}

impl fmt::Display for FeatureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handle())
    }
}

impl FromStr for FeatureClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FeatureClass::ALL
            .into_iter()
            .find(|class| class.handle() == s)
            .ok_or_else(|| Error::client(format!("unknown feature class \"{s}\"")))
    }
}

/// One persisted parameter of a feature specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specifier {
    Phenotype(PhenotypeCriteria),
    Radius(f64),
    Neighbors(u32),
}

/// A metric identified by class, phenotypes and numeric parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSpecification {
    class: FeatureClass,
    criteria: Vec<PhenotypeCriteria>,
    radius: Option<f64>,
    neighbors: Option<u32>,
}

impl FeatureSpecification {
    /// Validate arity and parameters for `class`. Graph-based classes get the
    /// default neighbour count.
    pub fn new(
        class: FeatureClass,
        criteria: Vec<PhenotypeCriteria>,
        radius: Option<f64>,
    ) -> Result<Self> {
        let neighbors = class.uses_neighbor_graph().then_some(DEFAULT_NEIGHBORS);
        Self::with_parameters(class, criteria, radius, neighbors)
    }

    fn with_parameters(
        class: FeatureClass,
        criteria: Vec<PhenotypeCriteria>,
        radius: Option<f64>,
        neighbors: Option<u32>,
    ) -> Result<Self> {
        if criteria.len() != class.arity() {
            return Err(Error::client(format!(
                "{class} takes {} phenotype(s), got {}",
                class.arity(),
                criteria.len()
            )));
        }
        match (class.takes_radius(), radius) {
            (true, Some(r)) if r.is_finite() && r > 0.0 => {}
            (true, Some(r)) => {
                return Err(Error::client(format!("radius must be positive, got {r}")))
            }
            (true, None) => return Err(Error::client(format!("{class} requires a radius"))),
            (false, Some(_)) => {
                return Err(Error::client(format!("{class} does not take a radius")))
            }
            (false, None) => {}
        }
        match (class.uses_neighbor_graph(), neighbors) {
            (true, Some(k)) if k > 0 => {}
            (true, _) => {
                return Err(Error::client(format!(
                    "{class} requires a positive neighbour count"
                )))
            }
            (false, Some(_)) => {
                return Err(Error::client(format!(
                    "{class} does not take a neighbour count"
                )))
            }
            (false, None) => {}
        }

        Ok(Self {
            class,
            criteria,
            radius,
            neighbors,
        })
    }

    pub fn class(&self) -> FeatureClass {
        self.class
    }

    pub fn criteria(&self) -> &[PhenotypeCriteria] {
        &self.criteria
    }

    pub fn radius(&self) -> Option<f64> {
        self.radius
    }

    pub fn neighbors(&self) -> Option<u32> {
        self.neighbors
    }

    /// Canonical specifier strings in persisted order: phenotypes first, then
    /// radius, then neighbour count.
    pub fn specifiers(&self) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(self.criteria.len() + 2);
        for criteria in &self.criteria {
            out.push(serde_json::to_string(&Specifier::Phenotype(criteria.clone()))?);
        }
        if let Some(radius) = self.radius {
            out.push(serde_json::to_string(&Specifier::Radius(radius))?);
        }
        if let Some(k) = self.neighbors {
            out.push(serde_json::to_string(&Specifier::Neighbors(k))?);
        }
        Ok(out)
    }

    /// Rebuild a specification from its persisted derivation method and
    /// specifiers.
    pub fn from_persisted<S: AsRef<str>>(derivation_method: &str, specifiers: &[S]) -> Result<Self> {
        let class: FeatureClass = derivation_method
            .parse()
            .map_err(|_| Error::Corrupt(format!("unknown derivation method {derivation_method:?}")))?;

        let mut criteria = Vec::new();
        let mut radius = None;
        let mut neighbors = None;
        for raw in specifiers {
            match serde_json::from_str::<Specifier>(raw.as_ref())? {
                Specifier::Phenotype(c) => criteria.push(c),
                Specifier::Radius(r) => radius = Some(r),
                Specifier::Neighbors(k) => neighbors = Some(k),
            }
        }

        Self::with_parameters(class, criteria, radius, neighbors)
            .map_err(|e| Error::Corrupt(format!("stored specification is invalid: {e}")))
    }
}

impl fmt::Display for FeatureSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        for criteria in &self.criteria {
            write!(f, " [{criteria}]")?;
        }
        if let Some(r) = self.radius {
            write!(f, " r={r}")?;
        }
        Ok(())
    }
}

/// JSON has no NaN or infinity; those become null.
pub fn json_compliant(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}
