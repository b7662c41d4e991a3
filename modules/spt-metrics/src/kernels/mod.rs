mod autocorrelation;
mod cooccurrence;
mod count;
mod enrichment;
mod proximity;

pub use autocorrelation::SpatialAutocorrelation;
pub use cooccurrence::CoOccurrence;
pub use count::Count;
pub use enrichment::NeighborhoodEnrichment;
pub use proximity::Proximity;
