//! Per-study, bit-packed cell expression data and the registry that holds it
//! for the lifetime of a process.

pub mod blobs;
pub mod codec;
pub mod db;
pub mod directory;
pub mod registry;
pub mod store;

pub use registry::{ExpressionSource, StudyEntry, StudyRegistry};
pub use store::{
    Cell, CountResult, CriteriaMask, Point, SpecimenView, StudyExpressions,
    StudyExpressionsBuilder,
};
