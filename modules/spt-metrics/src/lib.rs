//! Metric kernels over a study's expression store.
//!
//! Every kernel is a pure function of one specimen's cells and the resolved
//! phenotype masks. Results that are undefined for the input (no cells of the
//! conditioning phenotype, zero variance) are `None`, never a numeric
//! stand-in. Randomised kernels use a fixed seed.

pub mod grid;
pub mod kernel;
pub mod kernels;
pub mod neighbors;

pub use grid::GridIndex;
pub use kernel::{evaluate, kernel_for, Kernel};
pub use neighbors::NeighborGraph;
