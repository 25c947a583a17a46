//! Device backends implementing the collaborator traits in `runtime::device`.
//!
//! The simulator is always compiled and backs the test suite; CUDA is opt-in
//! behind the `cuda` feature.

pub mod sim;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use sim::{SimCompiler, SimDevice};

#[cfg(feature = "cuda")]
pub use cuda::{CudaCompiler, CudaContext};
