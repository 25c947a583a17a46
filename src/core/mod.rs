//! # Core Types
//!
//! Hardware-independent vocabulary of the probe pipeline.
//!
//! - **[`key`]:** Cache identity (device/graph fingerprint + serialized candidate).
//! - **[`options`]:** Compile options and their probe-time sanitization.
//! - **[`module`]:** Graph regions and the kernel modules rewrites produce.
//! - **[`error`]:** The failure taxonomy, including the two expected-negative tags.

pub mod error;
pub mod key;
pub mod module;
pub mod options;

pub use error::DynoError;
pub use key::{Fingerprint, ProbeKey};
pub use module::{GraphRegion, KernelModule, LaunchSpec};
pub use options::CompileOptions;
