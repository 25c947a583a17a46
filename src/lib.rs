//! # Dyno: Compile-Execute-Profile Cache for Kernel Autotuning 🏛️
//!
//! Dyno is the measurement core of a GPU autotuner. Given a candidate
//! configuration for a graph region, it compiles the candidate (or fetches
//! the artifact from a process-wide cache), runs it once to warm the device,
//! then runs it again under a device-side timer and reports the elapsed time.
//! Candidates that are structurally uncompilable or exceed on-chip resources
//! produce "no measurement" rather than an error, so a sweep over thousands
//! of configurations survives its expected rejections.
//!
//! ## Core Modules
//!
//! - **[`core`]**: Probe keys, kernel modules, compile options, and the error taxonomy.
//! - **[`runtime`]**: The compilation cache, backend invocation, execution driver, and probe harness.
//! - **[`backend`]**: Device backends: a host-memory simulator, and CUDA behind the `cuda` feature.
//!
//! ## Features
//!
//! - `cuda`: Enables the `cudarc`-based CUDA backend (NVRTC + raw driver API).

pub mod backend;
pub mod core;
pub mod runtime;

pub use crate::core::error::DynoError;
pub use crate::core::key::{Fingerprint, ProbeKey};
pub use crate::core::module::{GraphRegion, KernelModule, LaunchSpec};
pub use crate::core::options::CompileOptions;
pub use crate::runtime::cache::{CacheStats, CompileCache};
pub use crate::runtime::device::{
    Artifact, Compiler, DeviceAllocator, DeviceSpan, DeviceStream, DeviceTimer, ExecutionInput,
    ExecutionOutput, RunContext,
};
pub use crate::runtime::harness::{Harness, ProbeReport};
pub use crate::backend::{SimCompiler, SimDevice};
