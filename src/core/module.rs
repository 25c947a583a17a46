use super::options::CompileOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchSpec {
    pub fn linear(grid_x: u32, block_x: u32) -> Self {
        Self {
            grid: (grid_x, 1, 1),
            block: (block_x, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self::linear(1, 1)
    }
}

/// The unit being tuned: a named region of the surrounding computation graph
/// plus the compile options candidate builds inherit. The region's graph
/// payload stays with the caller; the rewrite callback closes over it.
#[derive(Debug, Clone)]
pub struct GraphRegion {
    pub name: String,
    pub options: CompileOptions,
}

impl GraphRegion {
    pub fn new(name: &str, options: CompileOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
        }
    }
}

/// A candidate-specialized translation unit, ready for the backend compiler.
/// Produced by the rewrite callback; `options` is stamped by the probe
/// pipeline before the compiler sees it.
///
/// Regions are statically shaped, so the rewrite declares the input arity and
/// output byte size up front. Backends size the output allocation from the
/// declaration rather than from anything observed at run time.
#[derive(Debug, Clone)]
pub struct KernelModule {
    pub entry_point: String,
    pub source: String,
    pub launch: LaunchSpec,
    pub input_arity: usize,
    pub output_bytes: usize,
    pub options: CompileOptions,
}

impl KernelModule {
    pub fn new(
        entry_point: &str,
        source: &str,
        launch: LaunchSpec,
        input_arity: usize,
        output_bytes: usize,
    ) -> Self {
        Self {
            entry_point: entry_point.to_string(),
            source: source.to_string(),
            launch,
            input_arity,
            output_bytes,
            options: CompileOptions::default(),
        }
    }
}
