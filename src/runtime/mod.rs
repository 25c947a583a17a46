pub mod cache;
pub mod compile;
pub mod device;
pub mod exec;
pub mod harness;

pub use cache::{CacheEntry, CacheStats, CompileCache};
pub use compile::compile_candidate;
pub use device::{
    Artifact, Compiler, DeviceAllocator, DeviceSpan, DeviceStream, DeviceTimer, ExecutionInput,
    ExecutionOutput, RunContext,
};
pub use exec::{bind_inputs, execute};
pub use harness::{Harness, ProbeReport};
