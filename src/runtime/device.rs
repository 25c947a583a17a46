use crate::core::{DynoError, KernelModule};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Non-owning view of caller-owned device memory. The probe pipeline never
/// frees a span it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpan {
    pub addr: u64,
    pub size: usize,
}

impl DeviceSpan {
    pub fn new(addr: u64, size: usize) -> Self {
        Self { addr, size }
    }
}

impl fmt::Display for DeviceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}+{}", self.addr, self.size)
    }
}

/// One artifact input, bound by parameter position. Artifacts never alias
/// inputs to outputs, so the memory stays borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionInput {
    pub span: DeviceSpan,
}

impl ExecutionInput {
    pub fn borrowed(span: DeviceSpan) -> Self {
        Self { span }
    }
}

/// Output of one artifact run. Owns its device allocation and hands it back
/// to the allocator on drop.
pub struct ExecutionOutput {
    span: DeviceSpan,
    allocator: Arc<dyn DeviceAllocator>,
}

impl ExecutionOutput {
    pub fn new(span: DeviceSpan, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self { span, allocator }
    }

    pub fn span(&self) -> DeviceSpan {
        self.span
    }
}

impl Drop for ExecutionOutput {
    fn drop(&mut self) {
        self.allocator.deallocate(self.span);
    }
}

impl fmt::Debug for ExecutionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOutput")
            .field("span", &self.span)
            .finish()
    }
}

/// Per-run handles an artifact needs from the harness.
pub struct RunContext<'a> {
    pub stream: &'a dyn DeviceStream,
    pub allocator: &'a Arc<dyn DeviceAllocator>,
    pub device_ordinal: u32,
    /// Serialize this run against all other work on the device. Set for both
    /// warmup and timed probe runs; contention pollutes the measurement.
    pub exclusive_device: bool,
}

/// Backend compiler contract. Compiles one candidate-specialized module for
/// the target device.
///
/// `ResourceExhausted` from here is an expected negative (the device lacks
/// the on-chip resources the module asks for) and is absorbed by the probe
/// pipeline; any other error aborts the sweep.
pub trait Compiler: Send + Sync {
    fn compile(&self, module: KernelModule) -> Result<Box<dyn Artifact>, DynoError>;
}

/// A compiled, runnable kernel for one specific device.
pub trait Artifact: Send + Sync {
    /// Declared input parameters, in bind order.
    fn param_count(&self) -> usize;

    fn run(
        &self,
        ctx: &RunContext<'_>,
        inputs: &[ExecutionInput],
    ) -> Result<ExecutionOutput, DynoError>;
}

impl fmt::Debug for dyn Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("param_count", &self.param_count())
            .finish()
    }
}

/// Device work queue owned by one tuning worker.
pub trait DeviceStream: Send + Sync {
    /// Block the host until every op enqueued so far has retired.
    fn block_until_idle(&self) -> Result<(), DynoError>;

    /// Start a device-side timer on this stream. Device-side, not host
    /// wall-clock: host scheduling jitter must not leak into measurements.
    fn start_timer(&self) -> Result<Box<dyn DeviceTimer>, DynoError>;

    /// Copy `src.size` bytes into `dst`. `dst` must be at least as large.
    fn copy_device_to_device(&self, src: DeviceSpan, dst: DeviceSpan) -> Result<(), DynoError>;
}

/// Running device timer. Stopping consumes it.
pub trait DeviceTimer: Send {
    fn stop(self: Box<Self>) -> Result<Duration, DynoError>;
}

pub trait DeviceAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DeviceSpan, DynoError>;
    fn deallocate(&self, span: DeviceSpan);
}
