//! Host-memory device for running the probe pipeline without a GPU.
//!
//! Heap allocations stand in for device buffers, kernels are interpreted by
//! entry point name, and the timer is host-side. Semantics match the real
//! backends: a shared-memory budget turns oversized candidates into
//! `ResourceExhausted`, and the exclusive-device flag is honored with a
//! device-wide serialization lock.

use crate::core::{DynoError, KernelModule};
use crate::runtime::device::{
    Artifact, Compiler, DeviceAllocator, DeviceSpan, DeviceStream, DeviceTimer, ExecutionInput,
    ExecutionOutput, RunContext,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

fn read_span(span: DeviceSpan) -> Vec<u8> {
    // Sim "device memory" is host memory; spans must reference live allocations.
    unsafe { std::slice::from_raw_parts(span.addr as *const u8, span.size).to_vec() }
}

fn write_span(span: DeviceSpan, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), span.addr as *mut u8, bytes.len());
    }
}

/// Host-heap device: allocator, stream, and timer in one handle. Share it
/// via `Arc` and hand clones to the harness as both stream and allocator.
pub struct SimDevice {
    live: Mutex<HashMap<u64, usize>>,
    exclusive: Mutex<()>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            exclusive: Mutex::new(()),
        }
    }

    /// Allocate a span and fill it with `bytes`.
    pub fn copy_to_device(&self, bytes: &[u8]) -> Result<DeviceSpan, DynoError> {
        let span = self.allocate(bytes.len())?;
        write_span(span, bytes);
        Ok(span)
    }

    pub fn copy_from_device(&self, span: DeviceSpan) -> Vec<u8> {
        read_span(span)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn hold_exclusive(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        self.exclusive.lock().ok()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        // Reclaim whatever tests left behind.
        if let Ok(mut live) = self.live.lock() {
            for (addr, size) in live.drain() {
                unsafe {
                    let slice = std::slice::from_raw_parts_mut(addr as *mut u8, size.max(1));
                    drop(Box::from_raw(slice));
                }
            }
        }
    }
}

impl DeviceAllocator for SimDevice {
    fn allocate(&self, size: usize) -> Result<DeviceSpan, DynoError> {
        let mut block = vec![0u8; size.max(1)].into_boxed_slice();
        let addr = block.as_mut_ptr() as u64;
        std::mem::forget(block);

        self.live
            .lock()
            .map_err(|_| DynoError::Poisoned("sim allocator"))?
            .insert(addr, size);
        Ok(DeviceSpan::new(addr, size))
    }

    fn deallocate(&self, span: DeviceSpan) {
        let mut live = match self.live.lock() {
            Ok(live) => live,
            Err(_) => return,
        };
        if live.remove(&span.addr).is_some() {
            unsafe {
                let slice =
                    std::slice::from_raw_parts_mut(span.addr as *mut u8, span.size.max(1));
                drop(Box::from_raw(slice));
            }
        } else {
            warn!("[SimDevice] deallocate of unknown span {}", span);
        }
    }
}

impl DeviceStream for SimDevice {
    fn block_until_idle(&self) -> Result<(), DynoError> {
        // Sim kernels retire synchronously inside run().
        Ok(())
    }

    fn start_timer(&self) -> Result<Box<dyn DeviceTimer>, DynoError> {
        Ok(Box::new(SimTimer {
            start: Instant::now(),
        }))
    }

    fn copy_device_to_device(&self, src: DeviceSpan, dst: DeviceSpan) -> Result<(), DynoError> {
        if dst.size < src.size {
            return Err(DynoError::Device(format!(
                "d2d copy of {} bytes into {} byte span",
                src.size, dst.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.addr as *const u8, dst.addr as *mut u8, src.size);
        }
        Ok(())
    }
}

struct SimTimer {
    start: Instant,
}

impl DeviceTimer for SimTimer {
    fn stop(self: Box<Self>) -> Result<std::time::Duration, DynoError> {
        Ok(self.start.elapsed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimKernelKind {
    Identity,
    Fill,
    ScaleF32,
    AddF32,
}

impl SimKernelKind {
    fn from_entry_point(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(Self::Identity),
            "fill" => Some(Self::Fill),
            "scale_f32" => Some(Self::ScaleF32),
            "add_f32" => Some(Self::AddF32),
            _ => None,
        }
    }

    fn param_count(self) -> usize {
        match self {
            Self::Fill => 0,
            Self::Identity | Self::ScaleF32 => 1,
            Self::AddF32 => 2,
        }
    }
}

/// Interpreting compiler over a small built-in kernel set, with the same
/// negative-outcome surface as a real JIT: an unknown entry point is a fatal
/// compile error, a module over the shared-memory budget is expected
/// exhaustion. Compile invocations are counted for cache tests.
pub struct SimCompiler {
    device: Arc<SimDevice>,
    shared_mem_budget: u32,
    compiles: AtomicUsize,
}

impl SimCompiler {
    pub fn new(device: Arc<SimDevice>) -> Self {
        Self::with_shared_mem_budget(device, 48 * 1024)
    }

    pub fn with_shared_mem_budget(device: Arc<SimDevice>, budget: u32) -> Self {
        Self {
            device,
            shared_mem_budget: budget,
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl Compiler for SimCompiler {
    fn compile(&self, module: KernelModule) -> Result<Box<dyn Artifact>, DynoError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);

        if module.launch.shared_mem_bytes > self.shared_mem_budget {
            return Err(DynoError::ResourceExhausted(format!(
                "kernel '{}' wants {} bytes of shared memory, device offers {}",
                module.entry_point, module.launch.shared_mem_bytes, self.shared_mem_budget
            )));
        }

        let kind = SimKernelKind::from_entry_point(&module.entry_point).ok_or_else(|| {
            DynoError::Compile(format!("unknown entry point '{}'", module.entry_point))
        })?;

        if module.input_arity != kind.param_count() {
            return Err(DynoError::Compile(format!(
                "'{}' takes {} inputs, module declares {}",
                module.entry_point,
                kind.param_count(),
                module.input_arity
            )));
        }

        debug!(
            "[SimCompiler] compiled '{}' ({} params, {} output bytes)",
            module.entry_point,
            kind.param_count(),
            module.output_bytes
        );
        Ok(Box::new(SimArtifact {
            kind,
            entry_point: module.entry_point,
            output_bytes: module.output_bytes,
            device: self.device.clone(),
        }))
    }
}

struct SimArtifact {
    kind: SimKernelKind,
    entry_point: String,
    output_bytes: usize,
    device: Arc<SimDevice>,
}

impl SimArtifact {
    fn compute(&self, inputs: &[ExecutionInput]) -> Result<Vec<u8>, DynoError> {
        match self.kind {
            SimKernelKind::Identity => Ok(read_span(inputs[0].span)),
            SimKernelKind::Fill => Ok(vec![0x5a; self.output_bytes]),
            SimKernelKind::ScaleF32 => {
                let bytes = read_span(inputs[0].span);
                if bytes.len() % 4 != 0 {
                    return Err(DynoError::Execution(format!(
                        "'{}' input is {} bytes, not f32-shaped",
                        self.entry_point,
                        bytes.len()
                    )));
                }
                let mut out = Vec::with_capacity(bytes.len());
                for chunk in bytes.chunks_exact(4) {
                    let x: f32 = bytemuck::pod_read_unaligned(chunk);
                    out.extend_from_slice(bytemuck::bytes_of(&(x * 2.0)));
                }
                Ok(out)
            }
            SimKernelKind::AddF32 => {
                let a = read_span(inputs[0].span);
                let b = read_span(inputs[1].span);
                if a.len() != b.len() || a.len() % 4 != 0 {
                    return Err(DynoError::Execution(format!(
                        "'{}' inputs are {} and {} bytes",
                        self.entry_point,
                        a.len(),
                        b.len()
                    )));
                }
                let mut out = Vec::with_capacity(a.len());
                for (ca, cb) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
                    let x: f32 = bytemuck::pod_read_unaligned(ca);
                    let y: f32 = bytemuck::pod_read_unaligned(cb);
                    out.extend_from_slice(bytemuck::bytes_of(&(x + y)));
                }
                Ok(out)
            }
        }
    }
}

impl Artifact for SimArtifact {
    fn param_count(&self) -> usize {
        self.kind.param_count()
    }

    fn run(
        &self,
        ctx: &RunContext<'_>,
        inputs: &[ExecutionInput],
    ) -> Result<ExecutionOutput, DynoError> {
        if inputs.len() != self.param_count() {
            return Err(DynoError::Execution(format!(
                "'{}' bound with {} inputs, declares {}",
                self.entry_point,
                inputs.len(),
                self.param_count()
            )));
        }

        let guard = if ctx.exclusive_device {
            self.device.hold_exclusive()
        } else {
            None
        };

        let result = self.compute(inputs)?;
        let span = ctx.allocator.allocate(result.len())?;
        write_span(span, &result);
        drop(guard);

        Ok(ExecutionOutput::new(span, ctx.allocator.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LaunchSpec;

    fn module(entry_point: &str, input_arity: usize, output_bytes: usize) -> KernelModule {
        KernelModule::new(entry_point, "", LaunchSpec::linear(1, 32), input_arity, output_bytes)
    }

    fn run_ctx<'a>(device: &'a Arc<SimDevice>, allocator: &'a Arc<dyn DeviceAllocator>) -> RunContext<'a> {
        RunContext {
            stream: device.as_ref(),
            allocator,
            device_ordinal: 0,
            exclusive_device: true,
        }
    }

    #[test]
    fn unknown_entry_point_is_fatal() {
        let device = Arc::new(SimDevice::new());
        let compiler = SimCompiler::new(device);
        let err = compiler
            .compile(module("warp_specialized_gemm", 1, 0))
            .unwrap_err();
        assert!(matches!(err, DynoError::Compile(_)));
    }

    #[test]
    fn declared_arity_must_match_kernel_signature() {
        let device = Arc::new(SimDevice::new());
        let compiler = SimCompiler::new(device);
        let err = compiler.compile(module("add_f32", 1, 4)).unwrap_err();
        assert!(matches!(err, DynoError::Compile(_)));
        assert!(!err.is_expected_negative());
    }

    #[test]
    fn over_budget_shared_mem_is_exhaustion() {
        let device = Arc::new(SimDevice::new());
        let compiler = SimCompiler::with_shared_mem_budget(device, 1024);
        let mut m = module("identity", 1, 4);
        m.launch.shared_mem_bytes = 4096;
        let err = compiler.compile(m).unwrap_err();
        assert!(err.is_expected_negative());
        assert!(matches!(err, DynoError::ResourceExhausted(_)));
    }

    #[test]
    fn identity_kernel_copies_input() {
        let device = Arc::new(SimDevice::new());
        let allocator: Arc<dyn DeviceAllocator> = device.clone();
        let compiler = SimCompiler::new(device.clone());

        let artifact = compiler.compile(module("identity", 1, 4)).unwrap();
        let input = device.copy_to_device(&[7u8, 6, 5, 4]).unwrap();

        let out = artifact
            .run(
                &run_ctx(&device, &allocator),
                &[ExecutionInput::borrowed(input)],
            )
            .unwrap();
        assert_eq!(device.copy_from_device(out.span()), vec![7, 6, 5, 4]);
    }

    #[test]
    fn fill_kernel_takes_no_inputs_and_writes_declared_bytes() {
        let device = Arc::new(SimDevice::new());
        let allocator: Arc<dyn DeviceAllocator> = device.clone();
        let compiler = SimCompiler::new(device.clone());

        let artifact = compiler.compile(module("fill", 0, 8)).unwrap();
        assert_eq!(artifact.param_count(), 0);

        let out = artifact.run(&run_ctx(&device, &allocator), &[]).unwrap();
        assert_eq!(device.copy_from_device(out.span()), vec![0x5a; 8]);
    }

    #[test]
    fn scale_kernel_doubles_f32() {
        let device = Arc::new(SimDevice::new());
        let allocator: Arc<dyn DeviceAllocator> = device.clone();
        let compiler = SimCompiler::new(device.clone());

        let artifact = compiler.compile(module("scale_f32", 1, 12)).unwrap();
        let xs = [1.5f32, -2.0, 0.25];
        let input = device.copy_to_device(bytemuck::cast_slice(&xs)).unwrap();

        let out = artifact
            .run(
                &run_ctx(&device, &allocator),
                &[ExecutionInput::borrowed(input)],
            )
            .unwrap();

        let bytes = device.copy_from_device(out.span());
        let doubled: Vec<f32> = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        assert_eq!(doubled, vec![3.0, -4.0, 0.5]);
    }

    #[test]
    fn output_allocations_are_returned_on_drop() {
        let device = Arc::new(SimDevice::new());
        let allocator: Arc<dyn DeviceAllocator> = device.clone();
        let compiler = SimCompiler::new(device.clone());

        let artifact = compiler.compile(module("identity", 1, 16)).unwrap();
        let input = device.copy_to_device(&[0u8; 16]).unwrap();
        let before = device.live_allocations();

        let out = artifact
            .run(
                &run_ctx(&device, &allocator),
                &[ExecutionInput::borrowed(input)],
            )
            .unwrap();
        assert_eq!(device.live_allocations(), before + 1);
        drop(out);
        assert_eq!(device.live_allocations(), before);
    }
}
