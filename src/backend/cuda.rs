//! CUDA rendition of the probe collaborators, on the raw driver API.
//!
//! NVRTC turns candidate source into PTX, the driver JIT loads it, and the
//! event pair around a launch gives device-side elapsed time. Exclusive
//! device access is a per-ordinal process-local lock held until the launched
//! work retires.

use crate::core::{DynoError, KernelModule, LaunchSpec};
use crate::runtime::device::{
    Artifact, Compiler, DeviceAllocator, DeviceSpan, DeviceStream, DeviceTimer, ExecutionInput,
    ExecutionOutput, RunContext,
};
use cudarc::driver::sys::CUresult;
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[derive(Debug)]
pub struct CudaModule(pub cudarc::driver::sys::CUmodule);

impl Drop for CudaModule {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let res = cudarc::driver::sys::lib().cuModuleUnload(self.0);
                if res != CUresult::CUDA_SUCCESS {
                    warn!("[CudaBackend] failed to unload module: {:?}", res);
                }
            }
        }
    }
}

unsafe impl Send for CudaModule {}
unsafe impl Sync for CudaModule {}

#[derive(Debug, Clone, Copy)]
pub struct CudaFunction(pub cudarc::driver::sys::CUfunction);

unsafe impl Send for CudaFunction {}
unsafe impl Sync for CudaFunction {}

static DEVICE_LOCKS: OnceLock<Mutex<HashMap<u32, Arc<Mutex<()>>>>> = OnceLock::new();

/// Process-local exclusivity lock for one device ordinal. Every exclusive run
/// in this process serializes on it, whichever harness it came from.
fn device_lock(ordinal: u32) -> Result<Arc<Mutex<()>>, DynoError> {
    let locks = DEVICE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = locks
        .lock()
        .map_err(|_| DynoError::Poisoned("device lock table"))?;
    Ok(map
        .entry(ordinal)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

/// One CUDA device: primary context, allocator, and stream in a single
/// handle. Share it via `Arc` and hand clones to the harness as both stream
/// and allocator.
pub struct CudaContext {
    pub device: Arc<cudarc::driver::CudaDevice>,
    device_id: String,
    ordinal: u32,
    max_shared_mem: u32,
    // NVRTC borrows the arch string for 'static; leaked once per context.
    nvrtc_arch: &'static str,
}

impl CudaContext {
    pub fn new(ordinal: u32) -> Result<Self, DynoError> {
        let device = cudarc::driver::CudaDevice::new(ordinal as usize)
            .map_err(|e| DynoError::Device(format!("CUDA init failed for {}: {:?}", ordinal, e)))?;

        let major = device
            .attribute(cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = device
            .attribute(cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(6);
        let max_shared_mem = device
            .attribute(cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN)
            .unwrap_or(49152) as u32;

        let name = device.name().unwrap_or_else(|_| "UnknownGPU".into());
        let device_id = format!("{}_sm{}{}_{}", name.replace(' ', "_"), major, minor, ordinal);
        let nvrtc_arch: &'static str =
            Box::leak(format!("compute_{}{}", major, minor).into_boxed_str());

        debug!("[CudaBackend] registered {}", device_id);
        Ok(Self {
            device,
            device_id,
            ordinal,
            max_shared_mem,
            nvrtc_arch,
        })
    }

    /// Stable device description for fingerprints, e.g.
    /// `NVIDIA_GeForce_RTX_3070_sm86_0`.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn max_shared_mem(&self) -> u32 {
        self.max_shared_mem
    }

    /// Allocate a span and fill it from host memory.
    pub fn copy_to_device(&self, bytes: &[u8]) -> Result<DeviceSpan, DynoError> {
        let span = self.allocate(bytes.len())?;
        unsafe {
            let res = cudarc::driver::sys::lib().cuMemcpyHtoD_v2(
                span.addr,
                bytes.as_ptr() as *const _,
                bytes.len(),
            );
            if res != CUresult::CUDA_SUCCESS {
                self.deallocate(span);
                return Err(DynoError::Device(format!("cuMemcpyHtoD failed: {:?}", res)));
            }
        }
        Ok(span)
    }

    pub fn copy_from_device(&self, span: DeviceSpan) -> Result<Vec<u8>, DynoError> {
        let mut host = vec![0u8; span.size];
        unsafe {
            let res = cudarc::driver::sys::lib().cuMemcpyDtoH_v2(
                host.as_mut_ptr() as *mut _,
                span.addr,
                span.size,
            );
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!("cuMemcpyDtoH failed: {:?}", res)));
            }
        }
        Ok(host)
    }
}

impl DeviceAllocator for CudaContext {
    fn allocate(&self, size: usize) -> Result<DeviceSpan, DynoError> {
        unsafe {
            let mut dptr: cudarc::driver::sys::CUdeviceptr = 0;
            let res = cudarc::driver::sys::lib().cuMemAlloc_v2(&mut dptr, size.max(1));
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!(
                    "cuMemAlloc of {} bytes failed: {:?}",
                    size, res
                )));
            }
            Ok(DeviceSpan::new(dptr, size))
        }
    }

    fn deallocate(&self, span: DeviceSpan) {
        unsafe {
            let res = cudarc::driver::sys::lib().cuMemFree_v2(span.addr);
            if res != CUresult::CUDA_SUCCESS {
                warn!("[CudaBackend] cuMemFree of {} failed: {:?}", span, res);
            }
        }
    }
}

impl DeviceStream for CudaContext {
    fn block_until_idle(&self) -> Result<(), DynoError> {
        unsafe {
            let res = cudarc::driver::sys::lib().cuCtxSynchronize();
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!(
                    "cuCtxSynchronize failed: {:?}",
                    res
                )));
            }
        }
        Ok(())
    }

    fn start_timer(&self) -> Result<Box<dyn DeviceTimer>, DynoError> {
        Ok(Box::new(EventTimer::begin()?))
    }

    fn copy_device_to_device(&self, src: DeviceSpan, dst: DeviceSpan) -> Result<(), DynoError> {
        if dst.size < src.size {
            return Err(DynoError::Device(format!(
                "d2d copy of {} bytes into {} byte span",
                src.size, dst.size
            )));
        }
        unsafe {
            let res = cudarc::driver::sys::lib().cuMemcpyDtoD_v2(dst.addr, src.addr, src.size);
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!("cuMemcpyDtoD failed: {:?}", res)));
            }
        }
        Ok(())
    }
}

/// Event pair on the default stream. `begin` records the start event;
/// `stop` records the end event, waits for it, and reads the elapsed time.
struct EventTimer {
    start: cudarc::driver::sys::CUevent,
    end: cudarc::driver::sys::CUevent,
}

unsafe impl Send for EventTimer {}

impl EventTimer {
    fn begin() -> Result<Self, DynoError> {
        unsafe {
            let lib = cudarc::driver::sys::lib();
            let mut start: cudarc::driver::sys::CUevent = std::ptr::null_mut();
            let mut end: cudarc::driver::sys::CUevent = std::ptr::null_mut();

            let res = lib.cuEventCreate(&mut start, 0);
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!("cuEventCreate failed: {:?}", res)));
            }
            let res = lib.cuEventCreate(&mut end, 0);
            if res != CUresult::CUDA_SUCCESS {
                let _ = lib.cuEventDestroy_v2(start);
                return Err(DynoError::Device(format!("cuEventCreate failed: {:?}", res)));
            }

            let timer = Self { start, end };
            let res = lib.cuEventRecord(timer.start, std::ptr::null_mut());
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!("cuEventRecord failed: {:?}", res)));
            }
            Ok(timer)
        }
    }
}

impl DeviceTimer for EventTimer {
    fn stop(self: Box<Self>) -> Result<Duration, DynoError> {
        unsafe {
            let lib = cudarc::driver::sys::lib();
            let res = lib.cuEventRecord(self.end, std::ptr::null_mut());
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!("cuEventRecord failed: {:?}", res)));
            }
            let res = lib.cuEventSynchronize(self.end);
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!(
                    "cuEventSynchronize failed: {:?}",
                    res
                )));
            }
            let mut millis = 0f32;
            let res = lib.cuEventElapsedTime(&mut millis, self.start, self.end);
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Device(format!(
                    "cuEventElapsedTime failed: {:?}",
                    res
                )));
            }
            Ok(Duration::from_secs_f64(millis as f64 / 1000.0))
        }
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        unsafe {
            let lib = cudarc::driver::sys::lib();
            if !self.start.is_null() {
                let _ = lib.cuEventDestroy_v2(self.start);
            }
            if !self.end.is_null() {
                let _ = lib.cuEventDestroy_v2(self.end);
            }
        }
    }
}

fn shared_mem_overflow(diag: &str) -> bool {
    let d = diag.to_ascii_lowercase();
    d.contains("too much shared data") || d.contains("too much shared memory")
}

/// NVRTC JIT over candidate source. A module whose launch wants more shared
/// memory than the device offers is rejected with `ResourceExhausted` before
/// NVRTC runs; NVRTC diagnostics that name a shared-memory overflow map to
/// the same variant. Everything else is a fatal `Compile` error.
pub struct CudaCompiler {
    ctx: Arc<CudaContext>,
}

impl CudaCompiler {
    pub fn new(ctx: Arc<CudaContext>) -> Self {
        Self { ctx }
    }
}

impl Compiler for CudaCompiler {
    fn compile(&self, module: KernelModule) -> Result<Box<dyn Artifact>, DynoError> {
        if module.launch.shared_mem_bytes > self.ctx.max_shared_mem {
            return Err(DynoError::ResourceExhausted(format!(
                "kernel '{}' wants {} bytes of shared memory, device offers {}",
                module.entry_point, module.launch.shared_mem_bytes, self.ctx.max_shared_mem
            )));
        }

        let mut nvrtc_options = Vec::new();
        if module.options.opt_level == 0 {
            nvrtc_options.push("--device-debug".to_string());
        }
        let opts = cudarc::nvrtc::CompileOptions {
            arch: Some(self.ctx.nvrtc_arch),
            ftz: Some(module.options.fast_math),
            prec_div: Some(!module.options.fast_math),
            prec_sqrt: Some(!module.options.fast_math),
            fmad: Some(true),
            options: nvrtc_options,
            ..Default::default()
        };

        let ptx = match cudarc::nvrtc::compile_ptx_with_opts(&module.source, opts) {
            Ok(ptx) => ptx,
            Err(e) => {
                let diag = format!("{:?}", e);
                if shared_mem_overflow(&diag) {
                    return Err(DynoError::ResourceExhausted(format!(
                        "kernel '{}': {}",
                        module.entry_point, diag
                    )));
                }
                return Err(DynoError::Compile(format!(
                    "NVRTC failed for '{}': {}",
                    module.entry_point, diag
                )));
            }
        };
        let ptx_src = ptx.to_src();

        if module.options.dump_ir {
            if let Some(dir) = &module.options.dump_dir {
                let _ = std::fs::write(dir.join(format!("{}.ptx", module.entry_point)), &ptx_src);
            }
        }

        unsafe {
            let lib = cudarc::driver::sys::lib();
            let ptx_c = CString::new(ptx_src)
                .map_err(|_| DynoError::Compile("PTX contains interior NUL".to_string()))?;

            let mut raw_module: cudarc::driver::sys::CUmodule = std::ptr::null_mut();
            let res = lib.cuModuleLoadData(&mut raw_module, ptx_c.as_ptr() as *const _);
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Compile(format!(
                    "driver JIT failed for '{}': {:?}",
                    module.entry_point, res
                )));
            }
            let loaded = Arc::new(CudaModule(raw_module));

            let name_c = CString::new(module.entry_point.as_str())
                .map_err(|_| DynoError::Compile("entry point contains interior NUL".to_string()))?;
            let mut func: cudarc::driver::sys::CUfunction = std::ptr::null_mut();
            let res = lib.cuModuleGetFunction(&mut func, loaded.0, name_c.as_ptr());
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Compile(format!(
                    "kernel function '{}' not found: {:?}",
                    module.entry_point, res
                )));
            }

            if module.launch.shared_mem_bytes > 0 {
                let _ = lib.cuFuncSetAttribute(
                    func,
                    cudarc::driver::sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                    module.launch.shared_mem_bytes as i32,
                );
            }

            debug!(
                "[CudaCompiler] compiled '{}' for {}",
                module.entry_point, self.ctx.device_id
            );
            Ok(Box::new(CudaArtifact {
                func: CudaFunction(func),
                module: loaded,
                entry_point: module.entry_point,
                launch: module.launch,
                input_arity: module.input_arity,
                output_bytes: module.output_bytes,
            }))
        }
    }
}

/// Launch convention: input device pointers in bind order, then the output
/// pointer. Bounds come from the launch geometry.
pub struct CudaArtifact {
    func: CudaFunction,
    // Keeps the driver module loaded while the function handle is live.
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    entry_point: String,
    launch: LaunchSpec,
    input_arity: usize,
    output_bytes: usize,
}

impl Artifact for CudaArtifact {
    fn param_count(&self) -> usize {
        self.input_arity
    }

    fn run(
        &self,
        ctx: &RunContext<'_>,
        inputs: &[ExecutionInput],
    ) -> Result<ExecutionOutput, DynoError> {
        if inputs.len() != self.input_arity {
            return Err(DynoError::Execution(format!(
                "'{}' bound with {} inputs, declares {}",
                self.entry_point,
                inputs.len(),
                self.input_arity
            )));
        }
        if inputs.len() + 1 > 64 {
            return Err(DynoError::Execution(format!(
                "'{}' exceeds the 64 kernel parameter slots",
                self.entry_point
            )));
        }

        let lock = if ctx.exclusive_device {
            Some(device_lock(ctx.device_ordinal)?)
        } else {
            None
        };
        let _held = match lock.as_ref() {
            Some(lock) => Some(
                lock.lock()
                    .map_err(|_| DynoError::Poisoned("device exclusivity"))?,
            ),
            None => None,
        };

        let span = ctx.allocator.allocate(self.output_bytes)?;
        let output = ExecutionOutput::new(span, ctx.allocator.clone());

        let mut arg_store = [0u64; 64];
        let mut kernel_params = [std::ptr::null_mut::<c_void>(); 64];
        for (i, input) in inputs.iter().enumerate() {
            arg_store[i] = input.span.addr;
            kernel_params[i] = &mut arg_store[i] as *mut u64 as *mut c_void;
        }
        arg_store[inputs.len()] = span.addr;
        kernel_params[inputs.len()] = &mut arg_store[inputs.len()] as *mut u64 as *mut c_void;

        unsafe {
            let lib = cudarc::driver::sys::lib();
            let res = lib.cuLaunchKernel(
                self.func.0,
                self.launch.grid.0,
                self.launch.grid.1,
                self.launch.grid.2,
                self.launch.block.0,
                self.launch.block.1,
                self.launch.block.2,
                self.launch.shared_mem_bytes,
                std::ptr::null_mut(),
                kernel_params.as_ptr() as *mut *mut c_void,
                std::ptr::null_mut(),
            );
            if res != CUresult::CUDA_SUCCESS {
                return Err(DynoError::Execution(format!(
                    "launch of '{}' failed: {:?}",
                    self.entry_point, res
                )));
            }

            if ctx.exclusive_device {
                // The lock may not release until the launched work retires.
                let res = lib.cuCtxSynchronize();
                if res != CUresult::CUDA_SUCCESS {
                    return Err(DynoError::Execution(format!(
                        "'{}' did not retire: {:?}",
                        self.entry_point, res
                    )));
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE_SRC: &str = r#"
extern "C" __global__ void scale_f32(const float* x, float* out) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    out[i] = x[i] * 2.0f;
}
"#;

    fn context() -> Option<Arc<CudaContext>> {
        match CudaContext::new(0) {
            Ok(ctx) => Some(Arc::new(ctx)),
            Err(_) => None,
        }
    }

    #[test]
    fn scale_kernel_round_trip() {
        let ctx = match context() {
            Some(ctx) => ctx,
            None => return,
        };
        let allocator: Arc<dyn DeviceAllocator> = ctx.clone();
        let compiler = CudaCompiler::new(ctx.clone());

        let module = KernelModule::new("scale_f32", SCALE_SRC, LaunchSpec::linear(1, 4), 1, 16);
        let artifact = compiler.compile(module).unwrap();

        let xs = [1.0f32, -2.0, 0.5, 8.0];
        let input = ctx.copy_to_device(bytemuck::cast_slice(&xs)).unwrap();

        let run_ctx = RunContext {
            stream: ctx.as_ref(),
            allocator: &allocator,
            device_ordinal: 0,
            exclusive_device: true,
        };
        let out = artifact
            .run(&run_ctx, &[ExecutionInput::borrowed(input)])
            .unwrap();

        let bytes = ctx.copy_from_device(out.span()).unwrap();
        let doubled: Vec<f32> = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        assert_eq!(doubled, vec![2.0, -4.0, 1.0, 16.0]);

        drop(out);
        ctx.deallocate(input);
    }

    #[test]
    fn event_timer_brackets_device_work() {
        let ctx = match context() {
            Some(ctx) => ctx,
            None => return,
        };
        let src = ctx.copy_to_device(&[1u8; 1 << 20]).unwrap();
        let dst = ctx.allocate(1 << 20).unwrap();

        let timer = ctx.start_timer().unwrap();
        ctx.copy_device_to_device(src, dst).unwrap();
        let elapsed = timer.stop().unwrap();

        // A 1 MiB d2d copy never rounds down to zero device time.
        assert!(elapsed > Duration::ZERO);
        ctx.deallocate(src);
        ctx.deallocate(dst);
    }

    #[test]
    fn broken_source_is_fatal_compile_error() {
        let ctx = match context() {
            Some(ctx) => ctx,
            None => return,
        };
        let compiler = CudaCompiler::new(ctx);
        let module = KernelModule::new(
            "nope",
            "__global__ void nope( { syntax error",
            LaunchSpec::default(),
            1,
            4,
        );
        let err = compiler.compile(module).unwrap_err();
        assert!(matches!(err, DynoError::Compile(_)));
    }

    #[test]
    fn over_budget_shared_mem_is_exhaustion() {
        let ctx = match context() {
            Some(ctx) => ctx,
            None => return,
        };
        let budget = ctx.max_shared_mem();
        let compiler = CudaCompiler::new(ctx);
        let mut module = KernelModule::new("scale_f32", SCALE_SRC, LaunchSpec::linear(1, 4), 1, 16);
        module.launch.shared_mem_bytes = budget + 1;
        let err = compiler.compile(module).unwrap_err();
        assert!(err.is_expected_negative());
    }
}
