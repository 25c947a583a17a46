use super::cache::{CacheEntry, CompileCache};
use super::compile::compile_candidate;
use super::device::{Compiler, DeviceAllocator, DeviceSpan, DeviceStream};
use super::exec::{bind_inputs, execute};
use crate::core::{DynoError, Fingerprint, GraphRegion, KernelModule, ProbeKey};
use log::{debug, trace};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// One measured probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub duration: Duration,
    pub cache_hit: bool,
}

/// Per-worker front end of the probe pipeline. Workers share the compiler
/// and the compile cache; each worker owns its stream.
pub struct Harness {
    compiler: Arc<dyn Compiler>,
    cache: Arc<CompileCache>,
    stream: Arc<dyn DeviceStream>,
    allocator: Arc<dyn DeviceAllocator>,
    device_ordinal: u32,
}

impl Harness {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        cache: Arc<CompileCache>,
        stream: Arc<dyn DeviceStream>,
        allocator: Arc<dyn DeviceAllocator>,
        device_ordinal: u32,
    ) -> Self {
        Self {
            compiler,
            cache,
            stream,
            allocator,
            device_ordinal,
        }
    }

    pub fn cache(&self) -> &Arc<CompileCache> {
        &self.cache
    }

    /// Compile-or-fetch one candidate without profiling it.
    pub fn compile<C, F>(
        &self,
        region: &GraphRegion,
        candidate: &C,
        fingerprint: &Fingerprint,
        rewrite_fn: F,
    ) -> Result<CacheEntry, DynoError>
    where
        C: Serialize,
        F: FnOnce(&C) -> Result<KernelModule, DynoError>,
    {
        let key = ProbeKey::new(fingerprint, candidate)?;
        self.cache.compile_or_fetch(key, || {
            compile_candidate(self.compiler.as_ref(), region, || rewrite_fn(candidate))
        })
    }

    /// Measure one candidate: compile or fetch the artifact, run it once to
    /// warm the device, drain, then run it once under a device timer and copy
    /// the produced output into `output_buffer`.
    ///
    /// `Ok(None)` means the candidate produced no artifact (rewrite rejection
    /// or device resource exhaustion); the sweep should skip it and continue.
    pub fn measure<C, F>(
        &self,
        region: &GraphRegion,
        candidate: &C,
        fingerprint: &Fingerprint,
        input_buffers: &[DeviceSpan],
        output_buffer: DeviceSpan,
        rewrite_fn: F,
    ) -> Result<Option<ProbeReport>, DynoError>
    where
        C: Serialize,
        F: FnOnce(&C) -> Result<KernelModule, DynoError>,
    {
        let key = ProbeKey::new(fingerprint, candidate)?;

        let mut compiled_here = false;
        let entry = self.cache.compile_or_fetch(key, || {
            compiled_here = true;
            compile_candidate(self.compiler.as_ref(), region, || rewrite_fn(candidate))
        })?;
        let cache_hit = !compiled_here;

        let artifact = match entry {
            Some(artifact) => artifact,
            None => {
                trace!(
                    "[Harness] no artifact for '{}', skipping candidate",
                    region.name
                );
                return Ok(None);
            }
        };

        // Warmup. Device caches, clock state, and lazy backend init settle
        // before the comparable run; the drain keeps warmup work from
        // overlapping the timed dispatch.
        {
            let inputs = bind_inputs(artifact.as_ref(), input_buffers)?;
            execute(
                artifact.as_ref(),
                &inputs,
                self.stream.as_ref(),
                &self.allocator,
                self.device_ordinal,
            )?;
            self.stream.block_until_idle()?;
        }

        // Timed run. Same physical buffers as the warmup; the timer brackets
        // only the dispatch and measures device-side elapsed time.
        let inputs = bind_inputs(artifact.as_ref(), input_buffers)?;
        let timer = self.stream.start_timer()?;
        let output = execute(
            artifact.as_ref(),
            &inputs,
            self.stream.as_ref(),
            &self.allocator,
            self.device_ordinal,
        )?;
        let duration = timer.stop()?;

        let produced = output.span();
        if produced.size != output_buffer.size {
            return Err(DynoError::OutputSizeMismatch {
                produced: produced.size,
                expected: output_buffer.size,
            });
        }
        self.stream.copy_device_to_device(produced, output_buffer)?;

        debug!(
            "[Harness] '{}' measured in {:?} (cache_hit: {})",
            region.name, duration, cache_hit
        );
        Ok(Some(ProbeReport {
            duration,
            cache_hit,
        }))
    }

    /// Drop every cached artifact. The next probe of each key recompiles.
    pub fn clear_cache(&self) -> Result<(), DynoError> {
        self.cache.clear()
    }
}
