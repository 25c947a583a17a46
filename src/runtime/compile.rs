use super::cache::CacheEntry;
use super::device::Compiler;
use crate::core::{DynoError, GraphRegion, KernelModule};
use log::debug;
use std::sync::Arc;

/// Compile one candidate, no cache involved.
///
/// The rewrite callback specializes the region for the candidate; the module
/// it returns inherits the region's options with the side channels stripped.
/// Returns `Ok(None)` for the two expected negatives so a sweep skips the
/// candidate and keeps going: a rewrite that rejects the candidate as
/// structurally invalid, and a backend compile that runs out of on-device
/// resources. Everything else propagates.
pub fn compile_candidate<F>(
    compiler: &dyn Compiler,
    region: &GraphRegion,
    rewrite_fn: F,
) -> Result<CacheEntry, DynoError>
where
    F: FnOnce() -> Result<KernelModule, DynoError>,
{
    let mut module = match rewrite_fn() {
        Ok(module) => module,
        Err(DynoError::UncompilableCandidate(reason)) => {
            debug!(
                "[Probe] rewrite rejected candidate for '{}': {}",
                region.name, reason
            );
            return Ok(None);
        }
        Err(other) => return Err(other),
    };

    module.options = region.options.sanitized_for_probe();

    match compiler.compile(module) {
        Ok(artifact) => Ok(Some(Arc::from(artifact))),
        Err(DynoError::ResourceExhausted(reason)) => {
            debug!(
                "[Probe] candidate for '{}' over device budget: {}",
                region.name, reason
            );
            Ok(None)
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompileOptions, LaunchSpec};
    use crate::runtime::device::{Artifact, ExecutionInput, ExecutionOutput, RunContext};
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct InertArtifact;

    impl Artifact for InertArtifact {
        fn param_count(&self) -> usize {
            0
        }
        fn run(
            &self,
            _ctx: &RunContext<'_>,
            _inputs: &[ExecutionInput],
        ) -> Result<ExecutionOutput, DynoError> {
            Err(DynoError::Execution("inert".into()))
        }
    }

    enum Mode {
        Accept,
        Exhausted,
        Broken,
    }

    struct StubCompiler {
        mode: Mode,
        seen_options: Mutex<Option<CompileOptions>>,
    }

    impl StubCompiler {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                seen_options: Mutex::new(None),
            }
        }
    }

    impl Compiler for StubCompiler {
        fn compile(&self, module: KernelModule) -> Result<Box<dyn Artifact>, DynoError> {
            *self.seen_options.lock().unwrap() = Some(module.options.clone());
            match self.mode {
                Mode::Accept => Ok(Box::new(InertArtifact)),
                Mode::Exhausted => Err(DynoError::ResourceExhausted("smem over budget".into())),
                Mode::Broken => Err(DynoError::Compile("ptx syntax".into())),
            }
        }
    }

    fn region() -> GraphRegion {
        let mut options = CompileOptions::default();
        options.dump_dir = Some(PathBuf::from("/tmp/dumps"));
        options.compile_parallelism = 8;
        GraphRegion::new("gemm_region", options)
    }

    fn module() -> KernelModule {
        KernelModule::new("identity", "", LaunchSpec::default(), 1, 4)
    }

    #[test]
    fn rewrite_rejection_yields_no_artifact() {
        let compiler = StubCompiler::new(Mode::Accept);
        let out = compile_candidate(&compiler, &region(), || {
            Err(DynoError::UncompilableCandidate("split 3 does not divide 64".into()))
        })
        .unwrap();
        assert!(out.is_none());
        // The compiler was never reached.
        assert!(compiler.seen_options.lock().unwrap().is_none());
    }

    #[test]
    fn rewrite_fatal_error_propagates() {
        let compiler = StubCompiler::new(Mode::Accept);
        let out = compile_candidate(&compiler, &region(), || {
            Err(DynoError::Execution("rewrite crashed".into()))
        });
        assert!(matches!(out, Err(DynoError::Execution(_))));
    }

    #[test]
    fn resource_exhaustion_yields_no_artifact() {
        let compiler = StubCompiler::new(Mode::Exhausted);
        let out = compile_candidate(&compiler, &region(), || Ok(module())).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn other_compile_failures_propagate() {
        let compiler = StubCompiler::new(Mode::Broken);
        let out = compile_candidate(&compiler, &region(), || Ok(module()));
        assert!(matches!(out, Err(DynoError::Compile(_))));
    }

    #[test]
    fn module_reaches_compiler_with_sanitized_options() {
        let compiler = StubCompiler::new(Mode::Accept);
        let out = compile_candidate(&compiler, &region(), || Ok(module())).unwrap();
        assert!(out.is_some());

        let seen = compiler.seen_options.lock().unwrap().clone().unwrap();
        assert_eq!(seen, region().options.sanitized_for_probe());
        assert_eq!(seen.dump_dir, None);
        assert_eq!(seen.compile_parallelism, 1);
    }
}
