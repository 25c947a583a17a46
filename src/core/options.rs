use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compile options a graph region carries. Probe compiles inherit these and
/// override the side-channel fields, see [`CompileOptions::sanitized_for_probe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub dump_dir: Option<PathBuf>,
    pub dump_ir: bool,
    pub tuning_record_read: Option<PathBuf>,
    pub tuning_record_write: Option<PathBuf>,
    pub compile_parallelism: usize, // 0 = backend decides
    pub experimental_graph_exec: bool,
    pub opt_level: u8,
    pub fast_math: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            dump_dir: None,
            dump_ir: false,
            tuning_record_read: None,
            tuning_record_write: None,
            compile_parallelism: 0,
            experimental_graph_exec: false,
            opt_level: 3,
            fast_math: true,
        }
    }
}

impl CompileOptions {
    /// Derive the options used for one candidate compile inside a sweep.
    ///
    /// Codegen-relevant knobs (opt level, fast math) pass through untouched;
    /// everything that would dump files, replay or record tuning results, or
    /// fan out across threads is forced off. A probe compile may itself run
    /// on one of many parallel tuning workers, so nested parallelism would
    /// oversubscribe the host.
    pub fn sanitized_for_probe(&self) -> Self {
        let mut opts = self.clone();
        opts.dump_dir = None;
        opts.dump_ir = false;
        opts.tuning_record_read = None;
        opts.tuning_record_write = None;
        opts.compile_parallelism = 1;
        opts.experimental_graph_exec = false;
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sanitization_strips_side_channels() {
        let noisy = CompileOptions {
            dump_dir: Some(PathBuf::from("/tmp/dumps")),
            dump_ir: true,
            tuning_record_read: Some(PathBuf::from("records.json")),
            tuning_record_write: Some(PathBuf::from("records.json")),
            compile_parallelism: 16,
            experimental_graph_exec: true,
            opt_level: 2,
            fast_math: false,
        };

        let probe = noisy.sanitized_for_probe();
        assert_eq!(probe.dump_dir, None);
        assert!(!probe.dump_ir);
        assert_eq!(probe.tuning_record_read, None);
        assert_eq!(probe.tuning_record_write, None);
        assert_eq!(probe.compile_parallelism, 1);
        assert!(!probe.experimental_graph_exec);
        // Codegen knobs survive.
        assert_eq!(probe.opt_level, 2);
        assert!(!probe.fast_math);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let opts = CompileOptions::default().sanitized_for_probe();
        assert_eq!(opts, opts.sanitized_for_probe());
    }
}
