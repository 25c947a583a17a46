use thiserror::Error;

/// Failure taxonomy for the probe pipeline.
///
/// `UncompilableCandidate` and `ResourceExhausted` are expected negatives
/// during a configuration sweep: the caller skips the candidate. Every
/// other variant is fatal and propagates out of `measure`.
#[derive(Debug, Error)]
pub enum DynoError {
    #[error("uncompilable candidate: {0}")]
    UncompilableCandidate(String),

    #[error("device resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("candidate descriptor not serializable: {0}")]
    Candidate(String),

    #[error("backend compile failed: {0}")]
    Compile(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("artifact expects {expected} inputs, {supplied} supplied")]
    ArityMismatch { expected: usize, supplied: usize },

    #[error("artifact produced {produced} bytes, caller buffer holds {expected}")]
    OutputSizeMismatch { produced: usize, expected: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

impl DynoError {
    /// True for the two failure classes a sweep absorbs as "skip this
    /// candidate" instead of aborting.
    pub fn is_expected_negative(&self) -> bool {
        matches!(
            self,
            DynoError::UncompilableCandidate(_) | DynoError::ResourceExhausted(_)
        )
    }
}
