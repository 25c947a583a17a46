use super::device::{
    Artifact, DeviceAllocator, DeviceSpan, DeviceStream, ExecutionInput, ExecutionOutput,
    RunContext,
};
use crate::core::DynoError;
use std::sync::Arc;

/// Pair each declared artifact parameter, in order, with the caller buffer at
/// the same index. The arity must match exactly; a mismatch is a contract
/// violation between the candidate and the caller, not a skippable negative.
pub fn bind_inputs(
    artifact: &dyn Artifact,
    buffers: &[DeviceSpan],
) -> Result<Vec<ExecutionInput>, DynoError> {
    let expected = artifact.param_count();
    if expected != buffers.len() {
        return Err(DynoError::ArityMismatch {
            expected,
            supplied: buffers.len(),
        });
    }
    Ok(buffers
        .iter()
        .copied()
        .map(ExecutionInput::borrowed)
        .collect())
}

/// Run the artifact with the exclusive-device flag raised, keeping other
/// workers' submissions off the device for the duration of the run.
pub fn execute(
    artifact: &dyn Artifact,
    inputs: &[ExecutionInput],
    stream: &dyn DeviceStream,
    allocator: &Arc<dyn DeviceAllocator>,
    device_ordinal: u32,
) -> Result<ExecutionOutput, DynoError> {
    let ctx = RunContext {
        stream,
        allocator,
        device_ordinal,
        exclusive_device: true,
    };
    artifact.run(&ctx, inputs)
}
