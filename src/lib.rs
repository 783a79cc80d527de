pub mod config;
pub mod diagnostic;
pub mod ir;
pub mod lower;
pub mod samples;
pub mod sim;
pub mod span;

// Re-exports: the lowering entry points at the crate root
pub use config::target;
pub use config::PipelineState;
pub use diagnostic::{Diagnostic, ErrorKind};
pub use ir::{FuncId, Function, Module};
pub use lower::{layout_mesh_shader_lds, LoweringSummary, MeshLdsLayout, MeshTaskShader};
pub use sim::{PipelineRun, Simulator};

/// Build the reference pair for `state`, lower it and return the
/// lowered module with its entry points.
pub fn lower_reference(
    state: &PipelineState,
) -> Result<(samples::ReferencePair, LoweringSummary), Diagnostic> {
    let mut pair = samples::reference_pair(state)?;
    let summary = MeshTaskShader::new(state).process(&mut pair.module, pair.task, Some(pair.mesh))?;
    Ok((pair, summary))
}

/// Fingerprint of a module's printed form.
pub fn module_hash(module: &Module) -> blake3::Hash {
    blake3::hash(module.to_string().as_bytes())
}
