//! Mesh/task shader lowering.
//!
//! Rewrites a task/mesh entry-point pair from abstract `MeshTaskOp`s into
//! plain memory operations, barriers and exports:
//!
//! - `layout` plans the mesh workgroup's LDS regions;
//! - `builtins` inserts a prologue and derives built-in values in it;
//! - `ring` addresses the task-to-mesh payload and draw-data rings;
//! - `task` lowers payload access and mesh task launches;
//! - `mesh` lowers output setters and payload reads;
//! - `export` appends the final export stage of a mesh workgroup.
//!
//! `MeshTaskShader::process` drives all of them over a staged copy of the
//! module and only commits when every function lowered and verified.

pub mod builtins;
pub mod export;
pub mod layout;
pub mod mesh;
pub mod ring;
pub mod task;

#[cfg(test)]
mod tests;

use bytemuck::{Pod, Zeroable};

use crate::config::{PipelineState, TargetInfo};
use crate::diagnostic::{Diagnostic, ErrorKind};
use crate::ir::cfg::verify_function;
use crate::ir::display::annotate;
use crate::ir::{BlockId, FuncId, Function, GlobalId, GlobalKind, Inst, Module, ShaderStage, Value};

pub use layout::{get_or_create_mesh_lds, layout_mesh_shader_lds, LdsRegionSpan, MeshLdsLayout, MeshLdsRegion};
pub use ring::{DrawDataEntry, RingChannelDescriptor, DRAW_DATA_RING_ENTRY_SIZE, PAYLOAD_RING_ENTRY_SIZE};

pub const MESH_LDS_NAME: &str = "mesh.lds";
pub const PAYLOAD_RING_NAME: &str = "task.payload_ring";
pub const DRAW_DATA_RING_NAME: &str = "task.draw_data_ring";
pub const PIPELINE_STATS_NAME: &str = "mesh.pipeline_stats";

/// Mesh pipeline statistics record, accumulated with 64-bit atomic adds.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshPipeStatsEntry {
    pub num_mesh_threads: u64,
    pub num_mesh_primitives: u64,
    pub num_task_threads: u64,
}

impl MeshPipeStatsEntry {
    pub const NUM_MESH_THREADS_OFFSET: u32 =
        std::mem::offset_of!(MeshPipeStatsEntry, num_mesh_threads) as u32;
    pub const NUM_MESH_PRIMITIVES_OFFSET: u32 =
        std::mem::offset_of!(MeshPipeStatsEntry, num_mesh_primitives) as u32;
    pub const NUM_TASK_THREADS_OFFSET: u32 =
        std::mem::offset_of!(MeshPipeStatsEntry, num_task_threads) as u32;
    pub const SIZE: u32 = std::mem::size_of::<MeshPipeStatsEntry>() as u32;
}

/// State shared by the lowering of one task/mesh pair.
///
/// Built per `process` call. Holds explicit handles to every global the
/// lowered code touches.
pub struct ShaderPairContext<'a> {
    pub state: &'a PipelineState,
    pub target: TargetInfo,
    pub layout: Option<MeshLdsLayout>,
    pub lds: Option<GlobalId>,
    pub ring: Option<RingChannelDescriptor>,
    pub stats: Option<GlobalId>,
}

/// What `process` planned and created.
#[derive(Clone, Debug)]
pub struct LoweringSummary {
    pub layout: Option<MeshLdsLayout>,
    pub lds: Option<GlobalId>,
    pub ring: Option<RingChannelDescriptor>,
    pub stats: Option<GlobalId>,
}

pub struct MeshTaskShader<'a> {
    state: &'a PipelineState,
}

impl<'a> MeshTaskShader<'a> {
    pub fn new(state: &'a PipelineState) -> Self {
        Self { state }
    }

    /// LDS layout of a mesh entry point under this pipeline state.
    pub fn layout_mesh_shader_lds(&self, mesh: &Function) -> Result<MeshLdsLayout, Diagnostic> {
        layout_mesh_shader_lds(self.state, mesh)
    }

    /// Lower the task and/or mesh entry point of `module` in place.
    ///
    /// On error the module is left untouched.
    pub fn process(
        &self,
        module: &mut Module,
        task: Option<FuncId>,
        mesh: Option<FuncId>,
    ) -> Result<LoweringSummary, Diagnostic> {
        let state = self.state;
        state.validate()?;

        if task.is_some() && !state.has_task_shader() {
            return Err(Diagnostic::invalid_state(
                "a task entry point was given but the pipeline has no task state".to_string(),
            ));
        }
        let task_func = task
            .map(|id| entry_point(module, id, ShaderStage::Task))
            .transpose()?;
        let mesh_func = mesh
            .map(|id| entry_point(module, id, ShaderStage::Mesh))
            .transpose()?;

        let layout = mesh_func
            .map(|f| layout_mesh_shader_lds(state, f))
            .transpose()?;
        if task_func.is_none() && mesh_func.is_none() {
            return Ok(LoweringSummary {
                layout,
                lds: None,
                ring: None,
                stats: None,
            });
        }

        let mut staged = module.clone();
        let lds = layout
            .as_ref()
            .map(|l| get_or_create_mesh_lds(&mut staged, l.total_size()));
        let ring = if state.has_task_shader() {
            Some(create_rings(&mut staged, state.ring.entry_count)?)
        } else {
            None
        };
        let stats = state.pipeline_stats.then(|| {
            staged.get_or_create_global(
                PIPELINE_STATS_NAME,
                GlobalKind::PipelineStats,
                MeshPipeStatsEntry::SIZE,
            )
        });

        let ctx = ShaderPairContext {
            state,
            target: state.target(),
            layout,
            lds,
            ring,
            stats,
        };

        if let Some(id) = task {
            lower_entry(&mut staged, id, |f| task::lower_task_shader(&ctx, f))?;
        }
        if let Some(id) = mesh {
            lower_entry(&mut staged, id, |f| mesh::lower_mesh_shader(&ctx, f))?;
        }

        *module = staged;
        Ok(LoweringSummary {
            layout: ctx.layout,
            lds,
            ring,
            stats,
        })
    }
}

fn entry_point(module: &Module, id: FuncId, stage: ShaderStage) -> Result<&Function, Diagnostic> {
    let func = module.function(id).ok_or_else(|| {
        Diagnostic::invalid_state(format!("{} entry point #{} does not exist", stage.name(), id.0))
    })?;
    if func.stage != stage {
        return Err(Diagnostic::invalid_state(format!(
            "`{}` is a {} shader, expected a {} shader",
            func.name,
            func.stage.name(),
            stage.name()
        )));
    }
    if func.lowered {
        return Err(Diagnostic::invalid_state(format!(
            "`{}` has already been lowered",
            func.name
        )));
    }
    verify_function(func).map_err(|mut d| {
        d.kind = ErrorKind::MalformedInput;
        d
    })?;
    Ok(func)
}

fn create_rings(module: &mut Module, entry_count: u32) -> Result<RingChannelDescriptor, Diagnostic> {
    let too_deep = || {
        Diagnostic::configuration(format!(
            "a ring of {} entries does not fit a 32-bit address space",
            entry_count
        ))
    };
    let mut ring = RingChannelDescriptor {
        entry_count,
        payload_ring: GlobalId(0),
        draw_data_ring: GlobalId(0),
    };
    let payload_size = ring.payload_ring_size().ok_or_else(too_deep)?;
    let draw_data_size = ring.draw_data_ring_size().ok_or_else(too_deep)?;
    ring.payload_ring =
        module.get_or_create_global(PAYLOAD_RING_NAME, GlobalKind::PayloadRing, payload_size);
    ring.draw_data_ring =
        module.get_or_create_global(DRAW_DATA_RING_NAME, GlobalKind::DrawDataRing, draw_data_size);
    Ok(ring)
}

fn lower_entry(
    module: &mut Module,
    id: FuncId,
    lower: impl FnOnce(Function) -> Result<Function, Diagnostic>,
) -> Result<(), Diagnostic> {
    let slot = module
        .function_mut(id)
        .ok_or_else(|| Diagnostic::internal(format!("entry point #{} vanished", id.0)))?;
    log::debug!("lowering {} shader `{}`", slot.stage.name(), slot.name);
    let mut lowered = lower(slot.clone())?;
    lowered.lowered = true;
    verify_function(&lowered)?;
    log::debug!(
        "`{}` lowered to {} blocks",
        lowered.name,
        lowered.blocks.len()
    );
    *slot = lowered;
    Ok(())
}

// ─── Shared helpers ───────────────────────────────────────────────

/// Location of the first abstract mesh/task operation left in `func`.
pub(crate) fn next_mesh_task_op(func: &Function) -> Option<(BlockId, usize)> {
    func.find_inst(|inst| inst.mesh_task_op().is_some())
}

/// Remove and return the instruction at `(block, index)`.
pub(crate) fn take_inst(func: &mut Function, block: BlockId, index: usize) -> Inst {
    func.block_mut(block).insts.remove(index)
}

/// Forward the result of a removed instruction to its replacement.
pub(crate) fn forward_result(func: &mut Function, old: Option<Value>, new: Value) {
    if let Some(old) = old {
        func.replace_all_uses(old, new);
    }
}

/// Reject a constant payload offset whose access runs past the payload.
pub(crate) fn check_payload_offset(
    func: &Function,
    block: BlockId,
    index: usize,
    offset: Value,
    access_size: u32,
    payload_size: u32,
) -> Result<(), Diagnostic> {
    let Some(start) = func.const_value(offset) else {
        return Ok(());
    };
    if start + access_size as u64 > payload_size as u64 {
        return Err(annotate(
            Diagnostic::malformed(format!(
                "task payload access of {} bytes at offset {} exceeds the declared payload size of {} bytes",
                access_size, start, payload_size
            )),
            func,
            block,
            index,
        ));
    }
    Ok(())
}
