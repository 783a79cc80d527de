//! Mesh shader lowering.
//!
//! The prologue of a mesh workgroup
//! 1. computes wave/thread ids,
//! 2. with a task shader: locates its ring entry, spins until the entry
//!    is ready and reads the launch dimensions from it,
//! 3. when the shader culls, clears the first index dword of every
//!    primitive slot across all threads, so the cull bit starts unset,
//! 4. lets thread 0 zero the vertex/primitive counters (and store the flat
//!    workgroup id when the layout has a slot for it), then
//! 5. waits on a barrier before the body starts.
//!
//! Body operations become LDS accesses at offsets given by the layout.
//! Every `ret` of the body jumps to the export stage instead.

use crate::config::MeshState;
use crate::diagnostic::Diagnostic;
use crate::ir::builder::Builder;
use crate::ir::display::annotate;
use crate::ir::{
    AtomicOp, BlockId, Elem, Function, GlobalId, HwReg, Inst, InstKind, IntPredicate, MeshTaskOp,
    Ordering, Ty, Value,
};

use super::builtins::{FlatIdSource, StageLowering};
use super::export::build_export_stage;
use super::layout::{MeshLdsLayout, MeshLdsRegion};
use super::ring::{RingChannelDescriptor, RingEntry};
use super::{check_payload_offset, forward_result, next_mesh_task_op, take_inst, ShaderPairContext};

/// Bit of the first index dword that marks a primitive as culled.
pub const CULL_BIT: u32 = 1 << 31;
const INDEX_MASK: u32 = !CULL_BIT;

fn expected_indices_ty(mesh: &MeshState) -> Ty {
    match mesh.indices_per_primitive() {
        1 => Ty::I32,
        n => Ty::vec(Elem::I32, n as u8),
    }
}

fn check_output_write(
    func: &Function,
    block: BlockId,
    index: usize,
    layout: &MeshLdsLayout,
    region: MeshLdsRegion,
    stride: u32,
    offset: Value,
    value: Value,
) -> Result<(), Diagnostic> {
    let fail = |msg: String| Err(annotate(Diagnostic::malformed(msg), func, block, index));
    if !layout.has(region) || stride == 0 {
        return fail(format!(
            "`{}` writes {} but the pipeline declares no such outputs",
            func.name,
            region.name()
        ));
    }
    if let Some(dword) = func.const_value(offset) {
        let end = dword * 4 + func.value_ty(value).size_in_bytes() as u64;
        if end > stride as u64 {
            return fail(format!(
                "{} write at dword {} runs past the {}-byte slot",
                region.name(),
                dword,
                stride
            ));
        }
    }
    Ok(())
}

/// Reject operations a mesh shader cannot contain, before anything is
/// rewritten.
fn check_mesh_ops(ctx: &ShaderPairContext<'_>, layout: &MeshLdsLayout, func: &Function) -> Result<(), Diagnostic> {
    let mesh = &ctx.state.mesh;
    for (block, index, inst) in func.insts() {
        let Some(op) = inst.mesh_task_op() else { continue };
        let fail = |msg: String| Err(annotate(Diagnostic::malformed(msg), func, block, index));
        match *op {
            MeshTaskOp::ReadBuiltIn(_) | MeshTaskOp::SetMeshOutputs { .. } => {}
            MeshTaskOp::SetPrimitiveCulled { culled, .. } => {
                if func.value_ty(culled) != Ty::I1 {
                    return fail("the culled flag must be an i1".to_string());
                }
            }
            MeshTaskOp::ReadTaskPayload { offset } => match &ctx.state.task {
                Some(task) => check_payload_offset(
                    func,
                    block,
                    index,
                    offset,
                    inst.ty.size_in_bytes(),
                    task.payload_size,
                )?,
                None => {
                    return fail(format!(
                        "`{}` reads the task payload but the pipeline has no task shader",
                        func.name
                    ))
                }
            },
            MeshTaskOp::WriteTaskPayload { .. }
            | MeshTaskOp::TaskPayloadAtomic { .. }
            | MeshTaskOp::TaskPayloadCmpXchg { .. } => {
                return fail(format!(
                    "`{}` is not valid in mesh shader `{}`: the task payload is read-only here",
                    op.name(),
                    func.name
                ))
            }
            MeshTaskOp::EmitMeshTasks { .. } => {
                return fail(format!(
                    "`{}` is not valid in mesh shader `{}`",
                    op.name(),
                    func.name
                ))
            }
            MeshTaskOp::SetPrimitiveIndices { indices, .. } => {
                let expected = expected_indices_ty(mesh);
                if func.value_ty(indices) != expected {
                    return fail(format!(
                        "primitive indices must be {} for {:?} output, found {}",
                        expected,
                        mesh.output_primitive,
                        func.value_ty(indices)
                    ));
                }
            }
            MeshTaskOp::WriteVertexOutput { offset, value, .. } => check_output_write(
                func,
                block,
                index,
                layout,
                MeshLdsRegion::VertexOutput,
                mesh.per_vertex_output_bytes,
                offset,
                value,
            )?,
            MeshTaskOp::WritePrimitiveOutput { offset, value, .. } => check_output_write(
                func,
                block,
                index,
                layout,
                MeshLdsRegion::PrimitiveOutput,
                mesh.per_primitive_output_bytes,
                offset,
                value,
            )?,
        }
    }
    Ok(())
}

/// Find this workgroup's ring entry and spin until its producer marked it
/// ready. The launch dimensions read from the entry become the dispatch
/// dimensions of the mesh workgroup.
fn wait_for_ring_entry(stage: &mut StageLowering, ring: &RingChannelDescriptor) -> RingEntry {
    let entry = {
        let mut b = stage.prologue_builder();
        let counter = b.read_hw(HwReg::TaskRingCounter);
        ring.emit_entry(&mut b, counter)
    };

    let head = stage.prologue_tail;
    let ready = stage.split_prologue("mesh.ring.ready");
    let poll = stage.func.add_block("mesh.ring.poll");
    let mut b = Builder::at_end(&mut stage.func, head);
    b.br(poll);
    b.set_insert_point_end(poll);
    let flag = ring.load_ready_flag(&mut b, &entry);
    let is_ready = b.icmp(IntPredicate::Eq, flag, entry.ready_flag);
    b.cond_br(is_ready, ready, poll);

    let dims = {
        let mut b = stage.prologue_builder();
        ring.read_group_counts(&mut b, &entry)
    };
    stage.set_dispatch_dims(dims);
    entry
}

/// All threads clear the first index dword of each primitive slot.
fn clear_cull_bits(
    stage: &mut StageLowering,
    mesh: &MeshState,
    layout: &MeshLdsLayout,
    lds: GlobalId,
) -> Result<(), Diagnostic> {
    let indices_base = layout.offset(MeshLdsRegion::PrimitiveIndices)?;
    let index_stride = mesh.indices_per_primitive() * 4;
    let tid = stage.thread_id_in_subgroup();
    let threads = stage.threads_per_group();

    let head = stage.prologue_tail;
    let rest = stage.split_prologue("mesh.cull.cleared");
    let mut b = Builder::at_end(&mut stage.func, head);
    let zero = b.const_i32(0);
    let end = b.const_i32(mesh.max_primitives);
    let step = b.const_i32(threads);
    b.strided_loop(tid, end, step, "mesh.cull.clear", |b, i| {
        let slot = b.mul_imm(i, index_stride);
        let addr = b.add_imm(slot, indices_base);
        b.store(lds, addr, zero);
    });
    b.br(rest);
    Ok(())
}

/// Thread 0 zeroes the counters and publishes the flat workgroup id.
fn init_lds(stage: &mut StageLowering, layout: &MeshLdsLayout, lds: GlobalId) -> Result<(), Diagnostic> {
    let tid = stage.thread_id_in_subgroup();
    let vertex_count = layout.offset(MeshLdsRegion::VertexCount)?;
    let primitive_count = layout.offset(MeshLdsRegion::PrimitiveCount)?;
    let flat_id = layout.region(MeshLdsRegion::FlatWorkgroupId);

    let mut b = stage.prologue_builder();
    let zero = b.const_i32(0);
    let first = b.icmp(IntPredicate::Eq, tid, zero);
    let (_, merge) = b.if_then(first, "mesh.init");
    let addr = b.const_i32(vertex_count);
    b.store(lds, addr, zero);
    let addr = b.const_i32(primitive_count);
    b.store(lds, addr, zero);
    if let Some(span) = flat_id {
        let addr = b.const_i32(span.offset);
        let id = b.read_hw(HwReg::FlatWorkgroupId);
        b.store(lds, addr, id);
    }
    b.set_insert_point(merge, 0);
    b.barrier();
    stage.prologue_tail = merge;

    if let Some(span) = flat_id {
        stage.flat_id_source = FlatIdSource::Lds {
            lds,
            offset: span.offset,
        };
    }
    Ok(())
}

/// Byte offset `base + slot * stride + dword * 4`.
fn slot_address(b: &mut Builder<'_>, base: u32, stride: u32, slot: Value, dword: Value) -> Value {
    let scaled = b.mul_imm(slot, stride);
    let at_slot = b.add_imm(scaled, base);
    let four = b.const_i32(4);
    let bytes = b.mul(dword, four);
    b.add(at_slot, bytes)
}

pub(crate) fn lower_mesh_shader(
    ctx: &ShaderPairContext<'_>,
    func: Function,
) -> Result<Function, Diagnostic> {
    let layout = ctx
        .layout
        .as_ref()
        .ok_or_else(|| Diagnostic::internal("mesh lowering without an LDS layout".to_string()))?;
    let lds = ctx
        .lds
        .ok_or_else(|| Diagnostic::internal("mesh lowering without an LDS global".to_string()))?;
    let mesh = &ctx.state.mesh;

    check_mesh_ops(ctx, layout, &func)?;
    let uses_cull =
        func.uses_mesh_task_op(|op| matches!(op, MeshTaskOp::SetPrimitiveCulled { .. }));

    let mut stage = StageLowering::begin(func, mesh.workgroup_size, ctx.state.wave_size);
    let entry = ctx.ring.map(|ring| (ring, wait_for_ring_entry(&mut stage, &ring)));
    if uses_cull {
        clear_cull_bits(&mut stage, mesh, layout, lds)?;
    }
    init_lds(&mut stage, layout, lds)?;

    // Body returns fall through to the export stage.
    let export = stage.func.add_block("mesh.export");
    for block in &mut stage.func.blocks {
        if let Some(last) = block.insts.last_mut() {
            if last.kind == InstKind::Ret {
                last.kind = InstKind::Br(export);
            }
        }
    }

    let tid = stage.thread_id_in_subgroup();
    let indices_base = layout.offset(MeshLdsRegion::PrimitiveIndices)?;
    let index_stride = mesh.indices_per_primitive() * 4;
    let vertex_count = layout.offset(MeshLdsRegion::VertexCount)?;
    let primitive_count = layout.offset(MeshLdsRegion::PrimitiveCount)?;

    while let Some((block, index)) = next_mesh_task_op(&stage.func) {
        let inst: Inst = take_inst(&mut stage.func, block, index);
        let Some(op) = inst.mesh_task_op().cloned() else { continue };

        if let MeshTaskOp::ReadBuiltIn(builtin) = op {
            let value = stage.builtin(builtin);
            forward_result(&mut stage.func, inst.result, value);
            continue;
        }

        let mut b = Builder::at(&mut stage.func, block, index);
        match op {
            MeshTaskOp::ReadTaskPayload { offset } => {
                let (ring, entry) = entry.as_ref().ok_or_else(|| {
                    Diagnostic::internal("payload read without a ring entry".to_string())
                })?;
                let value = ring.read_payload(&mut b, entry, inst.ty, offset);
                forward_result(b.func_mut(), inst.result, value);
            }
            MeshTaskOp::SetMeshOutputs {
                vertex_count: vertices,
                primitive_count: primitives,
            } => {
                let zero = b.const_i32(0);
                let first = b.icmp(IntPredicate::Eq, tid, zero);
                let (_, merge) = b.if_then(first, "mesh.set_outputs");
                let addr = b.const_i32(vertex_count);
                b.store(lds, addr, vertices);
                let addr = b.const_i32(primitive_count);
                b.store(lds, addr, primitives);
                b.set_insert_point(merge, 0);
                b.barrier();
            }
            MeshTaskOp::SetPrimitiveIndices { primitive, indices } => {
                let count = mesh.indices_per_primitive();
                let slot = b.mul_imm(primitive, index_stride);
                let slot = b.add_imm(slot, indices_base);
                for k in 0..count {
                    let index_value = if count == 1 {
                        indices
                    } else {
                        b.extract(indices, k)
                    };
                    let addr = b.add_imm(slot, 4 * k);
                    if k == 0 && uses_cull {
                        // keep the cull bit, replace the index bits
                        let mask = b.const_i32(INDEX_MASK);
                        let bits = b.and(index_value, mask);
                        let keep = b.const_i32(CULL_BIT);
                        b.atomic_rmw(AtomicOp::And, lds, addr, keep, Ordering::Monotonic);
                        b.atomic_rmw(AtomicOp::Or, lds, addr, bits, Ordering::Monotonic);
                    } else {
                        b.store(lds, addr, index_value);
                    }
                }
            }
            MeshTaskOp::SetPrimitiveCulled { primitive, culled } => {
                let slot = b.mul_imm(primitive, index_stride);
                let addr = b.add_imm(slot, indices_base);
                let mask = b.const_i32(INDEX_MASK);
                b.atomic_rmw(AtomicOp::And, lds, addr, mask, Ordering::Monotonic);
                let flag = b.zext(culled, Ty::I32);
                let shift = b.const_i32(31);
                let bit = b.shl(flag, shift);
                b.atomic_rmw(AtomicOp::Or, lds, addr, bit, Ordering::Monotonic);
            }
            MeshTaskOp::WriteVertexOutput {
                offset,
                vertex,
                value,
            } => {
                let base = layout.offset(MeshLdsRegion::VertexOutput)?;
                let addr = slot_address(&mut b, base, mesh.per_vertex_output_bytes, vertex, offset);
                b.store(lds, addr, value);
            }
            MeshTaskOp::WritePrimitiveOutput {
                offset,
                primitive,
                value,
            } => {
                let base = layout.offset(MeshLdsRegion::PrimitiveOutput)?;
                let addr =
                    slot_address(&mut b, base, mesh.per_primitive_output_bytes, primitive, offset);
                b.store(lds, addr, value);
            }
            other => {
                return Err(Diagnostic::internal(format!(
                    "`{}` survived mesh shader validation",
                    other.name()
                )))
            }
        }
    }

    build_export_stage(&mut stage, ctx, layout, lds, export, uses_cull)?;
    Ok(stage.func)
}
