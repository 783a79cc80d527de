//! Task shader lowering.
//!
//! The task workgroup owns ring entry `(baseRingEntryIndex + flatId) mod
//! depth`. Payload accesses go straight to that entry of the payload ring.
//! A mesh task launch becomes
//!
//! ```text
//! barrier
//! if threadIdInSubgroup == 0 {
//!     drawData[entry].groupCount = (x, y, z)
//!     store.release drawData[entry].ready = readyFlag
//! }
//! barrier
//! ```

use crate::diagnostic::Diagnostic;
use crate::ir::builder::Builder;
use crate::ir::display::annotate;
use crate::ir::uniformity::Uniformity;
use crate::ir::{AtomicOp, BuiltIn, Function, HwReg, IntPredicate, MeshTaskOp, Ordering};

use super::builtins::StageLowering;
use super::{
    check_payload_offset, forward_result, next_mesh_task_op, take_inst, MeshPipeStatsEntry,
    ShaderPairContext,
};

/// Launch counts must be the same for every invocation of the workgroup.
fn check_launch_uniformity(func: &Function) -> Result<(), Diagnostic> {
    let uniformity = Uniformity::analyze(func);
    for (block, index, inst) in func.insts() {
        let Some(MeshTaskOp::EmitMeshTasks { x, y, z }) = inst.mesh_task_op() else {
            continue;
        };
        for (axis, count) in ["x", "y", "z"].into_iter().zip([*x, *y, *z]) {
            if uniformity.is_divergent(count) {
                return Err(annotate(
                    Diagnostic::divergence(format!(
                        "mesh task count {} ({}) of `{}` is not workgroup-uniform",
                        axis, count, func.name
                    ))
                    .with_help(
                        "derive launch counts from constants, the payload or workgroup ids"
                            .to_string(),
                    ),
                    func,
                    block,
                    index,
                ));
            }
        }
    }
    Ok(())
}

/// Reject operations a task shader cannot contain, before anything is
/// rewritten.
fn check_task_ops(func: &Function, payload_size: u32) -> Result<(), Diagnostic> {
    for (block, index, inst) in func.insts() {
        let Some(op) = inst.mesh_task_op() else { continue };
        match *op {
            MeshTaskOp::ReadBuiltIn(_) | MeshTaskOp::EmitMeshTasks { .. } => {}
            MeshTaskOp::ReadTaskPayload { offset } => check_payload_offset(
                func,
                block,
                index,
                offset,
                inst.ty.size_in_bytes(),
                payload_size,
            )?,
            MeshTaskOp::WriteTaskPayload { offset, value }
            | MeshTaskOp::TaskPayloadAtomic { offset, value, .. } => check_payload_offset(
                func,
                block,
                index,
                offset,
                func.value_ty(value).size_in_bytes(),
                payload_size,
            )?,
            MeshTaskOp::TaskPayloadCmpXchg { offset, compare, .. } => check_payload_offset(
                func,
                block,
                index,
                offset,
                func.value_ty(compare).size_in_bytes(),
                payload_size,
            )?,
            _ => {
                return Err(annotate(
                    Diagnostic::malformed(format!(
                        "`{}` is not valid in task shader `{}`",
                        op.name(),
                        func.name
                    )),
                    func,
                    block,
                    index,
                ))
            }
        }
    }
    Ok(())
}

pub(crate) fn lower_task_shader(
    ctx: &ShaderPairContext<'_>,
    func: Function,
) -> Result<Function, Diagnostic> {
    let task_state = ctx.state.task.as_ref().ok_or_else(|| {
        Diagnostic::invalid_state("pipeline has no task state".to_string())
    })?;
    let ring = ctx
        .ring
        .ok_or_else(|| Diagnostic::internal("task lowering without a ring channel".to_string()))?;

    check_launch_uniformity(&func)?;
    check_task_ops(&func, task_state.payload_size)?;

    let mut stage = StageLowering::begin(func, task_state.workgroup_size, ctx.state.wave_size);

    let flat = stage.builtin(BuiltIn::FlatWorkgroupId);
    let entry = {
        let mut b = stage.prologue_builder();
        let base = b.read_hw(HwReg::BaseRingEntryIndex);
        let counter = b.add(base, flat);
        ring.emit_entry(&mut b, counter)
    };

    let tid = stage.thread_id_in_subgroup();
    if let Some(stats) = ctx.stats {
        let threads = stage.threads_per_group();
        let mut b = stage.prologue_builder();
        let zero = b.const_i32(0);
        let first = b.icmp(IntPredicate::Eq, tid, zero);
        let (_, merge) = b.if_then(first, "task.stats");
        let offset = b.const_i32(MeshPipeStatsEntry::NUM_TASK_THREADS_OFFSET);
        let count = b.const_i64(threads as u64);
        b.atomic_rmw(AtomicOp::Add, stats, offset, count, Ordering::Monotonic);
        stage.prologue_tail = merge;
    }

    while let Some((block, index)) = next_mesh_task_op(&stage.func) {
        let inst = take_inst(&mut stage.func, block, index);
        let Some(op) = inst.mesh_task_op().cloned() else { continue };

        if let MeshTaskOp::ReadBuiltIn(builtin) = op {
            let value = stage.builtin(builtin);
            forward_result(&mut stage.func, inst.result, value);
            continue;
        }

        let mut b = Builder::at(&mut stage.func, block, index);
        match op {
            MeshTaskOp::ReadTaskPayload { offset } => {
                let value = ring.read_payload(&mut b, &entry, inst.ty, offset);
                forward_result(b.func_mut(), inst.result, value);
            }
            MeshTaskOp::WriteTaskPayload { offset, value } => {
                ring.write_payload(&mut b, &entry, offset, value);
            }
            MeshTaskOp::TaskPayloadAtomic {
                op,
                ordering,
                offset,
                value,
            } => {
                let old = ring.payload_atomic(&mut b, &entry, op, ordering, offset, value);
                forward_result(b.func_mut(), inst.result, old);
            }
            MeshTaskOp::TaskPayloadCmpXchg {
                ordering,
                offset,
                compare,
                new,
            } => {
                let old = ring.payload_cmpxchg(&mut b, &entry, ordering, offset, compare, new);
                forward_result(b.func_mut(), inst.result, old);
            }
            MeshTaskOp::EmitMeshTasks { x, y, z } => {
                b.barrier();
                let zero = b.const_i32(0);
                let first = b.icmp(IntPredicate::Eq, tid, zero);
                let (_, merge) = b.if_then(first, "task.emit");
                ring.write_draw_data(&mut b, &entry, [x, y, z]);
                b.set_insert_point(merge, 0);
                b.barrier();
            }
            other => {
                return Err(Diagnostic::internal(format!(
                    "`{}` survived task shader validation",
                    other.name()
                )))
            }
        }
    }

    log::trace!(
        "task shader `{}` uses ring depth {}",
        stage.func.name,
        ring.entry_count
    );
    Ok(stage.func)
}
