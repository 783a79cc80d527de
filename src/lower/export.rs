//! Export stage of a mesh workgroup.
//!
//! Runs once per workgroup after the body finished:
//!
//! ```text
//! barrier
//! vc, pc = LDS counters
//! if tid == 0: export.alloc vc, pc
//! for i = tid; i < vc; i += N: export.vertex i, VertexOutput[i]
//! for i = tid; i < pc; i += N:
//!     if !culled(i): export.primitive i, indices[i], rate, PrimitiveOutput[i]
//! if tid == 0 and stats: numMeshThreads += N, numMeshPrimitives += pc
//! ret
//! ```

use crate::diagnostic::Diagnostic;
use crate::ir::builder::Builder;
use crate::ir::{AtomicOp, BlockId, GlobalId, IntPredicate, Ordering, Ty, Value};

use super::builtins::StageLowering;
use super::layout::{LdsRegionSpan, MeshLdsLayout, MeshLdsRegion};
use super::mesh::CULL_BIT;
use super::{MeshPipeStatsEntry, ShaderPairContext};

/// Shading rate flags of the API.
pub mod shading_rate {
    pub const VERTICAL_2_PIXELS: u32 = 1;
    pub const VERTICAL_4_PIXELS: u32 = 2;
    pub const HORIZONTAL_2_PIXELS: u32 = 4;
    pub const HORIZONTAL_4_PIXELS: u32 = 8;
}

/// Hardware `(xRate, yRate)` of an API shading rate: log2 of the pixel
/// count along each axis, clamped to 2.
pub fn hw_shading_rate(rate: u32) -> [u32; 2] {
    [((rate >> 2) & 3).min(2), (rate & 3).min(2)]
}

fn emit_hw_shading_rate(b: &mut Builder<'_>, rate: Value) -> [Value; 2] {
    let three = b.const_i32(3);
    let two = b.const_i32(2);
    let shift = b.const_i32(2);
    let horizontal = b.lshr(rate, shift);
    let horizontal = b.and(horizontal, three);
    let x = b.umin(horizontal, two);
    let vertical = b.and(rate, three);
    let y = b.umin(vertical, two);
    [x, y]
}

/// Load the dwords of output slot `slot` of a region with `stride` bytes
/// per slot.
fn load_slot(b: &mut Builder<'_>, lds: GlobalId, region: LdsRegionSpan, stride: u32, slot: Value) -> Vec<Value> {
    let scaled = b.mul_imm(slot, stride);
    let base = b.add_imm(scaled, region.offset);
    (0..stride / 4)
        .map(|dword| {
            let addr = b.add_imm(base, dword * 4);
            b.load(Ty::I32, lds, addr)
        })
        .collect()
}

pub(crate) fn build_export_stage(
    stage: &mut StageLowering,
    ctx: &ShaderPairContext<'_>,
    layout: &MeshLdsLayout,
    lds: GlobalId,
    export: BlockId,
    uses_cull: bool,
) -> Result<(), Diagnostic> {
    let mesh = &ctx.state.mesh;
    let tid = stage.thread_id_in_subgroup();
    let threads = stage.threads_per_group();
    let vertex_count_offset = layout.offset(MeshLdsRegion::VertexCount)?;
    let primitive_count_offset = layout.offset(MeshLdsRegion::PrimitiveCount)?;
    let indices_base = layout.offset(MeshLdsRegion::PrimitiveIndices)?;
    let vertex_outputs = layout.region(MeshLdsRegion::VertexOutput);
    let primitive_outputs = layout.region(MeshLdsRegion::PrimitiveOutput);
    let indices_per_primitive = mesh.indices_per_primitive();
    let shading_rate_dword = mesh
        .shading_rate_dword
        .filter(|_| ctx.target.supports_primitive_shading_rate() && primitive_outputs.is_some());

    let mut b = Builder::at_end(&mut stage.func, export);
    b.barrier();
    let addr = b.const_i32(vertex_count_offset);
    let vertex_count = b.load(Ty::I32, lds, addr);
    let addr = b.const_i32(primitive_count_offset);
    let primitive_count = b.load(Ty::I32, lds, addr);
    let zero = b.const_i32(0);
    let first = b.icmp(IntPredicate::Eq, tid, zero);
    let (_, merge) = b.if_then(first, "mesh.alloc");
    b.alloc_export(vertex_count, primitive_count);
    b.set_insert_point_end(merge);

    let step = b.const_i32(threads);
    b.strided_loop(tid, vertex_count, step, "mesh.vertex", |b, i| {
        let attrs = match vertex_outputs {
            Some(region) => load_slot(b, lds, region, mesh.per_vertex_output_bytes, i),
            None => Vec::new(),
        };
        b.export_vertex(i, attrs);
    });

    b.strided_loop(tid, primitive_count, step, "mesh.primitive", |b, i| {
        let slot = b.mul_imm(i, indices_per_primitive * 4);
        let slot = b.add_imm(slot, indices_base);
        let mut indices: Vec<Value> = (0..indices_per_primitive)
            .map(|k| {
                let addr = b.add_imm(slot, 4 * k);
                b.load(Ty::I32, lds, addr)
            })
            .collect();

        let visible_merge = if uses_cull {
            let mask = b.const_i32(!CULL_BIT);
            let flagged = b.const_i32(CULL_BIT);
            let cull = b.and(indices[0], flagged);
            indices[0] = b.and(indices[0], mask);
            let visible = b.icmp(IntPredicate::Eq, cull, zero);
            let (_, merge) = b.if_then(visible, "mesh.primitive.visible");
            Some(merge)
        } else {
            None
        };

        let attrs = match primitive_outputs {
            Some(region) => load_slot(b, lds, region, mesh.per_primitive_output_bytes, i),
            None => Vec::new(),
        };
        let rate = shading_rate_dword
            .and_then(|dword| attrs.get(dword as usize).copied())
            .map(|rate| emit_hw_shading_rate(b, rate));
        b.export_primitive(i, indices, rate, attrs);

        if let Some(merge) = visible_merge {
            b.set_insert_point_end(merge);
        }
    });

    if let Some(stats) = ctx.stats {
        let (_, merge) = b.if_then(first, "mesh.stats");
        let addr = b.const_i32(MeshPipeStatsEntry::NUM_MESH_THREADS_OFFSET);
        let count = b.const_i64(threads as u64);
        b.atomic_rmw(AtomicOp::Add, stats, addr, count, Ordering::Monotonic);
        let addr = b.const_i32(MeshPipeStatsEntry::NUM_MESH_PRIMITIVES_OFFSET);
        let count = b.zext(primitive_count, Ty::I64);
        b.atomic_rmw(AtomicOp::Add, stats, addr, count, Ordering::Monotonic);
        b.set_insert_point_end(merge);
    }
    b.ret();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::shading_rate::*;
    use super::*;

    #[test]
    fn test_hw_shading_rate() {
        assert_eq!(hw_shading_rate(0), [0, 0]);
        assert_eq!(hw_shading_rate(VERTICAL_2_PIXELS), [0, 1]);
        assert_eq!(hw_shading_rate(VERTICAL_4_PIXELS), [0, 2]);
        assert_eq!(hw_shading_rate(HORIZONTAL_2_PIXELS), [1, 0]);
        assert_eq!(hw_shading_rate(HORIZONTAL_4_PIXELS), [2, 0]);
        assert_eq!(
            hw_shading_rate(HORIZONTAL_2_PIXELS | VERTICAL_4_PIXELS),
            [1, 2]
        );
        // both flags of an axis clamp to 4 pixels
        assert_eq!(
            hw_shading_rate(HORIZONTAL_2_PIXELS | HORIZONTAL_4_PIXELS | VERTICAL_2_PIXELS | VERTICAL_4_PIXELS),
            [2, 2]
        );
    }
}
