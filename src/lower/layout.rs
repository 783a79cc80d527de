//! LDS layout of a mesh workgroup.
//!
//! Regions are placed back to back in a fixed priority order, each at the
//! running total rounded up to a dword. The layout is computed before any
//! region-dependent lowering and never changes afterwards.

use std::fmt;

use crate::config::PipelineState;
use crate::diagnostic::Diagnostic;
use crate::ir::{BuiltIn, Function, GlobalId, GlobalKind, MeshTaskOp, Module};

use super::MESH_LDS_NAME;

/// LDS regions of a mesh workgroup, in placement order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeshLdsRegion {
    VertexCount,
    PrimitiveCount,
    FlatWorkgroupId,
    PrimitiveIndices,
    VertexOutput,
    PrimitiveOutput,
}

impl MeshLdsRegion {
    pub const COUNT: usize = 6;

    pub const ALL: [MeshLdsRegion; MeshLdsRegion::COUNT] = [
        MeshLdsRegion::VertexCount,
        MeshLdsRegion::PrimitiveCount,
        MeshLdsRegion::FlatWorkgroupId,
        MeshLdsRegion::PrimitiveIndices,
        MeshLdsRegion::VertexOutput,
        MeshLdsRegion::PrimitiveOutput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MeshLdsRegion::VertexCount => "VertexCount",
            MeshLdsRegion::PrimitiveCount => "PrimitiveCount",
            MeshLdsRegion::FlatWorkgroupId => "FlatWorkgroupId",
            MeshLdsRegion::PrimitiveIndices => "PrimitiveIndices",
            MeshLdsRegion::VertexOutput => "VertexOutput",
            MeshLdsRegion::PrimitiveOutput => "PrimitiveOutput",
        }
    }
}

/// Byte range of one region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LdsRegionSpan {
    pub offset: u32,
    pub size: u32,
}

impl LdsRegionSpan {
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshLdsLayout {
    regions: [Option<LdsRegionSpan>; MeshLdsRegion::COUNT],
    total_size: u32,
}

impl MeshLdsLayout {
    pub fn region(&self, region: MeshLdsRegion) -> Option<LdsRegionSpan> {
        self.regions[region as usize]
    }

    pub fn has(&self, region: MeshLdsRegion) -> bool {
        self.region(region).is_some()
    }

    /// Byte offset of a region that must be present.
    pub fn offset(&self, region: MeshLdsRegion) -> Result<u32, Diagnostic> {
        self.region(region).map(|r| r.offset).ok_or_else(|| {
            Diagnostic::internal(format!(
                "LDS region {} is not part of the layout",
                region.name()
            ))
        })
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Present regions in placement order.
    pub fn iter(&self) -> impl Iterator<Item = (MeshLdsRegion, LdsRegionSpan)> + '_ {
        MeshLdsRegion::ALL
            .iter()
            .filter_map(|&r| self.region(r).map(|span| (r, span)))
    }
}

impl fmt::Display for MeshLdsLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (region, span) in self.iter() {
            writeln!(
                f,
                "{:<16} offset {:>5}  size {:>5}",
                region.name(),
                span.offset,
                span.size
            )?;
        }
        write!(f, "total {} bytes", self.total_size)
    }
}

fn align_to_dword(offset: u64) -> u64 {
    (offset + 3) & !3
}

/// Whether the mesh function needs the flat workgroup id in LDS.
fn needs_flat_workgroup_id(state: &PipelineState, mesh: &Function) -> bool {
    state.mesh.use_flat_workgroup_id
        || BuiltIn::ALL
            .iter()
            .any(|&b| b.needs_flat_workgroup_id() && mesh.reads_builtin(b))
}

/// Plan the LDS layout of a mesh workgroup.
///
/// Pure: reads the pipeline state and scans `mesh` for the built-ins and
/// output writes it uses. Fails when the layout exceeds the per-workgroup
/// LDS of the target, naming the first region that crosses the limit.
pub fn layout_mesh_shader_lds(
    state: &PipelineState,
    mesh: &Function,
) -> Result<MeshLdsLayout, Diagnostic> {
    let m = &state.mesh;
    let writes_vertex_outputs =
        mesh.uses_mesh_task_op(|op| matches!(op, MeshTaskOp::WriteVertexOutput { .. }));
    let writes_primitive_outputs =
        mesh.uses_mesh_task_op(|op| matches!(op, MeshTaskOp::WritePrimitiveOutput { .. }));

    let sizes: [Option<u64>; MeshLdsRegion::COUNT] = [
        Some(4),
        Some(4),
        needs_flat_workgroup_id(state, mesh).then_some(4),
        Some(m.max_primitives as u64 * m.indices_per_primitive() as u64 * 4),
        (m.per_vertex_output_bytes > 0 && writes_vertex_outputs)
            .then(|| m.max_vertices as u64 * m.per_vertex_output_bytes as u64),
        (m.per_primitive_output_bytes > 0 && writes_primitive_outputs)
            .then(|| m.max_primitives as u64 * m.per_primitive_output_bytes as u64),
    ];

    let limit = state.target().lds_size_per_workgroup() as u64;
    let required: u64 = sizes.iter().flatten().sum();
    let mut regions = [None; MeshLdsRegion::COUNT];
    let mut offset = 0u64;
    for (region, size) in MeshLdsRegion::ALL.iter().zip(sizes) {
        let Some(size) = size else { continue };
        offset = align_to_dword(offset);
        if offset + size > limit {
            return Err(Diagnostic::configuration(format!(
                "mesh shader `{}` needs {} bytes of LDS but the target provides {}",
                mesh.name, required, limit
            ))
            .with_note(format!(
                "region {} at offset {} with size {} ends past the limit",
                region.name(),
                offset,
                size
            ))
            .with_help("reduce max_vertices, max_primitives or the output strides".to_string()));
        }
        regions[*region as usize] = Some(LdsRegionSpan {
            offset: offset as u32,
            size: size as u32,
        });
        offset += size;
    }

    let layout = MeshLdsLayout {
        regions,
        total_size: offset as u32,
    };
    for (region, span) in layout.iter() {
        log::trace!(
            "mesh LDS {}: offset {} size {}",
            region.name(),
            span.offset,
            span.size
        );
    }
    Ok(layout)
}

/// Create the module's mesh LDS global, or grow it to `size` bytes.
pub fn get_or_create_mesh_lds(module: &mut Module, size: u32) -> GlobalId {
    module.get_or_create_global(MESH_LDS_NAME, GlobalKind::Lds, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GfxIpVersion, MeshState, OutputPrimitive, RingState};
    use crate::diagnostic::ErrorKind;
    use crate::ir::builder::Builder;
    use crate::ir::ShaderStage;

    fn state(max_vertices: u32, max_primitives: u32, vertex_bytes: u32, prim_bytes: u32) -> PipelineState {
        PipelineState {
            gfx_ip: GfxIpVersion::new(10, 3, 0),
            wave_size: 64,
            task: None,
            mesh: MeshState {
                workgroup_size: [32, 1, 1],
                output_primitive: OutputPrimitive::Triangles,
                max_vertices,
                max_primitives,
                per_vertex_output_bytes: vertex_bytes,
                per_primitive_output_bytes: prim_bytes,
                shading_rate_dword: None,
                use_flat_workgroup_id: false,
            },
            ring: RingState::default(),
            pipeline_stats: false,
        }
    }

    /// A mesh function writing both kinds of outputs, optionally reading
    /// `WorkgroupId`.
    fn writer(reads_workgroup_id: bool) -> Function {
        let mut f = Function::new("writer", ShaderStage::Mesh);
        let mut b = Builder::new(&mut f);
        let zero = b.const_i32(0);
        if reads_workgroup_id {
            b.read_builtin(BuiltIn::WorkgroupId);
        }
        b.write_vertex_output(zero, zero, zero);
        b.write_primitive_output(zero, zero, zero);
        b.ret();
        f
    }

    #[test]
    fn test_layout_order_and_sizes() {
        let layout = layout_mesh_shader_lds(&state(64, 126, 32, 16), &writer(false)).unwrap();
        assert_eq!(layout.region(MeshLdsRegion::VertexCount), Some(LdsRegionSpan { offset: 0, size: 4 }));
        assert_eq!(layout.region(MeshLdsRegion::PrimitiveCount), Some(LdsRegionSpan { offset: 4, size: 4 }));
        assert!(!layout.has(MeshLdsRegion::FlatWorkgroupId));
        assert_eq!(
            layout.region(MeshLdsRegion::PrimitiveIndices),
            Some(LdsRegionSpan { offset: 8, size: 126 * 3 * 4 })
        );
        let vo = layout.region(MeshLdsRegion::VertexOutput).unwrap();
        assert_eq!(vo.offset, 8 + 1512);
        assert_eq!(vo.size, 64 * 32);
        let po = layout.region(MeshLdsRegion::PrimitiveOutput).unwrap();
        assert_eq!(po.offset, vo.end());
        assert_eq!(layout.total_size(), po.end());
    }

    #[test]
    fn test_layout_regions_disjoint_and_aligned() {
        let layout = layout_mesh_shader_lds(&state(17, 9, 12, 4), &writer(true)).unwrap();
        let spans: Vec<LdsRegionSpan> = layout.iter().map(|(_, s)| s).collect();
        let mut sum = 0;
        for (i, a) in spans.iter().enumerate() {
            assert_eq!(a.offset % 4, 0);
            sum += a.size;
            for b in &spans[i + 1..] {
                assert!(a.end() <= b.offset || b.end() <= a.offset);
            }
        }
        assert_eq!(sum, layout.total_size());
    }

    #[test]
    fn test_flat_id_region_follows_builtin_use() {
        let without = layout_mesh_shader_lds(&state(8, 8, 4, 4), &writer(false)).unwrap();
        assert!(!without.has(MeshLdsRegion::FlatWorkgroupId));
        let with = layout_mesh_shader_lds(&state(8, 8, 4, 4), &writer(true)).unwrap();
        assert_eq!(
            with.region(MeshLdsRegion::FlatWorkgroupId),
            Some(LdsRegionSpan { offset: 8, size: 4 })
        );

        let mut forced = state(8, 8, 4, 4);
        forced.mesh.use_flat_workgroup_id = true;
        assert!(layout_mesh_shader_lds(&forced, &writer(false))
            .unwrap()
            .has(MeshLdsRegion::FlatWorkgroupId));
    }

    #[test]
    fn test_zero_sized_indices_distinct_from_absent() {
        let layout = layout_mesh_shader_lds(&state(8, 0, 0, 0), &writer(false)).unwrap();
        assert_eq!(
            layout.region(MeshLdsRegion::PrimitiveIndices),
            Some(LdsRegionSpan { offset: 8, size: 0 })
        );
        assert_eq!(layout.region(MeshLdsRegion::VertexOutput), None);
        assert_eq!(layout.region(MeshLdsRegion::PrimitiveOutput), None);
        assert_eq!(layout.total_size(), 8);
    }

    #[test]
    fn test_unused_outputs_get_no_region() {
        let mut f = Function::new("silent", ShaderStage::Mesh);
        Builder::new(&mut f).ret();
        let layout = layout_mesh_shader_lds(&state(8, 8, 16, 16), &f).unwrap();
        assert!(!layout.has(MeshLdsRegion::VertexOutput));
        assert!(!layout.has(MeshLdsRegion::PrimitiveOutput));
    }

    #[test]
    fn test_overflow_names_region() {
        // 256 vertices × 256 bytes = 64 KiB of vertex outputs alone
        let err = layout_mesh_shader_lds(&state(256, 16, 256, 0), &writer(false)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("LDS"));
        assert!(err.notes[0].contains("VertexOutput"));
    }

    #[test]
    fn test_layout_display() {
        let layout = layout_mesh_shader_lds(&state(4, 2, 8, 0), &writer(false)).unwrap();
        insta::assert_snapshot!(layout.to_string(), @r"
        VertexCount      offset     0  size     4
        PrimitiveCount   offset     4  size     4
        PrimitiveIndices offset     8  size    24
        VertexOutput     offset    32  size    32
        total 64 bytes
        ");
    }

    #[test]
    fn test_get_or_create_mesh_lds() {
        let mut module = Module::new();
        let g = get_or_create_mesh_lds(&mut module, 100);
        assert_eq!(get_or_create_mesh_lds(&mut module, 200), g);
        assert_eq!(module.global(g).size, 200);
        assert_eq!(module.global(g).kind, GlobalKind::Lds);
    }
}
