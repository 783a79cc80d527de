//! Pipeline configuration consumed by the lowering.
//!
//! A `PipelineState` carries everything the mesh/task lowering needs to
//! know about the pipeline that is not visible in the IR: workgroup
//! dimensions, output limits and strides, payload size, ring depth,
//! target generation and whether pipeline statistics are collected.
//! It is usually loaded from a JSON file:
//!
//! ```json
//! {
//!   "gfx_ip": { "major": 10, "minor": 3 },
//!   "wave_size": 64,
//!   "task": { "workgroup_size": [32, 1, 1], "payload_size": 64 },
//!   "mesh": {
//!     "workgroup_size": [64, 1, 1],
//!     "output_primitive": "triangles",
//!     "max_vertices": 64,
//!     "max_primitives": 126,
//!     "per_vertex_output_bytes": 32,
//!     "per_primitive_output_bytes": 16
//!   },
//!   "ring": { "entry_count": 256 },
//!   "pipeline_stats": false
//! }
//! ```

pub mod target;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;
use crate::lower::ring::PAYLOAD_RING_ENTRY_SIZE;
use crate::span::Span;

pub use target::{GfxIpVersion, TargetInfo};

fn default_wave_size() -> u32 {
    64
}

/// Per-pipeline state of a task/mesh pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineState {
    pub gfx_ip: GfxIpVersion,
    #[serde(default = "default_wave_size")]
    pub wave_size: u32,
    /// Absent for mesh-only pipelines.
    #[serde(default)]
    pub task: Option<TaskState>,
    pub mesh: MeshState,
    #[serde(default)]
    pub ring: RingState,
    /// Collect mesh pipeline statistics into the statistics buffer.
    #[serde(default)]
    pub pipeline_stats: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskState {
    pub workgroup_size: [u32; 3],
    /// Declared size of the task payload in bytes.
    #[serde(default)]
    pub payload_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshState {
    pub workgroup_size: [u32; 3],
    pub output_primitive: OutputPrimitive,
    pub max_vertices: u32,
    pub max_primitives: u32,
    /// Byte stride of one vertex's outputs (multiple of 4).
    #[serde(default)]
    pub per_vertex_output_bytes: u32,
    /// Byte stride of one primitive's outputs (multiple of 4).
    #[serde(default)]
    pub per_primitive_output_bytes: u32,
    /// Dword within the per-primitive outputs holding the primitive
    /// shading rate, if the shader writes one.
    #[serde(default)]
    pub shading_rate_dword: Option<u32>,
    /// Force the flat workgroup id LDS slot even if no built-in needs it.
    #[serde(default)]
    pub use_flat_workgroup_id: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPrimitive {
    Points,
    Lines,
    Triangles,
}

impl OutputPrimitive {
    pub fn indices_per_primitive(self) -> u32 {
        match self {
            OutputPrimitive::Points => 1,
            OutputPrimitive::Lines => 2,
            OutputPrimitive::Triangles => 3,
        }
    }
}

/// Task-to-mesh ring configuration. The depth is supplied by the driver,
/// which also guarantees that no more task workgroups are in flight than
/// there are entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingState {
    pub entry_count: u32,
}

impl Default for RingState {
    fn default() -> Self {
        Self { entry_count: 256 }
    }
}

impl TaskState {
    pub fn threads_per_group(&self) -> u32 {
        self.workgroup_size.iter().product()
    }
}

impl MeshState {
    pub fn threads_per_group(&self) -> u32 {
        self.workgroup_size.iter().product()
    }

    pub fn indices_per_primitive(&self) -> u32 {
        self.output_primitive.indices_per_primitive()
    }

    pub fn vertex_output_dwords(&self) -> u32 {
        self.per_vertex_output_bytes / 4
    }

    pub fn primitive_output_dwords(&self) -> u32 {
        self.per_primitive_output_bytes / 4
    }
}

impl PipelineState {
    /// Load and validate a pipeline state from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::configuration(format!(
                "cannot read pipeline config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Parse and validate a pipeline state. `name` labels diagnostics.
    pub fn from_json(content: &str, name: &str) -> Result<Self, Diagnostic> {
        let state: PipelineState = serde_json::from_str(content).map_err(|e| {
            let span = line_span(content, e.line());
            Diagnostic::configuration(format!("invalid pipeline config: {}", e)).with_snippet(
                name,
                content.to_string(),
                span,
            )
        })?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn target(&self) -> TargetInfo {
        TargetInfo::new(self.gfx_ip, self.wave_size)
    }

    pub fn has_task_shader(&self) -> bool {
        self.task.is_some()
    }

    /// Check every constraint the lowering relies on.
    pub fn validate(&self) -> Result<(), Diagnostic> {
        let target = self.target();
        let err = |msg: String| Err(Diagnostic::configuration(msg));

        if !target.supports_mesh_shader() {
            return err(format!(
                "mesh shaders are not supported on {}",
                self.gfx_ip
            ));
        }
        if !TargetInfo::is_valid_wave_size(self.wave_size) {
            return err(format!(
                "wave size {} is not supported (expected 32 or 64)",
                self.wave_size
            ));
        }

        check_workgroup_size("mesh", self.mesh.workgroup_size, &target)?;
        let mesh = &self.mesh;
        let limit = target.max_mesh_outputs();
        if mesh.max_vertices > limit {
            return err(format!(
                "max_vertices {} exceeds the hardware limit of {}",
                mesh.max_vertices, limit
            ));
        }
        if mesh.max_primitives > limit {
            return err(format!(
                "max_primitives {} exceeds the hardware limit of {}",
                mesh.max_primitives, limit
            ));
        }
        if mesh.per_vertex_output_bytes % 4 != 0 || mesh.per_primitive_output_bytes % 4 != 0 {
            return err("output strides must be multiples of 4 bytes".to_string());
        }
        if let Some(dword) = mesh.shading_rate_dword {
            if dword >= mesh.primitive_output_dwords() {
                return err(format!(
                    "shading_rate_dword {} lies outside the {}-byte primitive outputs",
                    dword, mesh.per_primitive_output_bytes
                ));
            }
        }

        if let Some(task) = &self.task {
            check_workgroup_size("task", task.workgroup_size, &target)?;
            if task.payload_size > PAYLOAD_RING_ENTRY_SIZE {
                return err(format!(
                    "task payload of {} bytes exceeds the {}-byte payload ring entry",
                    task.payload_size, PAYLOAD_RING_ENTRY_SIZE
                ));
            }
            if !self.ring.entry_count.is_power_of_two() {
                return err(format!(
                    "ring entry_count {} is not a power of two",
                    self.ring.entry_count
                ));
            }
        }
        Ok(())
    }
}

fn check_workgroup_size(stage: &str, size: [u32; 3], target: &TargetInfo) -> Result<(), Diagnostic> {
    if size.contains(&0) {
        return Err(Diagnostic::configuration(format!(
            "{} workgroup size {:?} has a zero dimension",
            stage, size
        )));
    }
    let threads = size.iter().map(|&d| d as u64).product::<u64>();
    if threads > target.max_workgroup_threads() as u64 {
        return Err(Diagnostic::configuration(format!(
            "{} workgroup of {} threads exceeds the limit of {}",
            stage,
            threads,
            target.max_workgroup_threads()
        )));
    }
    Ok(())
}

/// Byte span of a 1-based line, for pointing diagnostics at JSON errors.
fn line_span(content: &str, line: usize) -> Span {
    let mut start = 0usize;
    for (i, l) in content.split_inclusive('\n').enumerate() {
        if i + 1 == line {
            let end = start + l.trim_end_matches('\n').len();
            return Span::new(start as u32, end as u32);
        }
        start += l.len();
    }
    Span::new(content.len() as u32, content.len() as u32)
}
