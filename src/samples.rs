//! Reference task/mesh shader pairs built with the IR builder.
//!
//! The pair exercises every abstract operation the lowering handles and
//! produces outputs whose values can be predicted from the workgroup and
//! invocation ids alone:
//!
//! - the task shader stores `flatId * 7 + 1` at payload offset 0, counts
//!   its invocations at offset 4 and launches `1 + (flatId & 1)` mesh
//!   workgroups;
//! - the mesh shader emits `min(maxVertices, N)` vertices and
//!   `min(maxPrimitives, N)` primitives, primitive `i` indexing vertices
//!   `(i + k) mod vertexCount`, and culls every fourth primitive.

use crate::config::{
    GfxIpVersion, MeshState, OutputPrimitive, PipelineState, RingState, TaskState,
};
use crate::diagnostic::Diagnostic;
use crate::ir::builder::Builder;
use crate::ir::{
    AtomicOp, BuiltIn, Elem, FuncId, Function, IntPredicate, Module, Ordering, ShaderStage, Ty,
    Value,
};

/// Attribute dword `d` of output slot `slot` produced under `base`.
pub fn reference_attr(base: u32, slot: u32, dword: u32) -> u32 {
    base.wrapping_mul(4096)
        .wrapping_add(slot * 16)
        .wrapping_add(dword)
}

/// API shading rate the reference mesh shader gives primitive `i`.
pub fn reference_shading_rate(primitive: u32) -> u32 {
    primitive & 15
}

/// Whether the reference mesh shader culls primitive `i`.
pub fn reference_culled(primitive: u32) -> bool {
    primitive & 3 == 3
}

/// Payload value the reference task shader stores for workgroup `flat`.
pub fn reference_payload(flat: u32) -> u32 {
    flat.wrapping_mul(7).wrapping_add(1)
}

/// Mesh workgroups the reference task shader launches from workgroup `flat`.
pub fn reference_launch(flat: u32) -> [u32; 3] {
    [1 + (flat & 1), 1, 1]
}

/// A mesh-only pipeline on GFX10.3.
pub fn mesh_only_state() -> PipelineState {
    PipelineState {
        gfx_ip: GfxIpVersion::new(10, 3, 0),
        wave_size: 64,
        task: None,
        mesh: MeshState {
            workgroup_size: [32, 1, 1],
            output_primitive: OutputPrimitive::Triangles,
            max_vertices: 16,
            max_primitives: 8,
            per_vertex_output_bytes: 16,
            per_primitive_output_bytes: 8,
            shading_rate_dword: Some(1),
            use_flat_workgroup_id: false,
        },
        ring: RingState::default(),
        pipeline_stats: false,
    }
}

/// A task + mesh pipeline with a shallow ring and statistics enabled.
pub fn task_mesh_state() -> PipelineState {
    PipelineState {
        task: Some(TaskState {
            workgroup_size: [32, 1, 1],
            payload_size: 64,
        }),
        ring: RingState { entry_count: 4 },
        pipeline_stats: true,
        ..mesh_only_state()
    }
}

pub struct ReferencePair {
    pub module: Module,
    pub task: Option<FuncId>,
    pub mesh: FuncId,
}

/// Build the reference pair for `state`. The task shader is only built
/// when the pipeline has task state.
pub fn reference_pair(state: &PipelineState) -> Result<ReferencePair, Diagnostic> {
    state.validate()?;
    let mut module = Module::new();
    let task = state
        .task
        .as_ref()
        .map(|task| module.add_function(reference_task(task)));
    let mesh = module.add_function(reference_mesh(state));
    Ok(ReferencePair { module, task, mesh })
}

/// `if cond { body }`, leaving the cursor in the merge block.
fn guarded(b: &mut Builder<'_>, cond: Value, name: &str, body: impl FnOnce(&mut Builder<'_>)) {
    let then = b.add_block(format!("{}.then", name));
    let merge = b.add_block(format!("{}.merge", name));
    b.cond_br(cond, then, merge);
    b.set_insert_point_end(then);
    body(b);
    b.br(merge);
    b.set_insert_point_end(merge);
}

fn reference_task(task: &TaskState) -> Function {
    let mut f = Function::new("task_main", ShaderStage::Task);
    let mut b = Builder::new(&mut f);
    let flat = b.read_builtin(BuiltIn::FlatWorkgroupId);
    let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
    let zero = b.const_i32(0);
    let first = b.icmp(IntPredicate::Eq, tid, zero);

    if task.payload_size >= 4 {
        let scaled = b.mul_imm(flat, 7);
        let value = b.add_imm(scaled, 1);
        let counts_threads = task.payload_size >= 8;
        guarded(&mut b, first, "task.payload", |b| {
            b.write_task_payload(zero, value);
            if counts_threads {
                let four = b.const_i32(4);
                b.write_task_payload(four, zero);
            }
        });
        if counts_threads {
            b.barrier();
            let four = b.const_i32(4);
            let one = b.const_i32(1);
            b.task_payload_atomic(AtomicOp::Add, Ordering::Monotonic, four, one);
        }
    }

    let one = b.const_i32(1);
    let parity = b.and(flat, one);
    let x = b.add_imm(parity, 1);
    b.emit_mesh_tasks(x, one, one);
    b.ret();
    f
}

fn reference_mesh(state: &PipelineState) -> Function {
    let mesh = &state.mesh;
    let threads = mesh.threads_per_group();
    let vertex_count = mesh.max_vertices.min(threads);
    let primitive_count = if vertex_count == 0 {
        0
    } else {
        mesh.max_primitives.min(threads)
    };
    let reads_payload = state.task.as_ref().is_some_and(|t| t.payload_size >= 4);

    let mut f = Function::new("mesh_main", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
    let base = if reads_payload {
        let zero = b.const_i32(0);
        b.read_task_payload(Ty::I32, zero)
    } else {
        b.read_builtin(BuiltIn::FlatWorkgroupId)
    };
    let nv = b.const_i32(vertex_count);
    let np = b.const_i32(primitive_count);
    b.set_mesh_outputs(nv, np);

    let scaled_base = b.mul_imm(base, 4096);
    let slot = b.mul_imm(tid, 16);
    let attr_base = b.add(scaled_base, slot);

    if vertex_count > 0 && mesh.per_vertex_output_bytes > 0 {
        let in_range = b.icmp(IntPredicate::Ult, tid, nv);
        guarded(&mut b, in_range, "vertex", |b| {
            for dword in 0..mesh.vertex_output_dwords() {
                let offset = b.const_i32(dword);
                let value = b.add_imm(attr_base, dword);
                b.write_vertex_output(offset, tid, value);
            }
        });
    }

    if primitive_count > 0 {
        let in_range = b.icmp(IntPredicate::Ult, tid, np);
        guarded(&mut b, in_range, "primitive", |b| {
            let lanes: Vec<Value> = (0..mesh.indices_per_primitive())
                .map(|k| {
                    let shifted = b.add_imm(tid, k);
                    b.urem(shifted, nv)
                })
                .collect();
            let indices = match lanes.as_slice() {
                [single] => *single,
                _ => b.vector(Elem::I32, &lanes),
            };
            b.set_primitive_indices(tid, indices);

            for dword in 0..mesh.primitive_output_dwords() {
                let offset = b.const_i32(dword);
                let value = if mesh.shading_rate_dword == Some(dword) {
                    let flags = b.const_i32(15);
                    b.and(tid, flags)
                } else {
                    b.add_imm(attr_base, dword)
                };
                b.write_primitive_output(offset, tid, value);
            }

            let three = b.const_i32(3);
            let lane = b.and(tid, three);
            let culled = b.icmp(IntPredicate::Eq, lane, three);
            b.set_primitive_culled(tid, culled);
        });
    }
    b.ret();
    f
}
