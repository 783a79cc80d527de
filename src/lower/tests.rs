use super::*;
use crate::config::PipelineState;
use crate::ir::builder::Builder;
use crate::ir::{BuiltIn, InstKind, Ty};
use crate::samples::{self, reference_pair};

fn block_named(func: &Function, name: &str) -> bool {
    func.blocks.iter().any(|b| b.name == name)
}

fn single(stage: ShaderStage, build: impl FnOnce(&mut Builder<'_>)) -> (Module, FuncId) {
    let mut f = Function::new(format!("{}_main", stage.name()), stage);
    let mut b = Builder::new(&mut f);
    build(&mut b);
    b.ret();
    let mut module = Module::new();
    let id = module.add_function(f);
    (module, id)
}

#[test]
fn test_stats_entry_layout() {
    assert_eq!(MeshPipeStatsEntry::SIZE, 24);
    assert_eq!(MeshPipeStatsEntry::NUM_MESH_THREADS_OFFSET, 0);
    assert_eq!(MeshPipeStatsEntry::NUM_MESH_PRIMITIVES_OFFSET, 8);
    assert_eq!(MeshPipeStatsEntry::NUM_TASK_THREADS_OFFSET, 16);
}

#[test]
fn test_process_creates_globals() {
    let state = samples::task_mesh_state();
    let mut pair = reference_pair(&state).unwrap();
    let summary = MeshTaskShader::new(&state)
        .process(&mut pair.module, pair.task, Some(pair.mesh))
        .unwrap();

    let module = &pair.module;
    let lds = module.find_global(MESH_LDS_NAME).unwrap();
    assert_eq!(summary.lds, Some(lds));
    assert_eq!(
        module.global(lds).size,
        summary.layout.as_ref().unwrap().total_size()
    );

    let ring = summary.ring.unwrap();
    assert_eq!(ring.entry_count, 4);
    assert_eq!(module.global(ring.payload_ring).name, PAYLOAD_RING_NAME);
    assert_eq!(module.global(ring.payload_ring).size, 4 * PAYLOAD_RING_ENTRY_SIZE);
    assert_eq!(module.global(ring.draw_data_ring).size, 4 * DRAW_DATA_RING_ENTRY_SIZE);

    let stats = summary.stats.unwrap();
    assert_eq!(module.global(stats).name, PIPELINE_STATS_NAME);
    assert_eq!(module.global(stats).kind, GlobalKind::PipelineStats);
    assert_eq!(module.global(stats).size, MeshPipeStatsEntry::SIZE);
}

#[test]
fn test_lowered_functions_are_concrete() {
    let state = samples::task_mesh_state();
    let mut pair = reference_pair(&state).unwrap();
    MeshTaskShader::new(&state)
        .process(&mut pair.module, pair.task, Some(pair.mesh))
        .unwrap();

    for func in &pair.module.functions {
        assert!(func.lowered);
        assert!(next_mesh_task_op(func).is_none(), "{}", func);
        verify_function(func).unwrap();
    }
    let task = pair.module.function(pair.task.unwrap()).unwrap();
    assert!(block_named(task, "task.prologue"));
    assert!(block_named(task, "task.emit.then"));
    assert!(block_named(task, "task.stats.then"));

    let mesh = pair.module.function(pair.mesh).unwrap();
    assert_eq!(mesh.block(mesh.entry).name, "mesh.prologue");
    for name in ["mesh.ring.poll", "mesh.init.then", "mesh.export", "mesh.alloc.then"] {
        assert!(block_named(mesh, name), "missing {}", name);
    }
    // the body no longer returns on its own
    let rets = mesh
        .insts()
        .filter(|(_, _, inst)| matches!(inst.kind, InstKind::Ret))
        .count();
    assert_eq!(rets, 1);
}

#[test]
fn test_cull_bits_cleared_only_when_culling() {
    let state = samples::mesh_only_state();
    let mut pair = reference_pair(&state).unwrap();
    MeshTaskShader::new(&state)
        .process(&mut pair.module, None, Some(pair.mesh))
        .unwrap();
    let mesh = pair.module.function(pair.mesh).unwrap();
    assert!(block_named(mesh, "mesh.cull.clear.body"));

    let (mut module, mesh) = single(ShaderStage::Mesh, |b| {
        let one = b.const_i32(1);
        b.set_mesh_outputs(one, one);
    });
    MeshTaskShader::new(&state)
        .process(&mut module, None, Some(mesh))
        .unwrap();
    let mesh = module.function(mesh).unwrap();
    assert!(!block_named(mesh, "mesh.cull.clear.body"));
}

#[test]
fn test_mesh_only_has_no_rings() {
    let state = samples::mesh_only_state();
    let mut pair = reference_pair(&state).unwrap();
    let summary = MeshTaskShader::new(&state)
        .process(&mut pair.module, None, Some(pair.mesh))
        .unwrap();
    assert!(summary.ring.is_none());
    assert!(summary.stats.is_none());
    assert!(pair.module.find_global(PAYLOAD_RING_NAME).is_none());
    let mesh = pair.module.function(pair.mesh).unwrap();
    assert!(!block_named(mesh, "mesh.ring.poll"));
}

#[test]
fn test_second_process_is_rejected() {
    let state = samples::task_mesh_state();
    let mut pair = reference_pair(&state).unwrap();
    let shader = MeshTaskShader::new(&state);
    shader
        .process(&mut pair.module, pair.task, Some(pair.mesh))
        .unwrap();
    let lowered = pair.module.clone();
    let err = shader
        .process(&mut pair.module, pair.task, Some(pair.mesh))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(err.message.contains("already been lowered"));
    assert_eq!(pair.module, lowered);
}

#[test]
fn test_wrong_stage_is_rejected() {
    let state = samples::task_mesh_state();
    let mut pair = reference_pair(&state).unwrap();
    let err = MeshTaskShader::new(&state)
        .process(&mut pair.module, Some(pair.mesh), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[test]
fn test_task_entry_needs_task_state() {
    let state = samples::mesh_only_state();
    let (mut module, task) = single(ShaderStage::Task, |b| {
        let one = b.const_i32(1);
        b.emit_mesh_tasks(one, one, one);
    });
    let err = MeshTaskShader::new(&state)
        .process(&mut module, Some(task), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[test]
fn test_divergent_launch_count() {
    let state = samples::task_mesh_state();
    let (mut module, task) = single(ShaderStage::Task, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let one = b.const_i32(1);
        b.emit_mesh_tasks(tid, one, one);
    });
    let before = module.clone();
    let err = MeshTaskShader::new(&state)
        .process(&mut module, Some(task), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Divergence);
    assert!(err.snippet.is_some());
    assert_eq!(module, before);
}

#[test]
fn test_uniform_launch_from_workgroup_id() {
    let state = samples::task_mesh_state();
    let (mut module, task) = single(ShaderStage::Task, |b| {
        let id = b.read_builtin(BuiltIn::WorkgroupId);
        let x = b.extract(id, 0);
        let one = b.const_i32(1);
        b.emit_mesh_tasks(x, one, one);
    });
    assert!(MeshTaskShader::new(&state)
        .process(&mut module, Some(task), None)
        .is_ok());
}

#[test]
fn test_payload_offset_past_declared_size() {
    let state = samples::task_mesh_state();
    let (mut module, task) = single(ShaderStage::Task, |b| {
        let offset = b.const_i32(62);
        let value = b.const_i32(9);
        b.write_task_payload(offset, value);
    });
    let err = MeshTaskShader::new(&state)
        .process(&mut module, Some(task), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
    assert!(err.message.contains("64 bytes"));
}

#[test]
fn test_payload_write_in_mesh() {
    let state = samples::task_mesh_state();
    let (mut module, mesh) = single(ShaderStage::Mesh, |b| {
        let zero = b.const_i32(0);
        b.write_task_payload(zero, zero);
    });
    let err = MeshTaskShader::new(&state)
        .process(&mut module, None, Some(mesh))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
    assert!(err.message.contains("read-only"));
}

#[test]
fn test_payload_read_without_task() {
    let state = samples::mesh_only_state();
    let (mut module, mesh) = single(ShaderStage::Mesh, |b| {
        let zero = b.const_i32(0);
        b.read_task_payload(Ty::I32, zero);
    });
    let err = MeshTaskShader::new(&state)
        .process(&mut module, None, Some(mesh))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
}

#[test]
fn test_lds_overflow_leaves_module_untouched() {
    let mut state: PipelineState = samples::mesh_only_state();
    state.mesh.max_vertices = 256;
    state.mesh.per_vertex_output_bytes = 256;
    let (mut module, mesh) = single(ShaderStage::Mesh, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let zero = b.const_i32(0);
        b.write_vertex_output(zero, tid, tid);
    });
    let before = module.clone();
    let err = MeshTaskShader::new(&state)
        .process(&mut module, None, Some(mesh))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert_eq!(module, before);
}

#[test]
fn test_malformed_ssa_is_rejected() {
    let state = samples::mesh_only_state();
    let mut f = Function::new("broken", ShaderStage::Mesh);
    Builder::new(&mut f).const_i32(1);
    let mut module = Module::new();
    let mesh = module.add_function(f);
    let err = MeshTaskShader::new(&state)
        .process(&mut module, None, Some(mesh))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
}

#[test]
fn test_nothing_to_lower() {
    let state = samples::mesh_only_state();
    let mut module = Module::new();
    let summary = MeshTaskShader::new(&state)
        .process(&mut module, None, None)
        .unwrap();
    assert!(summary.layout.is_none());
    assert!(module.globals.is_empty());
}

#[test]
fn test_payload_offset_check_ignores_dynamic_offsets() {
    let state = samples::task_mesh_state();
    let (mut module, task) = single(ShaderStage::Task, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let offset = b.mul_imm(tid, 4096);
        b.write_task_payload(offset, tid);
        let one = b.const_i32(1);
        b.emit_mesh_tasks(one, one, one);
    });
    assert!(MeshTaskShader::new(&state)
        .process(&mut module, Some(task), None)
        .is_ok());
}
