use super::*;
use crate::diagnostic::ErrorKind;
use crate::ir::builder::Builder;
use crate::ir::{Elem, Ordering};
use crate::samples;

fn lds_module(f: Function) -> (Module, GlobalId) {
    let mut module = Module::new();
    let lds = module.get_or_create_global("mesh.lds", GlobalKind::Lds, 16);
    module.add_function(f);
    (module, lds)
}

fn dword(bytes: &[u8], offset: usize) -> u32 {
    bytemuck::pod_read_unaligned(&bytes[offset..offset + 4])
}

fn lowered(mut f: Function) -> Function {
    f.lowered = true;
    f
}

#[test]
fn test_atomics_and_loop_phis() {
    let mut f = Function::new("count", ShaderStage::Mesh);
    let lds = GlobalId(0);
    let mut b = Builder::new(&mut f);
    let one = b.const_i32(1);
    let zero = b.const_i32(0);
    let four = b.const_i32(4);
    let end = b.const_i32(4);
    b.atomic_rmw(AtomicOp::Add, lds, zero, one, Ordering::Monotonic);
    b.strided_loop(zero, end, one, "sum", |b, i| {
        b.atomic_rmw(AtomicOp::Add, lds, four, i, Ordering::Monotonic);
    });
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let exports = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 3)
        .unwrap();
    assert_eq!(exports, WorkgroupExports::default());
    let bytes = sim.global_bytes(GlobalId(0));
    assert_eq!(dword(bytes, 0), 3);
    assert_eq!(dword(bytes, 4), 3 * (1 + 2 + 3));
}

#[test]
fn test_vector_lanes() {
    let mut f = Function::new("lanes", ShaderStage::Mesh);
    let lds = GlobalId(0);
    let mut b = Builder::new(&mut f);
    let lanes: Vec<Value> = [5, 6, 7].into_iter().map(|v| b.const_i32(v)).collect();
    let v = b.vector(Elem::I32, &lanes);
    let nine = b.const_i32(9);
    let v = b.insert_element(v, nine, 2);
    let middle = b.extract(v, 1);
    let last = b.extract(v, 2);
    let zero = b.const_i32(0);
    b.store(lds, zero, middle);
    let four = b.const_i32(4);
    b.store(lds, four, last);
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    sim.run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap();
    let bytes = sim.global_bytes(GlobalId(0));
    assert_eq!((dword(bytes, 0), dword(bytes, 4)), (6, 9));
}

#[test]
fn test_barrier_divergence_detected() {
    let mut f = Function::new("split", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let lane = b.read_hw(HwReg::ThreadIdInWave);
    let zero = b.const_i32(0);
    let first = b.icmp(IntPredicate::Eq, lane, zero);
    b.ret();
    b.set_insert_point(BlockId(0), 3);
    b.if_then(first, "first");
    b.barrier();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 2)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Divergence);
}

#[test]
fn test_uniform_barrier_releases() {
    let mut f = Function::new("sync", ShaderStage::Mesh);
    let lds = GlobalId(0);
    let mut b = Builder::new(&mut f);
    let lane = b.read_hw(HwReg::ThreadIdInWave);
    let zero = b.const_i32(0);
    let four = b.const_i32(4);
    let seven = b.const_i32(7);
    let first = b.icmp(IntPredicate::Eq, lane, zero);
    let then = b.add_block("then");
    let merge = b.add_block("merge");
    b.cond_br(first, then, merge);
    b.set_insert_point_end(then);
    b.store(lds, zero, seven);
    b.br(merge);
    b.set_insert_point_end(merge);
    b.barrier();
    let seen = b.load(Ty::I32, lds, zero);
    b.atomic_rmw(AtomicOp::Add, lds, four, seen, Ordering::Monotonic);
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    sim.run_workgroup(&module.functions[0], HwEnv::default(), 4)
        .unwrap();
    let bytes = sim.global_bytes(GlobalId(0));
    assert_eq!(dword(bytes, 4), 4 * 7);
}

#[test]
fn test_runaway_loop_hits_step_limit() {
    let mut f = Function::new("spin", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let spin = b.add_block("spin");
    b.br(spin);
    b.set_insert_point_end(spin);
    b.br(spin);

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state).with_step_limit(100);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(err.help.is_some());
}

#[test]
fn test_abstract_op_rejected() {
    let mut f = Function::new("raw", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let zero = b.const_i32(0);
    b.set_mesh_outputs(zero, zero);
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[test]
fn test_unlowered_entry_point_rejected() {
    let mut f = Function::new("fresh", ShaderStage::Mesh);
    Builder::new(&mut f).ret();
    let (module, _) = lds_module(f);
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let err = sim.run_mesh_dispatch(FuncId(0), [1, 1, 1]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(err.message.contains("not been lowered"));
}

#[test]
fn test_export_space_rules() {
    let mut f = Function::new("exports", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let two = b.const_i32(2);
    let one = b.const_i32(1);
    b.alloc_export(two, one);
    b.export_vertex(one, vec![two]);
    b.alloc_export(two, one);
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap_err();
    assert!(err.message.contains("twice"));

    let mut f = Function::new("early", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let zero = b.const_i32(0);
    b.export_vertex(zero, Vec::new());
    b.ret();
    let (module, _) = lds_module(lowered(f));
    let mut sim = Simulator::new(&module, &state);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap_err();
    assert!(err.message.contains("before allocating"));
}

#[test]
fn test_out_of_bounds_access() {
    let mut f = Function::new("oob", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    let addr = b.const_i32(16);
    b.load(Ty::I32, GlobalId(0), addr);
    b.ret();

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let err = sim
        .run_workgroup(&module.functions[0], HwEnv::default(), 1)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert!(err.message.contains("mesh.lds"));
}

#[test]
fn test_hardware_registers() {
    let mut f = Function::new("regs", ShaderStage::Mesh);
    let lds = GlobalId(0);
    let mut b = Builder::new(&mut f);
    let wave = b.read_hw(HwReg::WaveIdInSubgroup);
    let zero = b.const_i32(0);
    let is_wave0 = b.icmp(IntPredicate::Eq, wave, zero);
    let flat = b.read_hw(HwReg::FlatWorkgroupId);
    let y = b.read_hw(HwReg::NumWorkgroups(1));
    b.ret();
    b.set_insert_point(BlockId(0), 5);
    b.if_then(is_wave0, "wave0");
    let four = b.const_i32(4);
    b.store(lds, zero, flat);
    b.store(lds, four, y);

    let (module, _) = lds_module(lowered(f));
    let state = samples::mesh_only_state();
    let mut sim = Simulator::new(&module, &state);
    let env = HwEnv {
        flat_workgroup_id: 5,
        num_workgroups: [2, 3, 4],
        ..HwEnv::default()
    };
    sim.run_workgroup(&module.functions[0], env, 2).unwrap();
    let bytes = sim.global_bytes(GlobalId(0));
    assert_eq!((dword(bytes, 0), dword(bytes, 4)), (5, 3));
}
