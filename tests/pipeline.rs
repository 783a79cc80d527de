//! End-to-end behaviour of lowered pipelines on the reference executor.

use taskmesh::config::{GfxIpVersion, PipelineState};
use taskmesh::ir::builder::Builder;
use taskmesh::ir::{BuiltIn, Elem, FuncId, Function, IntPredicate, Module, ShaderStage, Value};
use taskmesh::lower::builtins::unflatten;
use taskmesh::lower::export::hw_shading_rate;
use taskmesh::lower::{MeshLdsRegion, PAYLOAD_RING_ENTRY_SIZE};
use taskmesh::samples::{
    self, reference_attr, reference_culled, reference_launch, reference_pair, reference_payload,
    reference_shading_rate,
};
use taskmesh::sim::{Simulator, WorkgroupExports};
use taskmesh::{lower_reference, MeshTaskShader};

/// `if cond { body }` with the cursor left in the merge block.
fn guarded(b: &mut Builder<'_>, cond: Value, body: impl FnOnce(&mut Builder<'_>)) {
    let then = b.add_block("then");
    let merge = b.add_block("merge");
    b.cond_br(cond, then, merge);
    b.set_insert_point_end(then);
    body(b);
    b.br(merge);
    b.set_insert_point_end(merge);
}

fn lower_mesh(state: &PipelineState, build: impl FnOnce(&mut Builder<'_>)) -> (Module, FuncId) {
    let mut f = Function::new("mesh_main", ShaderStage::Mesh);
    let mut b = Builder::new(&mut f);
    build(&mut b);
    b.ret();
    let mut module = Module::new();
    let mesh = module.add_function(f);
    MeshTaskShader::new(state)
        .process(&mut module, None, Some(mesh))
        .unwrap();
    (module, mesh)
}

fn expected_primitive_count(wg: &WorkgroupExports) -> usize {
    let allocated = wg.alloc.unwrap()[1];
    (0..allocated).filter(|&i| !reference_culled(i)).count()
}

#[test]
fn test_layout_regions_disjoint_and_summed() {
    for state in [samples::mesh_only_state(), samples::task_mesh_state()] {
        let pair = reference_pair(&state).unwrap();
        let mesh = pair.module.function(pair.mesh).unwrap();
        let layout = MeshTaskShader::new(&state).layout_mesh_shader_lds(mesh).unwrap();

        let spans: Vec<_> = layout.iter().map(|(_, span)| span).collect();
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!(a.end() <= b.offset || b.end() <= a.offset, "{}", layout);
            }
        }
        let sum: u32 = spans.iter().map(|s| s.size).sum();
        assert_eq!(sum, layout.total_size());
        assert!(layout.has(MeshLdsRegion::VertexOutput));
        assert!(layout.has(MeshLdsRegion::PrimitiveOutput));
    }
}

#[test]
fn test_workgroup_id_round_trip() {
    let state = samples::mesh_only_state();
    let (module, mesh) = lower_mesh(&state, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let id = b.read_builtin(BuiltIn::WorkgroupId);
        let flat = b.read_builtin(BuiltIn::FlatWorkgroupId);
        let one = b.const_i32(1);
        let zero = b.const_i32(0);
        b.set_mesh_outputs(one, zero);
        let first = b.icmp(IntPredicate::Eq, tid, zero);
        guarded(b, first, |b| {
            for axis in 0..3 {
                let offset = b.const_i32(axis);
                let lane = b.extract(id, axis);
                b.write_vertex_output(offset, zero, lane);
            }
            let offset = b.const_i32(3);
            b.write_vertex_output(offset, zero, flat);
        });
    });

    let dims = [2, 3, 2];
    let mut sim = Simulator::new(&module, &state);
    let workgroups = sim.run_mesh_dispatch(mesh, dims).unwrap();
    assert_eq!(workgroups.len(), 12);
    for (flat, wg) in workgroups.iter().enumerate() {
        let flat = flat as u32;
        let [x, y, z] = unflatten(flat, dims);
        assert_eq!(wg.alloc, Some([1, 0]));
        assert_eq!(wg.vertex(0).unwrap().attrs, vec![x, y, z, flat]);
    }
}

#[test]
fn test_set_mesh_outputs_sizes_export() {
    let mut state = samples::mesh_only_state();
    state.mesh.per_vertex_output_bytes = 0;
    state.mesh.per_primitive_output_bytes = 0;
    state.mesh.shading_rate_dword = None;
    let (module, mesh) = lower_mesh(&state, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let five = b.const_i32(5);
        let three = b.const_i32(3);
        b.set_mesh_outputs(five, three);
        let in_range = b.icmp(IntPredicate::Ult, tid, three);
        guarded(b, in_range, |b| {
            let second = b.add_imm(tid, 1);
            let third = b.add_imm(tid, 2);
            let indices = b.vector(Elem::I32, &[tid, second, third]);
            b.set_primitive_indices(tid, indices);
        });
    });

    let mut sim = Simulator::new(&module, &state);
    let workgroups = sim.run_mesh_dispatch(mesh, [1, 1, 1]).unwrap();
    let wg = &workgroups[0];
    assert_eq!(wg.alloc, Some([5, 3]));
    assert_eq!(wg.vertices.len(), 5);
    assert_eq!(wg.primitives.len(), 3);
    for i in 0..3 {
        let primitive = wg.primitive(i).unwrap();
        assert_eq!(primitive.indices, vec![i, i + 1, i + 2]);
        assert!(primitive.attrs.is_empty());
        assert_eq!(primitive.shading_rate, None);
    }
}

#[test]
fn test_cull_flag_only_where_set() {
    let state = samples::mesh_only_state();
    let (module, mesh) = lower_mesh(&state, |b| {
        let tid = b.read_builtin(BuiltIn::LocalInvocationIndex);
        let flat = b.read_builtin(BuiltIn::FlatWorkgroupId);
        let zero = b.const_i32(0);
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let four = b.const_i32(4);
        b.set_mesh_outputs(four, two);
        let in_range = b.icmp(IntPredicate::Ult, tid, two);
        guarded(b, in_range, |b| {
            let second = b.add_imm(tid, 1);
            let third = b.add_imm(tid, 2);
            let indices = b.vector(Elem::I32, &[tid, second, third]);
            b.set_primitive_indices(tid, indices);
            // only workgroup 0 marks anything, and only primitive 1 as culled
            let first_group = b.icmp(IntPredicate::Eq, flat, zero);
            guarded(b, first_group, |b| {
                let culled = b.icmp(IntPredicate::Eq, tid, one);
                b.set_primitive_culled(tid, culled);
            });
        });
    });

    // stale LDS with every cull bit set
    let mut sim = Simulator::new(&module, &state).with_lds_fill(0xff);
    let workgroups = sim.run_mesh_dispatch(mesh, [2, 1, 1]).unwrap();
    let exported: Vec<Vec<u32>> = workgroups
        .iter()
        .map(|wg| {
            let mut indices: Vec<u32> = wg.primitives.iter().map(|p| p.index).collect();
            indices.sort_unstable();
            indices
        })
        .collect();
    assert_eq!(exported, vec![vec![0], vec![0, 1]]);
    let primitive = workgroups[1].primitive(1).unwrap();
    assert_eq!(primitive.indices, vec![1, 2, 3]);
}

#[test]
fn test_mesh_only_reference_outputs() {
    let state = samples::mesh_only_state();
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state);
    let run = sim.run_pipeline(None, pair.mesh, [2, 1, 1]).unwrap();
    assert!(run.launches.is_empty());
    assert!(run.stats.is_none());
    assert_eq!(run.mesh_workgroups.len(), 2);

    for (flat, wg) in run.mesh_workgroups.iter().enumerate() {
        let base = flat as u32;
        assert_eq!(wg.alloc, Some([16, 8]));
        assert_eq!(wg.vertices.len(), 16);
        for v in 0..16 {
            let attrs: Vec<u32> = (0..4).map(|d| reference_attr(base, v, d)).collect();
            assert_eq!(wg.vertex(v).unwrap().attrs, attrs);
        }
        assert_eq!(wg.primitives.len(), expected_primitive_count(wg));
        for p in 0..8 {
            let Some(primitive) = wg.primitive(p) else {
                assert!(reference_culled(p), "primitive {} missing", p);
                continue;
            };
            assert!(!reference_culled(p), "culled primitive {} exported", p);
            assert_eq!(primitive.indices, vec![p % 16, (p + 1) % 16, (p + 2) % 16]);
            assert_eq!(
                primitive.attrs,
                vec![reference_attr(base, p, 0), reference_shading_rate(p)]
            );
            assert_eq!(
                primitive.shading_rate,
                Some(hw_shading_rate(reference_shading_rate(p)))
            );
        }
    }
}

#[test]
fn test_task_payload_reaches_mesh() {
    let state = samples::task_mesh_state();
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state);
    let run = sim.run_pipeline(pair.task, pair.mesh, [3, 1, 1]).unwrap();

    let counters: Vec<u32> = run.launches.iter().map(|l| l.ring_counter).collect();
    assert_eq!(counters, vec![0, 1, 2]);
    for launch in &run.launches {
        assert_eq!(launch.group_count, reference_launch(launch.ring_counter));
    }
    // 1 + 2 + 1 mesh workgroups, each reading its task's payload
    let bases: Vec<u32> = run
        .mesh_workgroups
        .iter()
        .map(|wg| wg.vertex(0).unwrap().attrs[0])
        .collect();
    let expected: Vec<u32> = [0, 1, 1, 2]
        .into_iter()
        .map(|task| reference_attr(reference_payload(task), 0, 0))
        .collect();
    assert_eq!(bases, expected);

    // every task invocation bumped the payload counter of its entry
    let ring = pair.module.find_global("task.payload_ring").unwrap();
    let bytes = sim.global_bytes(ring);
    for entry in 0..3usize {
        let at = entry * PAYLOAD_RING_ENTRY_SIZE as usize + 4;
        let count: u32 = bytemuck::pod_read_unaligned(&bytes[at..at + 4]);
        assert_eq!(count, 32);
    }
}

#[test]
fn test_ring_wraps_around() {
    let state = samples::task_mesh_state();
    assert_eq!(state.ring.entry_count, 4);
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state);

    let first = sim.run_pipeline(pair.task, pair.mesh, [6, 1, 1]).unwrap();
    assert_eq!(first.launches.len(), 6);
    assert_eq!(sim.next_ring_counter(), 6);
    let last = first.mesh_workgroups.last().unwrap();
    assert_eq!(
        last.vertex(0).unwrap().attrs[0],
        reference_attr(reference_payload(5), 0, 0)
    );

    // second lap over entries 2 and 3 uses the opposite ready flag
    let second = sim.run_pipeline(pair.task, pair.mesh, [2, 1, 1]).unwrap();
    let counters: Vec<u32> = second.launches.iter().map(|l| l.ring_counter).collect();
    assert_eq!(counters, vec![6, 7]);
    assert_eq!(second.mesh_workgroups.len(), 1 + 2);
    assert_eq!(sim.draw_data(2).unwrap().ready, 0);
}

#[test]
fn test_pipeline_statistics() {
    let state = samples::task_mesh_state();
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state);
    let run = sim.run_pipeline(pair.task, pair.mesh, [3, 1, 1]).unwrap();

    let stats = run.stats.unwrap();
    assert_eq!(stats.num_task_threads, 3 * 32);
    assert_eq!(stats.num_mesh_threads, 4 * 32);
    // culled primitives still count
    assert_eq!(stats.num_mesh_primitives, 4 * 8);
}

#[test]
fn test_no_shading_rate_before_gfx10_3() {
    let mut state = samples::mesh_only_state();
    state.gfx_ip = GfxIpVersion::new(10, 1, 0);
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state);
    let run = sim.run_pipeline(None, pair.mesh, [1, 1, 1]).unwrap();
    let wg = &run.mesh_workgroups[0];
    assert!(!wg.primitives.is_empty());
    assert!(wg.primitives.iter().all(|p| p.shading_rate.is_none()));
}

#[test]
fn test_unpublished_entry_spins_until_step_limit() {
    let state = samples::task_mesh_state();
    let (pair, _) = lower_reference(&state).unwrap();
    let mut sim = Simulator::new(&pair.module, &state).with_step_limit(10_000);
    let err = sim.run_mesh_dispatch(pair.mesh, [1, 1, 1]).unwrap_err();
    assert_eq!(err.kind, taskmesh::ErrorKind::InvalidState);
}
