//! Reference executor for lowered task/mesh pipelines.
//!
//! Interprets lowered IR one workgroup at a time. Every invocation of a
//! workgroup runs until it reaches a barrier or returns; a barrier
//! releases once all invocations arrived. After each task workgroup the
//! executor reads its draw-data ring entry the way the command processor
//! does and, when the entry is published, runs the mesh workgroups it
//! launched before moving on.

pub mod value;

#[cfg(test)]
mod tests;

use crate::config::PipelineState;
use crate::diagnostic::Diagnostic;
use crate::ir::{
    AtomicOp, BinOp, BlockId, CastOp, FuncId, Function, GlobalId, GlobalKind, HwReg, Inst,
    InstKind, IntPredicate, Module, ShaderStage, Ty, Value,
};
use crate::lower::{
    DrawDataEntry, MeshPipeStatsEntry, RingChannelDescriptor, DRAW_DATA_RING_ENTRY_SIZE,
    DRAW_DATA_RING_NAME, PIPELINE_STATS_NAME,
};

pub use value::RtVal;
use value::{mask, signed, width};

const DEFAULT_STEP_LIMIT: u64 = 1 << 22;

/// Hardware registers of one workgroup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwEnv {
    pub flat_workgroup_id: u32,
    pub num_workgroups: [u32; 3],
    pub base_ring_entry_index: u32,
    pub task_ring_counter: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedVertex {
    pub index: u32,
    pub attrs: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedPrimitive {
    pub index: u32,
    pub indices: Vec<u32>,
    pub shading_rate: Option<[u32; 2]>,
    pub attrs: Vec<u32>,
}

/// Everything one workgroup exported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkgroupExports {
    /// `(vertices, primitives)` of the export-space allocation.
    pub alloc: Option<[u32; 2]>,
    pub vertices: Vec<ExportedVertex>,
    pub primitives: Vec<ExportedPrimitive>,
}

impl WorkgroupExports {
    pub fn vertex(&self, index: u32) -> Option<&ExportedVertex> {
        self.vertices.iter().find(|v| v.index == index)
    }

    pub fn primitive(&self, index: u32) -> Option<&ExportedPrimitive> {
        self.primitives.iter().find(|p| p.index == index)
    }
}

/// A mesh launch discovered in the draw-data ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshLaunch {
    pub ring_counter: u32,
    pub group_count: [u32; 3],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineRun {
    pub launches: Vec<MeshLaunch>,
    pub mesh_workgroups: Vec<WorkgroupExports>,
    pub stats: Option<MeshPipeStatsEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadState {
    Running,
    AtBarrier,
    Done,
}

struct Thread {
    id: u32,
    block: BlockId,
    pc: usize,
    values: Vec<Option<RtVal>>,
    state: ThreadState,
}

impl Thread {
    fn new(id: u32, func: &Function) -> Self {
        Self {
            id,
            block: func.entry,
            pc: 0,
            values: vec![None; func.num_values()],
            state: ThreadState::Running,
        }
    }

    fn get(&self, v: Value) -> Result<&RtVal, Diagnostic> {
        self.values
            .get(v.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| Diagnostic::internal(format!("{} read before it was defined", v)))
    }

    fn word(&self, v: Value) -> Result<u32, Diagnostic> {
        self.get(v)?.as_u32()
    }
}

pub struct Simulator<'m> {
    module: &'m Module,
    state: &'m PipelineState,
    memory: Vec<Vec<u8>>,
    step_limit: u64,
    next_ring_counter: u32,
    lds_fill: u8,
}

impl<'m> Simulator<'m> {
    /// Zero-initialized memory for every global of `module`.
    pub fn new(module: &'m Module, state: &'m PipelineState) -> Self {
        let memory = module
            .globals
            .iter()
            .map(|g| vec![0u8; g.size as usize])
            .collect();
        Self {
            module,
            state,
            memory,
            step_limit: DEFAULT_STEP_LIMIT,
            next_ring_counter: 0,
            lds_fill: 0,
        }
    }

    /// Byte LDS holds when a workgroup starts. Hardware leaves it
    /// undefined; a non-zero fill catches reads of uninitialized LDS.
    pub fn with_lds_fill(mut self, byte: u8) -> Self {
        self.lds_fill = byte;
        self
    }

    /// Instructions one workgroup may execute before it counts as hung.
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Ring counter of the first task workgroup of the next dispatch.
    pub fn with_ring_counter(mut self, counter: u32) -> Self {
        self.next_ring_counter = counter;
        self
    }

    pub fn next_ring_counter(&self) -> u32 {
        self.next_ring_counter
    }

    pub fn global_bytes(&self, id: GlobalId) -> &[u8] {
        &self.memory[id.0 as usize]
    }

    /// Accumulated pipeline statistics, if the module has a statistics buffer.
    pub fn stats(&self) -> Option<MeshPipeStatsEntry> {
        let id = self.module.find_global(PIPELINE_STATS_NAME)?;
        let bytes = self.global_bytes(id);
        let size = MeshPipeStatsEntry::SIZE as usize;
        (bytes.len() >= size).then(|| bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Draw-data ring entry `index`, as the command processor sees it.
    pub fn draw_data(&self, index: u32) -> Option<DrawDataEntry> {
        let id = self.module.find_global(DRAW_DATA_RING_NAME)?;
        let start = (index * DRAW_DATA_RING_ENTRY_SIZE) as usize;
        let bytes = self
            .global_bytes(id)
            .get(start..start + DRAW_DATA_RING_ENTRY_SIZE as usize)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn entry_point(&self, id: FuncId, stage: ShaderStage) -> Result<&'m Function, Diagnostic> {
        let module = self.module;
        let func = module.function(id).ok_or_else(|| {
            Diagnostic::invalid_state(format!("no function #{} to run", id.0))
        })?;
        if func.stage != stage {
            return Err(Diagnostic::invalid_state(format!(
                "`{}` is not a {} shader",
                func.name,
                stage.name()
            )));
        }
        if !func.lowered {
            return Err(Diagnostic::invalid_state(format!(
                "`{}` has not been lowered",
                func.name
            )));
        }
        Ok(func)
    }

    /// Run a mesh dispatch without a task shader.
    pub fn run_mesh_dispatch(
        &mut self,
        mesh: FuncId,
        dims: [u32; 3],
    ) -> Result<Vec<WorkgroupExports>, Diagnostic> {
        let func = self.entry_point(mesh, ShaderStage::Mesh)?;
        let threads = self.state.mesh.threads_per_group();
        (0..group_total(dims)?)
            .map(|flat| {
                let env = HwEnv {
                    flat_workgroup_id: flat,
                    num_workgroups: dims,
                    ..HwEnv::default()
                };
                self.run_workgroup(func, env, threads)
            })
            .collect()
    }

    /// Run a full dispatch of the pipeline. With a task shader, `dims`
    /// is the task dispatch and mesh work is discovered through the ring.
    pub fn run_pipeline(
        &mut self,
        task: Option<FuncId>,
        mesh: FuncId,
        dims: [u32; 3],
    ) -> Result<PipelineRun, Diagnostic> {
        let Some(task) = task else {
            let mesh_workgroups = self.run_mesh_dispatch(mesh, dims)?;
            return Ok(PipelineRun {
                launches: Vec::new(),
                mesh_workgroups,
                stats: self.stats(),
            });
        };

        let task_state = self.state.task.as_ref().ok_or_else(|| {
            Diagnostic::invalid_state("pipeline has no task state".to_string())
        })?;
        let task_func = self.entry_point(task, ShaderStage::Task)?;
        let mesh_func = self.entry_point(mesh, ShaderStage::Mesh)?;
        let task_threads = task_state.threads_per_group();
        let mesh_threads = self.state.mesh.threads_per_group();
        let ring = RingChannelDescriptor {
            entry_count: self.state.ring.entry_count,
            payload_ring: GlobalId(0),
            draw_data_ring: GlobalId(0),
        };

        let base = self.next_ring_counter;
        let count = group_total(dims)?;
        let mut run = PipelineRun::default();
        for flat in 0..count {
            let env = HwEnv {
                flat_workgroup_id: flat,
                num_workgroups: dims,
                base_ring_entry_index: base,
                task_ring_counter: 0,
            };
            self.run_workgroup(task_func, env, task_threads)?;

            let counter = base.wrapping_add(flat);
            let published = self
                .draw_data(ring.entry_index(counter))
                .filter(|entry| entry.ready == ring.ready_flag(counter));
            let Some(entry) = published else {
                log::trace!("task workgroup {} launched no mesh work", flat);
                continue;
            };
            let group_count = entry.group_count();
            log::trace!(
                "task workgroup {} launched {:?} mesh workgroups at ring counter {}",
                flat,
                group_count,
                counter
            );
            run.launches.push(MeshLaunch {
                ring_counter: counter,
                group_count,
            });
            for mesh_flat in 0..group_total(group_count)? {
                let env = HwEnv {
                    flat_workgroup_id: mesh_flat,
                    num_workgroups: group_count,
                    base_ring_entry_index: 0,
                    task_ring_counter: counter,
                };
                run.mesh_workgroups
                    .push(self.run_workgroup(mesh_func, env, mesh_threads)?);
            }
        }
        self.next_ring_counter = base.wrapping_add(count);
        run.stats = self.stats();
        Ok(run)
    }

    /// Run every invocation of one workgroup to completion.
    pub fn run_workgroup(
        &mut self,
        func: &Function,
        env: HwEnv,
        threads: u32,
    ) -> Result<WorkgroupExports, Diagnostic> {
        log::debug!(
            "running `{}` workgroup {} with {} invocations",
            func.name,
            env.flat_workgroup_id,
            threads
        );
        for (memory, global) in self.memory.iter_mut().zip(&self.module.globals) {
            if global.kind == GlobalKind::Lds {
                memory.fill(self.lds_fill);
            }
        }

        let mut threads: Vec<Thread> = (0..threads).map(|id| Thread::new(id, func)).collect();
        let mut exports = WorkgroupExports::default();
        let mut steps = 0u64;
        loop {
            for thread in &mut threads {
                if thread.state == ThreadState::Running {
                    self.run_thread(func, env, thread, &mut exports, &mut steps)?;
                }
            }
            let waiting = threads
                .iter()
                .filter(|t| t.state == ThreadState::AtBarrier)
                .count();
            if waiting == 0 {
                break;
            }
            if waiting != threads.len() {
                return Err(Diagnostic::divergence(format!(
                    "barrier divergence in `{}`: {} of {} invocations wait on a barrier, the rest returned",
                    func.name,
                    waiting,
                    threads.len()
                )));
            }
            for thread in &mut threads {
                thread.state = ThreadState::Running;
            }
        }
        Ok(exports)
    }

    fn run_thread(
        &mut self,
        func: &Function,
        env: HwEnv,
        thread: &mut Thread,
        exports: &mut WorkgroupExports,
        steps: &mut u64,
    ) -> Result<(), Diagnostic> {
        loop {
            *steps += 1;
            if *steps > self.step_limit {
                return Err(Diagnostic::invalid_state(format!(
                    "`{}` exceeded {} steps",
                    func.name, self.step_limit
                ))
                .with_help(
                    "a mesh workgroup spins forever when its task workgroup never published the ring entry"
                        .to_string(),
                ));
            }
            let inst = func.block(thread.block).insts.get(thread.pc).ok_or_else(|| {
                Diagnostic::internal(format!(
                    "invocation {} ran off the end of {}",
                    thread.id, thread.block
                ))
            })?;
            thread.pc += 1;
            match &inst.kind {
                InstKind::Barrier => {
                    thread.state = ThreadState::AtBarrier;
                    return Ok(());
                }
                InstKind::Ret => {
                    thread.state = ThreadState::Done;
                    return Ok(());
                }
                InstKind::Br(dest) => jump(func, thread, *dest)?,
                InstKind::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    let dest = if thread.get(*cond)?.as_bool()? {
                        *then_dest
                    } else {
                        *else_dest
                    };
                    jump(func, thread, dest)?;
                }
                _ => {
                    let value = self.execute(func, env, thread, inst, exports)?;
                    if let (Some(result), Some(value)) = (inst.result, value) {
                        thread.values[result.index()] = Some(value);
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        func: &Function,
        env: HwEnv,
        thread: &Thread,
        inst: &Inst,
        exports: &mut WorkgroupExports,
    ) -> Result<Option<RtVal>, Diagnostic> {
        let value = match &inst.kind {
            InstKind::Const(bits) => RtVal::scalar(inst.ty, *bits)?,
            InstKind::Binary { op, lhs, rhs } => {
                match (thread.get(*lhs)?, thread.get(*rhs)?) {
                    (RtVal::Vector(a), RtVal::Vector(b)) => {
                        let lanes = a
                            .iter()
                            .zip(b)
                            .map(|(&x, &y)| eval_binary(*op, Ty::I32, x as u64, y as u64).map(|r| r as u32))
                            .collect::<Result<_, _>>()?;
                        RtVal::Vector(lanes)
                    }
                    (a, b) => RtVal::scalar(inst.ty, eval_binary(*op, inst.ty, a.bits()?, b.bits()?)?)?,
                }
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let (a, b) = (thread.get(*lhs)?.bits()?, thread.get(*rhs)?.bits()?);
                RtVal::Bool(match pred {
                    IntPredicate::Eq => a == b,
                    IntPredicate::Ne => a != b,
                    IntPredicate::Ult => a < b,
                    IntPredicate::Ule => a <= b,
                    IntPredicate::Ugt => a > b,
                    IntPredicate::Uge => a >= b,
                })
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                let pick = if thread.get(*cond)?.as_bool()? { on_true } else { on_false };
                thread.get(*pick)?.clone()
            }
            InstKind::Cast { op, value } => match (op, thread.get(*value)?) {
                (CastOp::Bitcast, RtVal::Vector(lanes)) => RtVal::Vector(lanes.clone()),
                (_, v) => RtVal::scalar(inst.ty, v.bits()?)?,
            },
            InstKind::ExtractElement { vector, index } => match thread.get(*vector)? {
                RtVal::Vector(lanes) => {
                    let lane = lanes.get(*index as usize).ok_or_else(|| {
                        Diagnostic::internal(format!("lane {} out of range", index))
                    })?;
                    RtVal::scalar(inst.ty, *lane as u64)?
                }
                _ => return Err(Diagnostic::internal("extract from a scalar".to_string())),
            },
            InstKind::InsertElement {
                vector,
                element,
                index,
            } => {
                let RtVal::Vector(mut lanes) = thread.get(*vector)?.clone() else {
                    return Err(Diagnostic::internal("insert into a scalar".to_string()));
                };
                let lane = lanes.get_mut(*index as usize).ok_or_else(|| {
                    Diagnostic::internal(format!("lane {} out of range", index))
                })?;
                *lane = thread.word(*element)?;
                RtVal::Vector(lanes)
            }
            InstKind::Phi { .. } => {
                return Err(Diagnostic::internal(format!(
                    "phi {} executed outside a block head",
                    inst
                )))
            }
            InstKind::Load { global, offset, .. } => {
                self.read(*global, thread.word(*offset)?, inst.ty)?
            }
            InstKind::Store {
                global,
                offset,
                value,
                ..
            } => {
                self.write(*global, thread.word(*offset)?, thread.get(*value)?)?;
                return Ok(None);
            }
            InstKind::AtomicRmw {
                op,
                global,
                offset,
                value,
                ..
            } => {
                let ty = func.value_ty(*value);
                let addr = thread.word(*offset)?;
                let old = self.read(*global, addr, ty)?;
                let new = eval_atomic(*op, ty, old.bits()?, thread.get(*value)?.bits()?);
                self.write(*global, addr, &RtVal::scalar(ty, new)?)?;
                old
            }
            InstKind::CmpXchg {
                global,
                offset,
                compare,
                new,
                ..
            } => {
                let ty = func.value_ty(*compare);
                let addr = thread.word(*offset)?;
                let old = self.read(*global, addr, ty)?;
                if &old == thread.get(*compare)? {
                    self.write(*global, addr, thread.get(*new)?)?;
                }
                old
            }
            InstKind::ConvertToDivergent { value } => thread.get(*value)?.clone(),
            InstKind::ReadHw(reg) => RtVal::Word(self.read_hw(*reg, env, thread.id)),
            InstKind::AllocExport {
                vertices,
                primitives,
            } => {
                if exports.alloc.is_some() {
                    return Err(Diagnostic::invalid_state(format!(
                        "`{}` allocated export space twice",
                        func.name
                    )));
                }
                exports.alloc = Some([thread.word(*vertices)?, thread.word(*primitives)?]);
                return Ok(None);
            }
            InstKind::ExportVertex { index, attrs } => {
                let index = thread.word(*index)?;
                check_export(func, exports, 0, index)?;
                let attrs = words(thread, attrs)?;
                exports.vertices.push(ExportedVertex { index, attrs });
                return Ok(None);
            }
            InstKind::ExportPrimitive {
                index,
                indices,
                shading_rate,
                attrs,
            } => {
                let index = thread.word(*index)?;
                check_export(func, exports, 1, index)?;
                let shading_rate = match shading_rate {
                    Some([x, y]) => Some([thread.word(*x)?, thread.word(*y)?]),
                    None => None,
                };
                let primitive = ExportedPrimitive {
                    index,
                    indices: words(thread, indices)?,
                    shading_rate,
                    attrs: words(thread, attrs)?,
                };
                exports.primitives.push(primitive);
                return Ok(None);
            }
            InstKind::MeshTask(op) => {
                return Err(Diagnostic::invalid_state(format!(
                    "`{}` still contains `{}`",
                    func.name,
                    op.name()
                )))
            }
            InstKind::Barrier | InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret => {
                return Err(Diagnostic::internal(format!(
                    "control instruction {} reached the data path",
                    inst
                )))
            }
        };
        Ok(Some(value))
    }

    fn read_hw(&self, reg: HwReg, env: HwEnv, tid: u32) -> u32 {
        let wave_size = self.state.wave_size;
        match reg {
            HwReg::WaveIdInSubgroup => tid / wave_size,
            HwReg::ThreadIdInWave => tid % wave_size,
            HwReg::FlatWorkgroupId => env.flat_workgroup_id,
            HwReg::NumWorkgroups(axis) => env.num_workgroups[(axis as usize).min(2)],
            HwReg::BaseRingEntryIndex => env.base_ring_entry_index,
            HwReg::TaskRingCounter => env.task_ring_counter,
        }
    }

    fn range(&self, global: GlobalId, offset: u32, size: u32) -> Result<std::ops::Range<usize>, Diagnostic> {
        let len = self.memory[global.0 as usize].len();
        let start = offset as usize;
        let end = start + size as usize;
        if end > len {
            return Err(Diagnostic::invalid_state(format!(
                "access of {} bytes at offset {} is outside `{}` ({} bytes)",
                size,
                offset,
                self.module.global(global).name,
                len
            )));
        }
        Ok(start..end)
    }

    fn read(&self, global: GlobalId, offset: u32, ty: Ty) -> Result<RtVal, Diagnostic> {
        let range = self.range(global, offset, ty.size_in_bytes())?;
        let bytes = &self.memory[global.0 as usize][range];
        let dwords: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| bytemuck::pod_read_unaligned::<u32>(chunk))
            .collect();
        RtVal::from_dwords(ty, &dwords)
    }

    fn write(&mut self, global: GlobalId, offset: u32, value: &RtVal) -> Result<(), Diagnostic> {
        let dwords = value.to_dwords();
        let range = self.range(global, offset, dwords.len() as u32 * 4)?;
        self.memory[global.0 as usize][range].copy_from_slice(bytemuck::cast_slice(dwords.as_slice()));
        Ok(())
    }
}

/// Take the edge `thread.block -> dest`, evaluating the phis of `dest`
/// against the values of the predecessor.
fn jump(func: &Function, thread: &mut Thread, dest: BlockId) -> Result<(), Diagnostic> {
    let from = thread.block;
    let mut resolved = Vec::new();
    for inst in func.block(dest).insts.iter().take_while(|i| i.is_phi()) {
        let InstKind::Phi { incoming } = &inst.kind else { continue };
        let (value, _) = incoming.iter().find(|(_, pred)| *pred == from).ok_or_else(|| {
            Diagnostic::internal(format!("phi {} has no entry for {}", inst, from))
        })?;
        resolved.push((inst.result, thread.get(*value)?.clone()));
    }
    thread.block = dest;
    thread.pc = resolved.len();
    for (result, value) in resolved {
        if let Some(result) = result {
            thread.values[result.index()] = Some(value);
        }
    }
    Ok(())
}

fn words(thread: &Thread, values: &[Value]) -> Result<Vec<u32>, Diagnostic> {
    values.iter().map(|v| thread.word(*v)).collect()
}

fn check_export(func: &Function, exports: &WorkgroupExports, kind: usize, index: u32) -> Result<(), Diagnostic> {
    let what = ["vertex", "primitive"][kind];
    let Some(alloc) = exports.alloc else {
        return Err(Diagnostic::invalid_state(format!(
            "`{}` exported {} {} before allocating export space",
            func.name, what, index
        )));
    };
    if index >= alloc[kind] {
        return Err(Diagnostic::invalid_state(format!(
            "`{}` exported {} {} but allocated only {}",
            func.name, what, index, alloc[kind]
        )));
    }
    Ok(())
}

fn group_total(dims: [u32; 3]) -> Result<u32, Diagnostic> {
    dims.iter()
        .try_fold(1u32, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Diagnostic::configuration(format!("dispatch {:?} is too large", dims)))
}

fn eval_binary(op: BinOp, ty: Ty, a: u64, b: u64) -> Result<u64, Diagnostic> {
    let bits = width(ty) as u64;
    let result = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::UDiv | BinOp::URem if b & mask(ty) == 0 => {
            return Err(Diagnostic::invalid_state("division by zero".to_string()))
        }
        BinOp::UDiv => a / b,
        BinOp::URem => a % b,
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a << (b % bits),
        BinOp::LShr => a >> (b % bits),
        BinOp::UMin => a.min(b),
        BinOp::UMax => a.max(b),
    };
    Ok(result & mask(ty))
}

fn eval_atomic(op: AtomicOp, ty: Ty, old: u64, value: u64) -> u64 {
    let result = match op {
        AtomicOp::Xchg => value,
        AtomicOp::Add => old.wrapping_add(value),
        AtomicOp::Sub => old.wrapping_sub(value),
        AtomicOp::And => old & value,
        AtomicOp::Or => old | value,
        AtomicOp::Xor => old ^ value,
        AtomicOp::UMin => old.min(value),
        AtomicOp::UMax => old.max(value),
        AtomicOp::SMin => {
            if signed(ty, old) <= signed(ty, value) { old } else { value }
        }
        AtomicOp::SMax => {
            if signed(ty, old) >= signed(ty, value) { old } else { value }
        }
    };
    result & mask(ty)
}
