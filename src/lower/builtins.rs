//! Per-function lowering state and built-in derivation.
//!
//! Every lowered function gets a fresh prologue block in front of its old
//! entry. Values the lowering needs everywhere (wave/thread ids, ring
//! entry, built-ins) are computed at the end of the prologue, so they
//! dominate every use in the body. Built-ins are derived on first request
//! and cached in a dense array indexed by `BuiltIn`.

use crate::ir::builder::Builder;
use crate::ir::{BlockId, BuiltIn, Elem, Function, GlobalId, HwReg, Ty, Value};

/// Wave-relative ids of the current invocation.
#[derive(Clone, Copy, Debug)]
pub struct WaveThreadInfo {
    pub wave_id_in_subgroup: Value,
    pub thread_id_in_wave: Value,
    /// `wave × waveSize + lane`, marked divergent.
    pub thread_id_in_subgroup: Value,
}

/// Where the flat workgroup id comes from.
#[derive(Clone, Copy, Debug)]
pub(crate) enum FlatIdSource {
    Hardware,
    Lds { lds: GlobalId, offset: u32 },
}

pub(crate) struct StageLowering {
    pub func: Function,
    pub workgroup_size: [u32; 3],
    pub wave_size: u32,
    /// Entry block of the original body.
    pub body_entry: BlockId,
    /// Last prologue block; ends in the branch to `body_entry`.
    pub prologue_tail: BlockId,
    pub wave: WaveThreadInfo,
    pub flat_id_source: FlatIdSource,
    dispatch_dims: Option<[Value; 3]>,
    cache: [Option<Value>; BuiltIn::COUNT],
}

impl StageLowering {
    /// Insert the prologue and compute the wave/thread ids in it.
    pub fn begin(mut func: Function, workgroup_size: [u32; 3], wave_size: u32) -> Self {
        let body_entry = func.entry;
        let prologue = func.add_block(format!("{}.prologue", func.stage.name()));
        func.entry = prologue;

        let mut b = Builder::at_end(&mut func, prologue);
        let wave_id_in_subgroup = b.read_hw(HwReg::WaveIdInSubgroup);
        let thread_id_in_wave = b.read_hw(HwReg::ThreadIdInWave);
        let wave_base = b.mul_imm(wave_id_in_subgroup, wave_size);
        let tid = b.add(wave_base, thread_id_in_wave);
        let thread_id_in_subgroup = b.convert_to_divergent(tid);
        b.br(body_entry);

        Self {
            func,
            workgroup_size,
            wave_size,
            body_entry,
            prologue_tail: prologue,
            wave: WaveThreadInfo {
                wave_id_in_subgroup,
                thread_id_in_wave,
                thread_id_in_subgroup,
            },
            flat_id_source: FlatIdSource::Hardware,
            dispatch_dims: None,
            cache: [None; BuiltIn::COUNT],
        }
    }

    pub fn threads_per_group(&self) -> u32 {
        self.workgroup_size.iter().product()
    }

    pub fn thread_id_in_subgroup(&self) -> Value {
        self.wave.thread_id_in_subgroup
    }

    /// Builder placed before the branch that ends the prologue.
    pub fn prologue_builder(&mut self) -> Builder<'_> {
        let tail = self.prologue_tail;
        Builder::before_terminator(&mut self.func, tail)
    }

    /// Split the prologue at its end and return the new tail, which holds
    /// the branch to the body. The old tail is left unterminated.
    pub fn split_prologue(&mut self, name: &str) -> BlockId {
        let mut b = self.prologue_builder();
        let tail = b.split_block(name);
        self.prologue_tail = tail;
        tail
    }

    /// Dispatch dimensions used to unflatten workgroup ids. Defaults to the
    /// hardware dispatch registers.
    pub fn set_dispatch_dims(&mut self, dims: [Value; 3]) {
        self.dispatch_dims = Some(dims);
    }

    fn dispatch_dims(&mut self) -> [Value; 3] {
        if let Some(dims) = self.dispatch_dims {
            return dims;
        }
        let mut b = self.prologue_builder();
        let dims = [0u8, 1, 2].map(|axis| b.read_hw(HwReg::NumWorkgroups(axis)));
        self.dispatch_dims = Some(dims);
        dims
    }

    /// Value of `builtin`, derived in the prologue on first use.
    pub fn builtin(&mut self, builtin: BuiltIn) -> Value {
        if let Some(v) = self.cache[builtin.index()] {
            return v;
        }
        let v = self.derive(builtin);
        self.cache[builtin.index()] = Some(v);
        v
    }

    fn derive(&mut self, builtin: BuiltIn) -> Value {
        match builtin {
            BuiltIn::FlatWorkgroupId => {
                let source = self.flat_id_source;
                let mut b = self.prologue_builder();
                match source {
                    FlatIdSource::Hardware => b.read_hw(HwReg::FlatWorkgroupId),
                    FlatIdSource::Lds { lds, offset } => {
                        let addr = b.const_i32(offset);
                        b.load(Ty::I32, lds, addr)
                    }
                }
            }
            BuiltIn::NumWorkgroups => {
                let dims = self.dispatch_dims();
                self.prologue_builder().vector(Elem::I32, &dims)
            }
            BuiltIn::WorkgroupId => {
                let flat = self.builtin(BuiltIn::FlatWorkgroupId);
                let dims = self.dispatch_dims();
                let mut b = self.prologue_builder();
                let id = emit_unflatten(&mut b, flat, dims);
                b.vector(Elem::I32, &id)
            }
            BuiltIn::LocalInvocationIndex => self.wave.thread_id_in_subgroup,
            BuiltIn::LocalInvocationId => {
                let tid = self.wave.thread_id_in_subgroup;
                let size = self.workgroup_size;
                let mut b = self.prologue_builder();
                let dims = size.map(|d| b.const_i32(d));
                let id = emit_unflatten(&mut b, tid, dims);
                b.vector(Elem::I32, &id)
            }
            BuiltIn::GlobalInvocationId => {
                let group = self.builtin(BuiltIn::WorkgroupId);
                let local = self.builtin(BuiltIn::LocalInvocationId);
                let size = self.workgroup_size;
                let mut b = self.prologue_builder();
                let mut lanes = [group; 3];
                for (axis, lane) in lanes.iter_mut().enumerate() {
                    let g = b.extract(group, axis as u32);
                    let l = b.extract(local, axis as u32);
                    let scaled = b.mul_imm(g, size[axis]);
                    *lane = b.add(scaled, l);
                }
                b.vector(Elem::I32, &lanes)
            }
            BuiltIn::GlobalInvocationIndex => {
                let flat = self.builtin(BuiltIn::FlatWorkgroupId);
                let tid = self.wave.thread_id_in_subgroup;
                let threads = self.threads_per_group();
                let mut b = self.prologue_builder();
                let base = b.mul_imm(flat, threads);
                b.add(base, tid)
            }
            BuiltIn::SubgroupId => self.wave.wave_id_in_subgroup,
            BuiltIn::SubgroupLocalInvocationId => self.wave.thread_id_in_wave,
            BuiltIn::NumSubgroups => {
                let waves = self.threads_per_group().div_ceil(self.wave_size);
                self.prologue_builder().const_i32(waves)
            }
        }
    }
}

/// Row-major unflattening: `x = flat % cx`, `y = (flat / cx) % cy`,
/// `z = flat / (cx·cy)`.
pub fn emit_unflatten(b: &mut Builder<'_>, flat: Value, dims: [Value; 3]) -> [Value; 3] {
    let x = b.urem(flat, dims[0]);
    let row = b.udiv(flat, dims[0]);
    let y = b.urem(row, dims[1]);
    let plane = b.mul(dims[0], dims[1]);
    let z = b.udiv(flat, plane);
    [x, y, z]
}

pub fn unflatten(flat: u32, dims: [u32; 3]) -> [u32; 3] {
    [
        flat % dims[0],
        (flat / dims[0]) % dims[1],
        flat / (dims[0] * dims[1]),
    ]
}

pub fn flatten(id: [u32; 3], dims: [u32; 3]) -> u32 {
    id[0] + dims[0] * (id[1] + dims[1] * id[2])
}
