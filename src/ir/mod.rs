//! SSA intermediate representation for task and mesh shader entry points.
//!
//! A `Module` owns functions and module-scope globals (LDS, rings, the
//! statistics buffer). A `Function` is a list of basic blocks; each block
//! ends in exactly one terminator. Values are SSA: every `Value` has one
//! defining instruction and a type recorded in the function's value table.
//!
//! The same IR carries both forms the lowering deals with:
//! - before lowering, shaders use abstract `MeshTaskOp`s (set mesh outputs,
//!   emit mesh tasks, payload access, built-in reads);
//! - after lowering, only memory operations on globals, barriers, hardware
//!   register reads and export operations remain.

pub mod builder;
pub mod cfg;
pub mod display;
pub mod uniformity;


// ─── Handles ───────────────────────────────────────────────────────

/// An SSA value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

/// A basic block of one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A module-scope global.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// A function of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl Value {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ─── Types ─────────────────────────────────────────────────────────

/// Element type of a vector. Vectors only hold 32-bit lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Elem {
    I32,
    F32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    Void,
    I1,
    I32,
    I64,
    F32,
    Vector(Elem, u8),
}

impl Ty {
    pub fn vec(elem: Elem, len: u8) -> Ty {
        Ty::Vector(elem, len)
    }

    pub fn ivec3() -> Ty {
        Ty::Vector(Elem::I32, 3)
    }

    /// Size in memory. Booleans occupy a full dword.
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Ty::Void => 0,
            Ty::I1 | Ty::I32 | Ty::F32 => 4,
            Ty::I64 => 8,
            Ty::Vector(_, len) => 4 * len as u32,
        }
    }

    pub fn dwords(self) -> u32 {
        self.size_in_bytes() / 4
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Ty::Vector(..))
    }

    pub fn element(self) -> Ty {
        match self {
            Ty::Vector(Elem::I32, _) => Ty::I32,
            Ty::Vector(Elem::F32, _) => Ty::F32,
            other => other,
        }
    }

    pub fn vector_len(self) -> u32 {
        match self {
            Ty::Vector(_, len) => len as u32,
            _ => 1,
        }
    }
}

// ─── Operations ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    UMin,
    UMax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CastOp {
    ZExt,
    Trunc,
    Bitcast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Xchg,
    Add,
    Sub,
    And,
    Or,
    Xor,
    UMin,
    UMax,
    SMin,
    SMax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ordering {
    NotAtomic,
    Monotonic,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

/// Hardware-provided per-invocation registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HwReg {
    WaveIdInSubgroup,
    ThreadIdInWave,
    /// Flat index of this workgroup within its dispatch (task, mesh-only)
    /// or within the launch of its producing task workgroup (mesh).
    FlatWorkgroupId,
    /// Hardware dispatch dimensions, component 0..=2.
    NumWorkgroups(u8),
    /// Ring counter assigned to workgroup 0 of the current task dispatch.
    BaseRingEntryIndex,
    /// Ring counter of the task workgroup that launched this mesh workgroup.
    TaskRingCounter,
}

/// Abstract built-in values readable by task and mesh shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltIn {
    FlatWorkgroupId,
    WorkgroupId,
    NumWorkgroups,
    LocalInvocationId,
    LocalInvocationIndex,
    GlobalInvocationId,
    GlobalInvocationIndex,
    SubgroupId,
    SubgroupLocalInvocationId,
    NumSubgroups,
}

impl BuiltIn {
    pub const COUNT: usize = 10;

    pub const ALL: [BuiltIn; BuiltIn::COUNT] = [
        BuiltIn::FlatWorkgroupId,
        BuiltIn::WorkgroupId,
        BuiltIn::NumWorkgroups,
        BuiltIn::LocalInvocationId,
        BuiltIn::LocalInvocationIndex,
        BuiltIn::GlobalInvocationId,
        BuiltIn::GlobalInvocationIndex,
        BuiltIn::SubgroupId,
        BuiltIn::SubgroupLocalInvocationId,
        BuiltIn::NumSubgroups,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn ty(self) -> Ty {
        match self {
            BuiltIn::WorkgroupId
            | BuiltIn::NumWorkgroups
            | BuiltIn::LocalInvocationId
            | BuiltIn::GlobalInvocationId => Ty::ivec3(),
            _ => Ty::I32,
        }
    }

    /// Built-ins whose derivation goes through the flat workgroup id.
    pub fn needs_flat_workgroup_id(self) -> bool {
        matches!(
            self,
            BuiltIn::FlatWorkgroupId
                | BuiltIn::WorkgroupId
                | BuiltIn::GlobalInvocationId
                | BuiltIn::GlobalInvocationIndex
        )
    }

    /// Built-ins that differ between invocations of one workgroup.
    pub fn is_thread_varying(self) -> bool {
        matches!(
            self,
            BuiltIn::LocalInvocationId
                | BuiltIn::LocalInvocationIndex
                | BuiltIn::GlobalInvocationId
                | BuiltIn::GlobalInvocationIndex
                | BuiltIn::SubgroupId
                | BuiltIn::SubgroupLocalInvocationId
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltIn::FlatWorkgroupId => "FlatWorkgroupId",
            BuiltIn::WorkgroupId => "WorkgroupId",
            BuiltIn::NumWorkgroups => "NumWorkgroups",
            BuiltIn::LocalInvocationId => "LocalInvocationId",
            BuiltIn::LocalInvocationIndex => "LocalInvocationIndex",
            BuiltIn::GlobalInvocationId => "GlobalInvocationId",
            BuiltIn::GlobalInvocationIndex => "GlobalInvocationIndex",
            BuiltIn::SubgroupId => "SubgroupId",
            BuiltIn::SubgroupLocalInvocationId => "SubgroupLocalInvocationId",
            BuiltIn::NumSubgroups => "NumSubgroups",
        }
    }
}

/// Abstract task/mesh operations, present only before lowering.
#[derive(Clone, Debug, PartialEq)]
pub enum MeshTaskOp {
    ReadBuiltIn(BuiltIn),
    /// Read `ty` bytes of the task payload at `offset` (bytes).
    ReadTaskPayload {
        offset: Value,
    },
    WriteTaskPayload {
        offset: Value,
        value: Value,
    },
    TaskPayloadAtomic {
        op: AtomicOp,
        ordering: Ordering,
        offset: Value,
        value: Value,
    },
    TaskPayloadCmpXchg {
        ordering: Ordering,
        offset: Value,
        compare: Value,
        new: Value,
    },
    /// Launch `x × y × z` mesh workgroups.
    EmitMeshTasks {
        x: Value,
        y: Value,
        z: Value,
    },
    SetMeshOutputs {
        vertex_count: Value,
        primitive_count: Value,
    },
    /// `indices` is an `i32` for points, `<2 x i32>` for lines and
    /// `<3 x i32>` for triangles.
    SetPrimitiveIndices {
        primitive: Value,
        indices: Value,
    },
    SetPrimitiveCulled {
        primitive: Value,
        culled: Value,
    },
    /// `offset` is a dword index into the vertex's output slot.
    WriteVertexOutput {
        offset: Value,
        vertex: Value,
        value: Value,
    },
    WritePrimitiveOutput {
        offset: Value,
        primitive: Value,
        value: Value,
    },
}

impl MeshTaskOp {
    pub fn name(&self) -> &'static str {
        match self {
            MeshTaskOp::ReadBuiltIn(_) => "read_builtin",
            MeshTaskOp::ReadTaskPayload { .. } => "read_task_payload",
            MeshTaskOp::WriteTaskPayload { .. } => "write_task_payload",
            MeshTaskOp::TaskPayloadAtomic { .. } => "task_payload_atomic",
            MeshTaskOp::TaskPayloadCmpXchg { .. } => "task_payload_cmpxchg",
            MeshTaskOp::EmitMeshTasks { .. } => "emit_mesh_tasks",
            MeshTaskOp::SetMeshOutputs { .. } => "set_mesh_outputs",
            MeshTaskOp::SetPrimitiveIndices { .. } => "set_primitive_indices",
            MeshTaskOp::SetPrimitiveCulled { .. } => "set_primitive_culled",
            MeshTaskOp::WriteVertexOutput { .. } => "write_vertex_output",
            MeshTaskOp::WritePrimitiveOutput { .. } => "write_primitive_output",
        }
    }

    pub fn is_payload_access(&self) -> bool {
        matches!(
            self,
            MeshTaskOp::ReadTaskPayload { .. }
                | MeshTaskOp::WriteTaskPayload { .. }
                | MeshTaskOp::TaskPayloadAtomic { .. }
                | MeshTaskOp::TaskPayloadCmpXchg { .. }
        )
    }

    fn operands(&self) -> Vec<Value> {
        match *self {
            MeshTaskOp::ReadBuiltIn(_) => vec![],
            MeshTaskOp::ReadTaskPayload { offset } => vec![offset],
            MeshTaskOp::WriteTaskPayload { offset, value } => vec![offset, value],
            MeshTaskOp::TaskPayloadAtomic { offset, value, .. } => vec![offset, value],
            MeshTaskOp::TaskPayloadCmpXchg {
                offset,
                compare,
                new,
                ..
            } => vec![offset, compare, new],
            MeshTaskOp::EmitMeshTasks { x, y, z } => vec![x, y, z],
            MeshTaskOp::SetMeshOutputs {
                vertex_count,
                primitive_count,
            } => vec![vertex_count, primitive_count],
            MeshTaskOp::SetPrimitiveIndices { primitive, indices } => vec![primitive, indices],
            MeshTaskOp::SetPrimitiveCulled { primitive, culled } => vec![primitive, culled],
            MeshTaskOp::WriteVertexOutput {
                offset,
                vertex,
                value,
            } => vec![offset, vertex, value],
            MeshTaskOp::WritePrimitiveOutput {
                offset,
                primitive,
                value,
            } => vec![offset, primitive, value],
        }
    }

    fn for_each_operand_mut(&mut self, f: &mut dyn FnMut(&mut Value)) {
        match self {
            MeshTaskOp::ReadBuiltIn(_) => {}
            MeshTaskOp::ReadTaskPayload { offset } => f(offset),
            MeshTaskOp::WriteTaskPayload { offset, value }
            | MeshTaskOp::TaskPayloadAtomic { offset, value, .. } => {
                f(offset);
                f(value);
            }
            MeshTaskOp::TaskPayloadCmpXchg {
                offset,
                compare,
                new,
                ..
            } => {
                f(offset);
                f(compare);
                f(new);
            }
            MeshTaskOp::EmitMeshTasks { x, y, z } => {
                f(x);
                f(y);
                f(z);
            }
            MeshTaskOp::SetMeshOutputs {
                vertex_count,
                primitive_count,
            } => {
                f(vertex_count);
                f(primitive_count);
            }
            MeshTaskOp::SetPrimitiveIndices { primitive, indices } => {
                f(primitive);
                f(indices);
            }
            MeshTaskOp::SetPrimitiveCulled { primitive, culled } => {
                f(primitive);
                f(culled);
            }
            MeshTaskOp::WriteVertexOutput {
                offset,
                vertex,
                value,
            }
            | MeshTaskOp::WritePrimitiveOutput {
                offset,
                primitive: vertex,
                value,
            } => {
                f(offset);
                f(vertex);
                f(value);
            }
        }
    }
}

// ─── Instructions ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum InstKind {
    /// Scalar constant of the instruction type; vectors are splats.
    Const(u64),
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        pred: IntPredicate,
        lhs: Value,
        rhs: Value,
    },
    Select {
        cond: Value,
        on_true: Value,
        on_false: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
    },
    ExtractElement {
        vector: Value,
        index: u32,
    },
    InsertElement {
        vector: Value,
        element: Value,
        index: u32,
    },
    Phi {
        incoming: Vec<(Value, BlockId)>,
    },
    /// Load the instruction type from `global` at byte `offset`.
    Load {
        global: GlobalId,
        offset: Value,
        ordering: Ordering,
    },
    Store {
        global: GlobalId,
        offset: Value,
        value: Value,
        ordering: Ordering,
    },
    /// Returns the previous memory value.
    AtomicRmw {
        op: AtomicOp,
        global: GlobalId,
        offset: Value,
        value: Value,
        ordering: Ordering,
    },
    /// Returns the previous memory value.
    CmpXchg {
        global: GlobalId,
        offset: Value,
        compare: Value,
        new: Value,
        ordering: Ordering,
    },
    /// Workgroup execution barrier with workgroup-scope memory fence.
    Barrier,
    /// Identity that is never treated as uniform. Must dominate its uses.
    ConvertToDivergent {
        value: Value,
    },
    ReadHw(HwReg),
    /// Request export space for the workgroup (once per workgroup).
    AllocExport {
        vertices: Value,
        primitives: Value,
    },
    ExportVertex {
        index: Value,
        attrs: Vec<Value>,
    },
    ExportPrimitive {
        index: Value,
        indices: Vec<Value>,
        /// Hardware `(xRate, yRate)` shading rate.
        shading_rate: Option<[Value; 2]>,
        attrs: Vec<Value>,
    },
    MeshTask(MeshTaskOp),
    Br(BlockId),
    CondBr {
        cond: Value,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Ret,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    pub result: Option<Value>,
    pub ty: Ty,
    pub kind: InstKind,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.kind {
            InstKind::Br(dest) => vec![dest],
            InstKind::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                if then_dest == else_dest {
                    vec![then_dest]
                } else {
                    vec![then_dest, else_dest]
                }
            }
            _ => vec![],
        }
    }

    pub fn mesh_task_op(&self) -> Option<&MeshTaskOp> {
        match &self.kind {
            InstKind::MeshTask(op) => Some(op),
            _ => None,
        }
    }

    /// All values read by this instruction (phi incoming values included).
    pub fn operands(&self) -> Vec<Value> {
        match &self.kind {
            InstKind::Const(_)
            | InstKind::Barrier
            | InstKind::ReadHw(_)
            | InstKind::Br(_)
            | InstKind::Ret => vec![],
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            InstKind::Cast { value, .. } | InstKind::ConvertToDivergent { value } => vec![*value],
            InstKind::ExtractElement { vector, .. } => vec![*vector],
            InstKind::InsertElement {
                vector, element, ..
            } => vec![*vector, *element],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::Load { offset, .. } => vec![*offset],
            InstKind::Store { offset, value, .. } | InstKind::AtomicRmw { offset, value, .. } => {
                vec![*offset, *value]
            }
            InstKind::CmpXchg {
                offset,
                compare,
                new,
                ..
            } => vec![*offset, *compare, *new],
            InstKind::AllocExport {
                vertices,
                primitives,
            } => vec![*vertices, *primitives],
            InstKind::ExportVertex { index, attrs } => {
                let mut ops = vec![*index];
                ops.extend(attrs);
                ops
            }
            InstKind::ExportPrimitive {
                index,
                indices,
                shading_rate,
                attrs,
            } => {
                let mut ops = vec![*index];
                ops.extend(indices);
                if let Some(rate) = shading_rate {
                    ops.extend(rate);
                }
                ops.extend(attrs);
                ops
            }
            InstKind::MeshTask(op) => op.operands(),
            InstKind::CondBr { cond, .. } => vec![*cond],
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match &mut self.kind {
            InstKind::Const(_)
            | InstKind::Barrier
            | InstKind::ReadHw(_)
            | InstKind::Br(_)
            | InstKind::Ret => {}
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            InstKind::Cast { value, .. } | InstKind::ConvertToDivergent { value } => f(value),
            InstKind::ExtractElement { vector, .. } => f(vector),
            InstKind::InsertElement {
                vector, element, ..
            } => {
                f(vector);
                f(element);
            }
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(v, _)| f(v)),
            InstKind::Load { offset, .. } => f(offset),
            InstKind::Store { offset, value, .. } | InstKind::AtomicRmw { offset, value, .. } => {
                f(offset);
                f(value);
            }
            InstKind::CmpXchg {
                offset,
                compare,
                new,
                ..
            } => {
                f(offset);
                f(compare);
                f(new);
            }
            InstKind::AllocExport {
                vertices,
                primitives,
            } => {
                f(vertices);
                f(primitives);
            }
            InstKind::ExportVertex { index, attrs } => {
                f(index);
                attrs.iter_mut().for_each(&mut f);
            }
            InstKind::ExportPrimitive {
                index,
                indices,
                shading_rate,
                attrs,
            } => {
                f(index);
                indices.iter_mut().for_each(&mut f);
                if let Some(rate) = shading_rate {
                    rate.iter_mut().for_each(&mut f);
                }
                attrs.iter_mut().for_each(&mut f);
            }
            InstKind::MeshTask(op) => op.for_each_operand_mut(&mut f),
            InstKind::CondBr { cond, .. } => f(cond),
        }
    }
}

// ─── Functions ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Task,
    Mesh,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Task => "task",
            ShaderStage::Mesh => "mesh",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub stage: ShaderStage,
    pub entry: BlockId,
    pub blocks: Vec<Block>,
    value_tys: Vec<Ty>,
    /// Set once the mesh/task lowering has rewritten this function.
    pub lowered: bool,
}

impl Function {
    /// A function with a single empty `entry` block.
    pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
        Self {
            name: name.into(),
            stage,
            entry: BlockId(0),
            blocks: vec![Block {
                name: "entry".to_string(),
                insts: Vec::new(),
            }],
            value_tys: Vec::new(),
            lowered: false,
        }
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn new_value(&mut self, ty: Ty) -> Value {
        let v = Value(self.value_tys.len() as u32);
        self.value_tys.push(ty);
        v
    }

    pub fn value_ty(&self, v: Value) -> Ty {
        self.value_tys[v.index()]
    }

    pub fn num_values(&self) -> usize {
        self.value_tys.len()
    }

    pub fn terminator(&self, b: BlockId) -> Option<&Inst> {
        self.block(b).insts.last().filter(|i| i.is_terminator())
    }

    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b).map(|t| t.successors()).unwrap_or_default()
    }

    /// Every instruction with its location.
    pub fn insts(&self) -> impl Iterator<Item = (BlockId, usize, &Inst)> {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block
                .insts
                .iter()
                .enumerate()
                .map(move |(i, inst)| (BlockId(b as u32), i, inst))
        })
    }

    /// Location of the instruction defining `v`.
    pub fn def_site(&self, v: Value) -> Option<(BlockId, usize)> {
        self.insts()
            .find(|(_, _, inst)| inst.result == Some(v))
            .map(|(b, i, _)| (b, i))
    }

    pub fn def_inst(&self, v: Value) -> Option<&Inst> {
        self.def_site(v).map(|(b, i)| &self.block(b).insts[i])
    }

    /// The constant `v` is defined as, if any.
    pub fn const_value(&self, v: Value) -> Option<u64> {
        match self.def_inst(v)?.kind {
            InstKind::Const(bits) => Some(bits),
            _ => None,
        }
    }

    /// First instruction matching `pred`, in block order.
    pub fn find_inst(&self, mut pred: impl FnMut(&Inst) -> bool) -> Option<(BlockId, usize)> {
        self.insts()
            .find(|(_, _, inst)| pred(inst))
            .map(|(b, i, _)| (b, i))
    }

    pub fn uses_mesh_task_op(&self, mut pred: impl FnMut(&MeshTaskOp) -> bool) -> bool {
        self.insts()
            .any(|(_, _, inst)| inst.mesh_task_op().is_some_and(&mut pred))
    }

    pub fn reads_builtin(&self, builtin: BuiltIn) -> bool {
        self.uses_mesh_task_op(|op| *op == MeshTaskOp::ReadBuiltIn(builtin))
    }

    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                inst.for_each_operand_mut(|v| {
                    if *v == old {
                        *v = new;
                    }
                });
            }
        }
    }

    /// Add an incoming edge to the phi defining `phi`.
    pub fn phi_add_incoming(&mut self, phi: Value, value: Value, pred: BlockId) {
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                if inst.result == Some(phi) {
                    if let InstKind::Phi { incoming } = &mut inst.kind {
                        incoming.push((value, pred));
                    }
                    return;
                }
            }
        }
    }
}

// ─── Module ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobalKind {
    /// Workgroup-local shared memory.
    Lds,
    PayloadRing,
    DrawDataRing,
    PipelineStats,
}

impl GlobalKind {
    pub fn name(self) -> &'static str {
        match self {
            GlobalKind::Lds => "lds",
            GlobalKind::PayloadRing => "payload_ring",
            GlobalKind::DrawDataRing => "draw_data_ring",
            GlobalKind::PipelineStats => "pipeline_stats",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Global {
    pub name: String,
    pub kind: GlobalKind,
    /// Size in bytes.
    pub size: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    /// Look up a global by name, creating it or growing it to at least `size` bytes.
    pub fn get_or_create_global(&mut self, name: &str, kind: GlobalKind, size: u32) -> GlobalId {
        if let Some(id) = self.find_global(name) {
            let global = &mut self.globals[id.0 as usize];
            global.size = global.size.max(size);
            return id;
        }
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(Global {
            name: name.to_string(),
            kind,
            size,
        });
        id
    }
}
