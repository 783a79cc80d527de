//! Builder: cursor-based instruction synthesis over a `Function`.
//!
//! The builder holds an insertion point `(block, position)`. Every
//! `insert` places the instruction at the cursor and advances it, so a
//! sequence of calls produces instructions in program order. Control-flow
//! helpers (`split_block`, `if_then`) rewrite the CFG and leave the cursor
//! somewhere sensible for the caller to continue.

use super::*;

pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    pos: usize,
}

impl<'f> Builder<'f> {
    /// Cursor at the end of the entry block.
    pub fn new(func: &'f mut Function) -> Self {
        let entry = func.entry;
        Self::at_end(func, entry)
    }

    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let pos = func.block(block).insts.len();
        Self { func, block, pos }
    }

    /// Cursor just before the terminator of `block` (or at its end).
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let mut b = Self::at_end(func, block);
        b.set_before_terminator(block);
        b
    }

    pub fn at(func: &'f mut Function, block: BlockId, pos: usize) -> Self {
        Self { func, block, pos }
    }

    pub fn func(&self) -> &Function {
        self.func
    }

    pub fn func_mut(&mut self) -> &mut Function {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    // ── Cursor ─────────────────────────────────────────────────────

    pub fn set_insert_point(&mut self, block: BlockId, pos: usize) {
        self.block = block;
        self.pos = pos;
    }

    pub fn set_insert_point_end(&mut self, block: BlockId) {
        self.block = block;
        self.pos = self.func.block(block).insts.len();
    }

    pub fn set_before_terminator(&mut self, block: BlockId) {
        self.block = block;
        let insts = &self.func.block(block).insts;
        self.pos = match insts.last() {
            Some(last) if last.is_terminator() => insts.len() - 1,
            _ => insts.len(),
        };
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        self.func.add_block(name)
    }

    // ── Raw insertion ──────────────────────────────────────────────

    /// Insert an instruction at the cursor. Non-void instructions get a
    /// fresh result value.
    pub fn insert(&mut self, ty: Ty, kind: InstKind) -> Option<Value> {
        let result = (ty != Ty::Void).then(|| self.func.new_value(ty));
        self.func
            .block_mut(self.block)
            .insts
            .insert(self.pos, Inst { result, ty, kind });
        self.pos += 1;
        result
    }

    fn value(&mut self, ty: Ty, kind: InstKind) -> Value {
        debug_assert!(ty != Ty::Void);
        let result = self.func.new_value(ty);
        self.func.block_mut(self.block).insts.insert(
            self.pos,
            Inst {
                result: Some(result),
                ty,
                kind,
            },
        );
        self.pos += 1;
        result
    }

    fn effect(&mut self, kind: InstKind) {
        self.insert(Ty::Void, kind);
    }

    // ── Constants ──────────────────────────────────────────────────

    pub fn const_of(&mut self, ty: Ty, bits: u64) -> Value {
        self.value(ty, InstKind::Const(bits))
    }

    pub fn const_i32(&mut self, v: u32) -> Value {
        self.const_of(Ty::I32, v as u64)
    }

    pub fn const_i64(&mut self, v: u64) -> Value {
        self.const_of(Ty::I64, v)
    }

    pub fn const_bool(&mut self, v: bool) -> Value {
        self.const_of(Ty::I1, v as u64)
    }

    // ── Arithmetic ─────────────────────────────────────────────────

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.func.value_ty(lhs);
        self.value(ty, InstKind::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    pub fn urem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::URem, lhs, rhs)
    }

    pub fn and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    pub fn lshr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::LShr, lhs, rhs)
    }

    pub fn umin(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::UMin, lhs, rhs)
    }

    /// `lhs + imm` for an `i32` value.
    pub fn add_imm(&mut self, lhs: Value, imm: u32) -> Value {
        if imm == 0 {
            return lhs;
        }
        let c = self.const_i32(imm);
        self.add(lhs, c)
    }

    /// `lhs * imm` for an `i32` value.
    pub fn mul_imm(&mut self, lhs: Value, imm: u32) -> Value {
        if imm == 1 {
            return lhs;
        }
        let c = self.const_i32(imm);
        self.mul(lhs, c)
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        self.value(Ty::I1, InstKind::ICmp { pred, lhs, rhs })
    }

    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> Value {
        let ty = self.func.value_ty(on_true);
        self.value(
            ty,
            InstKind::Select {
                cond,
                on_true,
                on_false,
            },
        )
    }

    pub fn cast(&mut self, op: CastOp, value: Value, ty: Ty) -> Value {
        self.value(ty, InstKind::Cast { op, value })
    }

    pub fn zext(&mut self, value: Value, ty: Ty) -> Value {
        self.cast(CastOp::ZExt, value, ty)
    }

    pub fn extract(&mut self, vector: Value, index: u32) -> Value {
        let ty = self.func.value_ty(vector).element();
        self.value(ty, InstKind::ExtractElement { vector, index })
    }

    pub fn insert_element(&mut self, vector: Value, element: Value, index: u32) -> Value {
        let ty = self.func.value_ty(vector);
        self.value(
            ty,
            InstKind::InsertElement {
                vector,
                element,
                index,
            },
        )
    }

    /// Build a vector from scalar lanes.
    pub fn vector(&mut self, elem: Elem, lanes: &[Value]) -> Value {
        let mut v = self.const_of(Ty::vec(elem, lanes.len() as u8), 0);
        for (i, &lane) in lanes.iter().enumerate() {
            v = self.insert_element(v, lane, i as u32);
        }
        v
    }

    pub fn phi(&mut self, ty: Ty, incoming: Vec<(Value, BlockId)>) -> Value {
        self.value(ty, InstKind::Phi { incoming })
    }

    // ── Memory ─────────────────────────────────────────────────────

    pub fn load(&mut self, ty: Ty, global: GlobalId, offset: Value) -> Value {
        self.load_atomic(ty, global, offset, Ordering::NotAtomic)
    }

    pub fn load_atomic(
        &mut self,
        ty: Ty,
        global: GlobalId,
        offset: Value,
        ordering: Ordering,
    ) -> Value {
        self.value(
            ty,
            InstKind::Load {
                global,
                offset,
                ordering,
            },
        )
    }

    pub fn store(&mut self, global: GlobalId, offset: Value, value: Value) {
        self.store_atomic(global, offset, value, Ordering::NotAtomic)
    }

    pub fn store_atomic(&mut self, global: GlobalId, offset: Value, value: Value, ordering: Ordering) {
        self.effect(InstKind::Store {
            global,
            offset,
            value,
            ordering,
        })
    }

    pub fn atomic_rmw(
        &mut self,
        op: AtomicOp,
        global: GlobalId,
        offset: Value,
        value: Value,
        ordering: Ordering,
    ) -> Value {
        let ty = self.func.value_ty(value);
        self.value(
            ty,
            InstKind::AtomicRmw {
                op,
                global,
                offset,
                value,
                ordering,
            },
        )
    }

    pub fn cmpxchg(
        &mut self,
        global: GlobalId,
        offset: Value,
        compare: Value,
        new: Value,
        ordering: Ordering,
    ) -> Value {
        let ty = self.func.value_ty(compare);
        self.value(
            ty,
            InstKind::CmpXchg {
                global,
                offset,
                compare,
                new,
                ordering,
            },
        )
    }

    pub fn barrier(&mut self) {
        self.effect(InstKind::Barrier)
    }

    // ── Hardware ───────────────────────────────────────────────────

    pub fn convert_to_divergent(&mut self, value: Value) -> Value {
        let ty = self.func.value_ty(value);
        self.value(ty, InstKind::ConvertToDivergent { value })
    }

    pub fn read_hw(&mut self, reg: HwReg) -> Value {
        self.value(Ty::I32, InstKind::ReadHw(reg))
    }

    pub fn alloc_export(&mut self, vertices: Value, primitives: Value) {
        self.effect(InstKind::AllocExport {
            vertices,
            primitives,
        })
    }

    pub fn export_vertex(&mut self, index: Value, attrs: Vec<Value>) {
        self.effect(InstKind::ExportVertex { index, attrs })
    }

    pub fn export_primitive(
        &mut self,
        index: Value,
        indices: Vec<Value>,
        shading_rate: Option<[Value; 2]>,
        attrs: Vec<Value>,
    ) {
        self.effect(InstKind::ExportPrimitive {
            index,
            indices,
            shading_rate,
            attrs,
        })
    }

    // ── Abstract mesh/task operations ──────────────────────────────

    pub fn read_builtin(&mut self, builtin: BuiltIn) -> Value {
        self.value(
            builtin.ty(),
            InstKind::MeshTask(MeshTaskOp::ReadBuiltIn(builtin)),
        )
    }

    pub fn read_task_payload(&mut self, ty: Ty, offset: Value) -> Value {
        self.value(ty, InstKind::MeshTask(MeshTaskOp::ReadTaskPayload { offset }))
    }

    pub fn write_task_payload(&mut self, offset: Value, value: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::WriteTaskPayload {
            offset,
            value,
        }))
    }

    pub fn task_payload_atomic(
        &mut self,
        op: AtomicOp,
        ordering: Ordering,
        offset: Value,
        value: Value,
    ) -> Value {
        let ty = self.func.value_ty(value);
        self.value(
            ty,
            InstKind::MeshTask(MeshTaskOp::TaskPayloadAtomic {
                op,
                ordering,
                offset,
                value,
            }),
        )
    }

    pub fn task_payload_cmpxchg(
        &mut self,
        ordering: Ordering,
        offset: Value,
        compare: Value,
        new: Value,
    ) -> Value {
        let ty = self.func.value_ty(compare);
        self.value(
            ty,
            InstKind::MeshTask(MeshTaskOp::TaskPayloadCmpXchg {
                ordering,
                offset,
                compare,
                new,
            }),
        )
    }

    pub fn emit_mesh_tasks(&mut self, x: Value, y: Value, z: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::EmitMeshTasks { x, y, z }))
    }

    pub fn set_mesh_outputs(&mut self, vertex_count: Value, primitive_count: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::SetMeshOutputs {
            vertex_count,
            primitive_count,
        }))
    }

    pub fn set_primitive_indices(&mut self, primitive: Value, indices: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::SetPrimitiveIndices {
            primitive,
            indices,
        }))
    }

    pub fn set_primitive_culled(&mut self, primitive: Value, culled: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::SetPrimitiveCulled {
            primitive,
            culled,
        }))
    }

    pub fn write_vertex_output(&mut self, offset: Value, vertex: Value, value: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::WriteVertexOutput {
            offset,
            vertex,
            value,
        }))
    }

    pub fn write_primitive_output(&mut self, offset: Value, primitive: Value, value: Value) {
        self.effect(InstKind::MeshTask(MeshTaskOp::WritePrimitiveOutput {
            offset,
            primitive,
            value,
        }))
    }

    // ── Terminators ────────────────────────────────────────────────

    pub fn br(&mut self, dest: BlockId) {
        self.effect(InstKind::Br(dest))
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) {
        self.effect(InstKind::CondBr {
            cond,
            then_dest,
            else_dest,
        })
    }

    pub fn ret(&mut self) {
        self.effect(InstKind::Ret)
    }

    // ── Control flow editing ───────────────────────────────────────

    /// Move every instruction at or after the cursor into a new block.
    ///
    /// The current block is left without a terminator and the cursor at
    /// its end. Phis in the moved terminator's successors are retargeted
    /// to the new block.
    pub fn split_block(&mut self, name: impl Into<String>) -> BlockId {
        let old = self.block;
        let tail = self.func.block_mut(old).insts.split_off(self.pos);
        let new = self.func.add_block(name);
        self.func.block_mut(new).insts = tail;

        for succ in self.func.successors(new) {
            for inst in &mut self.func.block_mut(succ).insts {
                if let InstKind::Phi { incoming } = &mut inst.kind {
                    for (_, pred) in incoming.iter_mut() {
                        if *pred == old {
                            *pred = new;
                        }
                    }
                }
            }
        }

        self.pos = self.func.block(old).insts.len();
        new
    }

    /// Wrap everything from the cursor onwards in `if cond { … }` form:
    ///
    /// ```text
    /// head:  …; condbr cond, then, merge
    /// then:  br merge
    /// merge: <instructions that followed the cursor>
    /// ```
    ///
    /// Returns `(then, merge)` with the cursor placed inside `then`, before
    /// its branch.
    pub fn if_then(&mut self, cond: Value, name: &str) -> (BlockId, BlockId) {
        let head = self.block;
        let merge = self.split_block(format!("{}.merge", name));
        let then = self.func.add_block(format!("{}.then", name));

        self.set_insert_point_end(head);
        self.cond_br(cond, then, merge);
        self.set_insert_point_end(then);
        self.br(merge);
        self.set_before_terminator(then);
        (then, merge)
    }

    /// Emit `for (i = start; i < end; i += step) body(i)` at the cursor,
    /// which must be at the end of an unterminated block. The cursor ends
    /// at the (unterminated) loop exit block.
    pub fn strided_loop(
        &mut self,
        start: Value,
        end: Value,
        step: Value,
        name: &str,
        body: impl FnOnce(&mut Builder<'_>, Value),
    ) -> Value {
        let pre = self.block;
        let header = self.add_block(format!("{}.header", name));
        let body_bb = self.add_block(format!("{}.body", name));
        let exit = self.add_block(format!("{}.exit", name));

        self.br(header);
        self.set_insert_point_end(header);
        let i = self.phi(Ty::I32, vec![(start, pre)]);
        let in_range = self.icmp(IntPredicate::Ult, i, end);
        self.cond_br(in_range, body_bb, exit);

        self.set_insert_point_end(body_bb);
        body(self, i);
        let latch = self.block;
        let next = self.add(i, step);
        self.br(header);
        self.func.phi_add_incoming(i, next, latch);

        self.set_insert_point_end(exit);
        i
    }
}
