//! Textual dump of the IR.
//!
//! Used for diagnostics (a printed function is the snippet a diagnostic
//! points into), for `--print` in the CLI and for snapshot tests. There is
//! no parser; the format is for humans only.

use std::fmt::{self, Write as _};

use super::*;
use crate::diagnostic::Diagnostic;
use crate::span::Span;

// ─── Display ──────────────────────────────────────────────────────

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@g{}", self.0)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::I1 => write!(f, "i1"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::F32 => write!(f, "f32"),
            Ty::Vector(Elem::I32, n) => write!(f, "<{} x i32>", n),
            Ty::Vector(Elem::F32, n) => write!(f, "<{} x f32>", n),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::UDiv => "udiv",
            BinOp::URem => "urem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::UMin => "umin",
            BinOp::UMax => "umax",
        };
        f.write_str(s)
    }
}

impl fmt::Display for IntPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
        };
        f.write_str(s)
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AtomicOp::Xchg => "xchg",
            AtomicOp::Add => "add",
            AtomicOp::Sub => "sub",
            AtomicOp::And => "and",
            AtomicOp::Or => "or",
            AtomicOp::Xor => "xor",
            AtomicOp::UMin => "umin",
            AtomicOp::UMax => "umax",
            AtomicOp::SMin => "smin",
            AtomicOp::SMax => "smax",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ordering::NotAtomic => "",
            Ordering::Monotonic => "monotonic",
            Ordering::Acquire => "acquire",
            Ordering::Release => "release",
            Ordering::AcqRel => "acq_rel",
            Ordering::SeqCst => "seq_cst",
        };
        f.write_str(s)
    }
}

impl fmt::Display for HwReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwReg::WaveIdInSubgroup => write!(f, "wave_id_in_subgroup"),
            HwReg::ThreadIdInWave => write!(f, "thread_id_in_wave"),
            HwReg::FlatWorkgroupId => write!(f, "flat_workgroup_id"),
            HwReg::NumWorkgroups(axis) => write!(f, "num_workgroups.{}", axis),
            HwReg::BaseRingEntryIndex => write!(f, "base_ring_entry_index"),
            HwReg::TaskRingCounter => write!(f, "task_ring_counter"),
        }
    }
}

fn ordering_suffix(ordering: Ordering) -> String {
    match ordering {
        Ordering::NotAtomic => String::new(),
        other => format!(".{}", other),
    }
}

fn list(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl fmt::Display for MeshTaskOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mesh_task.{}", self.name())?;
        match self {
            MeshTaskOp::ReadBuiltIn(b) => write!(f, " {}", b.name()),
            MeshTaskOp::TaskPayloadAtomic {
                op,
                ordering,
                offset,
                value,
            } => write!(f, ".{}{} {}, {}", op, ordering_suffix(*ordering), offset, value),
            MeshTaskOp::TaskPayloadCmpXchg {
                ordering,
                offset,
                compare,
                new,
            } => write!(f, "{} {}, {}, {}", ordering_suffix(*ordering), offset, compare, new),
            other => {
                let ops: Vec<String> = other.operands().iter().map(|v| v.to_string()).collect();
                write!(f, " {}", ops.join(", "))
            }
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(r) = self.result {
            write!(f, "{} = ", r)?;
        }
        let ty = self.ty;
        match &self.kind {
            InstKind::Const(bits) => write!(f, "const {} {}", ty, bits),
            InstKind::Binary { op, lhs, rhs } => write!(f, "{} {} {}, {}", op, ty, lhs, rhs),
            InstKind::ICmp { pred, lhs, rhs } => write!(f, "icmp {} {}, {}", pred, lhs, rhs),
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => write!(f, "select {}, {}, {}", cond, on_true, on_false),
            InstKind::Cast { op, value } => {
                let name = match op {
                    CastOp::ZExt => "zext",
                    CastOp::Trunc => "trunc",
                    CastOp::Bitcast => "bitcast",
                };
                write!(f, "{} {} to {}", name, value, ty)
            }
            InstKind::ExtractElement { vector, index } => {
                write!(f, "extractelement {}, {}", vector, index)
            }
            InstKind::InsertElement {
                vector,
                element,
                index,
            } => write!(f, "insertelement {}, {}, {}", vector, element, index),
            InstKind::Phi { incoming } => {
                let parts: Vec<String> = incoming
                    .iter()
                    .map(|(v, b)| format!("[{}, {}]", v, b))
                    .collect();
                write!(f, "phi {} {}", ty, parts.join(", "))
            }
            InstKind::Load {
                global,
                offset,
                ordering,
            } => write!(f, "load{} {} {}[{}]", ordering_suffix(*ordering), ty, global, offset),
            InstKind::Store {
                global,
                offset,
                value,
                ordering,
            } => write!(f, "store{} {}, {}[{}]", ordering_suffix(*ordering), value, global, offset),
            InstKind::AtomicRmw {
                op,
                global,
                offset,
                value,
                ordering,
            } => write!(
                f,
                "atomicrmw.{}{} {}[{}], {}",
                op,
                ordering_suffix(*ordering),
                global,
                offset,
                value
            ),
            InstKind::CmpXchg {
                global,
                offset,
                compare,
                new,
                ordering,
            } => write!(
                f,
                "cmpxchg{} {}[{}], {}, {}",
                ordering_suffix(*ordering),
                global,
                offset,
                compare,
                new
            ),
            InstKind::Barrier => write!(f, "barrier"),
            InstKind::ConvertToDivergent { value } => write!(f, "convert_to_divergent {}", value),
            InstKind::ReadHw(reg) => write!(f, "hw.{}", reg),
            InstKind::AllocExport {
                vertices,
                primitives,
            } => write!(f, "export.alloc {}, {}", vertices, primitives),
            InstKind::ExportVertex { index, attrs } => {
                write!(f, "export.vertex {} {}", index, list(attrs))
            }
            InstKind::ExportPrimitive {
                index,
                indices,
                shading_rate,
                attrs,
            } => {
                write!(f, "export.primitive {} {}", index, list(indices))?;
                if let Some([x, y]) = shading_rate {
                    write!(f, " rate({}, {})", x, y)?;
                }
                write!(f, " {}", list(attrs))
            }
            InstKind::MeshTask(op) => write!(f, "{}", op),
            InstKind::Br(dest) => write!(f, "br {}", dest),
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            } => write!(f, "condbr {}, {}, {}", cond, then_dest, else_dest),
            InstKind::Ret => write!(f, "ret"),
        }
    }
}

// ─── Functions ────────────────────────────────────────────────────

/// A printed function plus the byte span of every instruction, indexed
/// `[block][inst]`.
pub struct PrintedFunction {
    pub text: String,
    pub spans: Vec<Vec<Span>>,
}

pub fn print_function(func: &Function) -> PrintedFunction {
    let mut text = String::new();
    let mut spans = Vec::with_capacity(func.blocks.len());
    let lowered = if func.lowered { " lowered" } else { "" };
    let _ = writeln!(
        text,
        "define {}{} @{} entry {} {{",
        func.stage.name(),
        lowered,
        func.name,
        func.entry
    );
    for (b, block) in func.blocks.iter().enumerate() {
        let _ = writeln!(text, "bb{} ({}):", b, block.name);
        let mut block_spans = Vec::with_capacity(block.insts.len());
        for inst in &block.insts {
            text.push_str("  ");
            let start = text.len() as u32;
            let _ = write!(text, "{}", inst);
            block_spans.push(Span::new(start, text.len() as u32));
            text.push('\n');
        }
        spans.push(block_spans);
    }
    text.push_str("}\n");
    PrintedFunction { text, spans }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_function(self).text)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, g) in self.globals.iter().enumerate() {
            writeln!(
                f,
                "{} = {} \"{}\", {} bytes",
                GlobalId(i as u32),
                g.kind.name(),
                g.name,
                g.size
            )?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

/// Attach the printed function as a snippet, pointing at one instruction.
pub fn annotate(diag: Diagnostic, func: &Function, block: BlockId, index: usize) -> Diagnostic {
    let printed = print_function(func);
    let span = printed
        .spans
        .get(block.index())
        .and_then(|b| b.get(index))
        .copied()
        .unwrap_or_else(Span::dummy);
    diag.with_snippet(func.name.clone(), printed.text, span)
}
