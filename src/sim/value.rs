//! Runtime values of the reference executor.

use crate::diagnostic::Diagnostic;
use crate::ir::Ty;

/// A runtime value. `f32` lanes are carried as raw bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtVal {
    Bool(bool),
    Word(u32),
    Dword(u64),
    Vector(Vec<u32>),
}

impl RtVal {
    /// Zero-extended scalar bits.
    pub fn bits(&self) -> Result<u64, Diagnostic> {
        match self {
            RtVal::Bool(b) => Ok(*b as u64),
            RtVal::Word(w) => Ok(*w as u64),
            RtVal::Dword(d) => Ok(*d),
            RtVal::Vector(_) => Err(Diagnostic::internal(
                "expected a scalar, found a vector".to_string(),
            )),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Diagnostic> {
        Ok(self.bits()? != 0)
    }

    pub fn as_u32(&self) -> Result<u32, Diagnostic> {
        Ok(self.bits()? as u32)
    }

    /// Scalar of type `ty` from raw bits, truncated to its width.
    pub fn scalar(ty: Ty, bits: u64) -> Result<Self, Diagnostic> {
        match ty {
            Ty::I1 => Ok(RtVal::Bool(bits & 1 != 0)),
            Ty::I32 | Ty::F32 => Ok(RtVal::Word(bits as u32)),
            Ty::I64 => Ok(RtVal::Dword(bits)),
            Ty::Vector(_, len) => Ok(RtVal::Vector(vec![bits as u32; len as usize])),
            Ty::Void => Err(Diagnostic::internal("void has no value".to_string())),
        }
    }

    /// Memory image of the value, in dwords.
    pub fn to_dwords(&self) -> Vec<u32> {
        match self {
            RtVal::Bool(b) => vec![*b as u32],
            RtVal::Word(w) => vec![*w],
            RtVal::Dword(d) => vec![*d as u32, (*d >> 32) as u32],
            RtVal::Vector(lanes) => lanes.clone(),
        }
    }

    pub fn from_dwords(ty: Ty, dwords: &[u32]) -> Result<Self, Diagnostic> {
        if dwords.len() != ty.dwords() as usize {
            return Err(Diagnostic::internal(format!(
                "{} dwords cannot form a {}",
                dwords.len(),
                ty
            )));
        }
        Ok(match ty {
            Ty::I1 => RtVal::Bool(dwords[0] != 0),
            Ty::I32 | Ty::F32 => RtVal::Word(dwords[0]),
            Ty::I64 => RtVal::Dword(dwords[0] as u64 | (dwords[1] as u64) << 32),
            Ty::Vector(..) => RtVal::Vector(dwords.to_vec()),
            Ty::Void => return Err(Diagnostic::internal("void has no value".to_string())),
        })
    }
}

/// Bit width of an integer scalar type.
pub fn width(ty: Ty) -> u32 {
    match ty {
        Ty::I1 => 1,
        Ty::I64 => 64,
        _ => 32,
    }
}

pub fn mask(ty: Ty) -> u64 {
    match width(ty) {
        64 => u64::MAX,
        w => (1u64 << w) - 1,
    }
}

/// Sign-extend the low `width(ty)` bits.
pub fn signed(ty: Ty, bits: u64) -> i64 {
    match width(ty) {
        64 => bits as i64,
        32 => bits as u32 as i32 as i64,
        _ => -((bits & 1) as i64),
    }
}
