//! Target instruction-set information.
//!
//! The optimizer is target-independent except for the vectorizer, which
//! needs to know which packed types the target supports, at which lane
//! counts, and with which operator restrictions. That knowledge is encoded
//! here as an explicit table keyed by architecture and component type, so
//! adding a target is additive.

use crate::ir::{Opcode, Type};
use target_lexicon::{Architecture, Triple};

/// Operator restrictions accompanying a vectorizable type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Restrictions(u8);

impl Restrictions {
    /// No restrictions.
    pub const NONE: Restrictions = Restrictions(0);
    /// No packed multiplication.
    pub const NO_MUL: Restrictions = Restrictions(1 << 0);
    /// No packed division.
    pub const NO_DIV: Restrictions = Restrictions(1 << 1);
    /// No packed shifts of any kind.
    pub const NO_SHIFT: Restrictions = Restrictions(1 << 2);
    /// No packed arithmetic right shift.
    pub const NO_SHR: Restrictions = Restrictions(1 << 3);
    /// Higher-order bits of a wider computation must not influence the
    /// result (set while descending through a narrowing conversion).
    pub const NO_HI_BITS: Restrictions = Restrictions(1 << 4);

    /// The union of two restriction sets.
    pub const fn union(self, other: Restrictions) -> Restrictions {
        Restrictions(self.0 | other.0)
    }

    /// Does this set contain any restriction of `tested`?
    pub fn intersects(self, tested: Restrictions) -> bool {
        self.0 & tested.0 != 0
    }
}

/// One row of the SIMD support table.
struct SimdRow {
    ty: Type,
    lanes: u8,
    restrictions: Restrictions,
}

/// 64-bit advanced SIMD (D registers): byte/halfword/word lanes, integer
/// mul/div/shifts unsupported by the generic path.
const A64_SIMD: &[SimdRow] = &[
    SimdRow {
        ty: Type::Bool,
        lanes: 8,
        restrictions: Restrictions::NO_DIV.union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Byte,
        lanes: 8,
        restrictions: Restrictions::NO_DIV.union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Char,
        lanes: 4,
        restrictions: Restrictions::NO_DIV.union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Short,
        lanes: 4,
        restrictions: Restrictions::NO_DIV.union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Int32,
        lanes: 2,
        restrictions: Restrictions::NO_DIV.union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Float32,
        lanes: 2,
        restrictions: Restrictions::NONE,
    },
];

/// 128-bit SSE4.1 vectors.
const X86_SIMD: &[SimdRow] = &[
    SimdRow {
        ty: Type::Bool,
        lanes: 16,
        restrictions: Restrictions::NO_MUL
            .union(Restrictions::NO_DIV)
            .union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Byte,
        lanes: 16,
        restrictions: Restrictions::NO_MUL
            .union(Restrictions::NO_DIV)
            .union(Restrictions::NO_SHIFT),
    },
    SimdRow {
        ty: Type::Char,
        lanes: 8,
        restrictions: Restrictions::NO_DIV,
    },
    SimdRow {
        ty: Type::Short,
        lanes: 8,
        restrictions: Restrictions::NO_DIV,
    },
    SimdRow {
        ty: Type::Int32,
        lanes: 4,
        restrictions: Restrictions::NO_DIV,
    },
    SimdRow {
        ty: Type::Int64,
        lanes: 2,
        restrictions: Restrictions::NO_MUL
            .union(Restrictions::NO_DIV)
            .union(Restrictions::NO_SHR),
    },
    SimdRow {
        ty: Type::Float32,
        lanes: 4,
        restrictions: Restrictions::NONE,
    },
    SimdRow {
        ty: Type::Float64,
        lanes: 2,
        restrictions: Restrictions::NONE,
    },
];

/// Scalar-to-vector opcode mapping. Target-independent; restrictions gate
/// which rows a target may actually use.
const VECTOR_OP: &[(Opcode, Opcode)] = &[
    (Opcode::Add, Opcode::VecAdd),
    (Opcode::Sub, Opcode::VecSub),
    (Opcode::Mul, Opcode::VecMul),
    (Opcode::Div, Opcode::VecDiv),
    (Opcode::And, Opcode::VecAnd),
    (Opcode::Or, Opcode::VecOr),
    (Opcode::Xor, Opcode::VecXor),
    (Opcode::Shl, Opcode::VecShl),
    (Opcode::Shr, Opcode::VecShr),
    (Opcode::UShr, Opcode::VecUShr),
    (Opcode::Neg, Opcode::VecNeg),
    (Opcode::Not, Opcode::VecNot),
    (Opcode::BooleanNot, Opcode::VecNot),
    (Opcode::TypeConversion, Opcode::VecCnv),
];

/// The packed counterpart of a scalar operation.
pub fn vector_opcode(scalar: Opcode) -> Option<Opcode> {
    VECTOR_OP
        .iter()
        .find(|&&(s, _)| s == scalar)
        .map(|&(_, v)| v)
}

/// What the optimizer needs to know about the compilation target.
pub struct IsaInfo {
    triple: Triple,
    has_sse41: bool,
}

impl IsaInfo {
    /// Describe a target. SSE4.1 defaults to off; x86 embedders that
    /// detect it call [`IsaInfo::with_sse41`].
    pub fn new(triple: Triple) -> Self {
        Self {
            triple,
            has_sse41: false,
        }
    }

    /// Enable SSE4.1 on an x86 target.
    pub fn with_sse41(mut self, has_sse41: bool) -> Self {
        self.has_sse41 = has_sse41;
        self
    }

    /// The target triple.
    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    /// Can the target vectorize component type `ty`? Returns the lane
    /// count and the operator restrictions to apply.
    pub fn vector_support(&self, ty: Type) -> Option<(u8, Restrictions)> {
        let table: &[SimdRow] = match self.triple.architecture {
            // Advanced SIMD is assumed present on all 64-bit ARM devices.
            Architecture::Aarch64(_) => A64_SIMD,
            Architecture::X86_64 | Architecture::X86_32(_) => {
                if self.has_sse41 {
                    X86_SIMD
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        table
            .iter()
            .find(|row| row.ty == ty)
            .map(|row| (row.lanes, row.restrictions))
    }
}
