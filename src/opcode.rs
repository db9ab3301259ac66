//! The operation op-code enum (§3 "Operation").
//!
//! Every variant here is one of the ~100 three-address p-code forms the
//! spec groups into arithmetic, comparison, load/store, branch, call,
//! merge, copy, piece/subpiece, multi-extend, indirect-effect, and
//! user-defined operations. The numeric encoding is part of the persisted
//! (stream-codec) surface of §6, hence `num_enum` rather than a bare `enum`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Copy = 0,
    Load,
    Store,
    Branch,
    CBranch,
    BranchInd,
    Call,
    CallInd,
    CallOther,
    Return,

    IntEqual,
    IntNotEqual,
    IntSLess,
    IntSLessEqual,
    IntLess,
    IntLessEqual,
    IntZExt,
    IntSExt,
    IntAdd,
    IntSub,
    IntCarry,
    IntSCarry,
    IntSBorrow,
    Int2Comp,
    IntNegate,
    IntXor,
    IntAnd,
    IntOr,
    IntLeft,
    IntRight,
    IntSRight,
    IntMult,
    IntDiv,
    IntSDiv,
    IntRem,
    IntSRem,

    BoolNegate,
    BoolXor,
    BoolAnd,
    BoolOr,

    FloatEqual,
    FloatNotEqual,
    FloatLess,
    FloatLessEqual,
    FloatNan,
    FloatAdd,
    FloatSub,
    FloatMult,
    FloatDiv,
    FloatNeg,
    FloatAbs,
    FloatSqrt,
    FloatInt2Float,
    FloatFloat2Float,
    FloatTrunc,
    FloatCeil,
    FloatFloor,
    FloatRound,

    MultiEqual,
    Indirect,
    Piece,
    SubPiece,
    Cast,
    PtrAdd,
    PtrSub,
    SegmentOp,
    CPoolRef,
    New,
    Insertion,
    Extraction,
    PopCount,
}

impl OpCode {
    /// True for the set of branch/call-terminal forms: per §3 invariants, at
    /// most one such op may end a basic block.
    pub fn is_block_terminal(self) -> bool {
        matches!(
            self,
            OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Call
                | OpCode::CallInd
                | OpCode::Return
        )
    }

    pub fn is_call(self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd)
    }

    pub fn is_phi(self) -> bool {
        matches!(self, OpCode::MultiEqual)
    }

    pub fn is_indirect_effect(self) -> bool {
        matches!(self, OpCode::Indirect)
    }

    /// Ops whose output is fully determined by their inputs with no
    /// dependence on memory/control state; these are candidates for
    /// constant folding and for the cover-cache's copy-shadow test.
    pub fn is_copy_like(self) -> bool {
        matches!(self, OpCode::Copy | OpCode::Cast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_opcodes_are_exactly_branch_call_return_forms() {
        for op in [OpCode::Branch, OpCode::CBranch, OpCode::BranchInd, OpCode::Call, OpCode::CallInd, OpCode::Return] {
            assert!(op.is_block_terminal());
        }
        assert!(!OpCode::IntAdd.is_block_terminal());
    }

    #[test]
    fn roundtrips_through_its_u8_encoding() {
        let raw: u8 = OpCode::IntAdd.into();
        assert_eq!(OpCode::try_from(raw).unwrap(), OpCode::IntAdd);
    }
}
