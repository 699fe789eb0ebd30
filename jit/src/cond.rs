//! Wasm-level branch conditions (spec §4.6.3/§4.6.9): a thin abstraction
//! over the raw AArch64 4-bit condition-code nibble that both `CSET`
//! (materializing a comparison as an `i32` boolean, [`backend::compare`])
//! and conditional branches ([`backend::branch`]) share, so neither module
//! needs to know the AArch64 encoding directly.

use crate::stack::element::CondenseOp;
use crate::types::WasmType;

const EQ: u8 = 0b0000;
const NE: u8 = 0b0001;
const HS: u8 = 0b0010; // CS, unsigned >=
const LO: u8 = 0b0011; // CC, unsigned <
const MI: u8 = 0b0100; // ordered float <
const PL: u8 = 0b0101; // negation of MI
const HI: u8 = 0b1000; // unsigned >
const LS: u8 = 0b1001; // unsigned <=, and ordered float <=
const GE: u8 = 0b1010; // signed >=, and ordered float >=
const LT: u8 = 0b1011; // signed <
const GT: u8 = 0b1100; // signed >, and ordered float >
const LE: u8 = 0b1101; // signed <=

/// A Wasm comparison's condition, stored as the AArch64 condition-code
/// nibble it lowers to directly (see the A64 condition code table in the
/// architecture reference) rather than as named `Lt`/`Le`/... variants:
/// signed-integer, unsigned-integer and ordered-float orderings each pick
/// a different nibble for what is nominally "less than", so a named-variant
/// enum would have to fork on operand type on every use. Keeping the raw
/// nibble also makes [`BranchCondition::negate`] exactly the hardware's bit
/// flip, which is the only form that stays correct for float's unordered
/// case (flipping `GT`'s bit gives "not greater than", which is true on
/// unordered input — not the same condition as ordered `LE`, even though
/// both are nominally "less-or-equal").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchCondition(u8);

impl BranchCondition {
    /// Derive the condition a condensed comparison node stands for. `ty`
    /// is the *operand* type (not the `i32` boolean result type), since it
    /// decides whether `CmpLtS`/`CmpLeS` mean signed-integer or
    /// ordered-float ordering.
    pub fn from_comparison(op: CondenseOp, ty: WasmType) -> Option<Self> {
        use CondenseOp::*;
        let float = ty.is_float();
        let nibble = match op {
            CmpEq => EQ,
            CmpNe => NE,
            CmpLtS if float => MI,
            CmpLtS => LT,
            CmpLeS if float => LS,
            CmpLeS => LE,
            CmpGtS => GT,
            CmpGeS => GE,
            CmpLtU => LO,
            CmpLeU => LS,
            CmpGtU => HI,
            CmpGeU => HS,
            _ => return None,
        };
        Some(BranchCondition(nibble))
    }

    /// The 4-bit AArch64 condition-code encoding (bits `[3:0]` of `cond`
    /// fields in `B.cond`/`CSEL`/`CSINC`/...).
    pub fn to_aarch64_cc(self) -> u8 {
        self.0
    }

    /// The logical negation: the condition true exactly when this one is
    /// false. AArch64 guarantees every condition's complement is itself a
    /// valid condition obtained by flipping bit 0 — that's what makes this
    /// correct even for the float nibbles that have no simple named
    /// opposite (`MI`'s complement is `PL`, not some other ordering
    /// nibble).
    pub fn negate(self) -> Self {
        BranchCondition(self.0 ^ 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_lt_negates_to_signed_ge() {
        let lt = BranchCondition::from_comparison(CondenseOp::CmpLtS, WasmType::I32).unwrap();
        let ge = BranchCondition::from_comparison(CondenseOp::CmpGeS, WasmType::I32).unwrap();
        assert_eq!(lt.negate(), ge);
        assert_eq!(lt.negate().negate(), lt);
    }

    #[test]
    fn unsigned_and_signed_lt_pick_different_nibbles() {
        let signed = BranchCondition::from_comparison(CondenseOp::CmpLtS, WasmType::I32).unwrap();
        let unsigned = BranchCondition::from_comparison(CondenseOp::CmpLtU, WasmType::I32).unwrap();
        assert_ne!(signed.to_aarch64_cc(), unsigned.to_aarch64_cc());
    }

    #[test]
    fn float_lt_picks_mi_distinct_from_signed_and_unsigned() {
        let float_lt = BranchCondition::from_comparison(CondenseOp::CmpLtS, WasmType::F64).unwrap();
        let signed_lt = BranchCondition::from_comparison(CondenseOp::CmpLtS, WasmType::I32).unwrap();
        let unsigned_lt = BranchCondition::from_comparison(CondenseOp::CmpLtU, WasmType::I32).unwrap();
        assert_ne!(float_lt.to_aarch64_cc(), signed_lt.to_aarch64_cc());
        assert_ne!(float_lt.to_aarch64_cc(), unsigned_lt.to_aarch64_cc());
    }

    #[test]
    fn float_le_shares_the_unsigned_le_nibble() {
        let float_le = BranchCondition::from_comparison(CondenseOp::CmpLeS, WasmType::F64).unwrap();
        let unsigned_le = BranchCondition::from_comparison(CondenseOp::CmpLeU, WasmType::I32).unwrap();
        assert_eq!(float_le.to_aarch64_cc(), unsigned_le.to_aarch64_cc());
    }

    #[test]
    fn non_comparison_op_returns_none() {
        assert!(BranchCondition::from_comparison(CondenseOp::Add, WasmType::I32).is_none());
    }
}
