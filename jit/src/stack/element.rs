//! A single node of the symbolic operand stack's condense tree (spec
//! §3.4–§3.6): either a concrete value already materialized in some
//! storage, or a still-deferred binary operation over two earlier nodes.
//! Nodes live in a flat arena ([`wasmjit_entity::PrimaryMap`]) and refer to
//! each other by [`StackSlotIndex`] rather than by pointer, per the arena/
//! index modeling this backend uses throughout (see the crate-level docs).

use wasmjit_entity::entity_impl;

use crate::storage::VariableStorage;
use crate::types::WasmType;

/// Arena index of one stack element.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlotIndex(u32);
entity_impl!(StackSlotIndex);

/// A deferred binary (or unary, with `rhs = None`) operation a condensed
/// stack node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrU,
    ShrS,
    Rotl,
    Rotr,
    CmpEq,
    CmpNe,
    CmpLtS,
    CmpLtU,
    CmpLeS,
    CmpLeU,
    CmpGtS,
    CmpGtU,
    CmpGeS,
    CmpGeU,
    Neg,
    Not,
    Clz,
    Ctz,
    Popcnt,
    /// `iNN.div_s`/`iNN.div_u`: traps `DivZero`/`DivOverflow` (signed only),
    /// so it can never be speculatively reordered ahead of where the
    /// source program placed it.
    DivS,
    DivU,
    /// `iNN.rem_s`/`iNN.rem_u`: same side effect as `DivS`/`DivU` (it still
    /// computes the quotient internally), but yields the remainder.
    RemS,
    RemU,
    /// A deferred linear-memory load: `lhs` is the effective address.
    /// `offset` is the instruction's static offset immediate (folded in at
    /// evaluation time rather than when the node is built, so an address
    /// reused by two different offsets condenses to two distinct nodes
    /// sharing the same `lhs`); `narrow_bytes`/`signed` mirror
    /// `crate::backend::memory::emit_linear_memory_load`'s parameters.
    /// Deferring a load into the condense tree (rather than evaluating it
    /// eagerly like the rest of the backend currently does) lets a bounds
    /// check or an address computation shared by several loads collapse
    /// into one evaluation.
    Load { offset: i32, narrow_bytes: Option<u32>, signed: bool },
}

impl CondenseOp {
    /// Is this a comparison, producing an `i32` boolean result rather than
    /// a value of the operands' own type? Branches consume these directly
    /// as condition codes without ever materializing the 0/1 (spec §4.5.3
    /// `condenseComparisonBelow`'s reason for existing: most comparisons
    /// never need to become a plain value at all).
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            CondenseOp::CmpEq
                | CondenseOp::CmpNe
                | CondenseOp::CmpLtS
                | CondenseOp::CmpLtU
                | CondenseOp::CmpLeS
                | CondenseOp::CmpLeU
                | CondenseOp::CmpGtS
                | CondenseOp::CmpGtU
                | CondenseOp::CmpGeS
                | CondenseOp::CmpGeU
        )
    }

    /// Is this a unary operation (no `rhs`)? `Load` is also one-operand
    /// (just an address) but carries its own metadata and dispatch path
    /// (`crate::backend::mod::OpEvaluator`), so it's deliberately excluded
    /// here.
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            CondenseOp::Neg | CondenseOp::Not | CondenseOp::Clz | CondenseOp::Ctz | CondenseOp::Popcnt
        )
    }

    /// Does evaluating this node do something beyond computing a value —
    /// a trap that can fire, or a read of mutable state — such that two
    /// evaluations of an equivalent node are not interchangeable and the
    /// condense walk must commit it in the source program's order rather
    /// than whenever convenient (spec §4.5.3, §9)?
    pub fn has_side_effect(self) -> bool {
        matches!(
            self,
            CondenseOp::DivS | CondenseOp::DivU | CondenseOp::RemS | CondenseOp::RemU | CondenseOp::Load { .. }
        )
    }
}

/// What a stack element currently is: a plain value, or a still-pending
/// computation over earlier elements.
#[derive(Debug, Clone)]
pub enum StackValue {
    /// An already materialized value.
    Storage(VariableStorage),
    /// A deferred computation. `ty` is the *result* type (which for
    /// comparisons differs from the operands' type).
    Condensed {
        op: CondenseOp,
        ty: WasmType,
        lhs: StackSlotIndex,
        rhs: Option<StackSlotIndex>,
    },
}

/// One arena-resident stack node: its current value plus its condense-tree
/// links (`parent`/`sibling`) and its reference-index occurrence-chain
/// links (`prev_occurrence`/`next_occurrence`).
#[derive(Debug, Clone)]
pub struct StackElement {
    /// This node's current value.
    pub value: StackValue,
    /// The node that consumes this one once it's evaluated, if any.
    pub parent: Option<StackSlotIndex>,
    /// The other child under the same `parent`, if this node is the left
    /// child of a binary `Condensed` node (spec §3.6: children of a
    /// two-operand condense node are linked lhs→rhs via `sibling` rather
    /// than each carrying both child indices directly).
    pub sibling: Option<StackSlotIndex>,
    /// Previous (older) referrer of the same storage, in that storage's
    /// reference-index occurrence chain.
    pub prev_occurrence: Option<StackSlotIndex>,
    /// Next (newer) referrer of the same storage.
    pub next_occurrence: Option<StackSlotIndex>,
}

impl StackElement {
    /// A freshly pushed concrete value, with no condense-tree or
    /// occurrence-chain links yet.
    pub fn leaf(storage: VariableStorage) -> Self {
        StackElement {
            value: StackValue::Storage(storage),
            parent: None,
            sibling: None,
            prev_occurrence: None,
            next_occurrence: None,
        }
    }

    /// This node's current type.
    pub fn ty(&self) -> WasmType {
        match &self.value {
            StackValue::Storage(s) => s.ty,
            StackValue::Condensed { ty, .. } => *ty,
        }
    }

    /// Is this node still a deferred computation?
    pub fn is_condensed(&self) -> bool {
        matches!(self.value, StackValue::Condensed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WasmType;

    #[test]
    fn comparison_ops_are_tagged() {
        assert!(CondenseOp::CmpEq.is_comparison());
        assert!(!CondenseOp::Add.is_comparison());
    }

    #[test]
    fn leaf_reports_storage_type() {
        let el = StackElement::leaf(VariableStorage::constant(WasmType::I32, 1));
        assert_eq!(el.ty(), WasmType::I32);
        assert!(!el.is_condensed());
    }

    #[test]
    fn div_rem_and_load_are_side_effecting() {
        assert!(CondenseOp::DivS.has_side_effect());
        assert!(CondenseOp::RemU.has_side_effect());
        assert!(CondenseOp::Load { offset: 0, narrow_bytes: None, signed: false }.has_side_effect());
        assert!(!CondenseOp::Add.has_side_effect());
        assert!(!CondenseOp::Mul.has_side_effect());
    }
}
