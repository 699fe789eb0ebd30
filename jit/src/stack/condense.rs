//! Forcing deferred computations into concrete values (spec §4.5.3):
//! `condenseValentBlock` flushes every pending node at or above a given
//! stack depth, and `condenseComparisonBelow` flushes just the node one
//! below the top when it holds a pending comparison. Both are needed at
//! control-flow boundaries — branch targets, calls, stores — where a
//! value's symbolic deferred form can no longer be allowed to outlive the
//! point where control may merge with another path that computed it
//! differently (or not at all).

use wasmjit_entity::PrimaryMap;

use crate::error::CodegenError;
use crate::stack::element::{StackElement, StackSlotIndex, StackValue};
use crate::stack::refindex::RefIndex;
use crate::storage::VariableStorage;
use crate::types::WasmType;

/// Materializes one `Condensed` node's operation into a concrete storage.
/// Implemented by the backend ([`crate::backend::OpEvaluator`]); kept as a
/// trait here so the condense tree itself has no dependency on instruction
/// selection. Takes the element arena and reference index directly (rather
/// than a whole [`crate::stack::Stack`]) since a condense walk already
/// holds a mutable borrow of the arena for its own traversal.
pub trait Evaluator {
    /// Emit whatever instruction(s) compute `op(lhs, rhs)` and return the
    /// storage the result now lives in. `elements`/`refs` are threaded
    /// through so scratch-register allocation can spill by rewriting other
    /// stack elements' storages in place. Fails when instruction selection
    /// or register allocation can't service this node (unencodable
    /// immediate, no free register, out-of-range branch in a trap check).
    fn evaluate(
        &mut self,
        elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
        refs: &mut RefIndex,
        op: crate::stack::element::CondenseOp,
        ty: WasmType,
        lhs: VariableStorage,
        rhs: Option<VariableStorage>,
    ) -> Result<VariableStorage, CodegenError>;
}

/// Materialize one slot's subtree in isolation, outside any
/// [`condense_valent_block`]/[`condense_comparison_below`] sweep — needed
/// when a single value is popped off the operand stack (and so off its
/// `order` list) while still `Condensed`, e.g. `local.set`'s operand.
pub(crate) fn evaluate_slot(
    elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    refs: &mut RefIndex,
    slot: StackSlotIndex,
    evaluator: &mut impl Evaluator,
) -> Result<VariableStorage, CodegenError> {
    let (op, ty, lhs, rhs) = match &elements[slot].value {
        StackValue::Storage(s) => return Ok(*s),
        StackValue::Condensed { op, ty, lhs, rhs } => (*op, *ty, *lhs, *rhs),
    };
    let lhs_storage = evaluate_slot(elements, refs, lhs, evaluator)?;
    let rhs_storage = match rhs {
        Some(r) => Some(evaluate_slot(elements, refs, r, evaluator)?),
        None => None,
    };
    let result = evaluator.evaluate(elements, refs, op, ty, lhs_storage, rhs_storage)?;
    elements[slot].value = StackValue::Storage(result);
    Ok(result)
}

/// Force every side-effecting node (`div`/`rem`/memory loads — see
/// [`crate::stack::element::CondenseOp::has_side_effect`]) reachable below
/// `slot` that hasn't already collapsed into a plain value, in the
/// left-to-right order the source program computed them in. Stops
/// descending once it hits a side-effecting node, since forcing it already
/// forces everything beneath it.
fn force_side_effects(
    elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    refs: &mut RefIndex,
    slot: StackSlotIndex,
    evaluator: &mut impl Evaluator,
) -> Result<(), CodegenError> {
    let (op, lhs, rhs) = match &elements[slot].value {
        StackValue::Storage(_) => return Ok(()),
        StackValue::Condensed { op, lhs, rhs, .. } => (*op, *lhs, *rhs),
    };
    if op.has_side_effect() {
        evaluate_slot(elements, refs, slot, evaluator)?;
        return Ok(());
    }
    force_side_effects(elements, refs, lhs, evaluator)?;
    if let Some(r) = rhs {
        force_side_effects(elements, refs, r, evaluator)?;
    }
    Ok(())
}

/// Evaluate any node whose operands are already concrete values once its
/// own subtree has been reduced — these need no register-pressure or
/// spill decisions beyond the one result register, so clearing them before
/// the final pass shrinks what that pass's allocator has to reason about.
fn evaluate_scratch_only(
    elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    refs: &mut RefIndex,
    slot: StackSlotIndex,
    evaluator: &mut impl Evaluator,
) -> Result<(), CodegenError> {
    let (lhs, rhs) = match &elements[slot].value {
        StackValue::Storage(_) => return Ok(()),
        StackValue::Condensed { lhs, rhs, .. } => (*lhs, *rhs),
    };
    evaluate_scratch_only(elements, refs, lhs, evaluator)?;
    if let Some(r) = rhs {
        evaluate_scratch_only(elements, refs, r, evaluator)?;
    }
    let lhs_concrete = !elements[lhs].is_condensed();
    let rhs_concrete = rhs.map(|r| !elements[r].is_condensed()).unwrap_or(true);
    if lhs_concrete && rhs_concrete {
        evaluate_slot(elements, refs, slot, evaluator)?;
    }
    Ok(())
}

/// Evaluate every stack element at or above `from_depth` (bottom-indexed,
/// `0` = the whole stack) that is still `Condensed`. `order` is the
/// stack's current bottom-to-top element list.
///
/// Runs as three passes rather than one post-order walk: first every
/// side-effecting node (in program order, so traps/loads can't be
/// reordered across each other), then every node that's already fully
/// reducible with no outstanding dependency on the rest of the stack, and
/// finally whatever pending nodes remain.
pub fn condense_valent_block(
    elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    refs: &mut RefIndex,
    order: &[StackSlotIndex],
    from_depth: usize,
    evaluator: &mut impl Evaluator,
) -> Result<(), CodegenError> {
    for &slot in order.iter().skip(from_depth) {
        force_side_effects(elements, refs, slot, evaluator)?;
    }
    for &slot in order.iter().skip(from_depth) {
        evaluate_scratch_only(elements, refs, slot, evaluator)?;
    }
    for &slot in order.iter().skip(from_depth) {
        if elements[slot].is_condensed() {
            evaluate_slot(elements, refs, slot, evaluator)?;
        }
    }
    Ok(())
}

/// If the stack element one below the top holds a pending comparison,
/// evaluate it now. Used before an operation (e.g. `local.set` reading
/// through a duplicated stack value) that needs the comparison's plain
/// `0`/`1` result rather than leaving it condensed for a branch to consume
/// as a condition code directly.
pub fn condense_comparison_below(
    elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    refs: &mut RefIndex,
    order: &[StackSlotIndex],
    evaluator: &mut impl Evaluator,
) -> Result<(), CodegenError> {
    if order.len() < 2 {
        return Ok(());
    }
    let slot = order[order.len() - 2];
    let is_pending_comparison = matches!(
        &elements[slot].value,
        StackValue::Condensed { op, .. } if op.is_comparison()
    );
    if is_pending_comparison {
        evaluate_slot(elements, refs, slot, evaluator)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::element::CondenseOp;
    use crate::regs::Reg;

    struct CountingEvaluator {
        calls: u32,
        next_reg: u8,
    }

    impl Evaluator for CountingEvaluator {
        fn evaluate(
            &mut self,
            _elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
            _refs: &mut RefIndex,
            _op: CondenseOp,
            ty: WasmType,
            _lhs: VariableStorage,
            _rhs: Option<VariableStorage>,
        ) -> Result<VariableStorage, CodegenError> {
            self.calls += 1;
            let reg = Reg::Gpr(self.next_reg);
            self.next_reg += 1;
            Ok(VariableStorage::reg(ty, reg))
        }
    }

    #[test]
    fn condense_valent_block_evaluates_post_order_once_each() {
        let mut elements: PrimaryMap<StackSlotIndex, StackElement> = PrimaryMap::new();
        let a = elements.push(StackElement::leaf(VariableStorage::constant(WasmType::I32, 1)));
        let b = elements.push(StackElement::leaf(VariableStorage::constant(WasmType::I32, 2)));
        let sum = elements.push(StackElement {
            value: StackValue::Condensed {
                op: CondenseOp::Add,
                ty: WasmType::I32,
                lhs: a,
                rhs: Some(b),
            },
            parent: None,
            sibling: None,
            prev_occurrence: None,
            next_occurrence: None,
        });
        let order = vec![sum];
        let mut refs = RefIndex::new();
        let mut evaluator = CountingEvaluator { calls: 0, next_reg: 10 };
        condense_valent_block(&mut elements, &mut refs, &order, 0, &mut evaluator).unwrap();
        assert_eq!(evaluator.calls, 1);
        assert!(!elements[sum].is_condensed());
    }

    #[test]
    fn condense_comparison_below_only_touches_pending_comparisons() {
        let mut elements: PrimaryMap<StackSlotIndex, StackElement> = PrimaryMap::new();
        let a = elements.push(StackElement::leaf(VariableStorage::constant(WasmType::I32, 1)));
        let b = elements.push(StackElement::leaf(VariableStorage::constant(WasmType::I32, 2)));
        let cmp = elements.push(StackElement {
            value: StackValue::Condensed {
                op: CondenseOp::CmpEq,
                ty: WasmType::I32,
                lhs: a,
                rhs: Some(b),
            },
            parent: None,
            sibling: None,
            prev_occurrence: None,
            next_occurrence: None,
        });
        let top = elements.push(StackElement::leaf(VariableStorage::constant(WasmType::I32, 0)));
        let order = vec![cmp, top];
        let mut refs = RefIndex::new();
        let mut evaluator = CountingEvaluator { calls: 0, next_reg: 20 };
        condense_comparison_below(&mut elements, &mut refs, &order, &mut evaluator).unwrap();
        assert_eq!(evaluator.calls, 1);
        assert!(!elements[cmp].is_condensed());
    }
}
