//! The symbolic operand stack (spec §3.4–§3.7, component C2): a stack of
//! [`element::StackElement`] nodes in an arena, the bottom-to-top push
//! order, and the [`refindex::RefIndex`] tracking which elements still
//! reference which storage. `condense` holds the operations that force a
//! deferred node's computation to actually happen.

pub mod condense;
pub mod element;
pub mod refindex;

use smallvec::SmallVec;
use wasmjit_entity::PrimaryMap;

use crate::error::CodegenError;
use crate::stack::condense::{condense_comparison_below, condense_valent_block, Evaluator};
use crate::stack::element::{CondenseOp, StackElement, StackSlotIndex, StackValue};
use crate::storage::VariableStorage;
use crate::types::WasmType;

pub use refindex::{RefIndex, RefKey};

/// Most Wasm function bodies never hold more than a handful of values on
/// the operand stack at once; inline storage avoids a heap allocation for
/// the common case the same way the teacher's `ValueLabelsRanges` and
/// block-param vectors do.
type StackOrder = SmallVec<[StackSlotIndex; 16]>;

/// The operand stack for one function body currently being compiled.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    elements: PrimaryMap<StackSlotIndex, StackElement>,
    /// Bottom-to-top order of currently live elements.
    order: StackOrder,
    refs: RefIndex,
}

impl Stack {
    /// An empty operand stack.
    pub fn new() -> Self {
        Stack::default()
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.order.len()
    }

    /// This function's reference index, for callers that need to look up
    /// or maintain occurrence chains directly (the register allocator;
    /// see [`crate::services`]).
    pub fn refs(&self) -> &RefIndex {
        &self.refs
    }

    /// Mutable access to the reference index.
    pub fn refs_mut(&mut self) -> &mut RefIndex {
        &mut self.refs
    }

    /// The arena of stack elements, for callers that need to inspect or
    /// mutate a specific slot directly.
    pub fn elements(&self) -> &PrimaryMap<StackSlotIndex, StackElement> {
        &self.elements
    }

    /// Mutable access to the element arena.
    pub fn elements_mut(&mut self) -> &mut PrimaryMap<StackSlotIndex, StackElement> {
        &mut self.elements
    }

    /// Split borrow of the element arena and the reference index, for
    /// callers (the register allocator) that need to mutate both at once —
    /// e.g. splicing a slot out of one storage's occurrence chain while
    /// rewriting that slot's element in place.
    pub fn split_refs_mut(
        &mut self,
    ) -> (&mut PrimaryMap<StackSlotIndex, StackElement>, &mut RefIndex) {
        (&mut self.elements, &mut self.refs)
    }

    /// Push an already-materialized value.
    pub fn push_storage(&mut self, storage: VariableStorage) -> StackSlotIndex {
        let slot = self.elements.push(StackElement::leaf(storage));
        self.order.push(slot);
        slot
    }

    /// Push a deferred computation over the top one or two elements,
    /// wiring `lhs`'s `parent`/`sibling` links so the tree can be walked
    /// from either child back to its operation (spec §3.6).
    pub fn push_condensed(
        &mut self,
        op: CondenseOp,
        ty: WasmType,
        lhs: StackSlotIndex,
        rhs: Option<StackSlotIndex>,
    ) -> StackSlotIndex {
        let slot = self.elements.push(StackElement {
            value: StackValue::Condensed { op, ty, lhs, rhs },
            parent: None,
            sibling: None,
            prev_occurrence: None,
            next_occurrence: None,
        });
        self.elements[lhs].parent = Some(slot);
        if let Some(r) = rhs {
            self.elements[lhs].sibling = Some(r);
            self.elements[r].parent = Some(slot);
            self.elements[r].sibling = Some(lhs);
        }
        self.order.push(slot);
        slot
    }

    /// Pop the top element off the stack, if any.
    pub fn pop(&mut self) -> Option<StackSlotIndex> {
        self.order.pop()
    }

    /// Peek `depth_from_top` elements down from the top (`0` is the top
    /// element itself).
    pub fn peek(&self, depth_from_top: usize) -> Option<StackSlotIndex> {
        let len = self.order.len();
        if depth_from_top >= len {
            return None;
        }
        Some(self.order[len - 1 - depth_from_top])
    }

    /// The type of `slot`'s current value.
    pub fn ty_of(&self, slot: StackSlotIndex) -> WasmType {
        self.elements[slot].ty()
    }

    /// Borrow a stack element directly.
    pub fn element(&self, slot: StackSlotIndex) -> &StackElement {
        &self.elements[slot]
    }

    /// `slot`'s storage, if it is already a concrete value rather than a
    /// still-deferred computation.
    pub fn storage_of(&self, slot: StackSlotIndex) -> Option<VariableStorage> {
        match &self.elements[slot].value {
            StackValue::Storage(s) => Some(*s),
            StackValue::Condensed { .. } => None,
        }
    }

    /// Force every deferred node at or above `from_depth` into a concrete
    /// value (spec §4.5.3).
    pub fn condense_valent_block(&mut self, from_depth: usize, evaluator: &mut impl Evaluator) -> Result<(), CodegenError> {
        condense_valent_block(&mut self.elements, &mut self.refs, &self.order, from_depth, evaluator)
    }

    /// Force the element one below the top, if it's a pending comparison,
    /// into a concrete `0`/`1` value (spec §4.5.3).
    pub fn condense_comparison_below(&mut self, evaluator: &mut impl Evaluator) -> Result<(), CodegenError> {
        condense_comparison_below(&mut self.elements, &mut self.refs, &self.order, evaluator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Reg;

    #[test]
    fn push_pop_tracks_depth_and_order() {
        let mut stack = Stack::new();
        assert_eq!(stack.depth(), 0);
        let a = stack.push_storage(VariableStorage::constant(WasmType::I32, 1));
        let b = stack.push_storage(VariableStorage::constant(WasmType::I32, 2));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek(0), Some(b));
        assert_eq!(stack.peek(1), Some(a));
        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn push_condensed_links_children_to_parent_and_each_other() {
        let mut stack = Stack::new();
        let a = stack.push_storage(VariableStorage::reg(WasmType::I32, Reg::Gpr(1)));
        let b = stack.push_storage(VariableStorage::reg(WasmType::I32, Reg::Gpr(2)));
        stack.pop();
        stack.pop();
        let sum = stack.push_condensed(CondenseOp::Add, WasmType::I32, a, Some(b));
        assert_eq!(stack.element(a).parent, Some(sum));
        assert_eq!(stack.element(b).parent, Some(sum));
        assert_eq!(stack.element(a).sibling, Some(b));
        assert_eq!(stack.element(b).sibling, Some(a));
        assert!(stack.storage_of(sum).is_none());
    }
}
