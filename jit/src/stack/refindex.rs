//! The reference index (spec §3.7): for every storage a value might live
//! in — a local, a global, a register, or a temp-stack spill slot — the
//! doubly-linked chain of every stack element currently referencing that
//! storage. Spilling a register (or flushing a local's stale copy) walks
//! exactly that storage's chain and nothing else, and removing a single
//! element from a chain is O(1) since each element already carries its
//! neighbors' indices rather than requiring a scan to find them.

use std::collections::HashMap;

use wasmjit_entity::PrimaryMap;

use crate::regs::Reg;
use crate::stack::element::{StackElement, StackSlotIndex};

/// The storage class a reference-index chain is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKey {
    /// A register-resident local or global, or a value held in scratch.
    Register(Reg),
    /// A spill slot in the temp-stack area, by its frame offset.
    TempStackSlot(i32),
    /// A value still at its home slot in job memory (a global not cached
    /// in a register).
    LinkData(i32),
}

/// Per-storage occurrence chains, keyed by [`RefKey`].
#[derive(Debug, Clone, Default)]
pub struct RefIndex {
    heads: HashMap<RefKey, StackSlotIndex>,
}

impl RefIndex {
    /// An empty reference index.
    pub fn new() -> Self {
        RefIndex::default()
    }

    /// Register `slot` as the newest referrer of `key`, splicing it in
    /// front of whatever was previously the newest.
    pub fn add_reference(
        &mut self,
        key: RefKey,
        slot: StackSlotIndex,
        elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    ) {
        elements[slot].prev_occurrence = None;
        elements[slot].next_occurrence = self.heads.get(&key).copied();
        if let Some(prev_head) = self.heads.get(&key).copied() {
            elements[prev_head].prev_occurrence = Some(slot);
        }
        self.heads.insert(key, slot);
    }

    /// Remove `slot` from `key`'s chain in O(1), splicing its neighbors
    /// together directly.
    pub fn remove_reference(
        &mut self,
        key: RefKey,
        slot: StackSlotIndex,
        elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
    ) {
        let prev = elements[slot].prev_occurrence;
        let next = elements[slot].next_occurrence;
        match prev {
            Some(p) => elements[p].next_occurrence = next,
            None => match next {
                Some(n) => {
                    self.heads.insert(key, n);
                }
                None => {
                    self.heads.remove(&key);
                }
            },
        }
        if let Some(n) = next {
            elements[n].prev_occurrence = prev;
        }
        elements[slot].prev_occurrence = None;
        elements[slot].next_occurrence = None;
    }

    /// Every current referrer of `key`, newest first — the list a spill
    /// walks to rewrite every stack element that still reads the spilled
    /// register's old location.
    pub fn occurrences(
        &self,
        key: RefKey,
        elements: &PrimaryMap<StackSlotIndex, StackElement>,
    ) -> Vec<StackSlotIndex> {
        let mut out = Vec::new();
        let mut cur = self.heads.get(&key).copied();
        while let Some(slot) = cur {
            out.push(slot);
            cur = elements[slot].next_occurrence;
        }
        out
    }

    /// Does `key` have any live referrer at all?
    pub fn has_references(&self, key: RefKey) -> bool {
        self.heads.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WasmType;

    fn push_leaf(elements: &mut PrimaryMap<StackSlotIndex, StackElement>) -> StackSlotIndex {
        elements.push(StackElement::leaf(crate::storage::VariableStorage::reg(
            WasmType::I32,
            Reg::Gpr(0),
        )))
    }

    #[test]
    fn add_and_remove_round_trip_through_empty() {
        let mut elements = PrimaryMap::new();
        let mut refs = RefIndex::new();
        let key = RefKey::Register(Reg::Gpr(3));

        let a = push_leaf(&mut elements);
        let b = push_leaf(&mut elements);
        refs.add_reference(key, a, &mut elements);
        refs.add_reference(key, b, &mut elements);

        assert_eq!(refs.occurrences(key, &elements), vec![b, a]);

        refs.remove_reference(key, b, &mut elements);
        assert_eq!(refs.occurrences(key, &elements), vec![a]);

        refs.remove_reference(key, a, &mut elements);
        assert!(!refs.has_references(key));
    }

    #[test]
    fn removing_middle_element_splices_neighbors() {
        let mut elements = PrimaryMap::new();
        let mut refs = RefIndex::new();
        let key = RefKey::TempStackSlot(16);

        let a = push_leaf(&mut elements);
        let b = push_leaf(&mut elements);
        let c = push_leaf(&mut elements);
        refs.add_reference(key, a, &mut elements);
        refs.add_reference(key, b, &mut elements);
        refs.add_reference(key, c, &mut elements);
        // Chain (newest first): c, b, a.

        refs.remove_reference(key, b, &mut elements);
        assert_eq!(refs.occurrences(key, &elements), vec![c, a]);
    }
}
