//! The register allocator (spec component C3, §4.5): push/pop bookkeeping
//! that keeps the [`crate::stack::RefIndex`] in sync with the operand
//! stack, scratch-register request/reuse, spilling a register's every
//! occurrence to the temp-stack area, and handing out temp-stack slots.
//!
//! Grounded on `cranelift_codegen::regalloc::register_set`'s free-register
//! bitset plus `cranelift_codegen::isa::aarch64::abi`'s stack-slot
//! allocation, adapted to this backend's single-pass model: there is no
//! separate liveness-analysis pass, so "can I reuse this register" is
//! answered on the spot from the reference index rather than from a
//! precomputed live range.
//!
//! Most methods here take the stack's element arena and reference index
//! directly (`elements`/`refs`) rather than a whole [`Stack`], so they can
//! be driven equally from ordinary backend code (which holds a full
//! `Stack`, see [`Stack::split_refs_mut`]) and from inside a condense-tree
//! walk (which only ever holds those two pieces at once — see
//! [`crate::stack::condense`]).

use wasmjit_entity::PrimaryMap;

use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::select::RegProvider;
use crate::regs::{RegMask, Reg, Registers};
use crate::stack::element::{StackElement, StackSlotIndex, StackValue};
use crate::stack::{RefIndex, RefKey, Stack};
use crate::storage::{StorageKind, VariableStorage};
use crate::types::WasmType;

/// The operand stack's element arena, as the allocator sees it.
pub type Elements = PrimaryMap<StackSlotIndex, StackElement>;

/// Registers reserved for globals, locals, and live Wasm-ABI parameters;
/// never handed out as scratch. Built once at function-entry time from
/// however many of [`Registers::gpr`]/[`Registers::fpr`]'s leading entries
/// the function's declared globals/locals/params consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservedSet {
    /// Reserved GPRs.
    pub gpr: RegMask,
    /// Reserved FPRs.
    pub fpr: RegMask,
}

/// The allocator for one function body: tracks which scratch registers are
/// currently free, the temp-stack spill area's slot occupancy, and owns no
/// code-emission state itself (that's [`Assembler`]'s job — this struct is
/// passed alongside it).
#[derive(Debug)]
pub struct RegisterAllocator {
    regs: Registers,
    reserved: ReservedSet,
    /// Scratch registers with no live value in them at all right now.
    free_gpr: RegMask,
    free_fpr: RegMask,
    /// Occupancy of the temp-stack spill area, indexed by slot number
    /// (`slot_offset = -(i as i32 + 1) * WasmType::SLOT_SIZE as i32` from
    /// the frame's temp-stack base).
    temp_slots: Vec<bool>,
}

impl RegisterAllocator {
    /// A fresh allocator for a function whose globals/locals/params occupy
    /// `reserved`'s registers; everything else in `regs.gpr`/`regs.fpr`
    /// starts out free.
    pub fn new(regs: Registers, reserved: ReservedSet) -> Self {
        let mut free_gpr_mask = RegMask::none();
        for &r in &regs.gpr {
            free_gpr_mask = free_gpr_mask.union(RegMask::singleton(r));
        }
        free_gpr_mask = free_gpr_mask.subtract(reserved.gpr);
        let mut free_fpr_mask = RegMask::none();
        for &r in &regs.fpr {
            free_fpr_mask = free_fpr_mask.union(RegMask::singleton(r));
        }
        free_fpr_mask = free_fpr_mask.subtract(reserved.fpr);

        RegisterAllocator {
            regs,
            reserved,
            free_gpr: free_gpr_mask,
            free_fpr: free_fpr_mask,
            temp_slots: Vec::new(),
        }
    }

    /// This function's register files, for callers (the backend) that need
    /// to know the dedicated `lin_mem`/`job_mem` registers directly.
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    fn free_mask_for(&self, is_float: bool) -> RegMask {
        if is_float {
            self.free_fpr
        } else {
            self.free_gpr
        }
    }

    fn set_free(&mut self, reg: Reg, free: bool) {
        let mask = RegMask::singleton(reg);
        if reg.is_fpr() {
            self.free_fpr = if free {
                self.free_fpr.union(mask)
            } else {
                self.free_fpr.subtract(mask)
            };
        } else {
            self.free_gpr = if free {
                self.free_gpr.union(mask)
            } else {
                self.free_gpr.subtract(mask)
            };
        }
    }

    /// `push` (spec §4.5.1): put `storage` on the operand stack and, if it
    /// names a register, add this stack slot to that register's occurrence
    /// chain.
    pub fn push(&mut self, stack: &mut Stack, storage: VariableStorage) -> StackSlotIndex {
        let slot = stack.push_storage(storage);
        let (elements, refs) = stack.split_refs_mut();
        self.add_reference(elements, refs, slot);
        slot
    }

    /// `pop` (spec §4.5.2): remove the top stack slot and drop its
    /// reference, if it held one.
    pub fn pop(&mut self, stack: &mut Stack) -> Option<StackSlotIndex> {
        let slot = stack.pop()?;
        let (elements, refs) = stack.split_refs_mut();
        self.remove_reference(elements, refs, slot);
        Some(slot)
    }

    fn ref_key_of(&self, elements: &Elements, slot: StackSlotIndex) -> Option<RefKey> {
        let storage = match &elements[slot].value {
            StackValue::Storage(s) => s,
            StackValue::Condensed { .. } => return None,
        };
        match storage.kind {
            StorageKind::Register(r) | StorageKind::StackReg { reg: r, .. } => Some(RefKey::Register(r)),
            StorageKind::StackMemory(off) => Some(RefKey::TempStackSlot(off)),
            StorageKind::LinkData(off) => Some(RefKey::LinkData(off)),
            StorageKind::Constant(_) | StorageKind::Invalid => None,
        }
    }

    /// `addReference` (spec §4.5.1): register `slot` as a new referrer of
    /// whatever storage it currently holds.
    pub fn add_reference(&mut self, elements: &mut Elements, refs: &mut RefIndex, slot: StackSlotIndex) {
        if let Some(key) = self.ref_key_of(elements, slot) {
            if let RefKey::Register(r) = key {
                self.set_free(r, false);
            }
            refs.add_reference(key, slot, elements);
        }
    }

    /// `removeReference` (spec §4.5.2): drop `slot` from its storage's
    /// occurrence chain. If that was the storage's last referrer and it was
    /// a register, the register becomes free again — unless it's a
    /// dedicated global/local register, which stays reserved for the rest
    /// of the function regardless of how many stack slots currently
    /// reference it.
    pub fn remove_reference(&mut self, elements: &mut Elements, refs: &mut RefIndex, slot: StackSlotIndex) {
        if let Some(key) = self.ref_key_of(elements, slot) {
            refs.remove_reference(key, slot, elements);
            if let RefKey::Register(r) = key {
                let dedicated = self.reserved.gpr.contains(r) || self.reserved.fpr.contains(r);
                if !dedicated && !refs.has_references(key) {
                    self.set_free(r, true);
                }
            }
        }
    }

    /// `isWritableScratchReg` (spec §4.5.4): can `reg` be overwritten right
    /// now without losing a value anything else still needs? True when
    /// `reg` isn't reserved for a global/local and either holds nothing at
    /// all or has no other live referrer besides the operand currently
    /// being consumed.
    pub fn is_writable_scratch_reg(&self, reg: Reg, elements: &Elements, refs: &RefIndex) -> bool {
        if self.reserved.gpr.contains(reg) || self.reserved.fpr.contains(reg) {
            return false;
        }
        if self.free_mask_for(reg.is_fpr()).contains(reg) {
            return true;
        }
        refs.occurrences(RefKey::Register(reg), elements).len() <= 1
    }

    /// `reqScratchReg` (spec §4.5.5): hand out a free scratch register of
    /// the right class, spilling an occupied one if none is free.
    pub fn req_scratch_reg(
        &mut self,
        ty: WasmType,
        elements: &mut Elements,
        refs: &mut RefIndex,
        asm: &mut Assembler,
    ) -> Result<Reg, CodegenError> {
        if let Some(reg) = self.req_free_scratch_reg(ty) {
            return Ok(reg);
        }
        let victim = self.pick_spill_victim(ty)?;
        self.spill_from_stack(elements, refs, asm, victim)?;
        self.req_free_scratch_reg(ty)
            .ok_or(CodegenError::NotImplemented("no scratch register available after spill"))
    }

    /// `reqFreeScratchReg` (spec §4.5.5): as [`Self::req_scratch_reg`] but
    /// never spills — returns `None` if nothing is currently free.
    pub fn req_free_scratch_reg(&mut self, ty: WasmType) -> Option<Reg> {
        let is_float = ty.is_float();
        let pool = if is_float { &self.regs.fpr } else { &self.regs.gpr };
        let free = self.free_mask_for(is_float);
        for &reg in pool {
            if free.contains(reg) {
                self.set_free(reg, false);
                return Some(reg);
            }
        }
        None
    }

    fn pick_spill_victim(&self, ty: WasmType) -> Result<Reg, CodegenError> {
        let is_float = ty.is_float();
        let pool = if is_float { &self.regs.fpr } else { &self.regs.gpr };
        let reserved = if is_float { self.reserved.fpr } else { self.reserved.gpr };
        pool.iter()
            .copied()
            .find(|&r| !reserved.contains(r))
            .ok_or(CodegenError::NotImplemented("no spillable register of this class"))
    }

    /// `liftToRegInPlace` (spec §4.5.6): if `slot` isn't already backed by a
    /// register, materialize it into one, rewriting the stack element's
    /// storage to the new register and updating the reference index.
    pub fn lift_to_reg_in_place(
        &mut self,
        elements: &mut Elements,
        refs: &mut RefIndex,
        asm: &mut Assembler,
        slot: StackSlotIndex,
    ) -> Result<Reg, CodegenError> {
        let storage = match &elements[slot].value {
            StackValue::Storage(s) => *s,
            StackValue::Condensed { .. } => {
                return Err(CodegenError::NotImplemented("cannot lift a still-condensed stack slot"))
            }
        };
        if let Some(r) = storage.register() {
            return Ok(r);
        }
        let reg = self.req_scratch_reg(storage.ty, elements, refs, asm)?;
        asm.emit_action_arg(&storage, reg);
        self.remove_reference(elements, refs, slot);
        elements[slot].value = StackValue::Storage(VariableStorage::reg(storage.ty, reg));
        self.add_reference(elements, refs, slot);
        Ok(reg)
    }

    /// `spillFromStack` (spec §4.5.7): move every current occupant of `reg`
    /// out to a fresh temp-stack slot, freeing `reg` for reuse. Every stack
    /// element that referenced `reg` is rewritten in place to point at its
    /// new `StackMemory` home.
    pub fn spill_from_stack(
        &mut self,
        elements: &mut Elements,
        refs: &mut RefIndex,
        asm: &mut Assembler,
        reg: Reg,
    ) -> Result<(), CodegenError> {
        let key = RefKey::Register(reg);
        let occurrences = refs.occurrences(key, elements);
        if occurrences.is_empty() {
            self.set_free(reg, true);
            return Ok(());
        }
        let ty = elements[occurrences[0]].ty();
        let offset = self.find_free_temp_stack_slot()?;
        store_to_temp_stack(asm, reg, offset, ty);

        for &slot in &occurrences {
            self.remove_reference(elements, refs, slot);
            elements[slot].value = StackValue::Storage(VariableStorage::stack(ty, offset));
        }
        for &slot in &occurrences {
            refs.add_reference(RefKey::TempStackSlot(offset), slot, elements);
        }
        self.set_free(reg, true);
        Ok(())
    }

    /// `findFreeTempStackSlot` (spec §4.5.8): the frame offset of a
    /// currently-unused temp-stack slot, extending the temp-stack area by
    /// one slot if every existing one is occupied. Slots are never
    /// permanently reclaimed by this allocator (a single-pass compiler
    /// never frees frame space mid-function) — `free_temp_stack_slot`
    /// marks one reusable again once its last referrer is gone.
    pub fn find_free_temp_stack_slot(&mut self) -> Result<i32, CodegenError> {
        if let Some(index) = self.temp_slots.iter().position(|&occupied| !occupied) {
            self.temp_slots[index] = true;
            return Ok(Self::slot_offset(index));
        }
        let index = self.temp_slots.len();
        self.temp_slots.push(true);
        Ok(Self::slot_offset(index))
    }

    /// Mark the temp-stack slot at `offset` free again, once its last
    /// referrer has been removed.
    pub fn free_temp_stack_slot(&mut self, offset: i32) {
        let index = (-offset / WasmType::SLOT_SIZE as i32 - 1) as usize;
        if let Some(occupied) = self.temp_slots.get_mut(index) {
            *occupied = false;
        }
    }

    fn slot_offset(index: usize) -> i32 {
        -((index as i32 + 1) * WasmType::SLOT_SIZE as i32)
    }

    /// Total temp-stack bytes consumed so far, for frame-size accounting.
    pub fn temp_stack_bytes(&self) -> u32 {
        self.temp_slots.len() as u32 * WasmType::SLOT_SIZE
    }
}

fn store_to_temp_stack(asm: &mut Assembler, reg: Reg, offset: i32, ty: WasmType) {
    // Mirrors `Assembler`'s private `load_from_frame`'s template choice, in
    // the store direction.
    use crate::isa::builder::InstrBuilder;
    use crate::isa::encoding::templates;
    let template = if ty.is_float() {
        if ty.is64() {
            0xFD00_0000 // STR Dt, [Xn, #imm]
        } else {
            0xBD00_0000 // STR St, [Xn, #imm]
        }
    } else if ty.is64() {
        templates::STR_IMM64
    } else {
        templates::STR_IMM32
    };
    let log2_size = if ty.is64() { 3 } else { 2 };
    // See `Assembler::load_from_frame`: `offset` is counted from the
    // frame's top, so the frame size has to be added back in to land a
    // valid non-negative `sp`-relative displacement.
    asm.instr(
        InstrBuilder::new(template)
            .set_t(reg)
            .set_n(Reg::Sp)
            .set_scaled_offset12(asm.frame_size() as i32 + offset, log2_size)
            .finish(),
    );
}

/// A view over a [`RegisterAllocator`] plus the [`Stack`]/[`Assembler`] it
/// needs to implement [`RegProvider`] for [`crate::isa::select::select_instr`].
pub struct AllocatingRegProvider<'a> {
    /// The allocator being driven.
    pub allocator: &'a mut RegisterAllocator,
    /// The operand stack, for reference-index lookups.
    pub stack: &'a mut Stack,
    /// The code buffer, for emitting lift/spill instructions.
    pub asm: &'a mut Assembler,
}

impl<'a> RegProvider for AllocatingRegProvider<'a> {
    fn request_scratch(&mut self, ty: WasmType) -> Result<Reg, CodegenError> {
        let (elements, refs) = self.stack.split_refs_mut();
        self.allocator.req_scratch_reg(ty, elements, refs, self.asm)
    }

    fn is_writable_scratch(&self, reg: Reg) -> bool {
        self.allocator.is_writable_scratch_reg(reg, self.stack.elements(), self.stack.refs())
    }

    fn lift_into(&mut self, storage: &VariableStorage, reg: Reg) -> Result<(), CodegenError> {
        self.asm.emit_action_arg(storage, reg);
        Ok(())
    }
}

/// As [`AllocatingRegProvider`], but driven from a condense-tree flush,
/// which only ever has the element arena and reference index in scope
/// (not a whole [`Stack`]) — see [`crate::stack::condense`].
pub struct ElementsRegProvider<'a> {
    /// The allocator being driven.
    pub allocator: &'a mut RegisterAllocator,
    /// The operand stack's element arena.
    pub elements: &'a mut Elements,
    /// The operand stack's reference index.
    pub refs: &'a mut RefIndex,
    /// The code buffer, for emitting lift/spill instructions.
    pub asm: &'a mut Assembler,
}

impl<'a> RegProvider for ElementsRegProvider<'a> {
    fn request_scratch(&mut self, ty: WasmType) -> Result<Reg, CodegenError> {
        self.allocator.req_scratch_reg(ty, self.elements, self.refs, self.asm)
    }

    fn is_writable_scratch(&self, reg: Reg) -> bool {
        self.allocator.is_writable_scratch_reg(reg, self.elements, self.refs)
    }

    fn lift_into(&mut self, storage: &VariableStorage, reg: Reg) -> Result<(), CodegenError> {
        self.asm.emit_action_arg(storage, reg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::element::CondenseOp;

    fn test_allocator() -> RegisterAllocator {
        RegisterAllocator::new(Registers::new_aarch64(), ReservedSet::default())
    }

    #[test]
    fn push_then_pop_frees_the_register() {
        let mut alloc = test_allocator();
        let mut stack = Stack::new();
        let reg = Reg::Gpr(9);
        assert!(alloc.is_writable_scratch_reg(reg, stack.elements(), stack.refs()));
        alloc.push(&mut stack, VariableStorage::reg(WasmType::I32, reg));
        assert!(!alloc.free_gpr.contains(reg));
        alloc.pop(&mut stack);
        assert!(alloc.free_gpr.contains(reg));
    }

    #[test]
    fn shared_register_stays_occupied_until_every_referrer_pops() {
        let mut alloc = test_allocator();
        let mut stack = Stack::new();
        let reg = Reg::Gpr(9);
        let a = alloc.push(&mut stack, VariableStorage::reg(WasmType::I32, reg));
        stack.pop();
        stack.push_storage(VariableStorage::reg(WasmType::I32, reg));
        let second = stack.peek(0).unwrap();
        let (elements, refs) = stack.split_refs_mut();
        alloc.add_reference(elements, refs, second);
        assert!(!alloc.free_gpr.contains(reg));
        let (elements, refs) = stack.split_refs_mut();
        alloc.remove_reference(elements, refs, a);
        assert!(!alloc.free_gpr.contains(reg), "still one referrer left");
    }

    #[test]
    fn find_free_temp_stack_slot_packs_sequentially() {
        let mut alloc = test_allocator();
        let a = alloc.find_free_temp_stack_slot().unwrap();
        let b = alloc.find_free_temp_stack_slot().unwrap();
        assert_eq!(a, -8);
        assert_eq!(b, -16);
        alloc.free_temp_stack_slot(a);
        let c = alloc.find_free_temp_stack_slot().unwrap();
        assert_eq!(c, -8, "freed slot is reused before growing the frame");
    }

    #[test]
    fn req_free_scratch_reg_returns_none_when_exhausted() {
        let mut alloc = RegisterAllocator::new(Registers::new_aarch64(), ReservedSet::default());
        let mut taken = Vec::new();
        while let Some(r) = alloc.req_free_scratch_reg(WasmType::I32) {
            taken.push(r);
        }
        assert!(!taken.is_empty());
        assert!(alloc.req_free_scratch_reg(WasmType::I32).is_none());
    }

    #[test]
    fn condensed_slot_cannot_be_lifted_directly() {
        let mut alloc = test_allocator();
        let mut stack = Stack::new();
        let mut asm = Assembler::new();
        let a = stack.push_storage(VariableStorage::constant(WasmType::I32, 1));
        let b = stack.push_storage(VariableStorage::constant(WasmType::I32, 2));
        stack.pop();
        stack.pop();
        let sum = stack.push_condensed(CondenseOp::Add, WasmType::I32, a, Some(b));
        let (elements, refs) = stack.split_refs_mut();
        assert!(alloc.lift_to_reg_in_place(elements, refs, &mut asm, sum).is_err());
    }
}
