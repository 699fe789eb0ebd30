//! Linear-memory access (spec §4.6.8/§4.6.14): loads, stores, `memory.copy`/
//! `memory.fill`, `memory.size`/`memory.grow`, and the bounds-check
//! sequence every access above goes through when
//! [`crate::config::Flags::linear_memory_bounds_checks`] is set.
//!
//! Every address here is relative to
//! [`crate::regs::DedicatedRegs::lin_mem`]; the offset immediate folded
//! into a Wasm `load`/`store` instruction is added in before the bounds
//! check, exactly as the operand stack's address element plus the
//! instruction's static offset forms one effective address.

use crate::cond::BranchCondition;
use crate::config::Flags;
use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::isa::relpatch::RelPatchObj;
use crate::regs::Reg;
use crate::services::{Elements, RegisterAllocator};
use crate::stack::element::CondenseOp;
use crate::stack::RefIndex;
use crate::storage::{StorageKind, VariableStorage};
use crate::trap::TrapCode;
use crate::types::WasmType;

fn lift(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    storage: VariableStorage,
) -> Result<Reg, CodegenError> {
    if let Some(r) = storage.register() {
        return Ok(r);
    }
    let reg = regs.req_scratch_reg(storage.ty, elements, refs, asm)?;
    asm.emit_action_arg(&storage, reg);
    Ok(reg)
}

/// `emitLinMemBoundsCheck` (spec §4.6.14): compares `addr_reg + obj_size`
/// against the cached memory-size register. On failure, when an
/// extension-request trampoline has been wired (see
/// `crate::backend::wrappers::emit_extension_request_trampoline`), loads the
/// candidate address into `x1` and calls it — the trampoline re-checks the
/// address against the (possibly just-grown) memory size and either returns
/// or traps itself. Falls back to trapping directly with
/// [`TrapCode::LinMemOutOfBoundsAccess`] when no trampoline is wired. A
/// no-op when the backend wasn't given a cached memory-size register
/// (`Reg::None`).
pub fn emit_bounds_check(
    asm: &mut Assembler,
    mem_size: Reg,
    addr_reg: Reg,
    obj_size: u32,
    scratch: Reg,
) -> Result<(), CodegenError> {
    if mem_size == Reg::None {
        return Ok(());
    }
    asm.add_imm_to_reg(scratch, addr_reg, obj_size as i64, true, scratch);
    asm.instr(InstrBuilder::new(templates::CMP_REG64).set_n(scratch).set_m(mem_size).finish());
    let cond = BranchCondition::from_comparison(CondenseOp::CmpGtU, WasmType::I64).expect("CmpGtU is always a valid comparison");
    match asm.extension_trampoline_pos() {
        Some(target) => {
            asm.emit_action_arg(&VariableStorage::reg(WasmType::I64, scratch), Reg::Gpr(1));
            asm.conditional_call(cond.to_aarch64_cc(), target)?;
        }
        None => {
            asm.conditional_trap(cond.to_aarch64_cc(), TrapCode::LinMemOutOfBoundsAccess)?;
        }
    }
    Ok(())
}

fn width_bits(ty: WasmType, narrow_bytes: Option<u32>) -> u32 {
    narrow_bytes.map(|b| b * 8).unwrap_or(ty.bytes() * 8)
}

/// `executeLinearMemoryLoad` (spec §4.6.8). `narrow_bytes`, when set, is the
/// memory access width for a sub-width load (`i32.load8_s`, `i64.load32_u`,
/// ...); `signed` only matters when narrower than `dst_ty`.
pub fn emit_linear_memory_load(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    flags: &Flags,
    dst_ty: WasmType,
    narrow_bytes: Option<u32>,
    signed: bool,
    offset: i32,
    addr: VariableStorage,
) -> Result<VariableStorage, CodegenError> {
    let addr_reg = lift(regs, elements, refs, asm, addr)?;
    let scratch = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.add_imm_to_reg(scratch, addr_reg, offset as i64, true, scratch);

    let lin_mem = regs.registers().dedicated.lin_mem;
    let mem_size = regs.registers().dedicated.mem_size;
    let access_bytes = narrow_bytes.unwrap_or(dst_ty.bytes());
    if flags.linear_memory_bounds_checks {
        emit_bounds_check(asm, mem_size, scratch, access_bytes, scratch)?;
    }

    let dst = if dst_ty.is_float() {
        regs.req_scratch_reg(dst_ty, elements, refs, asm)?
    } else {
        // Reuse the address register as the destination: this spot never
        // needs the address again once the value is loaded.
        addr_reg
    };
    asm.load_reg_offset(dst, lin_mem, scratch, dst_ty.is_float(), width_bits(dst_ty, narrow_bytes));

    if !dst_ty.is_float() && signed {
        if let Some(bytes) = narrow_bytes {
            if bytes < dst_ty.bytes() {
                sign_extend_in_place(asm, dst, dst_ty, bytes);
            }
        }
    }
    Ok(VariableStorage::reg(dst_ty, dst))
}

fn sign_extend_in_place(asm: &mut Assembler, reg: Reg, dst_ty: WasmType, from_bytes: u32) {
    let template = match (dst_ty.is64(), from_bytes) {
        (false, 1) => templates::SXTB32,
        (false, 2) => templates::SXTH32,
        (true, 1) => templates::SXTB64,
        (true, 2) => templates::SXTH64,
        (true, 4) => templates::SXTW64,
        _ => return,
    };
    asm.instr(InstrBuilder::new(template).set_d(reg).set_n(reg).finish());
}

/// `executeLinearMemoryStore` (spec §4.6.8). Stores the constant `0` via
/// the zero register without ever materializing it in a GPR/FPR first.
pub fn emit_linear_memory_store(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    flags: &Flags,
    narrow_bytes: Option<u32>,
    offset: i32,
    addr: VariableStorage,
    value: VariableStorage,
) -> Result<(), CodegenError> {
    let addr_reg = lift(regs, elements, refs, asm, addr)?;
    let scratch = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.add_imm_to_reg(scratch, addr_reg, offset as i64, true, scratch);

    let lin_mem = regs.registers().dedicated.lin_mem;
    let mem_size = regs.registers().dedicated.mem_size;
    let access_bytes = narrow_bytes.unwrap_or(value.ty.bytes());
    if flags.linear_memory_bounds_checks {
        emit_bounds_check(asm, mem_size, scratch, access_bytes, scratch)?;
    }

    let is_const_zero = matches!(value.kind, StorageKind::Constant(0));
    let src_reg = if is_const_zero { Reg::Zr } else { lift(regs, elements, refs, asm, value)? };
    asm.store_reg_offset(src_reg, lin_mem, scratch, value.ty.is_float(), width_bits(value.ty, narrow_bytes));
    Ok(())
}

/// `executeGetMemSize` (spec §4.6.8): the cached Wasm-page count, pushed as
/// an `i32`.
pub fn emit_get_mem_size(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
) -> Result<VariableStorage, CodegenError> {
    let dst = regs.req_scratch_reg(WasmType::I32, elements, refs, asm)?;
    let job_mem = regs.registers().dedicated.job_mem;
    asm.load_from_base(dst, job_mem, crate::layout::LINEAR_MEMORY_PAGE_COUNT.offset(), WasmType::I32);
    Ok(VariableStorage::reg(WasmType::I32, dst))
}

/// `executeMemGrow` (spec §4.6.8), simplified: calls the host memory-growth
/// helper directly through the function pointer cached at
/// [`crate::layout::MEMORY_HELPER_PTR`], rather than through the module-
/// level landing-pad trampoline (which exists to save/restore volatile
/// registers around *every* kind of host callback, not just this one) —
/// this call site only needs one argument and one result, so it manages
/// what it needs itself. The callee is trusted to return Wasm's
/// `0xFFFF_FFFF` failure sentinel itself.
pub fn emit_mem_grow(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    delta_pages: VariableStorage,
) -> Result<VariableStorage, CodegenError> {
    let job_mem = regs.registers().dedicated.job_mem;
    let arg_reg = Reg::Gpr(0);
    asm.emit_action_arg(&delta_pages, arg_reg);
    let helper = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.load_from_base(helper, job_mem, crate::layout::MEMORY_HELPER_PTR.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::BLR).set_n(helper).finish());
    Ok(VariableStorage::reg(WasmType::I32, Reg::Gpr(0)))
}

/// `executeLinearMemoryCopy` (spec §4.6.8), simplified to a byte-at-a-time
/// loop rather than the `LDP`/`STP` double-pair fast path — correctness
/// first, since a mis-encoded pre/post-indexed pair addressing mode would
/// silently corrupt memory in a way nothing here could catch without
/// running the emitted code. Still chooses forward vs. backward iteration
/// order by comparing `dst`/`src` so overlapping regions copy correctly,
/// matching `memmove` rather than plain `memcpy` semantics (Wasm's
/// `memory.copy` requires this).
pub fn emit_linear_memory_copy(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    flags: &Flags,
    dst: VariableStorage,
    src: VariableStorage,
    size: VariableStorage,
) -> Result<(), CodegenError> {
    let dst_reg = lift(regs, elements, refs, asm, dst)?;
    let src_reg = lift(regs, elements, refs, asm, src)?;
    let size_reg = lift(regs, elements, refs, asm, size)?;
    let lin_mem = regs.registers().dedicated.lin_mem;

    if flags.linear_memory_bounds_checks {
        let mem_size = regs.registers().dedicated.mem_size;
        let scratch = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
        emit_bounds_check(asm, mem_size, dst_reg, 0, scratch)?;
        emit_bounds_check(asm, mem_size, src_reg, 0, scratch)?;
    }

    let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I64).expect("CmpEq is always valid");
    let higher = BranchCondition::from_comparison(CondenseOp::CmpGtU, WasmType::I64).expect("CmpGtU is always valid");
    let byte = regs.req_scratch_reg(WasmType::I32, elements, refs, asm)?;
    let mut done = RelPatchObj::new();

    // Copy backward when dst > src: a forward byte loop would otherwise
    // overwrite bytes of an overlapping source region before reading them.
    asm.instr(InstrBuilder::new(templates::CMP_REG64).set_n(dst_reg).set_m(src_reg).finish());
    let mut backward = RelPatchObj::new();
    asm.prepare_jmp_cond(&mut backward, higher.to_aarch64_cc());

    let mut forward_top = RelPatchObj::new();
    asm.link_label_here(&mut forward_top);
    asm.instr(InstrBuilder::new(templates::CMP_IMM64).set_n(size_reg).set_imm12(0).finish());
    asm.prepare_jmp_cond(&mut done, eq.to_aarch64_cc());
    asm.load_reg_offset(byte, lin_mem, src_reg, false, 8);
    asm.store_reg_offset(byte, lin_mem, dst_reg, false, 8);
    asm.add_imm_to_reg(src_reg, src_reg, 1, true, byte);
    asm.add_imm_to_reg(dst_reg, dst_reg, 1, true, byte);
    asm.add_imm_to_reg(size_reg, size_reg, -1, true, byte);
    asm.prepare_jmp(&mut forward_top);

    // Backward loop: `backward` is the loop head (the zero-size check), so
    // looping back to it re-checks the exit condition every iteration.
    asm.link_label_here(&mut backward);
    let addr_scratch = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.instr(InstrBuilder::new(templates::CMP_IMM64).set_n(size_reg).set_imm12(0).finish());
    asm.prepare_jmp_cond(&mut done, eq.to_aarch64_cc());
    asm.add_imm_to_reg(size_reg, size_reg, -1, true, byte);
    asm.instr(InstrBuilder::new(templates::ADD_REG64).set_d(addr_scratch).set_n(src_reg).set_m(size_reg).finish());
    asm.load_reg_offset(byte, lin_mem, addr_scratch, false, 8);
    asm.instr(InstrBuilder::new(templates::ADD_REG64).set_d(addr_scratch).set_n(dst_reg).set_m(size_reg).finish());
    asm.store_reg_offset(byte, lin_mem, addr_scratch, false, 8);
    asm.prepare_jmp(&mut backward);

    asm.link_label_here(&mut done);
    Ok(())
}

/// `executeLinearMemoryFill` (spec §4.6.8): broadcast `val`'s low byte over
/// `size` bytes starting at `dst`, via the same byte-loop simplification as
/// [`emit_linear_memory_copy`].
pub fn emit_linear_memory_fill(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    flags: &Flags,
    dst: VariableStorage,
    val: VariableStorage,
    size: VariableStorage,
) -> Result<(), CodegenError> {
    let dst_reg = lift(regs, elements, refs, asm, dst)?;
    let val_reg = lift(regs, elements, refs, asm, val)?;
    let size_reg = lift(regs, elements, refs, asm, size)?;
    let lin_mem = regs.registers().dedicated.lin_mem;

    if flags.linear_memory_bounds_checks {
        let mem_size = regs.registers().dedicated.mem_size;
        let scratch = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
        emit_bounds_check(asm, mem_size, dst_reg, 0, scratch)?;
    }

    let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I64).expect("CmpEq is always valid");
    let one = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    let mut done = RelPatchObj::new();
    let mut top = RelPatchObj::new();
    asm.link_label_here(&mut top);
    asm.instr(InstrBuilder::new(templates::CMP_IMM64).set_n(size_reg).set_imm12(0).finish());
    asm.prepare_jmp_cond(&mut done, eq.to_aarch64_cc());
    asm.store_reg_offset(val_reg, lin_mem, dst_reg, false, 8);
    asm.add_imm_to_reg(dst_reg, dst_reg, 1, true, one);
    asm.add_imm_to_reg(size_reg, size_reg, -1, true, one);
    asm.prepare_jmp(&mut top);
    asm.link_label_here(&mut done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Registers;
    use crate::services::ReservedSet;
    use crate::stack::element::{StackElement, StackSlotIndex};
    use wasmjit_entity::PrimaryMap;

    fn fresh() -> (RegisterAllocator, PrimaryMap<StackSlotIndex, StackElement>, RefIndex, Assembler) {
        let allocator = RegisterAllocator::new(Registers::new_aarch64(), ReservedSet::default());
        (allocator, PrimaryMap::new(), RefIndex::new(), Assembler::new())
    }

    #[test]
    fn load_reuses_address_register_for_integer_destination() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let flags = Flags::default();
        let addr = VariableStorage::reg(WasmType::I64, Reg::Gpr(9));
        let result = emit_linear_memory_load(&mut regs, &mut elements, &mut refs, &mut asm, &flags, WasmType::I32, None, false, 0, addr);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().register(), Some(Reg::Gpr(9)));
    }

    #[test]
    fn narrow_signed_load_sign_extends_after_transfer() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let flags = Flags::default();
        let addr = VariableStorage::reg(WasmType::I64, Reg::Gpr(9));
        let before = asm.code().len();
        emit_linear_memory_load(&mut regs, &mut elements, &mut refs, &mut asm, &flags, WasmType::I64, Some(1), true, 0, addr).unwrap();
        // add-offset, load byte, sign-extend: three words.
        assert_eq!(asm.code().len() - before, 12);
    }

    #[test]
    fn store_of_constant_zero_uses_zero_register() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let flags = Flags::default();
        let addr = VariableStorage::reg(WasmType::I64, Reg::Gpr(9));
        let value = VariableStorage::constant(WasmType::I32, 0);
        let before = asm.code().len();
        emit_linear_memory_store(&mut regs, &mut elements, &mut refs, &mut asm, &flags, None, 0, addr, value).unwrap();
        assert!(asm.code().len() > before);
    }

    #[test]
    fn get_mem_size_loads_from_job_memory_page_count_slot() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let result = emit_get_mem_size(&mut regs, &mut elements, &mut refs, &mut asm);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().ty, WasmType::I32);
    }

    #[test]
    fn mem_grow_loads_helper_pointer_then_calls_it() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let delta = VariableStorage::constant(WasmType::I32, 1);
        let result = emit_mem_grow(&mut regs, &mut elements, &mut refs, &mut asm, delta);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().register(), Some(Reg::Gpr(0)));
    }

    #[test]
    fn copy_emits_forward_and_backward_loop_bodies() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let flags = Flags::default();
        let dst = VariableStorage::reg(WasmType::I64, Reg::Gpr(3));
        let src = VariableStorage::reg(WasmType::I64, Reg::Gpr(4));
        let size = VariableStorage::reg(WasmType::I64, Reg::Gpr(5));
        let result = emit_linear_memory_copy(&mut regs, &mut elements, &mut refs, &mut asm, &flags, dst, src, size);
        assert!(result.is_ok());
        assert!(!asm.code().is_empty());
    }

    #[test]
    fn fill_emits_a_loop() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let flags = Flags::default();
        let dst = VariableStorage::reg(WasmType::I64, Reg::Gpr(3));
        let val = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let size = VariableStorage::reg(WasmType::I64, Reg::Gpr(5));
        let result = emit_linear_memory_fill(&mut regs, &mut elements, &mut refs, &mut asm, &flags, dst, val, size);
        assert!(result.is_ok());
        assert!(!asm.code().is_empty());
    }
}
