//! Wasm's `select`/`select t` instruction (spec §4.6.3): picks `lhs` or
//! `rhs` based on a third `i32` condition operand, via `CSEL`/`FCSEL`
//! rather than a branch — the condense tree is never forced to flush just
//! because a `select` appears, the same way a comparison isn't forced to
//! materialize just because it feeds one.

use crate::cond::BranchCondition;
use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::regs::Reg;
use crate::services::{Elements, RegisterAllocator};
use crate::stack::RefIndex;
use crate::storage::VariableStorage;
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

/// Emit `CSEL dst, if_true, if_false, cond` (or `FCSEL` for float operands).
/// `cond_reg` holds the already-materialized `i32` condition; `select`
/// itself always evaluates the condition against zero (`cond_reg != 0`
/// picks `if_true`) rather than consuming a pending comparison node
/// directly, since Wasm's `select` operand is a plain `i32` value, not a
/// condense-tree comparison.
pub fn emit_select(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    ty: WasmType,
    if_true: VariableStorage,
    if_false: VariableStorage,
    cond_reg: VariableStorage,
) -> Result<VariableStorage, CodegenError> {
    let cond = lift(regs, elements, refs, asm, cond_reg)?;
    asm.instr(
        InstrBuilder::new(if ty.is64() { templates::CMP_IMM64 } else { templates::CMP_IMM32 })
            .set_n(cond)
            .finish(),
    );
    let true_reg = lift(regs, elements, refs, asm, if_true)?;
    let false_reg = lift(regs, elements, refs, asm, if_false)?;
    let dst = regs.req_scratch_reg(ty, elements, refs, asm)?;
    let is64 = ty.is64();
    let template = if ty.is_float() {
        if is64 {
            templates::FCSEL64
        } else {
            templates::FCSEL32
        }
    } else if is64 {
        templates::CSEL64
    } else {
        templates::CSEL32
    };
    // `CSEL` picks `Rn` when `cond` holds, `Rm` otherwise — so the
    // not-equal-to-zero condition (the `i32` truthy case) selects `Rn`.
    let cond = BranchCondition::from_comparison(crate::stack::element::CondenseOp::CmpNe, WasmType::I32).expect("CmpNe is always a valid comparison");
    let word = InstrBuilder::new(template)
        .set_d(dst)
        .set_n(true_reg)
        .set_m(false_reg)
        .set_cond_select(cond.to_aarch64_cc())
        .finish();
    asm.instr(word);
    Ok(VariableStorage::reg(ty, dst))
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
    fn select_on_int_registers_emits_cmp_then_csel() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let a = VariableStorage::reg(WasmType::I32, Reg::Gpr(3));
        let b = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let cond = VariableStorage::reg(WasmType::I32, Reg::Gpr(5));
        let result = emit_select(&mut regs, &mut elements, &mut refs, &mut asm, WasmType::I32, a, b, cond);
        assert!(result.is_ok());
        assert_eq!(asm.code().len(), 8);
    }

    #[test]
    fn select_on_float_registers_uses_fcsel() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let a = VariableStorage::reg(WasmType::F64, Reg::Fpr(1));
        let b = VariableStorage::reg(WasmType::F64, Reg::Fpr(2));
        let cond = VariableStorage::reg(WasmType::I32, Reg::Gpr(5));
        let result = emit_select(&mut regs, &mut elements, &mut refs, &mut asm, WasmType::F64, a, b, cond);
        assert!(result.is_ok());
    }
}
