//! Comparison `CondenseOp`s (spec §4.6.3): `CMP`/`FCMP` emitted as a
//! destination-less "select" candidate (see the `ArgType::None` handling
//! in [`crate::isa::select`]), paired with [`crate::cond::BranchCondition`]
//! to interpret the resulting flags.
//!
//! Most comparisons feed a branch directly and never need a materialized
//! `i32` — that's what `condenseComparisonBelow` exists to avoid (spec
//! §4.5.3). [`emit_compare_only`] is for that path. [`emit_comparison`] is
//! the fallback used when the condense tree is forced to flush a
//! comparison node as an ordinary value (e.g. it feeds an arithmetic op,
//! or is itself being stored to a local): it runs the same compare, then
//! `CSET`s the boolean into a fresh GPR.

use crate::cond::BranchCondition;
use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::{templates, AbstrInstr, ArgType};
use crate::regs::Reg;
use crate::services::{Elements, ElementsRegProvider, RegisterAllocator};
use crate::stack::element::CondenseOp;
use crate::stack::RefIndex;
use crate::storage::VariableStorage;
use crate::types::WasmType;

fn r(is64: bool) -> ArgType {
    if is64 {
        ArgType::R64
    } else {
        ArgType::R32
    }
}

fn rf(is64: bool) -> ArgType {
    if is64 {
        ArgType::R64F
    } else {
        ArgType::R32F
    }
}

fn imm12(is64: bool) -> ArgType {
    if is64 {
        ArgType::Imm12zxOls12_64
    } else {
        ArgType::Imm12zxOls12_32
    }
}

fn int_candidates(is64: bool) -> [AbstrInstr; 2] {
    let reg_template = if is64 { templates::CMP_REG64 } else { templates::CMP_REG32 };
    let imm_template = if is64 { templates::CMP_IMM64 } else { templates::CMP_IMM32 };
    [
        AbstrInstr::binary(reg_template, ArgType::None, r(is64), r(is64)),
        AbstrInstr::binary(imm_template, ArgType::None, r(is64), imm12(is64)),
    ]
}

fn float_candidates(is64: bool) -> [AbstrInstr; 1] {
    let template = if is64 { templates::FCMP64 } else { templates::FCMP32 };
    [AbstrInstr::binary(template, ArgType::None, rf(is64), rf(is64))]
}

/// Emit just the `CMP`/`FCMP`, leaving the flags set, and return the
/// condition a consumer (typically [`crate::backend::branch`]) should test
/// them with. Operands are pre-lifted the same way any other `selectInstr`
/// candidate set would be.
pub fn emit_compare_only(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    op: CondenseOp,
    ty: WasmType,
    lhs: VariableStorage,
    rhs: VariableStorage,
) -> Result<BranchCondition, CodegenError> {
    let cond = BranchCondition::from_comparison(op, ty).ok_or(CodegenError::NotImplemented("not a comparison condense op"))?;
    let candidates = if ty.is_float() { float_candidates(ty.is64()).to_vec() } else { int_candidates(ty.is64()).to_vec() };
    let mut provider = ElementsRegProvider { allocator: regs, elements, refs, asm };
    asm.select_instr(&candidates, lhs, rhs, ty, None, &mut provider)?;
    Ok(cond)
}

/// Run the comparison and materialize its boolean result as a fresh `i32`
/// via `CSET` (itself the `CSINC Rd, wzr, wzr, invert(cond)` alias: there
/// is no dedicated `CSET` opcode, spec §4.6.3).
pub fn emit_comparison(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    op: CondenseOp,
    ty: WasmType,
    lhs: VariableStorage,
    rhs: VariableStorage,
) -> Result<VariableStorage, CodegenError> {
    let cond = emit_compare_only(regs, elements, refs, asm, op, ty, lhs, rhs)?;
    let dst = regs.req_scratch_reg(WasmType::I32, elements, refs, asm)?;
    emit_cset(asm, dst, cond);
    Ok(VariableStorage::reg(WasmType::I32, dst))
}

/// `CSET dst, cond` via its `CSINC dst, wzr, wzr, invert(cond)` alias.
pub fn emit_cset(asm: &mut Assembler, dst: Reg, cond: BranchCondition) {
    let word = InstrBuilder::new(templates::CSINC32)
        .set_d(dst)
        .set_n(Reg::Zr)
        .set_m(Reg::Zr)
        .set_cond_select(cond.negate().to_aarch64_cc())
        .finish();
    asm.instr(word);
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
    fn signed_lt_on_registers_emits_cmp_then_cset() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let lhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(3));
        let rhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let result = emit_comparison(&mut regs, &mut elements, &mut refs, &mut asm, CondenseOp::CmpLtS, WasmType::I32, lhs, rhs);
        assert!(result.is_ok());
        // One CMP word plus one CSINC word.
        assert_eq!(asm.code().len(), 8);
        assert_eq!(result.unwrap().ty, WasmType::I32);
    }

    #[test]
    fn compare_only_leaves_no_destination_allocated() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let lhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(3));
        let rhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let cond = emit_compare_only(&mut regs, &mut elements, &mut refs, &mut asm, CondenseOp::CmpEq, WasmType::I32, lhs, rhs).unwrap();
        assert_eq!(cond, BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I32).unwrap());
        assert_eq!(asm.code().len(), 4);
    }

    #[test]
    fn float_comparison_uses_fcmp_candidate() {
        let (mut regs, mut elements, mut refs, mut asm) = fresh();
        let lhs = VariableStorage::reg(WasmType::F64, Reg::Fpr(1));
        let rhs = VariableStorage::reg(WasmType::F64, Reg::Fpr(2));
        let result = emit_comparison(&mut regs, &mut elements, &mut refs, &mut asm, CondenseOp::CmpLtS, WasmType::F64, lhs, rhs);
        assert!(result.is_ok());
    }
}
