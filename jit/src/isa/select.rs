//! Instruction selection (spec §4.4).
//!
//! `select_instr` tries a list of candidate encodings against a pair of
//! operand storages, lifting operands into registers where a candidate
//! needs a shape the storage doesn't directly provide, and picks a
//! destination register following the priority the spec lays out: reuse a
//! hinted register, reuse a dying source operand's register, or allocate a
//! fresh scratch register.

use crate::error::CodegenError;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::{encode_logical_immediate, AbstrInstr, ArgType};
use crate::regs::Reg;
use crate::storage::{StorageKind, VariableStorage};
use crate::types::WasmType;

/// The minimum a register source must provide for `select_instr` to lift
/// operands and choose a destination. Implemented by [`crate::services`]'s
/// allocator over the real register file.
pub trait RegProvider {
    /// Allocate a scratch register able to hold `ty`, without disturbing
    /// any value still live on the operand stack.
    fn request_scratch(&mut self, ty: WasmType) -> Result<Reg, CodegenError>;

    /// Is `reg` a scratch register whose current value is about to die
    /// (i.e. reusable as this operation's destination without a copy)?
    fn is_writable_scratch(&self, reg: Reg) -> bool;

    /// Emit whatever load/move sequence materializes `storage` into `reg`
    /// (used to pre-lift a non-encodable operand).
    fn lift_into(&mut self, storage: &VariableStorage, reg: Reg) -> Result<(), CodegenError>;
}

/// A `LinkData`/`StackMemory` storage is always lifted first, since no
/// AArch64 ALU instruction reads memory directly as an operand (spec §4.4
/// step 1).
fn needs_pre_lift(storage: &VariableStorage) -> bool {
    !storage.is_directly_encodable()
}

fn storage_matches(storage: &VariableStorage, shape: ArgType) -> bool {
    match (&storage.kind, shape) {
        (StorageKind::Register(r), _) | (StorageKind::StackReg { reg: r, .. }, _)
            if shape.is_register() =>
        {
            r.is_fpr() == shape.is_float_reg() && storage.ty.is64() == shape.is64()
        }
        (StorageKind::Constant(bits), ArgType::Imm12zxOls12_32)
        | (StorageKind::Constant(bits), ArgType::Imm12zxOls12_64) => {
            fits_imm12_shifted(*bits, shape.is64())
        }
        (StorageKind::Constant(bits), ArgType::Imm12Bitmask32) => {
            encode_logical_immediate(*bits & 0xFFFF_FFFF, 32).is_some()
        }
        (StorageKind::Constant(bits), ArgType::Imm13Bitmask64) => {
            encode_logical_immediate(*bits, 64).is_some()
        }
        (_, ArgType::None) => storage.is_invalid(),
        _ => false,
    }
}

fn fits_imm12_shifted(bits: u64, is64: bool) -> bool {
    let value = if is64 { bits } else { bits & 0xFFFF_FFFF };
    value <= 0xFFF || (value & 0xFFF == 0 && (value >> 12) <= 0xFFF)
}

/// Result of a successful `select_instr` call.
pub struct Selected {
    /// The fully built instruction word, including the destination field.
    pub word: u32,
    /// Where the operation's result now lives.
    pub dst: VariableStorage,
}

/// Try each of `candidates` in turn, lifting operands that don't directly
/// fit, and build the winning instruction. `dst_ty` is the result's Wasm
/// type; `dst_hint` is a register the caller would prefer the result land
/// in, honored only if it's already a dying scratch register.
pub fn select_instr(
    candidates: &[AbstrInstr],
    mut lhs: VariableStorage,
    mut rhs: VariableStorage,
    dst_ty: WasmType,
    dst_hint: Option<Reg>,
    regs: &mut impl RegProvider,
) -> Result<Selected, CodegenError> {
    if needs_pre_lift(&lhs) {
        let reg = regs.request_scratch(lhs.ty)?;
        regs.lift_into(&lhs, reg)?;
        lhs = VariableStorage::reg(lhs.ty, reg);
    }
    if needs_pre_lift(&rhs) {
        let reg = regs.request_scratch(rhs.ty)?;
        regs.lift_into(&rhs, reg)?;
        rhs = VariableStorage::reg(rhs.ty, reg);
    }

    // Pass 1: exact match, in original or (if commutative) swapped order.
    if let Some(result) = try_candidates(candidates, &lhs, &rhs, dst_ty, dst_hint, regs)? {
        return Ok(result);
    }

    // Pass 2: lift whichever operand blocked every candidate (typically a
    // constant fitting no candidate's immediate shape) and retry, lhs
    // first, then rhs if that alone still isn't enough.
    let lifted_lhs_reg = regs.request_scratch(lhs.ty)?;
    regs.lift_into(&lhs, lifted_lhs_reg)?;
    let lhs2 = VariableStorage::reg(lhs.ty, lifted_lhs_reg);
    if let Some(result) = try_candidates(candidates, &lhs2, &rhs, dst_ty, dst_hint, regs)? {
        return Ok(result);
    }

    let lifted_rhs_reg = regs.request_scratch(rhs.ty)?;
    regs.lift_into(&rhs, lifted_rhs_reg)?;
    let rhs2 = VariableStorage::reg(rhs.ty, lifted_rhs_reg);
    try_candidates(candidates, &lhs2, &rhs2, dst_ty, dst_hint, regs)?.ok_or(
        CodegenError::NotImplemented("no candidate instruction matched operand shapes"),
    )
}

fn try_candidates(
    candidates: &[AbstrInstr],
    lhs: &VariableStorage,
    rhs: &VariableStorage,
    dst_ty: WasmType,
    dst_hint: Option<Reg>,
    regs: &mut impl RegProvider,
) -> Result<Option<Selected>, CodegenError> {
    for candidate in candidates {
        let direct = storage_matches(lhs, candidate.src0) && storage_matches(rhs, candidate.src1);
        let swapped = candidate.commutative
            && storage_matches(rhs, candidate.src0)
            && storage_matches(lhs, candidate.src1);
        if !direct && !swapped {
            continue;
        }
        let (src0, src1) = if direct { (lhs, rhs) } else { (rhs, lhs) };
        // A compare-style candidate allocates nothing (spec §4.4 step 2a):
        // asking `choose_dst_reg` for a register it would never encode would
        // both waste a scratch register for the rest of the function (it's
        // never tied to a stack element, so it would never be freed) and,
        // for `CMP`'s `SUBS`-with-`Rd=zr` encoding, set the wrong `Rd`.
        let dst_reg = if candidate.dst == ArgType::None {
            None
        } else {
            Some(choose_dst_reg(src0, src1, dst_ty, dst_hint, regs)?)
        };

        let mut builder = InstrBuilder::new(candidate.template);
        if let Some(reg) = dst_reg {
            builder = builder.set_d(reg);
        }
        if let Some(r) = src0.register() {
            builder = builder.set_n(r);
        }
        builder = apply_operand(builder, src1, candidate.src1);

        let word = builder.finish();
        let dst = match dst_reg {
            Some(reg) => VariableStorage::reg(dst_ty, reg),
            None => VariableStorage::INVALID,
        };
        return Ok(Some(Selected { word, dst }));
    }
    Ok(None)
}

fn apply_operand(builder: InstrBuilder, storage: &VariableStorage, shape: ArgType) -> InstrBuilder {
    match (&storage.kind, shape) {
        (_, ArgType::None) => builder,
        (StorageKind::Constant(bits), ArgType::Imm12zxOls12_32)
        | (StorageKind::Constant(bits), ArgType::Imm12zxOls12_64) => {
            let (imm, shifted) = split_imm12_shifted(*bits);
            builder.set_imm12(imm).set_shift12(shifted)
        }
        (StorageKind::Constant(bits), ArgType::Imm12Bitmask32) => {
            let (n, immr, imms) = encode_logical_immediate(*bits & 0xFFFF_FFFF, 32).unwrap();
            builder.set_n_bit(n).set_immr(immr).set_imms(imms)
        }
        (StorageKind::Constant(bits), ArgType::Imm13Bitmask64) => {
            let (n, immr, imms) = encode_logical_immediate(*bits, 64).unwrap();
            builder.set_n_bit(n).set_immr(immr).set_imms(imms)
        }
        _ => match storage.register() {
            Some(r) => builder.set_m(r),
            None => builder,
        },
    }
}

fn split_imm12_shifted(bits: u64) -> (u16, bool) {
    if bits <= 0xFFF {
        (bits as u16, false)
    } else {
        ((bits >> 12) as u16, true)
    }
}

/// Destination-register priority (spec §4.4): reuse the hinted register if
/// it's already a dying writable scratch; else reuse whichever source
/// operand register is itself dying (`src0` preferred over `src1`,
/// matching the usual left-to-right in-place ALU convention); else
/// allocate a fresh scratch register.
fn choose_dst_reg(
    src0: &VariableStorage,
    src1: &VariableStorage,
    dst_ty: WasmType,
    dst_hint: Option<Reg>,
    regs: &mut impl RegProvider,
) -> Result<Reg, CodegenError> {
    if let Some(hint) = dst_hint {
        if regs.is_writable_scratch(hint) {
            return Ok(hint);
        }
    }
    if let Some(r) = src0.register() {
        if regs.is_writable_scratch(r) {
            return Ok(r);
        }
    }
    if let Some(r) = src1.register() {
        if regs.is_writable_scratch(r) {
            return Ok(r);
        }
    }
    regs.request_scratch(dst_ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::encoding::templates;

    struct FakeRegs {
        free: Vec<Reg>,
        writable_scratch: Vec<Reg>,
    }

    impl RegProvider for FakeRegs {
        fn request_scratch(&mut self, _ty: WasmType) -> Result<Reg, CodegenError> {
            self.free.pop().ok_or(CodegenError::NotImplemented("out of scratch"))
        }

        fn is_writable_scratch(&self, reg: Reg) -> bool {
            self.writable_scratch.contains(&reg)
        }

        fn lift_into(&mut self, _storage: &VariableStorage, _reg: Reg) -> Result<(), CodegenError> {
            Ok(())
        }
    }

    fn add_candidates() -> Vec<AbstrInstr> {
        vec![
            AbstrInstr::commutative(templates::ADD_REG32, ArgType::R32, ArgType::R32, ArgType::R32),
            AbstrInstr::binary(
                templates::ADD_IMM32,
                ArgType::R32,
                ArgType::R32,
                ArgType::Imm12zxOls12_32,
            ),
        ]
    }

    #[test]
    fn selects_immediate_form_when_rhs_is_small_constant() {
        let mut regs = FakeRegs {
            free: vec![Reg::Gpr(10)],
            writable_scratch: vec![],
        };
        let lhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(3));
        let rhs = VariableStorage::constant(WasmType::I32, 7);
        let result = select_instr(&add_candidates(), lhs, rhs, WasmType::I32, None, &mut regs).unwrap();
        assert_eq!(
            result.word,
            templates::ADD_IMM32 | (7 << 10) | (3 << 5) | 10
        );
    }

    #[test]
    fn commutative_candidate_tries_swapped_order() {
        let mut regs = FakeRegs {
            free: vec![Reg::Gpr(11)],
            writable_scratch: vec![],
        };
        // Only the register+register candidate can match two registers;
        // swapping doesn't matter for encoding since both are `R32`, but
        // this exercises the commutative match path.
        let lhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let rhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(5));
        let result = select_instr(&add_candidates(), lhs, rhs, WasmType::I32, None, &mut regs).unwrap();
        assert_eq!(result.word, templates::ADD_REG32 | (5 << 16) | (4 << 5) | 11);
    }

    #[test]
    fn dying_source_register_is_reused_as_destination() {
        let mut regs = FakeRegs {
            free: vec![Reg::Gpr(20)],
            writable_scratch: vec![Reg::Gpr(4)],
        };
        let lhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(4));
        let rhs = VariableStorage::constant(WasmType::I32, 1);
        let result = select_instr(&add_candidates(), lhs, rhs, WasmType::I32, None, &mut regs).unwrap();
        assert_eq!(result.dst.register(), Some(Reg::Gpr(4)));
    }

    #[test]
    fn pre_lifts_stack_memory_operand() {
        let mut regs = FakeRegs {
            free: vec![Reg::Gpr(9), Reg::Gpr(10)],
            writable_scratch: vec![],
        };
        let lhs = VariableStorage::stack(WasmType::I32, 16);
        let rhs = VariableStorage::reg(WasmType::I32, Reg::Gpr(2));
        let result = select_instr(&add_candidates(), lhs, rhs, WasmType::I32, None, &mut regs).unwrap();
        // lhs got lifted into Gpr(10) (popped last), used as Rn.
        assert_eq!(result.word, templates::ADD_REG32 | (2 << 16) | (10 << 5) | 9);
    }
}
