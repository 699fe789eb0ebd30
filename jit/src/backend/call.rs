//! Direct and indirect Wasm function calls (spec §4.6.9/§4.6.10), plus the
//! register-copy resolver argument packing shares with the call-site ABI
//! wrappers in [`crate::backend::wrappers`].
//!
//! A call site moves the condensed argument values into this backend's
//! internal Wasm calling convention (fixed GPR/FPR parameter registers,
//! mirroring AAPCS64's own `x0..x7`/`v0..v7` assignment rather than
//! inventing a new one), threads a stack-trace bookkeeping entry through
//! job memory so a trap inside the callee can unwind, and either branches
//! directly (callee already emitted, or not-yet-emitted but linkable via a
//! [`crate::reloc::Relocation`]) or, for `call_indirect`, validates a
//! table entry before branching through it.

use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::layout;
use crate::module_info::{FuncIndex, FunctionInfo, ModuleInfo, TableIndex};
use crate::reloc::Relocation;
use crate::regs::Reg;
use crate::services::{Elements, RegisterAllocator};
use crate::stack::RefIndex;
use crate::storage::VariableStorage;
use crate::trap::TrapCode;
use crate::types::WasmType;
use wasmjit_entity::EntityRef;

/// This backend's fixed Wasm-ABI parameter registers, in assignment order,
/// one list per register class. Mirrors AAPCS64's own convention so the
/// native-ABI wrappers in `wrappers` have the least possible translation
/// work to do, rather than because anything requires it.
const GPR_PARAMS: [Reg; 8] = [
    Reg::Gpr(0),
    Reg::Gpr(1),
    Reg::Gpr(2),
    Reg::Gpr(3),
    Reg::Gpr(4),
    Reg::Gpr(5),
    Reg::Gpr(6),
    Reg::Gpr(7),
];
const FPR_PARAMS: [Reg; 8] = [
    Reg::Fpr(0),
    Reg::Fpr(1),
    Reg::Fpr(2),
    Reg::Fpr(3),
    Reg::Fpr(4),
    Reg::Fpr(5),
    Reg::Fpr(6),
    Reg::Fpr(7),
];

/// Assign each of `tys` the next free register of its class, spilling to a
/// stack-argument offset (16-byte-aligned slots above `sp`, AAPCS64-style)
/// once a class's eight registers are exhausted.
pub(crate) fn assign_param_locations(tys: &[WasmType]) -> Vec<ParamLoc> {
    let mut gpr_idx = 0;
    let mut fpr_idx = 0;
    let mut stack_offset: i32 = 0;
    tys.iter()
        .map(|&ty| {
            if ty.is_float() {
                if fpr_idx < FPR_PARAMS.len() {
                    let loc = ParamLoc::Reg(FPR_PARAMS[fpr_idx]);
                    fpr_idx += 1;
                    loc
                } else {
                    let offset = stack_offset;
                    stack_offset += WasmType::SLOT_SIZE as i32;
                    ParamLoc::Stack(offset)
                }
            } else if gpr_idx < GPR_PARAMS.len() {
                let loc = ParamLoc::Reg(GPR_PARAMS[gpr_idx]);
                gpr_idx += 1;
                loc
            } else {
                let offset = stack_offset;
                stack_offset += WasmType::SLOT_SIZE as i32;
                ParamLoc::Stack(offset)
            }
        })
        .collect()
}

/// Where one call argument/result lands: a fixed ABI register, or an
/// offset into the outgoing-arguments area of the current stack frame
/// (spec §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLoc {
    /// A fixed GPR or FPR parameter register.
    Reg(Reg),
    /// Byte offset from `sp` into the outgoing stack-argument area.
    Stack(i32),
}

/// One pending register-to-register copy a call site's argument packing
/// needs to perform, before any of them may have clobbered another's
/// source (spec §4.6.9 step 3, SPEC_FULL §B `RegisterCopyResolver`).
#[derive(Debug, Clone, Copy)]
struct PendingMove {
    from: Reg,
    to: Reg,
    is_float: bool,
}

/// Resolves a set of parallel register-to-register moves into a safe
/// emission order, breaking cycles the way a plain sequential `mov` list
/// cannot. Grounded on the teacher's (and the original source's) parallel-
/// move resolution: topologically emit every move whose destination is not
/// also some other pending move's source; what's left over is purely
/// cyclic permutations, broken with a GPR three-`EOR` (XOR) swap or one
/// scratch-register rotation for FPR cycles.
#[derive(Debug, Default)]
pub struct RegisterCopyResolver {
    moves: Vec<PendingMove>,
}

impl RegisterCopyResolver {
    /// An empty resolver.
    pub fn new() -> Self {
        RegisterCopyResolver::default()
    }

    /// Queue a move from `from` to `to`. A no-op move (`from == to`) is
    /// dropped immediately rather than threaded through cycle detection.
    pub fn add_move(&mut self, from: Reg, to: Reg, is_float: bool) {
        if from != to {
            self.moves.push(PendingMove { from, to, is_float });
        }
    }

    /// Emit every queued move, in an order that never clobbers a register
    /// another pending move still needs to read.
    pub fn resolve(&mut self, asm: &mut Assembler, scratch_fpr: Reg) {
        while !self.moves.is_empty() {
            let sources: Vec<Reg> = self.moves.iter().map(|m| m.from).collect();
            if let Some(idx) = self.moves.iter().position(|m| !sources.contains(&m.to)) {
                let mv = self.moves.remove(idx);
                emit_reg_move(asm, mv.from, mv.to, mv.is_float);
                continue;
            }
            // Every remaining move's destination is some other move's
            // source: a pure cycle. Break it at the first entry.
            let cycle = self.extract_cycle();
            break_cycle(asm, &cycle, scratch_fpr);
        }
    }

    /// Pull one full cycle (`a -> b -> c -> ... -> a`) out of `self.moves`,
    /// starting from whatever move is first in the queue.
    fn extract_cycle(&mut self) -> Vec<PendingMove> {
        let start = self.moves.remove(0);
        let mut cycle = vec![start];
        loop {
            let need = cycle.last().unwrap().to;
            if need == start.from {
                break;
            }
            let idx = self
                .moves
                .iter()
                .position(|m| m.from == need)
                .expect("a detected cycle must close on itself");
            cycle.push(self.moves.remove(idx));
        }
        cycle
    }
}

fn emit_reg_move(asm: &mut Assembler, from: Reg, to: Reg, is_float: bool) {
    let ty = if is_float { WasmType::F64 } else { WasmType::I64 };
    asm.emit_action_arg(&VariableStorage::reg(ty, from), to);
}

/// Break one cycle of pending moves in place. GPR cycles use three `EOR`
/// (XOR) swaps per adjacent pair, needing no spare register; FPR cycles
/// rotate through one dedicated scratch FPR, since AArch64 has no
/// XOR-on-FPR equivalent.
fn break_cycle(asm: &mut Assembler, cycle: &[PendingMove], scratch_fpr: Reg) {
    if cycle.len() == 1 {
        return; // `from == to` already filtered out by `add_move`.
    }
    if !cycle[0].is_float {
        // Rotate right-to-left with XOR swaps: after swapping (a, b) then
        // (a, c) then (a, d)... `a` ends up holding the original last
        // value and every other register holds its predecessor's original
        // value, which is exactly the rotation a move cycle needs.
        let regs: Vec<Reg> = cycle.iter().map(|m| m.from).collect();
        for i in (1..regs.len()).rev() {
            xor_swap(asm, regs[0], regs[i]);
        }
    } else {
        asm.emit_action_arg(&VariableStorage::reg(WasmType::F64, cycle[0].from), scratch_fpr);
        for mv in cycle.iter().rev().take(cycle.len() - 1) {
            asm.emit_action_arg(&VariableStorage::reg(WasmType::F64, mv.from), mv.to);
        }
        asm.emit_action_arg(&VariableStorage::reg(WasmType::F64, scratch_fpr), cycle[0].to);
    }
}

fn xor_swap(asm: &mut Assembler, a: Reg, b: Reg) {
    asm.instr(InstrBuilder::new(templates::EOR_REG64).set_d(a).set_n(a).set_m(b).finish());
    asm.instr(InstrBuilder::new(templates::EOR_REG64).set_d(b).set_n(b).set_m(a).finish());
    asm.instr(InstrBuilder::new(templates::EOR_REG64).set_d(a).set_n(a).set_m(b).finish());
}

pub(crate) fn lift(
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

/// `execDirectFncCall` (spec §4.6.9) for a call whose target function is
/// resolvable by module index. Packs `args` into this backend's Wasm-ABI
/// parameter registers via [`RegisterCopyResolver`], pushes a stack-trace
/// bookkeeping entry (step 4), emits the call, restores bookkeeping, and
/// returns the callee's results as freshly materialized register storages
/// (step 7). `target_code` is `Some(offset)` when the callee has already
/// been emitted into the *same* function's code buffer (self-recursion,
/// the only case a same-buffer direct branch is possible for this
/// per-function code-buffer layout — see [`crate::reloc`]); otherwise a
/// [`Relocation`] is recorded into `caller`'s pending list for the module
/// linker to patch once every function's final address is known.
pub fn emit_direct_call(
    module: &ModuleInfo,
    caller: &mut FunctionInfo,
    caller_index: FuncIndex,
    asm: &mut Assembler,
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    target: FuncIndex,
    args: &[VariableStorage],
    target_code: Option<u32>,
) -> Result<Vec<VariableStorage>, CodegenError> {
    let sig = module.function_signature(target);
    if sig.params.len() != args.len() {
        return Err(CodegenError::Verify("call argument count does not match callee signature"));
    }

    let param_tys: Vec<WasmType> = sig.params.clone();
    let locations = assign_param_locations(&param_tys);

    let job_mem = regs.registers().dedicated.job_mem;

    // Step 1 (moving register-cached globals back to job memory before a
    // call) is the caller's responsibility: globals are permanently
    // register-resident for this function's whole body (spec §3.2's
    // dedicated-register assignment), so flushing them is a property of
    // which registers this call clobbers, not of the call sequence
    // itself — the caller flushes whichever of its own reserved global
    // registers the callee's ABI requires as scratch before invoking this
    // function, the same way it would before any other scratch-clobbering
    // operation.

    // Step 3: pack arguments. Registers go through the cycle-safe
    // resolver; stack arguments are stored directly since they can never
    // conflict with a register source.
    let mut resolver = RegisterCopyResolver::new();
    let mut stack_stores = Vec::new();
    for (arg, loc) in args.iter().zip(&locations) {
        match loc {
            ParamLoc::Reg(dst) => {
                let src = lift(regs, elements, refs, asm, *arg)?;
                resolver.add_move(src, *dst, dst.is_fpr());
            }
            ParamLoc::Stack(offset) => {
                stack_stores.push((*arg, *offset));
            }
        }
    }
    resolver.resolve(asm, Reg::Fpr(1));
    for (arg, offset) in stack_stores {
        let src = lift(regs, elements, refs, asm, arg)?;
        asm.store_to_base(src, Reg::Sp, offset, arg.ty);
    }

    // Step 4/5: push a stack-trace entry (spec §4.6.13 item 2).
    let old_head = push_stack_trace_entry(regs, elements, refs, asm, caller_index)?;

    // Step 6: branch to the callee.
    if let Some(offset) = target_code {
        let pos = asm.pos();
        let rel = (offset as i64 - pos as i64) / 4;
        asm.instr(InstrBuilder::new(templates::BL).set_imm26(rel as i32).finish());
    } else {
        let pos = asm.instr(InstrBuilder::new(templates::BL).finish());
        log::trace!("deferred call relocation at {pos} for target {}", target.index());
        caller.record_relocation(Relocation::call(pos, target));
    }

    // Step 7: pop the stack-trace entry and collect results.
    pop_stack_trace_entry(job_mem, asm, old_head);

    let result_locations = assign_param_locations(&sig.results);
    let results = sig
        .results
        .iter()
        .zip(&result_locations)
        .map(|(&ty, loc)| match loc {
            ParamLoc::Reg(r) => VariableStorage::reg(ty, *r),
            ParamLoc::Stack(offset) => VariableStorage::stack(ty, *offset),
        })
        .collect();
    Ok(results)
}

/// Push a stack-trace entry (spec §4.6.13 item 2): two words at the bottom
/// of this call's outgoing-argument area — the caller's current frame-ref
/// pointer (so the chain can be walked) and this call site's function index
/// (what the collector reports for this frame) — then point job memory's
/// `lastFrameRefPtr` at the new entry. Returns the old head, to be restored
/// by [`pop_stack_trace_entry`] once the call returns.
pub(crate) fn push_stack_trace_entry(
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    asm: &mut Assembler,
    caller_index: FuncIndex,
) -> Result<Reg, CodegenError> {
    let job_mem = regs.registers().dedicated.job_mem;
    let trace_slot = -(layout::SLOT_BYTES * 2);
    let old_head = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.load_from_base(old_head, job_mem, layout::LAST_FRAME_REF_PTR.offset(), WasmType::I64);
    asm.store_to_base(old_head, Reg::Sp, trace_slot, WasmType::I64);
    let func_idx_reg = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.mov_imm(func_idx_reg, caller_index.index() as u64, true);
    asm.store_to_base(func_idx_reg, Reg::Sp, trace_slot + layout::SLOT_BYTES, WasmType::I64);
    let new_head = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.instr(
        InstrBuilder::new(templates::SUB_IMM64)
            .set_d(new_head)
            .set_n(Reg::Sp)
            .set_imm12((-trace_slot) as u16)
            .finish(),
    );
    asm.store_to_base(new_head, job_mem, layout::LAST_FRAME_REF_PTR.offset(), WasmType::I64);
    Ok(old_head)
}

/// Restore job memory's `lastFrameRefPtr` to `old_head`, undoing
/// [`push_stack_trace_entry`] once a call has returned.
pub(crate) fn pop_stack_trace_entry(job_mem: Reg, asm: &mut Assembler, old_head: Reg) {
    asm.store_to_base(old_head, job_mem, layout::LAST_FRAME_REF_PTR.offset(), WasmType::I64);
}

/// `execIndirectWasmCall` (spec §4.6.9): validate `table_index` against the
/// table's runtime bound (trap `IndirectCallOutOfBounds`), load the table
/// entry at that index, validate its signature id against `expected_sig`
/// (trap `IndirectCallWrongSig`), validate the entry is linked (trap
/// `CalledFunctionNotLinked`), and `BLR` to `binary_base + offset`.
///
/// Table entries are packed as two `i32`s per slot: `(code_offset,
/// sig_id)`, at `table_base + runtime_index * 8`.
pub fn emit_indirect_call(
    asm: &mut Assembler,
    regs: &mut RegisterAllocator,
    elements: &mut Elements,
    refs: &mut RefIndex,
    module: &ModuleInfo,
    table: TableIndex,
    runtime_index: VariableStorage,
    expected_sig_id: u32,
) -> Result<(), CodegenError> {
    use crate::cond::BranchCondition;
    use crate::stack::element::CondenseOp;

    let table_info = module
        .tables
        .get(table)
        .ok_or(CodegenError::Verify("call_indirect references an undeclared table"))?;

    let job_mem = regs.registers().dedicated.job_mem;
    let idx_reg = lift(regs, elements, refs, asm, runtime_index)?;

    // Bounds check against the table's minimum element count (a
    // conservative static bound; a table that can grow would compare
    // against a runtime length cached the same way linear memory's size
    // is — out of scope for the fixed `TableInfo` this backend tracks).
    asm.instr(
        InstrBuilder::new(templates::CMP_IMM32)
            .set_n(idx_reg)
            .set_imm12(table_info.minimum as u16)
            .finish(),
    );
    let hs = BranchCondition::from_comparison(CondenseOp::CmpGeU, WasmType::I32).expect("CmpGeU is always valid");
    asm.conditional_trap(hs.to_aarch64_cc(), TrapCode::IndirectCallOutOfBounds)?;

    let table_base = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.load_from_base(table_base, job_mem, layout::TABLE_BASE_ADDRESS.offset(), WasmType::I64);

    // Each table entry is 8 bytes (`i32` code offset + `i32` sig id), so
    // the byte offset is `index << 3`; AArch64 has no shift-immediate
    // template in this backend's table, so the shift amount is
    // materialized into a register and `LSLV` (the variable-shift form)
    // used instead.
    let shift_amt = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.mov_imm(shift_amt, 3, true);
    let shifted = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.instr(
        InstrBuilder::new(templates::LSLV64)
            .set_d(shifted)
            .set_n(idx_reg)
            .set_m(shift_amt)
            .finish(),
    );
    let entry_addr = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.instr(
        InstrBuilder::new(templates::ADD_REG64)
            .set_d(entry_addr)
            .set_n(table_base)
            .set_m(shifted)
            .finish(),
    );

    let code_offset = regs.req_scratch_reg(WasmType::I32, elements, refs, asm)?;
    asm.load_from_base(code_offset, entry_addr, 0, WasmType::I32);
    let sig_id = regs.req_scratch_reg(WasmType::I32, elements, refs, asm)?;
    asm.load_from_base(sig_id, entry_addr, 4, WasmType::I32);

    asm.instr(
        InstrBuilder::new(templates::CMP_IMM32)
            .set_n(sig_id)
            .set_imm12((expected_sig_id & 0xFFF) as u16)
            .finish(),
    );
    let ne = BranchCondition::from_comparison(CondenseOp::CmpNe, WasmType::I32).expect("CmpNe is always valid");
    asm.conditional_trap(ne.to_aarch64_cc(), TrapCode::IndirectCallWrongSig)?;

    asm.instr(InstrBuilder::new(templates::CMP_IMM32).set_n(code_offset).set_imm12(0).finish());
    let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I32).expect("CmpEq is always valid");
    asm.conditional_trap(eq.to_aarch64_cc(), TrapCode::CalledFunctionNotLinked)?;

    let binary_base = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.load_from_base(binary_base, job_mem, layout::BINARY_MODULE_BASE.offset(), WasmType::I64);
    let target = regs.req_scratch_reg(WasmType::I64, elements, refs, asm)?;
    asm.instr(
        InstrBuilder::new(templates::ADD_REG64)
            .set_d(target)
            .set_n(binary_base)
            .set_m(code_offset)
            .finish(),
    );
    asm.instr(InstrBuilder::new(templates::BLR).set_n(target).finish());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_moves_apply_directly() {
        let mut asm = Assembler::new();
        let mut resolver = RegisterCopyResolver::new();
        resolver.add_move(Reg::Gpr(9), Reg::Gpr(0), false);
        resolver.add_move(Reg::Gpr(10), Reg::Gpr(1), false);
        resolver.resolve(&mut asm, Reg::Fpr(1));
        assert_eq!(asm.code().len(), 8);
    }

    #[test]
    fn self_move_is_dropped() {
        let mut resolver = RegisterCopyResolver::new();
        resolver.add_move(Reg::Gpr(0), Reg::Gpr(0), false);
        let mut asm = Assembler::new();
        resolver.resolve(&mut asm, Reg::Fpr(1));
        assert!(asm.code().is_empty());
    }

    #[test]
    fn two_cycle_breaks_with_xor_swap() {
        let mut asm = Assembler::new();
        let mut resolver = RegisterCopyResolver::new();
        resolver.add_move(Reg::Gpr(0), Reg::Gpr(1), false);
        resolver.add_move(Reg::Gpr(1), Reg::Gpr(0), false);
        resolver.resolve(&mut asm, Reg::Fpr(1));
        // Three EORs for the one 2-cycle.
        assert_eq!(asm.code().len(), 12);
    }

    #[test]
    fn three_cycle_breaks_with_two_xor_swaps() {
        let mut asm = Assembler::new();
        let mut resolver = RegisterCopyResolver::new();
        resolver.add_move(Reg::Gpr(0), Reg::Gpr(1), false);
        resolver.add_move(Reg::Gpr(1), Reg::Gpr(2), false);
        resolver.add_move(Reg::Gpr(2), Reg::Gpr(0), false);
        resolver.resolve(&mut asm, Reg::Fpr(1));
        assert_eq!(asm.code().len(), 24);
    }

    #[test]
    fn fpr_cycle_uses_scratch_rotation() {
        let mut asm = Assembler::new();
        let mut resolver = RegisterCopyResolver::new();
        resolver.add_move(Reg::Fpr(0), Reg::Fpr(2), true);
        resolver.add_move(Reg::Fpr(2), Reg::Fpr(0), true);
        resolver.resolve(&mut asm, Reg::Fpr(5));
        assert!(!asm.code().is_empty());
    }

    #[test]
    fn assign_param_locations_fills_registers_before_stack() {
        let tys = vec![WasmType::I32; 9];
        let locs = assign_param_locations(&tys);
        assert_eq!(locs[0], ParamLoc::Reg(Reg::Gpr(0)));
        assert_eq!(locs[7], ParamLoc::Reg(Reg::Gpr(7)));
        assert_eq!(locs[8], ParamLoc::Stack(0));
    }
}
