//! Module-level entry points (spec §4.6.13/§4.6.15): the handful of
//! trampolines emitted once per module rather than once per Wasm function —
//! the native↔Wasm ABI adapters, and the trap machinery's native-ABI
//! landing strip. Every routine here is leaf, fixed-register assembly
//! (no [`crate::services::RegisterAllocator`] involved — there is no
//! Wasm-level symbolic stack at these boundaries, just a handful of
//! hardcoded scratch registers the way the teacher's own trampoline stubs
//! are written).

use crate::backend::call::{assign_param_locations, ParamLoc, RegisterCopyResolver};
use crate::cond::BranchCondition;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::isa::relpatch::RelPatchObj;
use crate::layout;
use crate::module_info::{FuncIndex, ModuleInfo};
use crate::regs::{Reg, Registers};
use crate::stack::element::CondenseOp;
use crate::types::WasmType;

/// Registers this module's trampolines use as scratch, never as a
/// parameter/dedicated register — picked from the same caller-saved pool
/// [`Registers::new_aarch64`] hands ordinary function bodies.
const SCRATCH: [Reg; 5] = [Reg::Gpr(9), Reg::Gpr(10), Reg::Gpr(11), Reg::Gpr(12), Reg::Gpr(13)];

/// Variant of [`emit_wasm_to_native_adapter`] to emit, per spec §4.6.15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAbi {
    /// Rebuild native-ABI registers in place via [`RegisterCopyResolver`].
    V1,
    /// Serialize params/returns through stack buffers and pass
    /// `(params_ptr, returns_ptr, ctx_ptr)` to the import.
    V2,
}

/// The *native trap adapter* (spec §4.6.13 item 1): the only part of the
/// trap path a host signal handler invokes with the native ABI rather than
/// this backend's own — it loads the linear-memory pointer passed as its
/// second native argument into the dedicated `lin_mem` register (the trap
/// code is already sitting in `w0`, which is also this backend's trap-code
/// register, so nothing moves there) and falls straight through into
/// [`emit_generic_trap_handler`], which must be emitted immediately after
/// this function returns.
pub fn emit_native_trap_adapter(asm: &mut Assembler, regs: &Registers) -> u32 {
    let entry = asm.pos();
    if regs.dedicated.lin_mem != Reg::Gpr(1) {
        asm.emit_action_arg(&crate::storage::VariableStorage::reg(WasmType::I64, Reg::Gpr(1)), regs.dedicated.lin_mem);
    }
    entry
}

/// The *generic trap handler* (spec §4.6.13 item 2): optionally walks the
/// stack-trace chain built by [`super::call::emit_direct_call`], then
/// restores a known-good `sp` and tail-branches to the host trap handler.
///
/// The stack-trace buffer lives in job memory at the fixed, compile-time-
/// known offset `job_mem_size` (the first byte past every declared
/// global) — it never needs its own `FromEnd` slot since its size is fixed
/// by `capacity` at module-build time, the same way a global's offset is
/// fixed rather than runtime-negotiated.
pub fn emit_generic_trap_handler(
    asm: &mut Assembler,
    regs: &Registers,
    job_mem_size: i32,
    collect_stack_trace: bool,
    capacity: u32,
) -> u32 {
    let entry = asm.pos();
    let job_mem = regs.dedicated.job_mem;

    if collect_stack_trace {
        let ptr = SCRATCH[0];
        let counter = SCRATCH[1];
        let func_idx = SCRATCH[2];
        let addr = SCRATCH[3];

        asm.load_from_base(ptr, job_mem, layout::LAST_FRAME_REF_PTR.offset(), WasmType::I64);
        asm.mov_imm(counter, 0, true);

        let mut loop_end = RelPatchObj::new();
        let loop_start = asm.pos();

        asm.instr(InstrBuilder::new(templates::CMP_IMM64).set_n(ptr).set_imm12(0).finish());
        let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I64).expect("CmpEq is always valid");
        asm.prepare_jmp_cond(&mut loop_end, eq.to_aarch64_cc());

        asm.instr(
            InstrBuilder::new(templates::CMP_IMM64)
                .set_n(counter)
                .set_imm12(capacity as u16)
                .finish(),
        );
        let hs = BranchCondition::from_comparison(CondenseOp::CmpGeU, WasmType::I64).expect("CmpGeU is always valid");
        asm.prepare_jmp_cond(&mut loop_end, hs.to_aarch64_cc());

        // Each frame's function index lives 8 bytes past its `prev_ptr`
        // word (`super::call::emit_direct_call`'s two-word entry layout).
        asm.load_from_base(func_idx, ptr, layout::SLOT_BYTES, WasmType::I32);

        // buffer_addr = job_mem + job_mem_size + counter * 4 (4 == sizeof(i32))
        asm.add_imm_to_reg(addr, job_mem, job_mem_size as i64, true, addr);
        let shift_amt = SCRATCH[4];
        asm.mov_imm(shift_amt, 2, true);
        asm.instr(
            InstrBuilder::new(templates::LSLV64)
                .set_d(shift_amt)
                .set_n(counter)
                .set_m(shift_amt)
                .finish(),
        );
        asm.instr(
            InstrBuilder::new(templates::ADD_REG64)
                .set_d(addr)
                .set_n(addr)
                .set_m(shift_amt)
                .finish(),
        );
        asm.store_to_base(func_idx, addr, 0, WasmType::I32);

        // ptr = *ptr (follow the chain to the caller's own saved entry).
        asm.load_from_base(ptr, ptr, 0, WasmType::I64);
        asm.add_imm24_to_reg(counter, counter, 1, true);

        let pos = asm.pos();
        let offset = (loop_start as i64 - pos as i64) / 4;
        asm.instr(InstrBuilder::new(templates::B).set_imm26(offset as i32).finish());

        asm.link_label_here(&mut loop_end);
    }

    let sp_tmp = SCRATCH[0];
    asm.load_from_base(sp_tmp, job_mem, layout::TRAP_REENTRY_SP.offset(), WasmType::I64);
    asm.add_imm24_to_reg(Reg::Sp, sp_tmp, 0, true);

    let handler = SCRATCH[1];
    asm.load_from_base(handler, job_mem, layout::TRAP_HANDLER_ADDRESS.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::BR).set_n(handler).finish());

    entry
}

/// The *extension-request trampoline* (spec §4.6.13 item 3, called from a
/// bounds-check failure with the would-be-out-of-bounds address in `x1`):
/// re-checks against the current (possibly just-grown) memory size, since
/// another thread or a host callback may have extended memory between the
/// Wasm access and this trampoline running; if the access is now in range
/// it simply returns, otherwise it asks the host to grow memory and traps
/// on failure.
pub fn emit_extension_request_trampoline(asm: &mut Assembler, regs: &Registers) -> Result<u32, crate::error::CodegenError> {
    use crate::trap::TrapCode;

    let entry = asm.pos();
    let job_mem = regs.dedicated.job_mem;
    let candidate = Reg::Gpr(1);
    let cur_size = SCRATCH[0];

    asm.load_from_base(cur_size, job_mem, layout::LINEAR_MEMORY_BYTE_SIZE.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::CMP_REG64).set_n(candidate).set_m(cur_size).finish());
    let ls = BranchCondition::from_comparison(CondenseOp::CmpLeU, WasmType::I64).expect("CmpLeU is always valid");
    let mut still_in_range = RelPatchObj::new();
    asm.prepare_jmp_cond(&mut still_in_range, ls.to_aarch64_cc());

    // Spill the two registers this trampoline itself clobbers across the
    // host call: the link register and the faulting-address argument.
    asm.instr(
        InstrBuilder::new(templates::STP_PREIDX64)
            .set_t1(Reg::Lr)
            .set_t2(candidate)
            .set_n(Reg::Sp)
            .set_imm7_pair(-2)
            .finish(),
    );

    let helper = SCRATCH[1];
    asm.load_from_base(helper, job_mem, layout::MEMORY_HELPER_PTR.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::BLR).set_n(helper).finish());

    asm.instr(InstrBuilder::new(templates::CMP_IMM64).set_n(Reg::Gpr(0)).set_imm12(0).finish());
    let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I64).expect("CmpEq is always valid");
    asm.conditional_trap(eq.to_aarch64_cc(), TrapCode::LinMemCouldNotExtend)?;

    // x0 == -1: `CMN x0, #1` tests `x0 + 1 == 0`, since `CMP_IMM`'s
    // immediate field can't encode a negative operand directly.
    asm.instr(InstrBuilder::new(templates::CMN_IMM64).set_n(Reg::Gpr(0)).set_imm12(1).finish());
    let eq_neg1 = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I64).expect("CmpEq is always valid");
    asm.conditional_trap(eq_neg1.to_aarch64_cc(), TrapCode::LinMemOutOfBoundsAccess)?;

    // Rebuild the dedicated linear-memory and cached-size registers from
    // the (now grown) job-memory fields the host call just updated.
    asm.load_from_base(regs.dedicated.lin_mem, job_mem, layout::LINKED_MEMORY_PTR.offset(), WasmType::I64);
    if regs.dedicated.mem_size != Reg::None {
        asm.load_from_base(regs.dedicated.mem_size, job_mem, layout::LINEAR_MEMORY_BYTE_SIZE.offset(), WasmType::I64);
    }

    asm.instr(
        InstrBuilder::new(templates::LDP_POSTIDX64)
            .set_t1(Reg::Lr)
            .set_t2(candidate)
            .set_n(Reg::Sp)
            .set_imm7_pair(2)
            .finish(),
    );
    asm.instr(InstrBuilder::new(templates::RET).set_n(Reg::Lr).finish());

    asm.link_label_here(&mut still_in_range);
    asm.instr(InstrBuilder::new(templates::RET).set_n(Reg::Lr).finish());

    Ok(entry)
}

/// The *landing pad* (spec §4.6.13 item 4, only emitted when bounds-
/// checking is disabled): a trampoline a fault lands in directly, that
/// invokes a host-installed recovery routine and resumes at a
/// host-installed return address, rather than unwinding through the
/// generic trap handler at all.
pub fn emit_landing_pad(asm: &mut Assembler, regs: &Registers) -> u32 {
    let entry = asm.pos();
    let job_mem = regs.dedicated.job_mem;

    asm.instr(
        InstrBuilder::new(templates::STP_PREIDX64)
            .set_t1(Reg::Gpr(9))
            .set_t2(Reg::Gpr(10))
            .set_n(Reg::Sp)
            .set_imm7_pair(-2)
            .finish(),
    );

    let target = Reg::Gpr(9);
    asm.load_from_base(target, job_mem, layout::LANDING_PAD_TARGET.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::BLR).set_n(target).finish());

    asm.instr(
        InstrBuilder::new(templates::LDP_POSTIDX64)
            .set_t1(Reg::Gpr(9))
            .set_t2(Reg::Gpr(10))
            .set_n(Reg::Sp)
            .set_imm7_pair(2)
            .finish(),
    );

    let ret_addr = Reg::Gpr(9);
    asm.load_from_base(ret_addr, job_mem, layout::LANDING_PAD_RET.offset(), WasmType::I64);
    asm.instr(InstrBuilder::new(templates::BR).set_n(ret_addr).finish());

    entry
}

/// `emitFunctionEntryPoint` (spec §4.6.15): the native-ABI→Wasm-ABI wrapper
/// emitted for every exported function. `first_entry` is whether this
/// frame is the outermost native→Wasm crossing for the whole call chain
/// (the trap re-entry context, SP + an `ADR`-captured resume address, is
/// only pushed once — a re-entrant call from a Wasm import callback back
/// into another exported function must not clobber its caller's context).
pub fn emit_function_entry_point(
    module: &ModuleInfo,
    func: FuncIndex,
    asm: &mut Assembler,
    regs: &Registers,
    first_entry: bool,
    target_code: u32,
) -> u32 {
    let entry = asm.pos();
    let sig = module.function_signature(func);
    let job_mem = regs.dedicated.job_mem;

    // Native ABI in: x0 = serialized-arguments buffer, x3 = return-value
    // buffer (`passed as the fourth native param` per spec).
    let args_buf = Reg::Gpr(0);
    let ret_buf = Reg::Gpr(3);

    // Non-volatile register save (this wrapper's own prologue, distinct
    // from the Wasm function's own frame).
    asm.instr(
        InstrBuilder::new(templates::STP_PREIDX64)
            .set_t1(Reg::Lr)
            .set_t2(Reg::Gpr(19))
            .set_n(Reg::Sp)
            .set_imm7_pair(-2)
            .finish(),
    );

    if first_entry {
        let sp_save = SCRATCH[0];
        asm.add_imm24_to_reg(sp_save, Reg::Sp, 0, true);
        asm.store_to_base(sp_save, job_mem, layout::TRAP_REENTRY_SP.offset(), WasmType::I64);
        let mut here = RelPatchObj::new();
        let resume = SCRATCH[1];
        asm.prepare_adr(&mut here, resume);
        asm.link_label_here(&mut here);
        asm.store_to_base(resume, job_mem, layout::TRAP_HANDLER_ADDRESS.offset(), WasmType::I64);
    }

    // Load each Wasm parameter out of the serialized-arguments buffer
    // (tightly packed, one 8-byte slot per parameter) into its ABI
    // location, then pack for the direct call the same way an ordinary
    // call site would.
    let param_locs = assign_param_locations(&sig.params);
    let mut resolver = RegisterCopyResolver::new();
    for (i, loc) in param_locs.iter().enumerate() {
        let tmp = SCRATCH[i % SCRATCH.len()];
        asm.load_from_base(tmp, args_buf, (i as i32) * layout::SLOT_BYTES, sig.params[i]);
        match loc {
            ParamLoc::Reg(dst) => resolver.add_move(tmp, *dst, dst.is_fpr()),
            ParamLoc::Stack(offset) => asm.store_to_base(tmp, Reg::Sp, *offset, sig.params[i]),
        }
    }
    resolver.resolve(asm, Reg::Fpr(1));

    let pos = asm.pos();
    let rel = (target_code as i64 - pos as i64) / 4;
    asm.instr(InstrBuilder::new(templates::BL).set_imm26(rel as i32).finish());

    let result_locs = assign_param_locations(&sig.results);
    for (i, loc) in result_locs.iter().enumerate() {
        let reg = match loc {
            ParamLoc::Reg(r) => *r,
            ParamLoc::Stack(offset) => {
                let tmp = SCRATCH[i % SCRATCH.len()];
                asm.load_from_base(tmp, Reg::Sp, *offset, sig.results[i]);
                tmp
            }
        };
        asm.store_to_base(reg, ret_buf, (i as i32) * layout::SLOT_BYTES, sig.results[i]);
    }

    if first_entry {
        asm.store_to_base(Reg::Zr, job_mem, layout::TRAP_REENTRY_SP.offset(), WasmType::I64);
    }

    asm.instr(
        InstrBuilder::new(templates::LDP_POSTIDX64)
            .set_t1(Reg::Lr)
            .set_t2(Reg::Gpr(19))
            .set_n(Reg::Sp)
            .set_imm7_pair(2)
            .finish(),
    );
    asm.instr(InstrBuilder::new(templates::RET).set_n(Reg::Lr).finish());

    entry
}

/// `emitWasmToNativeAdapter` (spec §4.6.15): the inverse wrapper, emitted
/// per imported function, converting a Wasm-ABI call into a call to the
/// native `target` function pointer.
pub fn emit_wasm_to_native_adapter(
    module: &ModuleInfo,
    func: FuncIndex,
    asm: &mut Assembler,
    abi: ImportAbi,
    target: Reg,
) -> u32 {
    let entry = asm.pos();
    let sig = module.function_signature(func);

    match abi {
        ImportAbi::V1 => {
            // Params already sit in this backend's Wasm-ABI registers;
            // rebuild them into AAPCS64 positions in place. The two
            // conventions share the same register numbering by
            // construction (`super::call`'s GPR/FPR param lists mirror
            // AAPCS64 exactly), so in the common case this resolves to no
            // moves at all.
            let wasm_locs = assign_param_locations(&sig.params);
            let native_locs = assign_param_locations(&sig.params);
            let mut resolver = RegisterCopyResolver::new();
            for (from, to) in wasm_locs.iter().zip(&native_locs) {
                if let (ParamLoc::Reg(f), ParamLoc::Reg(t)) = (from, to) {
                    resolver.add_move(*f, *t, t.is_fpr());
                }
            }
            resolver.resolve(asm, Reg::Fpr(1));
            asm.instr(InstrBuilder::new(templates::BLR).set_n(target).finish());
        }
        ImportAbi::V2 => {
            // Serialize params into a stack buffer and pass
            // `(params_ptr, returns_ptr, ctx_ptr)`.
            let param_locs = assign_param_locations(&sig.params);
            let params_buf_offset: i32 = -(sig.params.len() as i32 * layout::SLOT_BYTES);
            let returns_buf_offset: i32 = params_buf_offset - (sig.results.len() as i32 * layout::SLOT_BYTES);

            for (i, loc) in param_locs.iter().enumerate() {
                let src = match loc {
                    ParamLoc::Reg(r) => *r,
                    ParamLoc::Stack(incoming_offset) => {
                        let tmp = SCRATCH[i % SCRATCH.len()];
                        asm.load_from_base(tmp, Reg::Sp, *incoming_offset, sig.params[i]);
                        tmp
                    }
                };
                asm.store_to_base(src, Reg::Sp, params_buf_offset + (i as i32) * layout::SLOT_BYTES, sig.params[i]);
            }

            asm.add_imm24_to_reg(Reg::Gpr(0), Reg::Sp, params_buf_offset, true);
            asm.add_imm24_to_reg(Reg::Gpr(1), Reg::Sp, returns_buf_offset, true);
            // `ctx_ptr` (x2) is left to whatever the caller already
            // populated it with (the import's opaque host context),
            // matching the V2 calling convention's silence on who sets it.
            asm.instr(InstrBuilder::new(templates::BLR).set_n(target).finish());

            // Reload each result from the returns buffer the import just
            // populated into this function's own Wasm-ABI result location.
            let result_locs = assign_param_locations(&sig.results);
            for (i, loc) in result_locs.iter().enumerate() {
                let dst = match loc {
                    ParamLoc::Reg(r) => *r,
                    ParamLoc::Stack(_) => SCRATCH[i % SCRATCH.len()],
                };
                asm.load_from_base(dst, Reg::Sp, returns_buf_offset + (i as i32) * layout::SLOT_BYTES, sig.results[i]);
                if let ParamLoc::Stack(outgoing_offset) = loc {
                    asm.store_to_base(dst, Reg::Sp, *outgoing_offset, sig.results[i]);
                }
            }
        }
    }

    asm.instr(InstrBuilder::new(templates::RET).set_n(Reg::Lr).finish());
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_info::{FunctionInfo, Signature, SignatureIndex};

    fn one_func_module(params: Vec<WasmType>, results: Vec<WasmType>) -> (ModuleInfo, FuncIndex) {
        let mut module = ModuleInfo::new();
        let sig = module.signatures.push(Signature { params, results });
        let func = module.functions.push(FunctionInfo::new(sig, vec![], false));
        (module, func)
    }

    #[test]
    fn native_trap_adapter_moves_lin_mem_pointer() {
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_native_trap_adapter(&mut asm, &regs);
        assert!(!asm.code().is_empty());
    }

    #[test]
    fn generic_trap_handler_without_stack_trace_is_short() {
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_generic_trap_handler(&mut asm, &regs, 0, false, 0);
        // Just the SP reload + handler load + BR: 3 instructions.
        assert_eq!(asm.code().len(), 12);
    }

    #[test]
    fn generic_trap_handler_with_stack_trace_emits_a_loop() {
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_generic_trap_handler(&mut asm, &regs, 64, true, 16);
        assert!(asm.code().len() > 12);
    }

    #[test]
    fn extension_request_trampoline_emits_both_paths() {
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_extension_request_trampoline(&mut asm, &regs).unwrap();
        assert!(!asm.code().is_empty());
    }

    #[test]
    fn landing_pad_ends_in_indirect_branch() {
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_landing_pad(&mut asm, &regs);
        let word = u32::from_le_bytes(asm.code()[asm.code().len() - 4..].try_into().unwrap());
        assert_eq!(word & 0xFFFF_FC1F, templates::BR);
    }

    #[test]
    fn function_entry_point_ends_in_ret() {
        let (module, func) = one_func_module(vec![WasmType::I32, WasmType::F64], vec![WasmType::I32]);
        let mut asm = Assembler::new();
        let regs = Registers::new_aarch64();
        emit_function_entry_point(&module, func, &mut asm, &regs, true, 1000);
        let word = u32::from_le_bytes(asm.code()[asm.code().len() - 4..].try_into().unwrap());
        assert_eq!(word, templates::RET | (30 << 5));
    }

    #[test]
    fn wasm_to_native_v1_adapter_ends_in_ret() {
        let (module, func) = one_func_module(vec![WasmType::I32], vec![WasmType::I32]);
        let mut asm = Assembler::new();
        emit_wasm_to_native_adapter(&module, func, &mut asm, ImportAbi::V1, Reg::Gpr(16));
        let word = u32::from_le_bytes(asm.code()[asm.code().len() - 4..].try_into().unwrap());
        assert_eq!(word, templates::RET | (30 << 5));
    }

    #[test]
    fn wasm_to_native_v2_adapter_passes_three_pointers() {
        let (module, func) = one_func_module(vec![WasmType::I32, WasmType::I64], vec![WasmType::I32]);
        let mut asm = Assembler::new();
        emit_wasm_to_native_adapter(&module, func, &mut asm, ImportAbi::V2, Reg::Gpr(16));
        assert!(asm.code().len() > 4);
    }
}
