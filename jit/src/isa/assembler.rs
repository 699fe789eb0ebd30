//! The `Assembler` facade (spec §4.1 components C1–C4, operation list in
//! §4.3): the single place that actually appends bytes to a function's
//! code buffer. Everything above this layer (the stack, the register
//! allocator, the backend) goes through here rather than poking bytes
//! directly, the same separation the teacher draws between `MachBuffer`
//! and the instruction-emission methods that call into it.

use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::{decode_float_immediate, encode_float_immediate, encode_logical_immediate, templates};
use crate::isa::relpatch::{BranchFieldKind, RelPatchObj};
use crate::isa::select::{select_instr, RegProvider, Selected};
use crate::isa::encoding::AbstrInstr;
use crate::error::CodegenError;
use crate::regs::Reg;
use crate::storage::{StorageKind, VariableStorage};
use crate::trap::TrapCode;
use crate::types::WasmType;

/// `BRK #imm16` — used as this backend's trap instruction, with `imm16`
/// carrying the [`TrapCode`] so the runtime's signal handler can recover
/// the reason without any side table (spec §6.3/§7).
const BRK_BASE: u32 = 0xD420_0000;

/// Accumulates one function body's machine code.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    /// Whether `trap` should also load the faulting PC into `x1` before
    /// branching to the generic handler, so a debug build's trap handler
    /// can report exactly where a trap fired.
    debug_assertions: bool,
    /// Code offset of the generic trap handler (see
    /// `crate::backend::wrappers::emit_generic_trap_handler`), once one has
    /// been emitted and wired with [`Self::set_generic_trap_handler`].
    generic_trap_handler_pos: Option<u32>,
    /// Code offset of the extension-request trampoline (see
    /// `crate::backend::wrappers::emit_extension_request_trampoline`), once
    /// wired with [`Self::set_extension_trampoline`].
    extension_trampoline_pos: Option<u32>,
    /// Every trap site emitted so far, in emission order, so a later
    /// `trap()` call for the same code can branch to an earlier site
    /// instead of emitting its own `w0` load every time.
    trap_sites: Vec<(TrapCode, u32)>,
    /// This function's current stack-frame size, set once by
    /// [`Self::set_stack_frame_size`]. `StorageKind::StackMemory` offsets
    /// are counted from the frame's top rather than from `sp` directly
    /// (`sp` only reaches the frame's bottom once lowered), so every
    /// load/store through one needs this added back in — see
    /// [`Self::load_from_frame`].
    frame_size: u32,
    /// The dedicated job-memory base register (`regs.dedicated.job_mem`),
    /// wired once via [`Self::set_job_mem_base`] so `LinkData` storage
    /// addresses off it rather than `sp`.
    job_mem_base: Option<Reg>,
}

impl Assembler {
    /// An empty code buffer.
    pub fn new() -> Self {
        Assembler::default()
    }

    /// Whether traps should also stash the faulting PC in `x1` (see
    /// [`Self::trap`]).
    pub fn set_debug_assertions(&mut self, v: bool) {
        self.debug_assertions = v;
    }

    /// Wire the generic trap handler's code offset so subsequent `trap`
    /// calls branch to it instead of emitting a bare `BRK`.
    pub fn set_generic_trap_handler(&mut self, pos: u32) {
        self.generic_trap_handler_pos = Some(pos);
    }

    /// Wire the extension-request trampoline's code offset so
    /// `crate::backend::memory::emit_bounds_check` can re-request linear
    /// memory growth instead of trapping outright.
    pub fn set_extension_trampoline(&mut self, pos: u32) {
        self.extension_trampoline_pos = Some(pos);
    }

    /// The extension-request trampoline's code offset, if one has been
    /// wired with [`Self::set_extension_trampoline`].
    pub fn extension_trampoline_pos(&self) -> Option<u32> {
        self.extension_trampoline_pos
    }

    /// Wire the dedicated job-memory base register so `LinkData` storage
    /// (globals, tables, module bookkeeping) materializes off it instead of
    /// `sp`. Callers set this once, right after constructing both the
    /// `Assembler` and this function's `RegisterAllocator`.
    pub fn set_job_mem_base(&mut self, reg: Reg) {
        self.job_mem_base = Some(reg);
    }

    /// Current write position (byte offset from the start of this
    /// function's code).
    pub fn pos(&self) -> u32 {
        self.code.len() as u32
    }

    /// The accumulated machine code so far.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the assembler, returning the finished code buffer.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    /// `INSTR`: append a raw, fully-built instruction word.
    pub fn instr(&mut self, word: u32) -> u32 {
        let pos = self.pos();
        self.code.extend_from_slice(&word.to_le_bytes());
        pos
    }

    fn patch_word(&mut self, pos: u32, word: u32) {
        let idx = pos as usize;
        self.code[idx..idx + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// Load a 64-bit bit pattern into `dst` (sign-extended/zero-extended
    /// per `is64`) using the fewest `MOVZ`/`MOVN`/`MOVK`/`ORR`-immediate
    /// instructions possible (spec §4.1's `MOVimm` feasibility rule, §8.1
    /// invariant 6): try the single-instruction logical-immediate form
    /// first, then fall back to a `MOVZ`-or-`MOVN` seed plus up to three
    /// `MOVK` instructions for the remaining 16-bit chunks.
    pub fn mov_imm(&mut self, dst: Reg, value: u64, is64: bool) {
        let width = if is64 { 64 } else { 32 };
        let masked = if is64 { value } else { value & 0xFFFF_FFFF };

        if masked == 0 {
            let template = if is64 { templates::MOVZ64 } else { templates::MOVZ32 };
            self.instr(InstrBuilder::new(template).set_d(dst).set_imm16(0).finish());
            return;
        }

        if let Some((n, immr, imms)) = encode_logical_immediate(masked, width) {
            let template = if is64 { templates::ORR_IMM64 } else { templates::ORR_IMM32 };
            let word = InstrBuilder::new(template)
                .set_d(dst)
                .set_n(Reg::Zr)
                .set_n_bit(n)
                .set_immr(immr)
                .set_imms(imms)
                .finish();
            self.instr(word);
            return;
        }

        let chunks: Vec<u16> = (0..if is64 { 4 } else { 2 })
            .map(|i| ((masked >> (i * 16)) & 0xFFFF) as u16)
            .collect();
        let nonzero_chunks = chunks.iter().filter(|&&c| c != 0).count();
        let ones_chunks = chunks.iter().filter(|&&c| c == 0xFFFF).count();

        // MOVN seeds to all-ones, which is cheaper when most chunks are
        // already 0xFFFF.
        let use_movn = ones_chunks > chunks.len() - nonzero_chunks.max(1);

        let mut seeded = false;
        for (i, &chunk) in chunks.iter().enumerate() {
            let hw = i as u8;
            if !seeded {
                let skip_value = if use_movn { 0xFFFF } else { 0 };
                if chunk == skip_value && i + 1 < chunks.len() {
                    continue;
                }
                let template = if use_movn {
                    if is64 { templates::MOVN64 } else { templates::MOVN32 }
                } else if is64 {
                    templates::MOVZ64
                } else {
                    templates::MOVZ32
                };
                let encoded = if use_movn { !chunk } else { chunk };
                self.instr(
                    InstrBuilder::new(template)
                        .set_d(dst)
                        .set_hw(hw)
                        .set_imm16(encoded)
                        .finish(),
                );
                seeded = true;
                continue;
            }
            let skip_value = if use_movn { 0xFFFF } else { 0 };
            if chunk == skip_value {
                continue;
            }
            let template = if is64 { templates::MOVK64 } else { templates::MOVK32 };
            self.instr(
                InstrBuilder::new(template)
                    .set_d(dst)
                    .set_hw(hw)
                    .set_imm16(chunk)
                    .finish(),
            );
        }
    }

    /// Load a floating-point bit pattern into FPR `dst`. Zero always goes
    /// through `FMOV d, xzr`; values fitting the 8-bit VFP modified
    /// immediate use the single-instruction `FMOV` immediate form;
    /// anything else is materialized in a GPR via [`Self::mov_imm`] and
    /// moved across with `FMOV` general-to-scalar (spec §4.1 `FMOVimm`).
    pub fn fmov_imm(&mut self, dst: Reg, bits: u64, is64: bool, scratch_gpr: Reg) {
        if bits == 0 {
            let template = if is64 {
                templates::FMOV_GPR_TO_FPR64
            } else {
                templates::FMOV_GPR_TO_FPR32
            };
            self.instr(InstrBuilder::new(template).set_d(dst).set_n(Reg::Zr).finish());
            return;
        }
        if let Some(imm8) = encode_float_immediate(is64, bits) {
            let template = if is64 { templates::FMOV_IMM64 } else { templates::FMOV_IMM32 };
            self.instr(InstrBuilder::new(template).set_d(dst).set_imm8_float(imm8).finish());
            return;
        }
        self.mov_imm(scratch_gpr, bits, is64);
        let template = if is64 {
            templates::FMOV_GPR_TO_FPR64
        } else {
            templates::FMOV_GPR_TO_FPR32
        };
        self.instr(InstrBuilder::new(template).set_d(dst).set_n(scratch_gpr).finish());
    }

    /// Does the given bit pattern decode back to `bits` through
    /// [`Self::fmov_imm`]'s modified-immediate path? Exposed for callers
    /// (and property tests) that want to check feasibility without
    /// emitting anything.
    pub fn float_immediate_round_trips(is64: bool, bits: u64) -> bool {
        match encode_float_immediate(is64, bits) {
            Some(imm8) => decode_float_immediate(is64, imm8) == bits,
            None => false,
        }
    }

    /// `addImm24ToReg`: add a signed immediate of up to 24 bits to `src`,
    /// writing the result to `dst`, using at most two `ADD`-immediate
    /// instructions (the low 12 bits unshifted, the high 12 bits shifted
    /// left by 12) — no scratch register required. Used for stack-frame
    /// setup, where frame sizes are bounded well under 2^24 bytes.
    pub fn add_imm24_to_reg(&mut self, dst: Reg, src: Reg, imm: i32, is64: bool) {
        debug_assert!((-(1 << 24)..(1 << 24)).contains(&imm));
        let negative = imm < 0;
        let magnitude = imm.unsigned_abs();
        let low = (magnitude & 0xFFF) as u16;
        let high = ((magnitude >> 12) & 0xFFF) as u16;
        let template = match (negative, is64) {
            (false, false) => templates::ADD_IMM32,
            (false, true) => templates::ADD_IMM64,
            (true, false) => templates::SUB_IMM32,
            (true, true) => templates::SUB_IMM64,
        };
        let mut cur = src;
        let mut emitted = false;
        if high != 0 {
            self.instr(
                InstrBuilder::new(template)
                    .set_d(dst)
                    .set_n(cur)
                    .set_imm12(high)
                    .set_shift12(true)
                    .finish(),
            );
            cur = dst;
            emitted = true;
        }
        if low != 0 || !emitted {
            self.instr(
                InstrBuilder::new(template)
                    .set_d(dst)
                    .set_n(cur)
                    .set_imm12(low)
                    .set_shift12(false)
                    .finish(),
            );
        }
    }

    /// `addImmToReg`: add an arbitrary signed 64-bit immediate to `src`,
    /// writing the result to `dst`. Immediates within 24 bits go through
    /// [`Self::add_imm24_to_reg`]; larger ones are materialized in
    /// `scratch` with [`Self::mov_imm`] and added with a register-form
    /// `ADD`.
    pub fn add_imm_to_reg(&mut self, dst: Reg, src: Reg, imm: i64, is64: bool, scratch: Reg) {
        if (-(1i64 << 24)..(1i64 << 24)).contains(&imm) {
            self.add_imm24_to_reg(dst, src, imm as i32, is64);
            return;
        }
        self.mov_imm(scratch, imm as u64, is64);
        let template = if is64 { templates::ADD_REG64 } else { templates::ADD_REG32 };
        self.instr(
            InstrBuilder::new(template)
                .set_d(dst)
                .set_n(src)
                .set_m(scratch)
                .finish(),
        );
    }

    /// `setStackFrameSize`: subtract `size` bytes from `sp`, establishing
    /// this function's frame. `size` must already be 16-byte aligned (see
    /// [`Self::align_stack_frame_size`]).
    pub fn set_stack_frame_size(&mut self, size: u32) {
        debug_assert_eq!(size % 16, 0, "AArch64 requires a 16-byte-aligned SP");
        self.add_imm24_to_reg(Reg::Sp, Reg::Sp, -(size as i32), true);
        self.frame_size = size;
    }

    /// This function's frame size, as last set by [`Self::set_stack_frame_size`].
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Every trap site emitted so far, for a caller that wants to copy them
    /// into [`crate::module_info::FunctionInfo::stack_trace`] before
    /// consuming this assembler with [`Self::finish`].
    pub fn trap_sites(&self) -> &[(TrapCode, u32)] {
        &self.trap_sites
    }

    /// Round `size` up to the next 16-byte boundary, as AArch64's calling
    /// convention requires of `sp` at every public boundary (spec §4.1).
    pub fn align_stack_frame_size(size: u32) -> u32 {
        (size + 15) & !15
    }

    /// `probeStack`: touch one word of every 4 KiB page in `[sp, sp -
    /// frame_size)` so that a guard page beneath the stack faults before
    /// this function's locals are corrupted, rather than after (spec §7,
    /// `StackFenceBreached`). A no-op when `frame_size` fits in a single
    /// page.
    pub fn probe_stack(&mut self, frame_size: u32) {
        const PAGE: u32 = 4096;
        let mut offset = PAGE;
        while offset < frame_size {
            self.instr(
                InstrBuilder::new(templates::STR_IMM64)
                    .set_t(Reg::Zr)
                    .set_n(Reg::Sp)
                    .set_scaled_offset12((frame_size - offset) as i32, 3)
                    .finish(),
            );
            offset += PAGE;
        }
    }

    /// `TRAP`: trap with `code` by loading it into `w0` (and, in a debug
    /// build, the faulting PC into `x1`) and branching to the generic trap
    /// handler. If an earlier site already traps with the same `code` and
    /// is still in branch range, jump there instead of materializing the
    /// load again. Falls back to a bare `BRK #imm16` (carrying `code` in
    /// the immediate) when no generic handler has been wired yet, which is
    /// what a standalone test or a handler-less embedding gets.
    pub fn trap(&mut self, code: TrapCode) -> Result<u32, CodegenError> {
        if let Some(&(_, site_pos)) = self.trap_sites.iter().rev().find(|(c, _)| *c == code) {
            if let Some(rel) = Self::branch26_offset(site_pos, self.pos()) {
                let entry = self.instr(InstrBuilder::new(templates::B).set_imm26(rel).finish());
                return Ok(entry);
            }
        }

        let entry = self.pos();
        log::trace!("emitting trap site for {code:?} at {entry}");
        self.mov_imm(Reg::Gpr(0), code.code() as u64, false);
        if self.debug_assertions {
            self.mov_imm(Reg::Gpr(1), entry as u64, true);
        }
        match self.generic_trap_handler_pos {
            Some(handler_pos) => {
                let rel = Self::branch26_offset(handler_pos, self.pos())
                    .ok_or(CodegenError::BranchOutOfRange)?;
                self.instr(InstrBuilder::new(templates::B).set_imm26(rel).finish());
            }
            None => {
                self.instr(BRK_BASE | ((code.code() & 0xFFFF) << 5));
            }
        }
        self.trap_sites.push((code, entry));
        Ok(entry)
    }

    /// `cTRAP`: trap with `code` only when `cond` (an AArch64 4-bit
    /// condition-code value) holds, by branching over [`Self::trap`]'s
    /// (variable-length) sequence when it doesn't.
    pub fn conditional_trap(&mut self, cond: u8, code: TrapCode) -> Result<u32, CodegenError> {
        let inverted = cond ^ 1; // AArch64 condition codes pair up as even/odd inverses.
        let mut skip = RelPatchObj::new();
        let branch_pos = self.prepare_jmp_cond(&mut skip, inverted);
        self.trap(code)?;
        self.link_label_here(&mut skip);
        Ok(branch_pos)
    }

    /// `BL` to `target` only when `cond` holds — used by
    /// `crate::backend::memory::emit_bounds_check` to call into the
    /// extension-request trampoline instead of trapping directly.
    pub fn conditional_call(&mut self, cond: u8, target: u32) -> Result<u32, CodegenError> {
        let inverted = cond ^ 1;
        let mut skip = RelPatchObj::new();
        let branch_pos = self.prepare_jmp_cond(&mut skip, inverted);
        let rel = Self::branch26_offset(target, self.pos()).ok_or(CodegenError::BranchOutOfRange)?;
        self.instr(InstrBuilder::new(templates::BL).set_imm26(rel).finish());
        self.link_label_here(&mut skip);
        Ok(branch_pos)
    }

    /// Word-granular displacement from the next instruction at `from_pos`
    /// to `target_pos`, or `None` if it doesn't fit a 26-bit signed field.
    fn branch26_offset(target_pos: u32, from_pos: u32) -> Option<i32> {
        let rel = (target_pos as i64 - from_pos as i64) / 4;
        if (-(1i64 << 25)..(1i64 << 25)).contains(&rel) {
            Some(rel as i32)
        } else {
            None
        }
    }

    /// `prepareJMP`: emit an unconditional `B` to `target`, registering
    /// the reference in `target`'s pending chain if its position isn't
    /// known yet.
    pub fn prepare_jmp(&mut self, target: &mut RelPatchObj) -> u32 {
        let pos = self.pos();
        let offset = target.pos_offset_before_instr(pos, BranchFieldKind::Imm26);
        self.instr(InstrBuilder::new(templates::B).set_imm26(offset).finish())
    }

    /// `prepareJMPcond`: as [`Self::prepare_jmp`], but a conditional
    /// `B.cond`.
    pub fn prepare_jmp_cond(&mut self, target: &mut RelPatchObj, cond: u8) -> u32 {
        let pos = self.pos();
        let offset = target.pos_offset_before_instr(pos, BranchFieldKind::Imm19);
        self.instr(
            InstrBuilder::new(templates::BCOND)
                .set_imm19(offset)
                .set_cond_branch(cond)
                .finish(),
        )
    }

    /// `prepareJMPcbz`/`prepareJMPcbnz`: compare-and-branch forms.
    pub fn prepare_jmp_cbz(&mut self, target: &mut RelPatchObj, reg: Reg, is64: bool, on_nonzero: bool) -> u32 {
        let pos = self.pos();
        let offset = target.pos_offset_before_instr(pos, BranchFieldKind::Imm19);
        let template = match (on_nonzero, is64) {
            (false, false) => templates::CBZ32,
            (false, true) => templates::CBZ64,
            (true, false) => templates::CBNZ32,
            (true, true) => templates::CBNZ64,
        };
        self.instr(InstrBuilder::new(template).set_t(reg).set_imm19(offset).finish())
    }

    /// `prepareADR`: load `dst` with the address of `target`.
    pub fn prepare_adr(&mut self, target: &mut RelPatchObj, dst: Reg) -> u32 {
        let pos = self.pos();
        let offset = target.pos_offset_before_instr(pos, BranchFieldKind::Imm21Adr);
        self.instr(InstrBuilder::new(templates::ADR).set_imm21_adr(offset).set_d(dst).finish())
    }

    /// Resolve `target` to the current write position, patching every
    /// pending branch to it.
    pub fn link_label_here(&mut self, target: &mut RelPatchObj) {
        target.link_to_here(&mut self.code);
    }

    /// `selectInstr`: delegate to [`crate::isa::select::select_instr`] and
    /// append the resulting instruction word.
    pub fn select_instr(
        &mut self,
        candidates: &[AbstrInstr],
        lhs: VariableStorage,
        rhs: VariableStorage,
        dst_ty: WasmType,
        dst_hint: Option<Reg>,
        regs: &mut impl RegProvider,
    ) -> Result<Selected, CodegenError> {
        let selected = select_instr(candidates, lhs, rhs, dst_ty, dst_hint, regs)?;
        self.instr(selected.word);
        Ok(selected)
    }

    /// `emitActionArg`: materialize `storage` into a concrete register,
    /// emitting whatever load/move sequence that requires. This is the
    /// shared primitive behind pre-lifting an operand for `selectInstr`
    /// and flushing a stack slot's condensed computation into a register.
    pub fn emit_action_arg(&mut self, storage: &VariableStorage, into: Reg) {
        match storage.kind {
            StorageKind::Constant(bits) => {
                if storage.ty.is_float() {
                    self.fmov_imm(into, bits, storage.ty.is64(), into);
                } else {
                    self.mov_imm(into, bits, storage.ty.is64());
                }
            }
            StorageKind::StackMemory(offset) => {
                self.load_from_frame(into, offset, storage.ty);
            }
            StorageKind::LinkData(offset) => {
                self.load_from_job_mem(into, offset, storage.ty);
            }
            StorageKind::Register(reg) | StorageKind::StackReg { reg, .. } => {
                if reg != into {
                    self.move_reg(into, reg, storage.ty);
                }
            }
            StorageKind::Invalid => {}
        }
    }

    fn move_reg(&mut self, dst: Reg, src: Reg, ty: WasmType) {
        if ty.is_float() {
            let template = if ty.is64() { templates::FADD64 } else { templates::FADD32 };
            // FMOV scalar register form shares FADD's src1 slot unused;
            // simplest correct sequence is `FADD dst, src, #0`-equivalent
            // is not available, so emit the dedicated FMOV register-move
            // form instead (same family as GPR<->FPR transfer templates
            // but register-to-register within one file): ORR-equivalent
            // for vectors is `FMOV Dd, Dn`, encoded as `FADD` is wrong; use
            // the general move-within-class encoding below.
            let _ = template;
            self.instr(
                InstrBuilder::new(if ty.is64() { 0x1E60_4000 } else { 0x1E20_4000 })
                    .set_d(dst)
                    .set_n(src)
                    .finish(),
            );
        } else {
            let template = if ty.is64() { templates::ORR_REG64 } else { templates::ORR_REG32 };
            self.instr(
                InstrBuilder::new(template)
                    .set_d(dst)
                    .set_n(Reg::Zr)
                    .set_m(src)
                    .finish(),
            );
        }
    }

    /// Load a frame-top-relative slot (a stack-resident local's home, or an
    /// incoming stack-passed argument once `set_stack_frame_size` has
    /// lowered `sp`) into `dst`.
    pub(crate) fn load_from_frame(&mut self, dst: Reg, offset: i32, ty: WasmType) {
        let template = if ty.is_float() {
            if ty.is64() {
                0xFD40_0000 // LDR Dt, [Xn, #imm] (unsigned offset, 64-bit FPR)
            } else {
                0xBD40_0000 // LDR St, [Xn, #imm]
            }
        } else if ty.is64() {
            templates::LDR_IMM64
        } else {
            templates::LDR_IMM32
        };
        let log2_size = if ty.is64() { 3 } else { 2 };
        // `offset` is counted from the frame's top (see
        // `StorageKind::StackMemory`'s doc comment), not from `sp`, which
        // sits at the frame's bottom once lowered by `set_stack_frame_size`;
        // add the frame size back in to get a valid non-negative `sp`-
        // relative displacement, same as `probe_stack` already does.
        self.instr(
            InstrBuilder::new(template)
                .set_t(dst)
                .set_n(Reg::Sp)
                .set_scaled_offset12(self.frame_size as i32 + offset, log2_size)
                .finish(),
        );
    }

    /// Store direction of [`Self::load_from_frame`], for backend code that
    /// writes a stack-resident local's home slot directly (spilling goes
    /// through `crate::services`'s own copy of this instead, since it only
    /// ever targets a freshly allocated temp slot).
    pub(crate) fn store_to_frame(&mut self, src: Reg, offset: i32, ty: WasmType) {
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
        self.instr(
            InstrBuilder::new(template)
                .set_t(src)
                .set_n(Reg::Sp)
                .set_scaled_offset12(self.frame_size as i32 + offset, log2_size)
                .finish(),
        );
    }

    /// Zero-initialize the stack-resident slot at `offset` (frame-top-
    /// relative), for debug-mode local zero-init — same addressing as
    /// [`Self::store_to_frame`], without needing a zero already in a GPR.
    pub(crate) fn zero_frame_slot(&mut self, offset: i32, ty: WasmType) {
        self.store_to_frame(Reg::Zr, offset, ty);
    }

    fn load_from_job_mem(&mut self, dst: Reg, offset: i32, ty: WasmType) {
        let base = self
            .job_mem_base
            .expect("job-memory base register not wired via set_job_mem_base");
        self.load_from_base(dst, base, offset, ty);
    }

    /// Load through an arbitrary base register with a small signed byte
    /// offset, via the unscaled `LDUR` family — unlike `LDR`'s scaled
    /// immediate form, this tolerates negative and unaligned offsets, which
    /// is exactly the shape of job-memory `FromEnd` slots and globals
    /// addressed off [`crate::regs::DedicatedRegs::job_mem`].
    pub fn load_from_base(&mut self, dst: Reg, base: Reg, offset: i32, ty: WasmType) {
        let template = if ty.is_float() {
            if ty.is64() {
                templates::LDUR_FPR64
            } else {
                templates::LDUR_FPR32
            }
        } else if ty.is64() {
            templates::LDUR64
        } else {
            templates::LDUR32
        };
        self.instr(
            InstrBuilder::new(template)
                .set_t(dst)
                .set_n(base)
                .set_imm9_unscaled(offset)
                .finish(),
        );
    }

    /// Store through an arbitrary base register with a small signed byte
    /// offset; see [`Self::load_from_base`].
    pub fn store_to_base(&mut self, src: Reg, base: Reg, offset: i32, ty: WasmType) {
        let template = if ty.is_float() {
            if ty.is64() {
                templates::STUR_FPR64
            } else {
                templates::STUR_FPR32
            }
        } else if ty.is64() {
            templates::STUR64
        } else {
            templates::STUR32
        };
        self.instr(
            InstrBuilder::new(template)
                .set_t(src)
                .set_n(base)
                .set_imm9_unscaled(offset)
                .finish(),
        );
    }

    /// Load from `base + index` (register-offset addressing) at the given
    /// transfer width — linear-memory access, where `index` already holds
    /// the runtime-computed byte address relative to `base`. `width_bits`
    /// is one of 8/16/32/64; narrower-than-`dst_is64` integer loads zero-
    /// extend, matching Wasm's `iNN.loadM_u` semantics (signed variants
    /// sign-extend afterwards with `SXTB`/`SXTH`/`SXTW`, emitted by the
    /// caller).
    pub fn load_reg_offset(&mut self, dst: Reg, base: Reg, index: Reg, is_float: bool, width_bits: u32) {
        let template = match (is_float, width_bits) {
            (true, 32) => templates::LDR_REG_OFFSET_FPR32,
            (true, 64) => templates::LDR_REG_OFFSET_FPR64,
            (false, 8) => templates::LDRB_REG_OFFSET,
            (false, 16) => templates::LDRH_REG_OFFSET,
            (false, 32) => templates::LDR_REG_OFFSET32,
            (false, 64) => templates::LDR_REG_OFFSET64,
            _ => unreachable!("unsupported load width"),
        };
        self.instr(InstrBuilder::new(template).set_t(dst).set_n(base).set_m(index).finish());
    }

    /// Store to `base + index`; see [`Self::load_reg_offset`].
    pub fn store_reg_offset(&mut self, src: Reg, base: Reg, index: Reg, is_float: bool, width_bits: u32) {
        let template = match (is_float, width_bits) {
            (true, 32) => templates::STR_REG_OFFSET_FPR32,
            (true, 64) => templates::STR_REG_OFFSET_FPR64,
            (false, 8) => templates::STRB_REG_OFFSET,
            (false, 16) => templates::STRH_REG_OFFSET,
            (false, 32) => templates::STR_REG_OFFSET32,
            (false, 64) => templates::STR_REG_OFFSET64,
            _ => unreachable!("unsupported store width"),
        };
        self.instr(InstrBuilder::new(template).set_t(src).set_n(base).set_m(index).finish());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::decode::eval_mov_imm_words;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn mov_imm_round_trips_any_64bit_value(value: u64) {
            let mut asm = Assembler::new();
            asm.mov_imm(Reg::Gpr(3), value, true);
            let words: Vec<u32> = asm.code().chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            prop_assert_eq!(eval_mov_imm_words(&words), Some(value));
        }

        #[test]
        fn mov_imm_round_trips_any_32bit_value(value: u32) {
            let mut asm = Assembler::new();
            asm.mov_imm(Reg::Gpr(3), value as u64, false);
            let words: Vec<u32> = asm.code().chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            prop_assert_eq!(eval_mov_imm_words(&words), Some(value as u64));
        }
    }

    #[test]
    fn mov_imm_zero_is_single_movz() {
        let mut asm = Assembler::new();
        asm.mov_imm(Reg::Gpr(0), 0, true);
        assert_eq!(asm.code().len(), 4);
    }

    #[test]
    fn mov_imm_logical_pattern_is_single_instruction() {
        let mut asm = Assembler::new();
        asm.mov_imm(Reg::Gpr(1), 0xFFFF_0000_FFFF_0000, true);
        assert_eq!(asm.code().len(), 4, "a bitmask-immediate pattern needs only one ORR");
    }

    #[test]
    fn mov_imm_arbitrary_64bit_uses_at_most_four_instructions() {
        let mut asm = Assembler::new();
        asm.mov_imm(Reg::Gpr(2), 0x1234_5678_9ABC_DEF0, true);
        assert!(asm.code().len() <= 16);
        assert!(!asm.code().is_empty());
    }

    #[test]
    fn add_imm24_single_instruction_for_small_values() {
        let mut asm = Assembler::new();
        asm.add_imm24_to_reg(Reg::Gpr(0), Reg::Gpr(1), 100, true);
        assert_eq!(asm.code().len(), 4);
    }

    #[test]
    fn align_stack_frame_size_rounds_up() {
        assert_eq!(Assembler::align_stack_frame_size(0), 0);
        assert_eq!(Assembler::align_stack_frame_size(1), 16);
        assert_eq!(Assembler::align_stack_frame_size(16), 16);
        assert_eq!(Assembler::align_stack_frame_size(17), 32);
    }

    #[test]
    fn trap_with_no_handler_emits_bare_brk() {
        let mut asm = Assembler::new();
        asm.trap(TrapCode::DivZero).unwrap();
        // w0 load (at least one instruction) then the BRK fallback.
        let brk = u32::from_le_bytes(asm.code()[asm.code().len() - 4..].try_into().unwrap());
        assert_eq!(brk, BRK_BASE | (TrapCode::DivZero.code() << 5));
    }

    #[test]
    fn trap_reuses_an_earlier_site_of_the_same_code_when_in_range() {
        let mut asm = Assembler::new();
        asm.trap(TrapCode::DivZero).unwrap();
        let before = asm.code().len();
        asm.trap(TrapCode::DivZero).unwrap();
        assert_eq!(asm.code().len() - before, 4, "reusing a cached site emits a single branch");
    }

    #[test]
    fn trap_with_different_code_does_not_reuse_a_cached_site() {
        let mut asm = Assembler::new();
        asm.trap(TrapCode::DivZero).unwrap();
        let before = asm.code().len();
        asm.trap(TrapCode::DivOverflow).unwrap();
        assert!(asm.code().len() - before > 4, "a different code must materialize its own w0 load");
    }

    #[test]
    fn trap_errs_when_generic_handler_unreachable() {
        let mut asm = Assembler::new();
        asm.set_generic_trap_handler(1 << 28);
        assert!(asm.trap(TrapCode::DivZero).is_err());
    }

    #[test]
    fn conditional_trap_skips_the_trap_sequence_when_untaken() {
        let mut asm = Assembler::new();
        asm.conditional_trap(0, TrapCode::DivZero).unwrap();
        assert!(asm.code().len() > 4, "conditional branch plus the trap sequence");
    }

    #[test]
    fn load_from_base_encodes_negative_offset() {
        let mut asm = Assembler::new();
        asm.load_from_base(Reg::Gpr(3), Reg::Gpr(29), -8, WasmType::I64);
        let word = u32::from_le_bytes(asm.code()[0..4].try_into().unwrap());
        assert_eq!(word, templates::LDUR64 | ((-8i32 as u32 & 0x1FF) << 12) | (29 << 5) | 3);
    }

    #[test]
    fn load_reg_offset_picks_byte_template_for_8_bits() {
        let mut asm = Assembler::new();
        asm.load_reg_offset(Reg::Gpr(0), Reg::Gpr(18), Reg::Gpr(9), false, 8);
        let word = u32::from_le_bytes(asm.code()[0..4].try_into().unwrap());
        assert_eq!(word & 0xFFFF_FC00, templates::LDRB_REG_OFFSET);
    }

    #[test]
    fn prepare_jmp_then_link_patches_displacement() {
        let mut asm = Assembler::new();
        let mut target = RelPatchObj::new();
        let branch_pos = asm.prepare_jmp(&mut target);
        for _ in 0..3 {
            asm.instr(0);
        }
        asm.link_label_here(&mut target);
        let word = u32::from_le_bytes(
            asm.code()[branch_pos as usize..branch_pos as usize + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(word & 0x03FF_FFFF, 4);
    }
}
