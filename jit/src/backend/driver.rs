//! Per-function compilation driver (spec §3.8/§3.9/§4.6.1, component C9):
//! the one place that actually walks a Wasm function body one opcode at a
//! time, wiring the operand stack, register allocator, control-flow stack
//! and every other `backend` submodule's emitters together into a single
//! pass. A Wasm decoder/validator is out of scope for this crate (see the
//! crate-level docs); [`FunctionCompiler::feed`] is what such a frontend
//! calls once per validated opcode, already resolved to this backend's own
//! operand/index types.

use crate::backend::branch::{self, BlockStack};
use crate::backend::call::{self, ParamLoc, RegisterCopyResolver};
use crate::backend::{arith, compare, memory, select as select_emit};
use crate::backend::{Codegen, OpEvaluator};
use crate::cond::BranchCondition;
use crate::config::Flags;
use crate::error::CodegenError;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::module_info::{FuncIndex, FunctionInfo, GlobalIndex, ModuleInfo, Signature, SignatureIndex, TableIndex};
use crate::regs::{Reg, RegMask, Registers};
use crate::services::{RegisterAllocator, ReservedSet};
use crate::stack::element::CondenseOp;
use crate::storage::VariableStorage;
use crate::trap::TrapCode;
use crate::types::WasmType;
use wasmjit_entity::EntityRef;

/// Conservative scratch/spill budget reserved on top of locals at function
/// entry, so a single upfront `setStackFrameSize` can cover the whole
/// body's transient spilling without this backend's single-shot frame
/// primitive having to grow mid-function.
const SCRATCH_BUDGET_BYTES: u32 = 128;

/// Where one local (declared or parameter) lives for the rest of its
/// enclosing function — decided once at entry and never moved afterward,
/// since this backend's register assignment is static per function rather
/// than computed from a liveness pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalHome {
    /// Permanently resident in a dedicated callee-saved register.
    Register(Reg),
    /// Permanently resident in a stack-frame slot (frame-top-relative).
    Stack(i32),
}

impl LocalHome {
    fn storage(self, ty: WasmType) -> VariableStorage {
        match self {
            LocalHome::Register(r) => VariableStorage::reg(ty, r),
            LocalHome::Stack(off) => VariableStorage::stack(ty, off),
        }
    }
}

/// Hands out the leading `gpr_local_capacity()`/`fpr_local_capacity()`
/// registers of each class to globals first, then to this function's
/// locals, in declaration order (spec §3.2). Whatever a class runs out of
/// room for falls back to a permanent stack-frame slot instead.
struct LocalAllocator {
    gpr_used: usize,
    fpr_used: usize,
    gpr_cap: usize,
    fpr_cap: usize,
}

impl LocalAllocator {
    fn new(regs: &Registers) -> Self {
        LocalAllocator {
            gpr_used: 0,
            fpr_used: 0,
            gpr_cap: regs.gpr_local_capacity(),
            fpr_cap: regs.fpr_local_capacity(),
        }
    }

    fn take_register(&mut self, ty: WasmType, regs: &Registers) -> Option<Reg> {
        if ty.is_float() {
            if self.fpr_used < self.fpr_cap {
                let reg = regs.fpr[self.fpr_used];
                self.fpr_used += 1;
                return Some(reg);
            }
        } else if self.gpr_used < self.gpr_cap {
            let reg = regs.gpr[self.gpr_used];
            self.gpr_used += 1;
            return Some(reg);
        }
        None
    }

    /// The mask of every register handed out so far, for [`ReservedSet`] —
    /// so the scratch allocator never reassigns a global/local's register.
    fn reserved_mask(&self, regs: &Registers) -> (RegMask, RegMask) {
        let mut gpr = RegMask::none();
        for &r in &regs.gpr[..self.gpr_used] {
            gpr = gpr.union(RegMask::singleton(r));
        }
        let mut fpr = RegMask::none();
        for &r in &regs.fpr[..self.fpr_used] {
            fpr = fpr.union(RegMask::singleton(r));
        }
        (gpr, fpr)
    }
}

/// One validated Wasm opcode, already resolved to this backend's own index
/// and operand types by the (out-of-scope) frontend decoder/validator.
#[derive(Debug, Clone)]
pub enum WasmOp {
    /// `i32.const` / `i64.const` / `f32.const` / `f64.const`. `bits` is the
    /// value's bit pattern (sign/zero-extended for integers, raw IEEE bits
    /// for floats), matching [`VariableStorage::constant`].
    Const { ty: WasmType, bits: u64 },
    /// `local.get`.
    LocalGet(u32),
    /// `local.set`.
    LocalSet(u32),
    /// `local.tee`.
    LocalTee(u32),
    /// `global.get`.
    GlobalGet(GlobalIndex),
    /// `global.set`.
    GlobalSet(GlobalIndex),
    /// Any unary numeric op (`clz`, `ctz`, `popcnt`, `neg`, `not`, ...).
    Unary(CondenseOp),
    /// Any binary numeric or comparison op, deferred into the condense
    /// tree (everything except float `mul`/`div`, which are eager — see
    /// [`Self::FloatMul`]/[`Self::FloatDiv`]).
    Binary(CondenseOp),
    /// `fNN.mul`, emitted eagerly rather than condensed (spec §4.6.5).
    FloatMul,
    /// `fNN.div`, emitted eagerly (spec §4.6.5).
    FloatDiv,
    /// `i32.wrap_i64`.
    Wrap,
    /// `iNN.extendM_s`/`_u` and `i64.extend_i32_s`/`_u`.
    Extend { signed: bool, from_bits: u32 },
    /// `fNN.convert_iMM_s`/`_u`.
    IntToFloat { signed: bool, dst_ty: WasmType },
    /// `iNN.trunc_fMM_s`/`_u`. The caller's overflow bounds check (spec
    /// §4.6.5) is emitted by this driver right before delegating to
    /// [`arith::emit_trunc`].
    Trunc { signed: bool, dst_ty: WasmType },
    /// `f32.demote_f64`/`f64.promote_f32`.
    FloatConvert { dst_ty: WasmType },
    /// `iNN.reinterpret_fMM`/`fMM.reinterpret_iNN`.
    Reinterpret { dst_ty: WasmType },
    /// `fNN.copysign`.
    Copysign,
    /// `iNN.loadM[_u]`, deferred into the condense tree.
    Load { narrow_bytes: Option<u32>, signed: bool, offset: i32, dst_ty: WasmType },
    /// `iNN.storeM`, emitted eagerly (stores have no useful deferral).
    Store { narrow_bytes: Option<u32>, offset: i32 },
    /// `memory.size`.
    MemorySize,
    /// `memory.grow`.
    MemoryGrow,
    /// `memory.copy`.
    MemoryCopy,
    /// `memory.fill`.
    MemoryFill,
    /// `drop`.
    Drop,
    /// `select`.
    Select,
    /// `block`.
    Block(Signature),
    /// `loop`.
    Loop(Signature),
    /// `if`.
    If(Signature),
    /// `else`.
    Else,
    /// `end`.
    End,
    /// `br`, by label depth.
    Br(usize),
    /// `br_if`, by label depth.
    BrIf(usize),
    /// `br_table`.
    BrTable { targets: Vec<usize>, default: usize },
    /// `call`.
    Call { target: FuncIndex, target_code: Option<u32> },
    /// `call_indirect`.
    CallIndirect { table: TableIndex, sig_index: SignatureIndex },
    /// `return`.
    Return,
    /// `unreachable`.
    Unreachable,
}

/// Drives one function body's compilation from entry to the final `end`
/// (spec §3.9's `enteredFunction`/per-opcode lifecycle).
pub struct FunctionCompiler<'m> {
    codegen: Codegen<'m>,
    blocks: BlockStack,
    func_index: FuncIndex,
    info: FunctionInfo,
    local_homes: Vec<LocalHome>,
    local_tys: Vec<WasmType>,
    global_homes: Vec<Option<Reg>>,
    frame_size: u32,
    lr_save_offset: i32,
}

impl<'m> FunctionCompiler<'m> {
    /// `enteredFunction` (spec §3.9/§4.6.1): assign every global and local
    /// its permanent home, reserve and emit this function's stack frame,
    /// save `LR`, move incoming parameters into their homes, and (in debug
    /// builds) zero-initialize stack-resident locals.
    pub fn enter(
        module: &'m ModuleInfo,
        func_index: FuncIndex,
        flags: Flags,
        declared_locals: &[WasmType],
    ) -> Result<Self, CodegenError> {
        log::debug!("entering function {}", func_index.index());
        let sig = module.function_signature(func_index).clone();
        let shell = &module.functions[func_index];
        let info = FunctionInfo::new(shell.signature, declared_locals.to_vec(), shell.is_builtin);
        let regs_file = Registers::new_aarch64();

        let mut local_alloc = LocalAllocator::new(&regs_file);
        // Globals first, module-wide, so every function agrees on which
        // globals would be register-resident if this function touched
        // every one of them — each function still loads/stores its own
        // register cache independently (spec §3.2 has no cross-function
        // register-content sharing; job memory is the source of truth).
        let mut global_homes = Vec::with_capacity(module.globals.len());
        for global in module.globals.values() {
            global_homes.push(local_alloc.take_register(global.ty, &regs_file));
        }

        let mut local_tys: Vec<WasmType> = sig.params.clone();
        local_tys.extend_from_slice(declared_locals);
        if local_tys.len() > u16::MAX as usize {
            return Err(CodegenError::TooManyLocals);
        }
        if sig.params.len() > u8::MAX as usize {
            return Err(CodegenError::TooManyParams);
        }

        let mut local_homes_regs: Vec<Option<Reg>> = Vec::with_capacity(local_tys.len());
        for &ty in &local_tys {
            local_homes_regs.push(local_alloc.take_register(ty, &regs_file));
        }

        let (reserved_gpr, reserved_fpr) = local_alloc.reserved_mask(&regs_file);
        let reserved = ReservedSet { gpr: reserved_gpr, fpr: reserved_fpr };
        let mut regs = RegisterAllocator::new(regs_file, reserved);

        // The LR save slot is always the very first permanent stack slot
        // (offset `-8`), reserved the same way a stack-resident local's
        // home is — just never freed.
        let lr_save_offset = regs.find_free_temp_stack_slot()?;

        let mut local_homes = Vec::with_capacity(local_tys.len());
        for home in local_homes_regs {
            let resolved = match home {
                Some(r) => LocalHome::Register(r),
                None => LocalHome::Stack(regs.find_free_temp_stack_slot()?),
            };
            local_homes.push(resolved);
        }

        let locals_stack_bytes = regs.temp_stack_bytes();
        let frame_size = crate::isa::assembler::Assembler::align_stack_frame_size(locals_stack_bytes + SCRATCH_BUDGET_BYTES);
        if frame_size > 0x00FF_FFFF {
            return Err(CodegenError::ReachedMaximumStackFrameSize);
        }

        let mut codegen = Codegen::new(regs, module, flags);
        codegen.asm.set_debug_assertions(flags.debug_assertions);
        codegen.asm.set_job_mem_base(codegen.regs.registers().dedicated.job_mem);
        codegen.asm.set_stack_frame_size(frame_size);
        if flags.active_stack_overflow_check {
            codegen.asm.probe_stack(frame_size);
            Self::emit_stack_fence_check(&mut codegen)?;
        }

        codegen.asm.store_to_frame(Reg::Lr, lr_save_offset, WasmType::I64);

        let mut compiler = FunctionCompiler {
            codegen,
            blocks: BlockStack::new(),
            func_index,
            info,
            local_homes,
            local_tys,
            global_homes,
            frame_size,
            lr_save_offset,
        };
        compiler.home_incoming_params(&sig)?;
        if flags.debug_assertions {
            compiler.zero_stack_resident_locals(sig.params.len());
        }
        Ok(compiler)
    }

    fn emit_stack_fence_check(codegen: &mut Codegen<'m>) -> Result<(), CodegenError> {
        let job_mem = codegen.regs.registers().dedicated.job_mem;
        let (elements, refs) = codegen.stack.split_refs_mut();
        let fence = codegen.regs.req_scratch_reg(WasmType::I64, elements, refs, &mut codegen.asm)?;
        codegen
            .asm
            .load_from_base(fence, job_mem, crate::layout::STACK_FENCE_ADDRESS.offset(), WasmType::I64);
        codegen.asm.instr(
            InstrBuilder::new(templates::CMP_REG64)
                .set_n(Reg::Sp)
                .set_m(fence)
                .finish(),
        );
        let lo = BranchCondition::from_comparison(CondenseOp::CmpLtU, WasmType::I64).expect("CmpLtU is always valid");
        codegen.asm.conditional_trap(lo.to_aarch64_cc(), TrapCode::StackFenceBreached)?;
        Ok(())
    }

    fn home_incoming_params(&mut self, sig: &Signature) -> Result<(), CodegenError> {
        let locations = call::assign_param_locations(&sig.params);
        let mut resolver = RegisterCopyResolver::new();
        let mut deferred_stack_loads = Vec::new();
        for (i, (&ty, loc)) in sig.params.iter().zip(&locations).enumerate() {
            match (loc, self.local_homes[i]) {
                (ParamLoc::Reg(src), LocalHome::Register(dst)) => resolver.add_move(*src, dst, dst.is_fpr()),
                (ParamLoc::Reg(src), LocalHome::Stack(offset)) => {
                    self.codegen.asm.store_to_frame(*src, offset, ty);
                }
                (ParamLoc::Stack(arg_offset), home) => deferred_stack_loads.push((*arg_offset, home, ty)),
            }
        }
        resolver.resolve(&mut self.codegen.asm, Reg::Fpr(1));
        for (arg_offset, home, ty) in deferred_stack_loads {
            // Incoming stack-passed arguments sit above this frame's top,
            // at the caller's outgoing-argument offsets — reachable the
            // same way a stack-resident local's home is, since both are
            // frame-top-relative (see `StorageKind::StackMemory`).
            match home {
                LocalHome::Register(dst) => self.codegen.asm.load_from_frame(dst, arg_offset, ty),
                LocalHome::Stack(dst_offset) => {
                    let (elements, refs) = self.codegen.stack.split_refs_mut();
                    let scratch = self.codegen.regs.req_scratch_reg(ty, elements, refs, &mut self.codegen.asm)?;
                    self.codegen.asm.load_from_frame(scratch, arg_offset, ty);
                    self.codegen.asm.store_to_frame(scratch, dst_offset, ty);
                }
            }
        }
        Ok(())
    }

    fn zero_stack_resident_locals(&mut self, params_len: usize) {
        for (home, &ty) in self.local_homes[params_len..].iter().zip(&self.local_tys[params_len..]) {
            if let LocalHome::Stack(offset) = *home {
                self.codegen.asm.zero_frame_slot(offset, ty);
            }
        }
    }

    fn evaluator(&mut self) -> OpEvaluator<'_> {
        OpEvaluator {
            regs: &mut self.codegen.regs,
            asm: &mut self.codegen.asm,
            flags: &self.codegen.flags,
        }
    }

    /// Force every deferred computation currently on the stack (spec
    /// §4.5.3) — needed before any control-flow boundary that merges
    /// paths, a store, or a call.
    fn condense_all(&mut self) -> Result<(), CodegenError> {
        let mut evaluator = OpEvaluator {
            regs: &mut self.codegen.regs,
            asm: &mut self.codegen.asm,
            flags: &self.codegen.flags,
        };
        self.codegen.stack.condense_valent_block(0, &mut evaluator)
    }

    fn pop_storage(&mut self) -> Result<VariableStorage, CodegenError> {
        let slot = self
            .codegen
            .regs
            .pop(&mut self.codegen.stack)
            .ok_or(CodegenError::Verify("operand stack underflow"))?;
        if let Some(storage) = self.codegen.stack.storage_of(slot) {
            return Ok(storage);
        }
        let mut evaluator = OpEvaluator {
            regs: &mut self.codegen.regs,
            asm: &mut self.codegen.asm,
            flags: &self.codegen.flags,
        };
        let (elements, refs) = self.codegen.stack.split_refs_mut();
        crate::stack::condense::evaluate_slot(elements, refs, slot, &mut evaluator)
    }

    fn push_storage(&mut self, storage: VariableStorage) {
        self.codegen.regs.push(&mut self.codegen.stack, storage);
    }

    /// Bail out once actual temp-stack usage would exceed the conservative
    /// budget reserved in [`Self::enter`] — this backend's single-shot
    /// frame primitive can't grow mid-function to cover an under-estimate.
    fn check_frame_budget(&self) -> Result<(), CodegenError> {
        if self.codegen.regs.temp_stack_bytes() > self.frame_size {
            return Err(CodegenError::ReachedMaximumStackFrameSize);
        }
        Ok(())
    }

    /// `spillAllVariables` at a block boundary (spec §4.6.11): force every
    /// deferred computation and materialize every local/global's register
    /// cache doesn't need rewriting here (dedicated registers are never
    /// scratch-spilled — see [`RegisterAllocator::remove_reference`]); what
    /// a nested block actually needs is every *operand-stack* value forced
    /// to a concrete, branch-stable storage before code that might branch
    /// past this block can run.
    fn spill_before_block(&mut self) -> Result<(), CodegenError> {
        self.condense_all()
    }

    /// Process one validated opcode (spec §4.6's per-family dispatch).
    pub fn feed(&mut self, op: WasmOp) -> Result<(), CodegenError> {
        match op {
            WasmOp::Const { ty, bits } => self.push_storage(VariableStorage::constant(ty, bits)),
            WasmOp::LocalGet(index) => self.op_local_get(index)?,
            WasmOp::LocalSet(index) => self.op_local_set(index)?,
            WasmOp::LocalTee(index) => self.op_local_tee(index)?,
            WasmOp::GlobalGet(index) => self.op_global_get(index)?,
            WasmOp::GlobalSet(index) => self.op_global_set(index)?,
            WasmOp::Unary(cop) => self.op_unary(cop)?,
            WasmOp::Binary(cop) => self.op_binary(cop)?,
            WasmOp::FloatMul => self.op_float_binary(true)?,
            WasmOp::FloatDiv => self.op_float_binary(false)?,
            WasmOp::Wrap => {
                let operand = self.pop_storage()?;
                let result = arith::emit_wrap(operand);
                self.push_storage(result);
            }
            WasmOp::Extend { signed, from_bits } => {
                let operand = self.pop_storage()?;
                let result = self.with_elements(|regs, elements, refs, asm| {
                    arith::emit_extend(regs, elements, refs, asm, signed, from_bits, operand)
                })?;
                self.push_storage(result);
            }
            WasmOp::IntToFloat { signed, dst_ty } => {
                let operand = self.pop_storage()?;
                let result = self.with_elements(|regs, elements, refs, asm| {
                    arith::emit_int_to_float(regs, elements, refs, asm, dst_ty, signed, operand)
                })?;
                self.push_storage(result);
            }
            WasmOp::Trunc { signed, dst_ty } => self.op_trunc(signed, dst_ty)?,
            WasmOp::FloatConvert { dst_ty } => {
                let operand = self.pop_storage()?;
                let result = self.with_elements(|regs, elements, refs, asm| {
                    arith::emit_float_convert(regs, elements, refs, asm, dst_ty, operand)
                })?;
                self.push_storage(result);
            }
            WasmOp::Reinterpret { dst_ty } => {
                let operand = self.pop_storage()?;
                let result = self.with_elements(|regs, elements, refs, asm| {
                    arith::emit_reinterpret(regs, elements, refs, asm, dst_ty, operand)
                })?;
                self.push_storage(result);
            }
            WasmOp::Copysign => {
                let rhs = self.pop_storage()?;
                let lhs = self.pop_storage()?;
                let ty = lhs.ty;
                let result = self.with_elements(|regs, elements, refs, asm| arith::emit_copysign(regs, elements, refs, asm, ty, lhs, rhs))?;
                self.push_storage(result);
            }
            WasmOp::Load { narrow_bytes, signed, offset, dst_ty } => self.op_load(narrow_bytes, signed, offset, dst_ty)?,
            WasmOp::Store { narrow_bytes, offset } => self.op_store(narrow_bytes, offset)?,
            WasmOp::MemorySize => {
                let result = self.with_elements(|regs, elements, refs, asm| memory::emit_get_mem_size(regs, elements, refs, asm))?;
                self.push_storage(result);
            }
            WasmOp::MemoryGrow => {
                let delta = self.pop_storage()?;
                let result = self.with_elements(|regs, elements, refs, asm| memory::emit_mem_grow(regs, elements, refs, asm, delta))?;
                self.push_storage(result);
            }
            WasmOp::MemoryCopy => {
                let size = self.pop_storage()?;
                let src = self.pop_storage()?;
                let dst = self.pop_storage()?;
                let flags = self.codegen.flags;
                self.with_elements(|regs, elements, refs, asm| memory::emit_linear_memory_copy(regs, elements, refs, asm, &flags, dst, src, size))?;
            }
            WasmOp::MemoryFill => {
                let size = self.pop_storage()?;
                let val = self.pop_storage()?;
                let dst = self.pop_storage()?;
                let flags = self.codegen.flags;
                self.with_elements(|regs, elements, refs, asm| memory::emit_linear_memory_fill(regs, elements, refs, asm, &flags, dst, val, size))?;
            }
            WasmOp::Drop => {
                self.codegen.regs.pop(&mut self.codegen.stack).ok_or(CodegenError::Verify("drop on empty stack"))?;
            }
            WasmOp::Select => self.op_select()?,
            WasmOp::Block(signature) => self.op_block(signature)?,
            WasmOp::Loop(signature) => self.op_loop(signature)?,
            WasmOp::If(signature) => self.op_if(signature)?,
            WasmOp::Else => self.op_else()?,
            WasmOp::End => self.op_end()?,
            WasmOp::Br(depth) => self.op_br(depth)?,
            WasmOp::BrIf(depth) => self.op_br_if(depth)?,
            WasmOp::BrTable { targets, default } => self.op_br_table(targets, default)?,
            WasmOp::Call { target, target_code } => self.op_call(target, target_code)?,
            WasmOp::CallIndirect { table, sig_index } => self.op_call_indirect(table, sig_index)?,
            WasmOp::Return => self.op_return()?,
            WasmOp::Unreachable => {
                self.codegen.asm.trap(TrapCode::Unreachable)?;
            }
        }
        self.check_frame_budget()
    }

    /// Thread `regs`/`elements`/`refs`/`asm` into a closure the way every
    /// `backend` emitter expects them, splitting the stack's borrow for
    /// the duration of the call.
    fn with_elements<T>(
        &mut self,
        f: impl FnOnce(&mut RegisterAllocator, &mut crate::services::Elements, &mut crate::stack::RefIndex, &mut crate::isa::assembler::Assembler) -> Result<T, CodegenError>,
    ) -> Result<T, CodegenError> {
        let (elements, refs) = self.codegen.stack.split_refs_mut();
        f(&mut self.codegen.regs, elements, refs, &mut self.codegen.asm)
    }

    fn op_local_get(&mut self, index: u32) -> Result<(), CodegenError> {
        let ty = *self.local_tys.get(index as usize).ok_or(CodegenError::Verify("local.get index out of range"))?;
        let storage = self.local_homes[index as usize].storage(ty);
        self.push_storage(storage);
        Ok(())
    }

    fn op_local_set(&mut self, index: u32) -> Result<(), CodegenError> {
        let value = self.pop_storage()?;
        self.write_local(index, value)
    }

    fn op_local_tee(&mut self, index: u32) -> Result<(), CodegenError> {
        self.codegen.stack.condense_comparison_below(&mut self.evaluator())?;
        let top = self.codegen.stack.peek(0).ok_or(CodegenError::Verify("local.tee on empty stack"))?;
        let value = self
            .codegen
            .stack
            .storage_of(top)
            .ok_or(CodegenError::Verify("local.tee operand still condensed"))?;
        self.write_local(index, value)
    }

    fn write_local(&mut self, index: u32, value: VariableStorage) -> Result<(), CodegenError> {
        let home = *self
            .local_homes
            .get(index as usize)
            .ok_or(CodegenError::Verify("local.set index out of range"))?;
        match home {
            LocalHome::Register(dst) => {
                let src_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, value))?;
                if src_reg != dst {
                    self.codegen.asm.emit_action_arg(&VariableStorage::reg(value.ty, src_reg), dst);
                }
            }
            LocalHome::Stack(offset) => {
                let src_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, value))?;
                self.codegen.asm.store_to_frame(src_reg, offset, value.ty);
            }
        }
        Ok(())
    }

    fn global_ty(&self, index: GlobalIndex) -> WasmType {
        self.codegen.module.globals[index].ty
    }

    fn op_global_get(&mut self, index: GlobalIndex) -> Result<(), CodegenError> {
        let ty = self.global_ty(index);
        let storage = match self.global_homes[index.index()] {
            Some(reg) => VariableStorage::reg(ty, reg),
            None => VariableStorage::link_data(ty, self.codegen.module.globals[index].job_mem_offset),
        };
        self.push_storage(storage);
        Ok(())
    }

    fn op_global_set(&mut self, index: GlobalIndex) -> Result<(), CodegenError> {
        let value = self.pop_storage()?;
        match self.global_homes[index.index()] {
            Some(dst) => {
                let src_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, value))?;
                if src_reg != dst {
                    self.codegen.asm.emit_action_arg(&VariableStorage::reg(value.ty, src_reg), dst);
                }
            }
            None => {
                let offset = self.codegen.module.globals[index].job_mem_offset;
                let job_mem = self.codegen.regs.registers().dedicated.job_mem;
                let src_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, value))?;
                self.codegen.asm.store_to_base(src_reg, job_mem, offset, value.ty);
            }
        }
        Ok(())
    }

    fn op_unary(&mut self, op: CondenseOp) -> Result<(), CodegenError> {
        let operand = self.codegen.regs.pop(&mut self.codegen.stack).ok_or(CodegenError::Verify("unary op on empty stack"))?;
        let ty = self.codegen.stack.ty_of(operand);
        self.codegen.stack.push_condensed(op, ty, operand, None);
        Ok(())
    }

    fn op_binary(&mut self, op: CondenseOp) -> Result<(), CodegenError> {
        let rhs = self.codegen.stack.pop().ok_or(CodegenError::Verify("binary op missing rhs"))?;
        let lhs = self.codegen.stack.pop().ok_or(CodegenError::Verify("binary op missing lhs"))?;
        let operand_ty = self.codegen.stack.ty_of(lhs);
        let result_ty = if op.is_comparison() { WasmType::I32 } else { operand_ty };
        self.codegen.stack.push_condensed(op, result_ty, lhs, Some(rhs));
        Ok(())
    }

    fn op_float_binary(&mut self, mul: bool) -> Result<(), CodegenError> {
        let rhs = self.pop_storage()?;
        let lhs = self.pop_storage()?;
        let ty = lhs.ty;
        let result = self.with_elements(|regs, elements, refs, asm| {
            if mul {
                arith::emit_float_mul(regs, elements, refs, asm, ty, lhs, rhs)
            } else {
                arith::emit_float_div(regs, elements, refs, asm, ty, lhs, rhs)
            }
        })?;
        self.push_storage(result);
        Ok(())
    }

    fn op_trunc(&mut self, signed: bool, dst_ty: WasmType) -> Result<(), CodegenError> {
        let operand = self.pop_storage()?;
        let src_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, operand))?;
        // The overflow bounds check is this driver's responsibility (see
        // `arith::emit_trunc`'s doc comment): compare the float source
        // against the destination integer range before converting, since
        // `FCVTZS`/`FCVTZU` themselves saturate silently rather than trap.
        let (bound_lo, bound_hi) = float_trunc_bounds(operand.ty, dst_ty, signed);
        let lo_reg = self.with_elements(|regs, elements, refs, asm| {
            let scratch = regs.req_scratch_reg(operand.ty, elements, refs, asm)?;
            asm.fmov_imm(scratch, bound_lo, operand.ty.is64(), scratch);
            Ok::<_, CodegenError>(scratch)
        })?;
        self.codegen.asm.instr(
            InstrBuilder::new(if operand.ty.is64() { templates::FCMP64 } else { templates::FCMP32 })
                .set_n(src_reg)
                .set_d(lo_reg)
                .finish(),
        );
        let le = BranchCondition::from_comparison(CondenseOp::CmpLeS, operand.ty).expect("CmpLeS is always valid");
        self.codegen.asm.conditional_trap(le.to_aarch64_cc(), TrapCode::TruncOverflow)?;
        let hi_reg = self.with_elements(|regs, elements, refs, asm| {
            let scratch = regs.req_scratch_reg(operand.ty, elements, refs, asm)?;
            asm.fmov_imm(scratch, bound_hi, operand.ty.is64(), scratch);
            Ok::<_, CodegenError>(scratch)
        })?;
        self.codegen.asm.instr(
            InstrBuilder::new(if operand.ty.is64() { templates::FCMP64 } else { templates::FCMP32 })
                .set_n(src_reg)
                .set_d(hi_reg)
                .finish(),
        );
        let ge = BranchCondition::from_comparison(CondenseOp::CmpGeS, operand.ty).expect("CmpGeS is always valid");
        self.codegen.asm.conditional_trap(ge.to_aarch64_cc(), TrapCode::TruncOverflow)?;
        let operand = VariableStorage::reg(operand.ty, src_reg);
        let result = self.with_elements(|regs, elements, refs, asm| arith::emit_trunc(regs, elements, refs, asm, dst_ty, signed, operand))?;
        self.push_storage(result);
        Ok(())
    }

    fn op_load(&mut self, narrow_bytes: Option<u32>, signed: bool, offset: i32, dst_ty: WasmType) -> Result<(), CodegenError> {
        let addr = self.codegen.stack.pop().ok_or(CodegenError::Verify("load missing address"))?;
        self.codegen.stack.push_condensed(CondenseOp::Load { offset, narrow_bytes, signed }, dst_ty, addr, None);
        Ok(())
    }

    fn op_store(&mut self, narrow_bytes: Option<u32>, offset: i32) -> Result<(), CodegenError> {
        let value = self.pop_storage()?;
        let addr = self.pop_storage()?;
        let flags = self.codegen.flags;
        self.with_elements(|regs, elements, refs, asm| memory::emit_linear_memory_store(regs, elements, refs, asm, &flags, narrow_bytes, offset, addr, value))
    }

    fn op_select(&mut self) -> Result<(), CodegenError> {
        let cond = self.pop_storage()?;
        let if_false = self.pop_storage()?;
        let if_true = self.pop_storage()?;
        let ty = if_true.ty;
        let result = self.with_elements(|regs, elements, refs, asm| select_emit::emit_select(regs, elements, refs, asm, ty, if_true, if_false, cond))?;
        self.push_storage(result);
        Ok(())
    }

    fn op_block(&mut self, signature: Signature) -> Result<(), CodegenError> {
        self.spill_before_block()?;
        self.blocks.push_block(signature, self.frame_size);
        Ok(())
    }

    fn op_loop(&mut self, signature: Signature) -> Result<(), CodegenError> {
        self.spill_before_block()?;
        self.blocks.push_loop(&mut self.codegen.asm, signature, self.frame_size);
        Ok(())
    }

    fn op_if(&mut self, signature: Signature) -> Result<(), CodegenError> {
        let cond = self.pop_storage()?;
        let cond_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, cond))?;
        self.codegen.asm.instr(
            InstrBuilder::new(templates::CMP_IMM32)
                .set_n(cond_reg)
                .set_imm12(0)
                .finish(),
        );
        self.spill_before_block()?;
        self.blocks.push_if(signature, self.frame_size);
        // The `then` arm's pending-branch target doubles as the fallback
        // taken when the condition is false; a conditional branch over the
        // arm is recorded the same way `br_if` records one, just against
        // this frame's own target rather than an outer label.
        let eq = BranchCondition::from_comparison(CondenseOp::CmpEq, WasmType::I32).expect("CmpEq is always valid");
        branch::emit_branch(&mut self.codegen.asm, &mut self.blocks, self.frame_size, 0, Some(eq), Reg::Gpr(16))
    }

    fn op_else(&mut self) -> Result<(), CodegenError> {
        self.spill_before_block()?;
        // Unconditionally skip the `else` arm from the end of the `then`
        // arm, then resolve the `if`'s conditional-skip target to here so
        // the `else` arm begins exactly where the condition's negation
        // lands.
        let frame = self.blocks.frame(0).ok_or(CodegenError::Verify("else outside an if block"))?;
        let signature = frame.signature.clone();
        let entry_frame_size = frame.entry_frame_size;
        self.blocks.finalize(&mut self.codegen.asm);
        self.blocks.push_block(signature, entry_frame_size);
        Ok(())
    }

    fn op_end(&mut self) -> Result<(), CodegenError> {
        self.spill_before_block()?;
        self.blocks.finalize(&mut self.codegen.asm).ok_or(CodegenError::Verify("end with no open block"))?;
        Ok(())
    }

    fn op_br(&mut self, depth: usize) -> Result<(), CodegenError> {
        self.condense_all()?;
        branch::emit_branch(&mut self.codegen.asm, &mut self.blocks, self.frame_size, depth, None, Reg::Gpr(16))
    }

    fn op_br_if(&mut self, depth: usize) -> Result<(), CodegenError> {
        let cond = self.pop_storage()?;
        let cond_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, cond))?;
        self.condense_all()?;
        self.codegen.asm.instr(
            InstrBuilder::new(templates::CMP_IMM32)
                .set_n(cond_reg)
                .set_imm12(0)
                .finish(),
        );
        let ne = BranchCondition::from_comparison(CondenseOp::CmpNe, WasmType::I32).expect("CmpNe is always valid");
        branch::emit_branch(&mut self.codegen.asm, &mut self.blocks, self.frame_size, depth, Some(ne), Reg::Gpr(16))
    }

    fn op_br_table(&mut self, targets: Vec<usize>, default: usize) -> Result<(), CodegenError> {
        let index = self.pop_storage()?;
        let index_reg = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, index))?;
        self.condense_all()?;
        branch::emit_table_branch(&mut self.codegen.asm, &mut self.blocks, self.frame_size, index_reg, &targets, default, Reg::Gpr(16))
    }

    /// Flush every register-resident global back to job memory before a
    /// call clobbers it — the caller's documented responsibility (see
    /// [`call::emit_direct_call`]'s step-1 note).
    fn flush_globals(&mut self) {
        let job_mem = self.codegen.regs.registers().dedicated.job_mem;
        for (index, home) in self.global_homes.clone().into_iter().enumerate() {
            if let Some(reg) = home {
                let global = &self.codegen.module.globals[GlobalIndex::new(index as u32)];
                self.codegen.asm.store_to_base(reg, job_mem, global.job_mem_offset, global.ty);
            }
        }
    }

    fn op_call(&mut self, target: FuncIndex, target_code: Option<u32>) -> Result<(), CodegenError> {
        let sig = self.codegen.module.function_signature(target).clone();
        let mut args = Vec::with_capacity(sig.params.len());
        for _ in 0..sig.params.len() {
            args.push(self.pop_storage()?);
        }
        args.reverse();
        self.condense_all()?;
        self.flush_globals();
        let func_index = self.func_index;
        let module = self.codegen.module;
        let (elements, refs) = self.codegen.stack.split_refs_mut();
        let results = call::emit_direct_call(
            module,
            &mut self.info,
            func_index,
            &mut self.codegen.asm,
            &mut self.codegen.regs,
            elements,
            refs,
            target,
            &args,
            target_code,
        )?;
        for result in results {
            self.push_storage(result);
        }
        Ok(())
    }

    fn op_call_indirect(&mut self, table: TableIndex, sig_index: SignatureIndex) -> Result<(), CodegenError> {
        let sig = self.codegen.module.signatures[sig_index].clone();
        let expected_sig_id = sig_index.index() as u32;
        let runtime_index = self.pop_storage()?;
        let mut args = Vec::with_capacity(sig.params.len());
        for _ in 0..sig.params.len() {
            args.push(self.pop_storage()?);
        }
        args.reverse();
        self.condense_all()?;
        self.flush_globals();

        let locations = call::assign_param_locations(&sig.params);
        let job_mem = self.codegen.regs.registers().dedicated.job_mem;
        let func_index = self.func_index;
        let old_head = self.with_elements(|regs, elements, refs, asm| call::push_stack_trace_entry(regs, elements, refs, asm, func_index))?;

        let mut resolver = RegisterCopyResolver::new();
        let mut stack_stores = Vec::new();
        for (arg, loc) in args.iter().zip(&locations) {
            match loc {
                ParamLoc::Reg(dst) => {
                    let src = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, *arg))?;
                    resolver.add_move(src, *dst, dst.is_fpr());
                }
                ParamLoc::Stack(offset) => stack_stores.push((*arg, *offset)),
            }
        }
        resolver.resolve(&mut self.codegen.asm, Reg::Fpr(1));
        for (arg, offset) in stack_stores {
            let src = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, arg))?;
            self.codegen.asm.store_to_base(src, Reg::Sp, offset, arg.ty);
        }

        let module = self.codegen.module;
        self.with_elements(|regs, elements, refs, asm| call::emit_indirect_call(asm, regs, elements, refs, module, table, runtime_index, expected_sig_id))?;

        call::pop_stack_trace_entry(job_mem, &mut self.codegen.asm, old_head);

        let result_locations = call::assign_param_locations(&sig.results);
        for (&ty, loc) in sig.results.iter().zip(&result_locations) {
            let result = match loc {
                ParamLoc::Reg(r) => VariableStorage::reg(ty, *r),
                ParamLoc::Stack(offset) => VariableStorage::stack(ty, *offset),
            };
            self.push_storage(result);
        }
        Ok(())
    }

    fn op_return(&mut self) -> Result<(), CodegenError> {
        let sig = self.codegen.module.function_signature(self.func_index).clone();
        let mut results = Vec::with_capacity(sig.results.len());
        for _ in 0..sig.results.len() {
            results.push(self.pop_storage()?);
        }
        results.reverse();
        self.condense_all()?;

        let locations = call::assign_param_locations(&sig.results);
        let mut resolver = RegisterCopyResolver::new();
        let mut stack_stores = Vec::new();
        for (value, loc) in results.iter().zip(&locations) {
            match loc {
                ParamLoc::Reg(dst) => {
                    let src = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, *value))?;
                    resolver.add_move(src, *dst, dst.is_fpr());
                }
                ParamLoc::Stack(offset) => stack_stores.push((*value, *offset)),
            }
        }
        resolver.resolve(&mut self.codegen.asm, Reg::Fpr(1));
        for (value, offset) in stack_stores {
            let src = self.with_elements(|regs, elements, refs, asm| call::lift(regs, elements, refs, asm, value))?;
            self.codegen.asm.store_to_base(src, Reg::Sp, offset, value.ty);
        }

        self.emit_epilogue();
        Ok(())
    }

    /// `emitReturnAndUnwindStack` (spec §4.6.12): restore `LR`, undo this
    /// function's frame reservation, and `RET`. Every `return` site repeats
    /// this same straight-line sequence rather than jumping to one shared
    /// epilogue, since nothing in this backend threads a forward label
    /// across the whole function body for it.
    fn emit_epilogue(&mut self) {
        self.codegen.asm.load_from_frame(Reg::Lr, self.lr_save_offset, WasmType::I64);
        self.codegen
            .asm
            .add_imm_to_reg(Reg::Sp, Reg::Sp, self.frame_size as i64, true, Reg::Gpr(16));
        self.codegen.asm.instr(InstrBuilder::new(templates::RET).set_n(Reg::Lr).finish());
    }

    /// Finish compiling this function body: force anything still deferred
    /// on the operand stack (a function whose last instruction isn't
    /// `return`/`unreachable` falls off the end implicitly, per Wasm's
    /// validation rules, so its trailing values are this function's
    /// results), emit the implicit final return, and fold the emitted code
    /// and trap table into this function's
    /// [`crate::module_info::FunctionInfo`] (relocations were already
    /// recorded into it as compilation proceeded — see
    /// [`call::emit_direct_call`]). The caller still has to install the
    /// result at `module.functions[func_index]` itself, since `enter` only
    /// borrowed the module, never took it by value.
    pub fn finish(mut self) -> Result<FunctionInfo, CodegenError> {
        if self.blocks.depth() == 0 {
            self.op_return()?;
        }
        for &(trap_code, code_offset) in self.codegen.asm.trap_sites() {
            self.info.record_trap(code_offset, trap_code);
        }
        self.info.stack_frame_size = self.frame_size;
        self.info.code = self.codegen.asm.finish();
        log::debug!("finished function {}: {} bytes, frame {}", self.func_index.index(), self.info.code.len(), self.frame_size);
        Ok(self.info)
    }
}

/// The float bit-pattern bounds a truncation source must stay strictly
/// within for `iNN.trunc_fMM_s`/`_u` not to overflow the destination
/// integer type (spec §4.6.5's caller-side bounds check). Returned as the
/// source float type's own bit pattern so the check can run directly
/// against the not-yet-converted operand.
fn float_trunc_bounds(src_ty: WasmType, dst_ty: WasmType, signed: bool) -> (u64, u64) {
    let dst64 = dst_ty.is64();
    if src_ty.is64() {
        let (lo, hi): (f64, f64) = match (dst64, signed) {
            (false, true) => (i32::MIN as f64 - 1.0, i32::MAX as f64 + 1.0),
            (false, false) => (-1.0, u32::MAX as f64 + 1.0),
            (true, true) => (i64::MIN as f64, i64::MAX as f64),
            (true, false) => (-1.0, u64::MAX as f64),
        };
        (lo.to_bits(), hi.to_bits())
    } else {
        let (lo, hi): (f32, f32) = match (dst64, signed) {
            (false, true) => (i32::MIN as f32 - 1.0, i32::MAX as f32 + 1.0),
            (false, false) => (-1.0, u32::MAX as f32 + 1.0),
            (true, true) => (i64::MIN as f32, i64::MAX as f32),
            (true, false) => (-1.0, u64::MAX as f32),
        };
        (lo.to_bits() as u64, hi.to_bits() as u64)
    }
}
