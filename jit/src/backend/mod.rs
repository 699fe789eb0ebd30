//! Per-instruction-family code generation (spec §4.6, component C9): the
//! orchestrator a Wasm decoder/validator (out of scope for this crate —
//! see the crate-level docs) calls one opcode at a time. Each submodule
//! covers one family; all of them work the same way, pulling operands off
//! [`Codegen::stack`] and pushing results back through [`Codegen::regs`],
//! with [`Codegen::asm`] as the only place bytes actually get appended.

pub mod arith;
pub mod branch;
pub mod call;
pub mod compare;
pub mod driver;
pub mod memory;
pub mod select;
pub mod wrappers;

use wasmjit_entity::PrimaryMap;

use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::select::select_instr;
use crate::module_info::ModuleInfo;
use crate::regs::Reg;
use crate::services::{AllocatingRegProvider, RegisterAllocator};
use crate::stack::condense::Evaluator;
use crate::stack::element::{CondenseOp, StackElement, StackSlotIndex};
use crate::stack::{RefIndex, Stack};
use crate::storage::VariableStorage;
use crate::types::WasmType;
use crate::Flags;

/// Everything one function body's code generation needs, bundled so each
/// `backend` submodule's functions can take `&mut Codegen` instead of four
/// separate parameters.
pub struct Codegen<'m> {
    /// The operand stack and its condense tree.
    pub stack: Stack,
    /// The register allocator.
    pub regs: RegisterAllocator,
    /// The code buffer.
    pub asm: Assembler,
    /// Module-wide signatures/globals/tables this function may reference.
    pub module: &'m ModuleInfo,
    /// Compile-time switches.
    pub flags: Flags,
}

impl<'m> Codegen<'m> {
    /// Start compiling a function body.
    pub fn new(regs: RegisterAllocator, module: &'m ModuleInfo, flags: Flags) -> Self {
        Codegen {
            stack: Stack::new(),
            regs,
            asm: Assembler::new(),
            module,
            flags,
        }
    }

    /// Select among `candidates`, operating on `lhs`/`rhs`, emitting the
    /// winning instruction and returning where the result landed. Threads
    /// `self.regs`/`self.stack`/`self.asm` through
    /// [`crate::isa::select::select_instr`] via [`AllocatingRegProvider`].
    pub fn select(
        &mut self,
        candidates: &[crate::isa::encoding::AbstrInstr],
        lhs: VariableStorage,
        rhs: VariableStorage,
        dst_ty: WasmType,
        dst_hint: Option<Reg>,
    ) -> Result<VariableStorage, CodegenError> {
        let mut provider = AllocatingRegProvider {
            allocator: &mut self.regs,
            stack: &mut self.stack,
            asm: &mut self.asm,
        };
        let selected = select_instr(candidates, lhs, rhs, dst_ty, dst_hint, &mut provider)?;
        self.asm.instr(selected.word);
        Ok(selected.dst)
    }
}

/// The [`Evaluator`] every condense-tree flush point uses: dispatches each
/// [`CondenseOp`] to [`arith`], [`compare`] or [`memory`]'s emitters.
/// Borrows just the allocator, code buffer and compile-time flags back out
/// of the enclosing [`Codegen`] for the duration of one flush — the
/// condense walk itself supplies the element arena and reference index it's
/// already traversing.
pub struct OpEvaluator<'a> {
    /// Borrowed back in from the enclosing `Codegen` for the duration of
    /// one condense-tree flush.
    pub regs: &'a mut RegisterAllocator,
    /// See above.
    pub asm: &'a mut Assembler,
    /// Needed by `CondenseOp::Load`, which has to decide whether to emit a
    /// bounds check.
    pub flags: &'a Flags,
}

impl<'a> Evaluator for OpEvaluator<'a> {
    fn evaluate(
        &mut self,
        elements: &mut PrimaryMap<StackSlotIndex, StackElement>,
        refs: &mut RefIndex,
        op: CondenseOp,
        ty: WasmType,
        lhs: VariableStorage,
        rhs: Option<VariableStorage>,
    ) -> Result<VariableStorage, CodegenError> {
        if let CondenseOp::Load { offset, narrow_bytes, signed } = op {
            return memory::emit_linear_memory_load(
                self.regs, elements, refs, self.asm, self.flags, ty, narrow_bytes, signed, offset, lhs,
            );
        }
        if op.is_comparison() {
            return compare::emit_comparison(self.regs, elements, refs, self.asm, op, ty, lhs, rhs.expect("comparisons are binary"));
        }
        if op.is_unary() {
            return arith::emit_unary(self.regs, elements, refs, self.asm, op, ty, lhs);
        }
        let rhs = rhs.expect("only comparisons/unary ops omit rhs");
        match op {
            CondenseOp::DivS | CondenseOp::DivU | CondenseOp::RemS | CondenseOp::RemU => {
                let signed = matches!(op, CondenseOp::DivS | CondenseOp::RemS);
                let remainder = matches!(op, CondenseOp::RemS | CondenseOp::RemU);
                arith::emit_checked_div(self.regs, elements, refs, self.asm, ty, signed, remainder, lhs, rhs)
            }
            _ => arith::emit_binary(self.regs, elements, refs, self.asm, op, ty, lhs, rhs),
        }
    }
}
