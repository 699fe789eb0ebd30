//! Structured control flow (spec §4.6.6/§4.6.7/§4.6.11): `block`/`loop`/
//! `if`/`else`/`end`, `br`/`br_if`, and `br_table`.
//!
//! A [`ControlFrame`] is pushed for every `block`/`loop`/`if` the frontend
//! decodes and popped on its matching `end`. Forward targets (`Block`,
//! `IfBlock`) thread their pending branches through a
//! [`crate::isa::relpatch::RelPatchObj`] exactly the way any other
//! not-yet-known label does; `Loop`'s target is the loop header itself, so
//! it is resolved immediately on entry and backward branches compute their
//! displacement directly.

use crate::cond::BranchCondition;
use crate::error::CodegenError;
use crate::isa::assembler::Assembler;
use crate::isa::builder::InstrBuilder;
use crate::isa::encoding::templates;
use crate::isa::relpatch::RelPatchObj;
use crate::module_info::Signature;
use crate::regs::Reg;

/// What kind of structured-control construct a [`ControlFrame`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `block ... end`: forward-only target, resolved at `end`.
    Block,
    /// `loop ... end`: backward target, resolved at entry.
    Loop,
    /// `if ... else ... end`: forward-only target at `end`; `else` rewires
    /// the live pending target from "skip to end" to "skip to else" by
    /// swapping in a fresh [`RelPatchObj`] for the remainder of the `then`
    /// arm.
    IfBlock,
}

/// One nested level of structured control flow, live between its opening
/// instruction and matching `end` (spec §4.6.11).
#[derive(Debug)]
pub struct ControlFrame {
    /// Which construct this frame is.
    pub kind: BlockKind,
    /// The block's declared parameter/result types.
    pub signature: Signature,
    /// The symbolic stack-frame size in effect when this block was entered;
    /// every branch to this frame's target must first restore the frame to
    /// this size (spec §4.6.6).
    pub entry_frame_size: u32,
    /// Forward branch target (`Block`/`IfBlock`'s `end`); left unresolved
    /// until `finalize`. Unused for `Loop`.
    pub pending_branches: RelPatchObj,
    /// Backward branch target (`Loop`'s header), resolved at push time.
    pub loop_header: Option<RelPatchObj>,
}

/// The nested stack of live control frames for one function body.
#[derive(Debug, Default)]
pub struct BlockStack {
    frames: Vec<ControlFrame>,
}

impl BlockStack {
    /// An empty block stack, as at function entry.
    pub fn new() -> Self {
        BlockStack::default()
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a `block` frame.
    pub fn push_block(&mut self, signature: Signature, entry_frame_size: u32) {
        self.frames.push(ControlFrame {
            kind: BlockKind::Block,
            signature,
            entry_frame_size,
            pending_branches: RelPatchObj::new(),
            loop_header: None,
        });
    }

    /// Push an `if` frame.
    pub fn push_if(&mut self, signature: Signature, entry_frame_size: u32) {
        self.frames.push(ControlFrame {
            kind: BlockKind::IfBlock,
            signature,
            entry_frame_size,
            pending_branches: RelPatchObj::new(),
            loop_header: None,
        });
    }

    /// Push a `loop` frame, resolving its backward target to the current
    /// assembler position immediately.
    pub fn push_loop(&mut self, asm: &mut Assembler, signature: Signature, entry_frame_size: u32) {
        let mut header = RelPatchObj::new();
        asm.link_label_here(&mut header);
        self.frames.push(ControlFrame {
            kind: BlockKind::Loop,
            signature,
            entry_frame_size,
            pending_branches: RelPatchObj::new(),
            loop_header: Some(header),
        });
    }

    /// Borrow the frame `depth_from_top` levels down (`0` is the innermost
    /// currently-open frame) — what `br`/`br_if` with that label depth
    /// target.
    pub fn frame(&mut self, depth_from_top: usize) -> Option<&mut ControlFrame> {
        let len = self.frames.len();
        if depth_from_top >= len {
            return None;
        }
        Some(&mut self.frames[len - 1 - depth_from_top])
    }

    /// Pop and finalize the innermost frame at its matching `end`: patch
    /// every pending forward branch to the current position and report the
    /// frame size to restore.
    pub fn finalize(&mut self, asm: &mut Assembler) -> Option<u32> {
        let mut frame = self.frames.pop()?;
        asm.link_label_here(&mut frame.pending_branches);
        Some(frame.entry_frame_size)
    }
}

/// `br`/`br_if` (spec §4.6.6): branch to the block `depth_from_top` levels
/// up. `cond`, when present, is the already-materialized branch condition
/// (`None` means unconditional). Adjusts the live stack-frame size to the
/// target's entry size before branching, so the callee never observes a
/// frame larger than it expects.
pub fn emit_branch(
    asm: &mut Assembler,
    blocks: &mut BlockStack,
    current_frame_size: u32,
    depth_from_top: usize,
    cond: Option<BranchCondition>,
    scratch: Reg,
) -> Result<(), CodegenError> {
    let frame = blocks.frame(depth_from_top).ok_or(CodegenError::Verify("br depth exceeds open block nesting"))?;
    let target_frame_size = frame.entry_frame_size;
    let is_loop = frame.kind == BlockKind::Loop;

    if target_frame_size == current_frame_size {
        emit_branch_to_frame(asm, blocks, depth_from_top, cond, is_loop);
        return Ok(());
    }

    // Frame sizes differ: branching must first restore SP to the target's
    // entry size. An unconditional branch can do that inline; a
    // conditional one has to skip the adjustment + branch pair when the
    // condition doesn't hold, since the adjustment must not happen on the
    // fallthrough path.
    let diff = target_frame_size as i64 - current_frame_size as i64;
    match cond {
        None => {
            asm.add_imm_to_reg(Reg::Sp, Reg::Sp, diff, true, scratch);
            emit_branch_to_frame(asm, blocks, depth_from_top, None, is_loop);
        }
        Some(c) => {
            // `B.!cond` over exactly the adjustment + unconditional branch,
            // since the adjustment must not run on the fallthrough path.
            let mut skip = RelPatchObj::new();
            asm.prepare_jmp_cond(&mut skip, c.negate().to_aarch64_cc());
            asm.add_imm_to_reg(Reg::Sp, Reg::Sp, diff, true, scratch);
            emit_branch_to_frame(asm, blocks, depth_from_top, None, is_loop);
            asm.link_label_here(&mut skip);
        }
    }
    Ok(())
}

fn emit_branch_to_frame(asm: &mut Assembler, blocks: &mut BlockStack, depth_from_top: usize, cond: Option<BranchCondition>, is_loop: bool) {
    let frame = blocks.frame(depth_from_top).expect("depth already validated by caller");
    match (is_loop, cond) {
        (true, None) => {
            let header = frame.loop_header.as_mut().expect("loop frame always has a header");
            asm.prepare_jmp(header);
        }
        (true, Some(c)) => {
            let header = frame.loop_header.as_mut().expect("loop frame always has a header");
            asm.prepare_jmp_cond(header, c.to_aarch64_cc());
        }
        (false, None) => {
            asm.prepare_jmp(&mut frame.pending_branches);
        }
        (false, Some(c)) => {
            asm.prepare_jmp_cond(&mut frame.pending_branches, c.to_aarch64_cc());
        }
    }
}

/// `br_table` (spec §4.6.7): branch to `targets[index]`, or `default` when
/// `index` is out of range. Lowered as a linear `CMP`/`B.eq` chain ending in
/// an unconditional branch to `default` — simpler to get right than a
/// computed jump table, at the cost of `O(targets.len())` comparisons on
/// the taken path; most `br_table`s in practice carry only a handful of
/// arms (dense `match`/`switch` lowering), where the difference is noise.
pub fn emit_table_branch(
    asm: &mut Assembler,
    blocks: &mut BlockStack,
    current_frame_size: u32,
    index_reg: Reg,
    targets: &[usize],
    default: usize,
    scratch: Reg,
) -> Result<(), CodegenError> {
    let eq = BranchCondition::from_comparison(crate::stack::element::CondenseOp::CmpEq, crate::types::WasmType::I32)
        .expect("CmpEq is always a valid comparison");
    for (i, &depth) in targets.iter().enumerate() {
        asm.instr(
            InstrBuilder::new(templates::CMP_IMM32)
                .set_n(index_reg)
                .set_imm12(i as u16)
                .finish(),
        );
        emit_branch(asm, blocks, current_frame_size, depth, Some(eq), scratch)?;
    }
    emit_branch(asm, blocks, current_frame_size, default, None, scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WasmType;

    fn sig() -> Signature {
        Signature { params: vec![], results: vec![WasmType::I32] }
    }

    #[test]
    fn loop_header_resolves_immediately() {
        let mut asm = Assembler::new();
        let mut blocks = BlockStack::new();
        blocks.push_loop(&mut asm, sig(), 0);
        assert!(blocks.frame(0).unwrap().loop_header.as_ref().unwrap().is_resolved());
    }

    #[test]
    fn block_target_resolves_at_finalize() {
        let mut asm = Assembler::new();
        let mut blocks = BlockStack::new();
        blocks.push_block(sig(), 0);
        assert!(!blocks.frame(0).unwrap().pending_branches.is_resolved());
        blocks.finalize(&mut asm);
    }

    #[test]
    fn unconditional_branch_to_same_frame_size_patches_forward() {
        let mut asm = Assembler::new();
        let mut blocks = BlockStack::new();
        blocks.push_block(sig(), 16);
        emit_branch(&mut asm, &mut blocks, 16, 0, None, Reg::Gpr(9)).unwrap();
        assert_eq!(asm.code().len(), 4);
        let restored = blocks.finalize(&mut asm);
        assert_eq!(restored, Some(16));
    }

    #[test]
    fn branch_to_loop_header_goes_backward() {
        let mut asm = Assembler::new();
        let mut blocks = BlockStack::new();
        blocks.push_loop(&mut asm, sig(), 0);
        asm.instr(0); // loop body filler
        emit_branch(&mut asm, &mut blocks, 0, 0, None, Reg::Gpr(9)).unwrap();
        let word = u32::from_le_bytes(asm.code()[4..8].try_into().unwrap());
        assert_eq!(word & 0x03FF_FFFF, (-1i32 as u32) & 0x03FF_FFFF);
    }

    #[test]
    fn branch_past_open_nesting_errs() {
        let mut asm = Assembler::new();
        let mut blocks = BlockStack::new();
        assert!(emit_branch(&mut asm, &mut blocks, 0, 0, None, Reg::Gpr(9)).is_err());
    }
}
