//! Cross-function branch linking (spec §4.6.10), adapted to this crate's
//! per-function code buffers.
//!
//! The symbolic `RelPatchObj` chain in [`crate::isa::relpatch`] threads a
//! pending branch's displacement field through itself to the next pending
//! branch, which only works within one contiguous, already-allocated
//! buffer: patching a site means writing straight into `code[pos..]`. A
//! call to a Wasm function compiled *before* the caller fits that model
//! directly — both live in the same `Vec<u8>`... except this backend
//! compiles every function into its own [`crate::module_info::FunctionInfo::code`],
//! so "already emitted" and "not yet emitted" callees are never in the
//! same buffer at patch time regardless of compile order.
//!
//! Grounded on `cranelift_codegen::binemit::Reloc`: instead of patching
//! eagerly, a call site records a [`Relocation`] describing what needs to
//! go there, and an external module linker (out of scope for this crate —
//! it owns the layout of the final concatenated binary) walks every
//! function's relocation list once all functions are compiled and patches
//! each site with the now-known target offset.

use crate::module_info::FuncIndex;

/// What a relocation site ultimately resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// A direct call/branch to another Wasm-defined function's entry
    /// point, by module-level index.
    WasmFunction(FuncIndex),
    /// An indirect call through the host-provided import table (the
    /// linker resolves this to whatever address the host registered for
    /// import slot `index`).
    ImportFunction(u32),
    /// The module's generic trap handler (spec §4.6.13) — only needed
    /// when the handler is emitted once and shared, rather than inlined
    /// at every trap site.
    TrapHandler,
}

/// The AArch64 immediate field a relocation patches, mirroring
/// [`crate::isa::relpatch::BranchFieldKind`] but named independently since
/// relocations patch across buffers rather than through a live chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `BL`/`B`'s 26-bit word-granularity PC-relative immediate.
    Branch26,
    /// `B.cond`/`CBZ`/`CBNZ`'s 19-bit word-granularity PC-relative
    /// immediate.
    Branch19,
}

/// One pending cross-function patch: "the instruction at `offset` bytes
/// into this function's code needs its immediate field set once `target`'s
/// final address is known."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the instruction to patch, within the owning
    /// function's [`crate::module_info::FunctionInfo::code`].
    pub offset: u32,
    /// What the encoded immediate should end up pointing at.
    pub target: RelocTarget,
    /// Which immediate field to patch.
    pub kind: RelocKind,
}

impl Relocation {
    /// Record a direct call to `target`'s entry point at `offset`.
    pub fn call(offset: u32, target: FuncIndex) -> Self {
        Relocation {
            offset,
            target: RelocTarget::WasmFunction(target),
            kind: RelocKind::Branch26,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmjit_entity::EntityRef;

    #[test]
    fn call_relocation_targets_branch26() {
        let reloc = Relocation::call(40, FuncIndex::new(3));
        assert_eq!(reloc.kind, RelocKind::Branch26);
        assert_eq!(reloc.target, RelocTarget::WasmFunction(FuncIndex::new(3)));
    }
}
