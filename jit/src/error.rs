//! Compile-time error kinds (spec §7).
//!
//! All other invalid inputs are the frontend validator's responsibility; the
//! core assumes a validated input and uses `debug_assert!` to defend its
//! internal invariants. The kinds below are the only ones a caller is
//! expected to recover from (by rejecting the module) rather than treat as
//! a bug in this crate.

use thiserror::Error;

/// Errors the core can surface while compiling a single function.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    /// The function's stack frame grew past the 24-bit signed immediate
    /// ceiling `setStackFrameSize` can express in a single ADD/SUB pair.
    #[error("stack frame size exceeded the maximum encodable frame size")]
    ReachedMaximumStackFrameSize,

    /// A branch's target fell outside the ±128 MiB range of a `B`/`BL`
    /// imm26, and no applicable peephole (cached trap, `CBZ`/`CBNZ`) could
    /// bring it back in range.
    #[error("branch target is out of the ±128MB range addressable by this ISA")]
    BranchOutOfRange,

    /// More locals were declared than the reference-index arrays (sized at
    /// function entry) can address.
    #[error("function declares more locals than this backend supports")]
    TooManyLocals,

    /// More parameters were declared than the Wasm calling convention's
    /// register/stack assignment can address.
    #[error("function declares more parameters than this backend supports")]
    TooManyParams,

    /// A builtin function (spec §6.6 `BUILTIN_FUNCTIONS`) was named in an
    /// export; builtins are host-internal only.
    #[error("builtin functions cannot be exported")]
    CannotExportBuiltinFunction,

    /// A `call_indirect` table contained a builtin.
    #[error("builtin functions cannot be called indirectly")]
    CannotIndirectlyCallBuiltinFunction,

    /// The frontend requested an operation this backend doesn't implement
    /// (e.g. a SIMD or GC proposal opcode — see spec §1 Non-goals).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// An internal invariant this crate maintains itself (not a property of
    /// the input module) was violated — a condense-tree shape the backend
    /// never expected to see lifted, a control-flow stack underflow, or
    /// similar. Distinct from `NotImplemented`: reaching this means a bug
    /// in this crate, not a missing feature.
    #[error("internal invariant violated: {0}")]
    Verify(&'static str),
}
