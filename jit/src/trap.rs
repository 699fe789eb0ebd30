//! Trap codes (spec §6.3).
//!
//! A trap is a runtime failure signalled by branching to the module's
//! generic trap handler (see `backend::wrappers`) with a code loaded into
//! `w0`. Trap codes are not compile-time errors — see [`crate::error`] for
//! those — they're data baked into emitted machine code.

/// Fixed enumeration of trap reasons the generated code can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapCode {
    /// Trap code already loaded into `w0`; used when re-branching into a
    /// cached trap sequence that set the code earlier in the function.
    None = 0,
    /// Integer division or remainder by zero.
    DivZero = 1,
    /// Signed division overflow (`INT_MIN / -1`).
    DivOverflow = 2,
    /// A probed stack-fence check found the frame had grown past the guard.
    StackFenceBreached = 3,
    /// Float-to-int truncation source was out of the target integer's range.
    TruncOverflow = 4,
    /// `call_indirect` table index was out of bounds.
    IndirectCallOutOfBounds = 5,
    /// `call_indirect` table entry's type id didn't match the call site's.
    IndirectCallWrongSig = 6,
    /// `call_indirect` table entry has no linked function (null entry).
    CalledFunctionNotLinked = 7,
    /// Linear-memory access address + size exceeded the memory's bound.
    LinMemOutOfBoundsAccess = 8,
    /// `memory.grow` extension-request trampoline failed to extend.
    LinMemCouldNotExtend = 9,
    /// A builtin function trapped (spec §6.6 `BUILTIN_FUNCTIONS`).
    BuiltinTrap = 10,
    /// The host's memory-extension mutex/lock protocol was violated.
    LinkedMemoryMux = 11,
    /// Wasm's `unreachable` instruction executed.
    Unreachable = 12,
}

impl TrapCode {
    /// The `w0` immediate value the generic trap handler expects.
    pub fn code(self) -> u32 {
        self as u32
    }
}
