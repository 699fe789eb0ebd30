//! Fixed job-memory offsets (spec §6.4): a handful of well-known byte
//! positions, relative to the *top* (high end) of job memory, that the
//! compiled code and the host runtime both agree on out-of-band. None of
//! these are part of this crate's public ABI in the sense of being
//! negotiated at compile time — they're baked-in constants the way
//! `cranelift_wasm`'s `VMContext` field offsets are, just counted from the
//! end of the region rather than the start, since job memory grows
//! upward from compiler-assigned global/table offsets while these fixed
//! host-cooperation slots live at the far end regardless of how many
//! globals a given module declares.
//!
//! Every offset here is negative relative to the job-memory base register
//! (`Registers::dedicated().job_mem`), since the fixed block sits *above*
//! the base in the negative-offset sense used throughout this backend:
//! `LDUR`/`STUR` with one of these constants reaches into it directly.

/// Byte width of one job-memory "from-end" slot. Pointers and lengths are
/// all native-word (64-bit) sized; nothing in this fixed block is narrower.
pub const SLOT_BYTES: i32 = 8;

/// A fixed, host-agreed offset from the end of job memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FromEnd(i32);

impl FromEnd {
    const fn nth(index: i32) -> Self {
        FromEnd(-(index + 1) * SLOT_BYTES)
    }

    /// The byte displacement to use in an `LDUR`/`STUR` off the job-memory
    /// base register (always `<= 0`).
    pub fn offset(self) -> i32 {
        self.0
    }
}

/// Pointer to the most recently pushed stack-trace frame ([`FunctionInfo`](
/// crate::module_info::FunctionInfo) call-bookkeeping entry), or null at
/// the top level. Walked by the stack-trace collector after a trap.
pub const LAST_FRAME_REF_PTR: FromEnd = FromEnd::nth(0);

/// Base address of the linked (host-allocated) linear-memory buffer.
pub const LINKED_MEMORY_PTR: FromEnd = FromEnd::nth(1);

/// Current length, in bytes, of the linked linear-memory buffer.
pub const LINKED_MEMORY_LEN: FromEnd = FromEnd::nth(2);

/// The module's declared linear-memory page size, in Wasm pages (64 KiB
/// units) — used by `memory.size`/`memory.grow`.
pub const LINEAR_MEMORY_PAGE_COUNT: FromEnd = FromEnd::nth(3);

/// Current actual byte size of linear memory (mirrors
/// [`LINKED_MEMORY_LEN`] but addressed separately since bounds checks read
/// it far more often than anything touches the buffer pointer itself).
pub const LINEAR_MEMORY_BYTE_SIZE: FromEnd = FromEnd::nth(4);

/// Address the active-stack-overflow-check compares the current `sp`
/// against.
pub const STACK_FENCE_ADDRESS: FromEnd = FromEnd::nth(5);

/// `sp` to restore when a trap fires, so the trap handler runs on a known-
/// good stack rather than wherever execution happened to fault.
pub const TRAP_REENTRY_SP: FromEnd = FromEnd::nth(6);

/// Host-provided trap handler entry point.
pub const TRAP_HANDLER_ADDRESS: FromEnd = FromEnd::nth(7);

/// Host-provided helper function pointer for memory operations this
/// backend doesn't inline (e.g. `memory.grow`'s reallocation).
pub const MEMORY_HELPER_PTR: FromEnd = FromEnd::nth(8);

/// Base address of the active `call_indirect` table.
pub const TABLE_BASE_ADDRESS: FromEnd = FromEnd::nth(9);

/// Base address of this module's compiled-code binary, used by relocation
/// resolution and by `call_indirect`'s signature/target validation.
pub const BINARY_MODULE_BASE: FromEnd = FromEnd::nth(10);

/// Target address the landing-pad trampoline invokes (only meaningful
/// when bounds-checking is disabled, spec §4.6.13).
pub const LANDING_PAD_TARGET: FromEnd = FromEnd::nth(11);

/// Return address the landing-pad trampoline resumes at.
pub const LANDING_PAD_RET: FromEnd = FromEnd::nth(12);

/// Total byte size of the fixed from-end block, i.e. where
/// compiler-assigned global/table job-memory offsets must stop growing
/// before they collide with this block.
pub const FIXED_BLOCK_BYTES: i32 = 13 * SLOT_BYTES;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_packed_without_gaps() {
        assert_eq!(LAST_FRAME_REF_PTR.offset(), -8);
        assert_eq!(LINKED_MEMORY_PTR.offset(), -16);
        assert_eq!(LANDING_PAD_RET.offset(), -(FIXED_BLOCK_BYTES as i32));
    }

    #[test]
    fn every_offset_is_nonpositive() {
        for offset in [
            LAST_FRAME_REF_PTR,
            LINKED_MEMORY_PTR,
            LINKED_MEMORY_LEN,
            LINEAR_MEMORY_PAGE_COUNT,
            LINEAR_MEMORY_BYTE_SIZE,
            STACK_FENCE_ADDRESS,
            TRAP_REENTRY_SP,
            TRAP_HANDLER_ADDRESS,
            MEMORY_HELPER_PTR,
            TABLE_BASE_ADDRESS,
            BINARY_MODULE_BASE,
            LANDING_PAD_TARGET,
            LANDING_PAD_RET,
        ] {
            assert!(offset.offset() <= 0);
        }
    }
}
