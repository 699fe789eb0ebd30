//! Compile-time configuration (spec §6.6).
//!
//! Mirrors `cranelift_codegen::settings` in spirit — a small, explicitly
//! constructed settings object threaded through the backend — but scoped to
//! exactly the switches this spec names, rather than a general flag DSL.

/// The native ABI variant in effect for import call sites (spec §9,
/// "Platform divergence"). Exposed as an enum rather than `#[cfg(target_os)]`
/// conditionals scattered through the call-argument packing code, per the
/// Design Notes' recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Standard AAPCS64: stack arguments are rounded up to 8-byte slots.
    Aapcs64,
    /// Apple's AArch64 ABI: stack arguments are packed at their natural
    /// (possibly sub-8-byte) size, and X18 is reserved (never allocated by
    /// this crate's register allocator regardless of platform, since it is
    /// excluded from `Registers::gpr` at construction time — see
    /// [`crate::regs`]).
    AppleAarch64,
}

/// Compile-time switches threaded through a single function's compilation.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    /// `LINEAR_MEMORY_BOUNDS_CHECKS`: emit explicit bounds checks before
    /// every linear-memory access rather than relying on guard pages.
    pub linear_memory_bounds_checks: bool,
    /// `ACTIVE_STACK_OVERFLOW_CHECK`: emit a stack-fence check whenever the
    /// frame grows (see `services::find_free_temp_stack_slot`).
    pub active_stack_overflow_check: bool,
    /// `INTERRUPTION_REQUEST`: poll an interruption flag after every call.
    pub interruption_request: bool,
    /// `BUILTIN_FUNCTIONS`: allow calls to host builtins.
    pub builtin_functions: bool,
    /// `ENABLE_EXTENSIONS`: emit the extension-request trampoline (vs. the
    /// landing pad) at the top of the module.
    pub enable_extensions: bool,
    /// `EAGER_ALLOCATION`: reserve the full declared linear-memory maximum
    /// up front instead of growing lazily.
    pub eager_allocation: bool,
    /// Debug mode: zero-initialize stack-resident locals at entry and load
    /// the bytecode-position register before every trap.
    pub debug_assertions: bool,
    /// `MAX_WASM_STACKSIZE_BEFORE_NATIVE_CALL`.
    pub max_wasm_stack_before_native_call: u32,
    /// `STACKSIZE_LEFT_BEFORE_NATIVE_CALL`.
    pub stack_left_before_native_call: u32,
    /// Target ABI variant for import call sites.
    pub platform: Platform,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            linear_memory_bounds_checks: true,
            active_stack_overflow_check: true,
            interruption_request: false,
            builtin_functions: false,
            enable_extensions: true,
            eager_allocation: false,
            debug_assertions: cfg!(debug_assertions),
            max_wasm_stack_before_native_call: 1 << 20,
            stack_left_before_native_call: 1 << 16,
            platform: Platform::Aapcs64,
        }
    }
}

impl Flags {
    /// A `Flags` builder seeded with the defaults, for tests that only want
    /// to flip one switch.
    pub fn builder() -> Self {
        Self::default()
    }
}
