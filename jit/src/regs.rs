//! Register enumeration and the `RegMask` bit set (spec §3.2).
//!
//! Grounded on `cranelift_codegen::regalloc::register_set::RegisterSet`
//! (bit-vector-of-units set with `take`/`free`/`iter`) and
//! `cranelift_codegen::isa::registers` (the typed register-class table);
//! adapted to AArch64's flat 31-GPR/32-FPR register files (no sub-register
//! aliasing to model, unlike x86's `rax`/`eax`/`al`), and to the specific
//! reserved/scratch/parameter partitioning spec §3.2 requires.

use std::fmt;

/// One AArch64 register: a general-purpose register, a floating-point
/// register, or one of the three architectural specials. `NONE` stands in
/// for "no register" the way a null pointer would in the teacher's C++
/// source; carrying it as an enum variant instead of `Option<Reg>` keeps
/// `Reg` a plain `Copy` value usable directly as a template bitfield input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// `x0`..`x30`, addressed through the backend's allocation order rather
    /// than raw AArch64 encoding number; see [`Registers::gpr`].
    Gpr(u8),
    /// `v0`..`v31` (used in scalar `d`/`s` form throughout this backend).
    Fpr(u8),
    /// Stack pointer (`sp`).
    Sp,
    /// Link register (`x30`, named separately since it's never allocated).
    Lr,
    /// Zero register (`xzr`/`wzr`).
    Zr,
    /// Sentinel: "no register".
    None,
}

impl Reg {
    /// The raw AArch64 encoding number (0..=31) for this register, where
    /// applicable. `Sp`/`Zr` share encoding 31 (disambiguated by
    /// instruction context, same as the real ISA); `None` has no encoding.
    pub fn encoding(self) -> Option<u8> {
        match self {
            Reg::Gpr(n) => Some(n),
            Reg::Fpr(n) => Some(n),
            Reg::Sp | Reg::Zr => Some(31),
            Reg::Lr => Some(30),
            Reg::None => None,
        }
    }

    /// Is this a general-purpose (integer) register, including `Sp`/`Lr`/`Zr`?
    pub fn is_gpr_class(self) -> bool {
        matches!(self, Reg::Gpr(_) | Reg::Sp | Reg::Lr | Reg::Zr)
    }

    /// Is this a floating-point register?
    pub fn is_fpr(self) -> bool {
        matches!(self, Reg::Fpr(_))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Gpr(n) => write!(f, "x{n}"),
            Reg::Fpr(n) => write!(f, "v{n}"),
            Reg::Sp => write!(f, "sp"),
            Reg::Lr => write!(f, "lr"),
            Reg::Zr => write!(f, "xzr"),
            Reg::None => write!(f, "<none>"),
        }
    }
}

/// The two dedicated GPRs that never appear in [`Registers::gpr`], plus the
/// optional cached-memory-size register (spec §3.2 paragraph 2).
#[derive(Debug, Clone, Copy)]
pub struct DedicatedRegs {
    /// Base pointer of the Wasm linear memory.
    pub lin_mem: Reg,
    /// Base pointer of the job memory (module-private scratch area).
    pub job_mem: Reg,
    /// Optional cache of `linear_memory_byte_size - 8`, used to fast-path
    /// bounds checks (spec §4.6.14). `Reg::None` when not cached.
    pub mem_size: Reg,
}

/// The allocation-ordered register files (spec §3.2).
///
/// `gpr`/`fpr` are ordered: globals, then locals, then Wasm-ABI parameter
/// registers, then general scratch, then a fixed tail of permanently
/// reserved scratch registers (at least 5, per spec). The native return
/// register is guaranteed to be among that reserved tail.
#[derive(Debug, Clone)]
pub struct Registers {
    /// Allocatable GPRs, in allocation order. Does not include `lin_mem`,
    /// `job_mem`, `sp`, `lr`, or `zr`.
    pub gpr: Vec<Reg>,
    /// Allocatable FPRs, in allocation order.
    pub fpr: Vec<Reg>,
    /// Index into `gpr`/`fpr` (conceptually; see [`RegisterLayout`]) where
    /// the permanently-reserved scratch tail begins.
    pub reserved_scratch_start: usize,
    /// Dedicated, never-allocated registers.
    pub dedicated: DedicatedRegs,
}

/// Describes how many of `gpr`/`fpr`'s leading entries are consumed by
/// globals, how many more by register-resident locals, and how many more by
/// Wasm-ABI parameters — the rest, up to `reserved_scratch_start`, are
/// general scratch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterLayout {
    /// Count of globals assigned a dedicated register of this class.
    pub globals: usize,
    /// Count of locals assigned a dedicated register of this class.
    pub locals: usize,
    /// Count of Wasm-ABI parameter registers of this class.
    pub params: usize,
}

impl Registers {
    /// Build the standard AArch64 allocation order: `x19`..`x28` (callee-
    /// saved, usable for globals/locals), `x0`..`x7` (parameter registers,
    /// reused as scratch once arguments have been consumed), `x9`..`x15`
    /// (caller-saved scratch), and a reserved tail `x16,x17,x8,x0,x1` — `x0`
    /// doubles as the native return register and therefore must be among
    /// the reserved tail per spec §3.2(a). `x18` (platform register on
    /// Apple targets), `x29` (frame pointer), `x30` (`Lr`), and `sp` never
    /// appear here.
    pub fn new_aarch64() -> Self {
        let mut gpr = Vec::new();
        // Callee-saved: globals/locals live here so calls don't need to
        // reload them.
        for n in 19..=28 {
            gpr.push(Reg::Gpr(n));
        }
        // Wasm-ABI parameter registers, reusable as scratch after the
        // prologue copies them into their home storage.
        for n in 2..=7 {
            gpr.push(Reg::Gpr(n));
        }
        // General scratch.
        for n in 9..=15 {
            gpr.push(Reg::Gpr(n));
        }
        let reserved_scratch_start = gpr.len();
        // Permanently reserved scratch tail (>= 5 entries); x0 is last so
        // it is always available as the native return register.
        gpr.push(Reg::Gpr(16));
        gpr.push(Reg::Gpr(17));
        gpr.push(Reg::Gpr(8));
        gpr.push(Reg::Gpr(1));
        gpr.push(Reg::Gpr(0));

        let mut fpr = Vec::new();
        for n in 8..=15 {
            fpr.push(Reg::Fpr(n));
        }
        for n in 16..=31 {
            fpr.push(Reg::Fpr(n));
        }
        let fpr_reserved_start = fpr.len() - 5;

        debug_assert!(gpr.len() - reserved_scratch_start >= 5);
        debug_assert!(fpr.len() - fpr_reserved_start >= 5);
        let _ = fpr_reserved_start;

        Registers {
            gpr,
            fpr,
            reserved_scratch_start,
            // `x18` is the platform register on Apple targets and is never
            // allocated on any target for portability; `x29` is the frame
            // pointer our prologue never needs for unwinding since this
            // backend keeps its own stack-trace chain (spec §4.6.9 step 4)
            // rather than relying on frame-pointer walking. Both are free
            // for the two dedicated pointers spec §3.2 requires.
            dedicated: DedicatedRegs {
                lin_mem: Reg::Gpr(18),
                job_mem: Reg::Gpr(29),
                mem_size: Reg::None,
            },
        }
    }

    /// Opt a cached linear-memory-size register into `dedicated.mem_size`,
    /// using `x22`'s slot reassigned from general scratch — callers that
    /// enable `LINEAR_MEMORY_BOUNDS_CHECKS` fast-pathing call this once at
    /// module-info construction time.
    pub fn with_cached_mem_size(mut self, reg: Reg) -> Self {
        self.gpr.retain(|&r| r != reg);
        self.dedicated.mem_size = reg;
        self
    }

    /// How many of `gpr`'s leading entries ([`Self::new_aarch64`]'s
    /// callee-saved `x19..=x28` block) are available to globals and
    /// register-resident locals combined.
    pub fn gpr_local_capacity(&self) -> usize {
        10
    }

    /// As [`Self::gpr_local_capacity`], for `fpr` (the callee-saved
    /// `v8..=v15` block).
    pub fn fpr_local_capacity(&self) -> usize {
        8
    }
}

/// Fixed-width bit set over all registers.
///
/// Stores GPRs in the low 32 bits and FPRs in the next 32 bits of a single
/// `u64`, which is enough for AArch64's 31 GPRs + 32 FPRs; ground truth for
/// the union/subtract/membership operations is
/// `cranelift_codegen::regalloc::register_set::RegisterSet`, simplified
/// here because AArch64 has no register-unit aliasing to account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegMask(u64);

const FPR_SHIFT: u32 = 32;

impl RegMask {
    /// The empty mask.
    pub fn none() -> Self {
        RegMask(0)
    }

    /// The mask containing every GPR `x0..=x30` and every FPR `v0..=v31`.
    pub fn all() -> Self {
        RegMask(0xFFFF_FFFF_FFFF_FFFF)
    }

    /// A mask containing just `reg` (a no-op for `Reg::None`/`Sp`/`Lr`/`Zr`,
    /// which this mask doesn't track — only allocatable `Gpr`/`Fpr` values).
    pub fn singleton(reg: Reg) -> Self {
        match reg {
            Reg::Gpr(n) if n < 31 => RegMask(1u64 << n),
            Reg::Fpr(n) if n < 32 => RegMask(1u64 << (FPR_SHIFT + n as u32)),
            _ => RegMask::none(),
        }
    }

    /// Union of two masks.
    pub fn union(self, other: RegMask) -> RegMask {
        RegMask(self.0 | other.0)
    }

    /// `self` with every bit of `other` cleared.
    pub fn subtract(self, other: RegMask) -> RegMask {
        RegMask(self.0 & !other.0)
    }

    /// Intersection of two masks.
    pub fn intersect(self, other: RegMask) -> RegMask {
        RegMask(self.0 & other.0)
    }

    /// Is `reg` a member of this mask? `Reg::None`/`Sp`/`Lr`/`Zr` are never
    /// members since this mask only tracks allocatable `Gpr`/`Fpr` values.
    pub fn contains(self, reg: Reg) -> bool {
        !self.intersect(RegMask::singleton(reg)).is_empty()
    }

    /// Number of registers set in this mask.
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Is this mask empty?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_union_subtract() {
        let a = RegMask::singleton(Reg::Gpr(3));
        let b = RegMask::singleton(Reg::Gpr(9));
        let u = a.union(b);
        assert!(u.contains(Reg::Gpr(3)));
        assert!(u.contains(Reg::Gpr(9)));
        assert_eq!(u.count(), 2);
        let s = u.subtract(a);
        assert!(!s.contains(Reg::Gpr(3)));
        assert!(s.contains(Reg::Gpr(9)));
    }

    #[test]
    fn fpr_and_gpr_do_not_alias() {
        let g = RegMask::singleton(Reg::Gpr(0));
        let f = RegMask::singleton(Reg::Fpr(0));
        assert!(g.intersect(f).is_empty());
    }

    #[test]
    fn all_and_none() {
        assert!(RegMask::none().is_empty());
        assert!(!RegMask::all().is_empty());
        assert_eq!(RegMask::all().count(), 64);
    }

    #[test]
    fn allocation_order_reserves_tail() {
        let regs = Registers::new_aarch64();
        assert!(regs.gpr.len() - regs.reserved_scratch_start >= 5);
        assert_eq!(regs.gpr[regs.gpr.len() - 1], Reg::Gpr(0));
    }
}
