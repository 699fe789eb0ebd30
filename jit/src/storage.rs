//! `VariableStorage` (spec §3.3).

use crate::regs::Reg;
use crate::types::WasmType;

/// Where a single Wasm-level value currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageKind {
    /// Absence of a storage.
    Invalid,
    /// An inline constant value; `bits` holds the type's bit pattern
    /// (sign/zero-extended to 64 bits for integers, raw IEEE bits for
    /// floats).
    Constant(u64),
    /// A concrete register.
    Register(Reg),
    /// Offset (in bytes, from the current stack frame's top) into the
    /// function's stack frame — either a home slot for a stack-resident
    /// local, or a temp-stack spill slot.
    StackMemory(i32),
    /// Offset (in bytes) into job memory — globals, tables, and
    /// module-wide bookkeeping.
    LinkData(i32),
    /// A local that is conceptually in both its home slot and its
    /// dedicated register across a branch-join point (spec §3.3). Reads
    /// use `reg`; pending writes eventually flush to `slot_offset`.
    StackReg { reg: Reg, slot_offset: i32 },
}

/// `(machine-type, storage-kind, location)` triple (spec §3.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariableStorage {
    /// The Wasm type of the value held at this storage.
    pub ty: WasmType,
    /// Where the value lives.
    pub kind: StorageKind,
}

impl VariableStorage {
    /// The canonical "nothing here" storage.
    pub const INVALID: VariableStorage = VariableStorage {
        ty: WasmType::Invalid,
        kind: StorageKind::Invalid,
    };

    /// Build a register storage.
    pub fn reg(ty: WasmType, reg: Reg) -> Self {
        VariableStorage {
            ty,
            kind: StorageKind::Register(reg),
        }
    }

    /// Build a constant storage.
    pub fn constant(ty: WasmType, bits: u64) -> Self {
        VariableStorage {
            ty,
            kind: StorageKind::Constant(bits),
        }
    }

    /// Build a stack-memory storage.
    pub fn stack(ty: WasmType, offset: i32) -> Self {
        VariableStorage {
            ty,
            kind: StorageKind::StackMemory(offset),
        }
    }

    /// Build a link-data (job memory) storage.
    pub fn link_data(ty: WasmType, offset: i32) -> Self {
        VariableStorage {
            ty,
            kind: StorageKind::LinkData(offset),
        }
    }

    /// Is this storage absent?
    pub fn is_invalid(&self) -> bool {
        matches!(self.kind, StorageKind::Invalid)
    }

    /// The concrete register backing this storage, if it is `Register` or
    /// `StackReg` (both have a register a reader can use directly).
    pub fn register(&self) -> Option<Reg> {
        match self.kind {
            StorageKind::Register(r) => Some(r),
            StorageKind::StackReg { reg, .. } => Some(reg),
            _ => None,
        }
    }

    /// Is this storage a pre-lifted operand form — i.e. not `StackMemory`/
    /// `LinkData`, which `selectInstr` must lift to a register before any
    /// arithmetic instruction can reference it (spec §4.4 step 1)?
    pub fn is_directly_encodable(&self) -> bool {
        !matches!(
            self.kind,
            StorageKind::StackMemory(_) | StorageKind::LinkData(_)
        )
    }
}

/// Storage equality tests both kind and payload: registers by identity,
/// memory by offset, constants by bit-pattern (spec §3.3). `PartialEq` on
/// `VariableStorage` already does exactly this since every `StorageKind`
/// variant's payload is itself `PartialEq`-by-value; this free function
/// exists only to give the spec's named operation a named call site.
pub fn storage_eq(a: &VariableStorage, b: &VariableStorage) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_kind_and_payload() {
        let a = VariableStorage::stack(WasmType::I32, 16);
        let b = VariableStorage::stack(WasmType::I32, 16);
        let c = VariableStorage::stack(WasmType::I32, 24);
        assert!(storage_eq(&a, &b));
        assert!(!storage_eq(&a, &c));
    }

    #[test]
    fn register_extracts_from_stack_reg_too() {
        let v = VariableStorage {
            ty: WasmType::I32,
            kind: StorageKind::StackReg {
                reg: Reg::Gpr(19),
                slot_offset: 8,
            },
        };
        assert_eq!(v.register(), Some(Reg::Gpr(19)));
    }
}
