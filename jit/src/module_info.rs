//! Whole-module and per-function bookkeeping (spec component C5, §3.8–3.9):
//! the signature table, local/global declarations, each function's stack-
//! frame accounting, and the trap/stack-trace tables the runtime consults
//! after a fault. Grounded on `cranelift_wasm`'s `ModuleEnvironment`-style
//! split between compile-time-known module shape and the per-function
//! compiled artifact, simplified to what a single-pass backend actually
//! needs to retain (no separate "translation" vs. "compilation" phase).

use wasmjit_entity::{entity_impl, EntityRef, PrimaryMap};

use crate::reloc::Relocation;
use crate::trap::TrapCode;
use crate::types::WasmType;

/// Index of a function, in module declaration order (imports first).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a global.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex);

/// Index of a table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableIndex(u32);
entity_impl!(TableIndex);

/// Index of a linear memory (Wasm MVP allows exactly one, but the type is
/// kept general the way the teacher's own module tables are).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryIndex(u32);
entity_impl!(MemoryIndex);

/// Index of a function signature (distinct functions may share one).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureIndex(u32);
entity_impl!(SignatureIndex);

/// A function's parameter and result types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types, in argument order.
    pub params: Vec<WasmType>,
    /// Result types. Wasm's MVP allows at most one; later proposals allow
    /// more, so this is a `Vec` rather than `Option<WasmType>`.
    pub results: Vec<WasmType>,
}

/// A declared global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalInfo {
    /// The global's value type.
    pub ty: WasmType,
    /// Can this global be written after initialization?
    pub mutable: bool,
    /// Byte offset of this global's storage within job memory.
    pub job_mem_offset: i32,
}

/// A declared table (only `funcref` tables matter to this backend: call_indirect
/// dispatch targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    /// Minimum element count.
    pub minimum: u32,
    /// Maximum element count, if bounded.
    pub maximum: Option<u32>,
}

/// The module's single linear memory, if declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Minimum size, in 64 KiB pages.
    pub minimum_pages: u32,
    /// Maximum size, in 64 KiB pages, if bounded.
    pub maximum_pages: Option<u32>,
}

/// One entry in a function's stack-trace table: the code offset a trap at
/// this point in the function would report, paired with the trap reason
/// baked into the `BRK` immediate at that site (spec §4.6.13/§6.3). Walked
/// by the runtime's signal handler, terminated either by running off the
/// end of the table or by a zero-offset sentinel entry — whichever the
/// runtime's fixed-size buffer hits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTraceEntry {
    /// Byte offset into this function's code.
    pub code_offset: u32,
    /// The trap reason, if this site can trap (landing pads record
    /// `TrapCode::None` entries purely for call-return bookkeeping).
    pub trap_code: TrapCode,
}

/// Per-function compiled artifact and its static bookkeeping.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// This function's signature.
    pub signature: SignatureIndex,
    /// Declared locals beyond the parameters, in declaration order.
    pub locals: Vec<WasmType>,
    /// Final stack-frame size in bytes (16-byte aligned), once known.
    pub stack_frame_size: u32,
    /// The function's emitted machine code.
    pub code: Vec<u8>,
    /// Ascending-by-offset stack-trace table for this function.
    pub stack_trace: Vec<StackTraceEntry>,
    /// Pending cross-function call/branch patches (spec §4.6.10), resolved
    /// by an external module linker once every function's final position
    /// in the concatenated binary is known (see [`crate::reloc`]).
    pub relocations: Vec<Relocation>,
    /// Is this function reachable only through `call_indirect`/export,
    /// i.e. not itself calling into host builtins directly? Tracked so
    /// `CannotIndirectlyCallBuiltinFunction`/`CannotExportBuiltinFunction`
    /// can be checked at module-build time rather than deep in codegen.
    pub is_builtin: bool,
}

impl FunctionInfo {
    /// A function shell with no code yet, ready for the backend to fill in.
    pub fn new(signature: SignatureIndex, locals: Vec<WasmType>, is_builtin: bool) -> Self {
        FunctionInfo {
            signature,
            locals,
            stack_frame_size: 0,
            code: Vec::new(),
            stack_trace: Vec::new(),
            relocations: Vec::new(),
            is_builtin,
        }
    }

    /// Record a trap site at the code's current end.
    pub fn record_trap(&mut self, code_offset: u32, trap_code: TrapCode) {
        self.stack_trace.push(StackTraceEntry { code_offset, trap_code });
    }

    /// Record a pending cross-function patch at the code's current end.
    pub fn record_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }
}

/// The whole module: signatures, declarations, and each function's
/// compiled artifact, indexed by the entity types above.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    /// Every distinct signature the module declares or a function uses.
    pub signatures: PrimaryMap<SignatureIndex, Signature>,
    /// Every function, imports included (imports have no `code`).
    pub functions: PrimaryMap<FuncIndex, FunctionInfo>,
    /// Every global.
    pub globals: PrimaryMap<GlobalIndex, GlobalInfo>,
    /// Every table.
    pub tables: PrimaryMap<TableIndex, TableInfo>,
    /// The module's linear memory, if it declares one.
    pub memory: Option<MemoryInfo>,
    /// Running total of job-memory bytes consumed by globals/bookkeeping
    /// so far; used to hand out `job_mem_offset` values as globals are
    /// declared.
    pub job_mem_size: i32,
}

impl ModuleInfo {
    /// An empty module, ready to have signatures/functions/globals pushed
    /// onto it as the frontend walks the Wasm binary's sections.
    pub fn new() -> Self {
        ModuleInfo::default()
    }

    /// Declare a global, assigning it the next free job-memory slot.
    pub fn declare_global(&mut self, ty: WasmType, mutable: bool) -> GlobalIndex {
        let offset = self.job_mem_size;
        self.job_mem_size += ty.bytes() as i32;
        self.globals.push(GlobalInfo {
            ty,
            mutable,
            job_mem_offset: offset,
        })
    }

    /// The signature of function `index`.
    pub fn function_signature(&self, index: FuncIndex) -> &Signature {
        let sig_index = self.functions[index].signature;
        &self.signatures[sig_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaring_globals_packs_job_memory_sequentially() {
        let mut module = ModuleInfo::new();
        let g0 = module.declare_global(WasmType::I32, false);
        let g1 = module.declare_global(WasmType::F64, true);
        assert_eq!(module.globals[g0].job_mem_offset, 0);
        assert_eq!(module.globals[g1].job_mem_offset, 8);
        assert_eq!(module.job_mem_size, 16);
    }

    #[test]
    fn function_signature_looks_up_through_index() {
        let mut module = ModuleInfo::new();
        let sig = module.signatures.push(Signature {
            params: vec![WasmType::I32],
            results: vec![WasmType::I32],
        });
        let func = module
            .functions
            .push(FunctionInfo::new(sig, vec![], false));
        assert_eq!(module.function_signature(func).params, vec![WasmType::I32]);
    }

    #[test]
    fn record_trap_appends_to_stack_trace() {
        let sig = SignatureIndex::new(0);
        let mut f = FunctionInfo::new(sig, vec![], false);
        f.record_trap(12, TrapCode::DivZero);
        assert_eq!(f.stack_trace.len(), 1);
        assert_eq!(f.stack_trace[0].code_offset, 12);
    }
}
