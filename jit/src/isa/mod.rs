//! AArch64 instruction selection, encoding, and emission (spec C1–C4).
//!
//! Grounded on `cranelift_codegen::isa::{x86,arm64}::registers` for the
//! shape of a target-specific register table and on
//! `cranelift_codegen::binemit::relaxation` for the branch-relaxation
//! mindset (patch a not-yet-known displacement once its target is known);
//! the actual bit-template encoding is this crate's own, since the spec's
//! C1 ("typed operand-shape enumeration") has no direct analogue in the
//! retrieved slice of the teacher's old `meta`-DSL-generated tables.

pub mod assembler;
pub mod builder;
pub mod encoding;
pub mod relpatch;
pub mod select;

#[cfg(test)]
pub mod decode;
