//! Densely numbered entity references used as arena indices.
//!
//! The condense tree and the reference index (see the `wasmjit-codegen` crate)
//! model the symbolic operand stack as a flat arena of nodes connected by
//! `parent`/`sibling`/`prevOccurrence`/`nextOccurrence` indices rather than by
//! pointers. This crate is the indexing primitive that makes that possible:
//! an `EntityRef` is a `Copy` newtype wrapping a `u32`, and a `PrimaryMap`
//! owns a dense `Vec` of values keyed by such references.

mod map;

pub use crate::map::{PrimaryMap, SecondaryMap};

/// A type that can be used as a densely numbered entity reference.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small index.
    fn new(index: usize) -> Self;

    /// Get the index of this reference.
    fn index(self) -> usize;
}

/// Generate an `EntityRef` newtype wrapping a `u32`.
///
/// This mirrors `cranelift_entity::entity_impl!` — every arena key in this
/// crate's consumers (stack-element indices, reference-index slots) is
/// generated by this macro rather than hand-rolled, so they're all
/// `Copy + Eq + Hash + Debug` with a consistent `NONE`-free `Option`
/// representation via `Option<K>`.
#[macro_export]
macro_rules! entity_impl {
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            fn new(index: usize) -> Self {
                debug_assert!(index < (u32::MAX as usize));
                $entity(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::fmt::Debug for $entity {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "{}{}", stringify!($entity), self.0)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, PartialEq, Eq)]
    struct E(u32);
    entity_impl!(E);

    #[test]
    fn new_and_index_round_trip() {
        let e = E::new(12);
        assert_eq!(e.index(), 12);
    }
}
