//! Array-based data structures using densely numbered entity references as
//! mapping keys.
//!
//! The compiler's in-memory IR needs to refer to entities — basic blocks,
//! instructions, loops, heap locations — from many places at once. Rust
//! references are a poor fit for this: the ownership rules make graph-shaped
//! data painful, and 64-bit pointers waste space. Instead, an entity is
//! identified by a small typed index wrapping a `u32`, and the entity's data
//! lives in a table owned by one central data structure.
//!
//! This crate provides the index types and the tables:
//!
//! - The [`entity_impl!`] macro turns a `u32` newtype into an [`EntityRef`]
//!   with a compact `Display` implementation.
//! - [`PrimaryMap`] allocates entities and owns their primary definition.
//! - [`SecondaryMap`] associates further data with entities allocated
//!   elsewhere, materializing a default value for untouched keys.
//! - [`EntitySet`] is a bit-vector set of entities.
//! - [`packed_option::PackedOption`] stores an `Option<EntityRef>` in 32
//!   bits by reserving the all-ones index.

#![warn(missing_docs)]
#![deny(trivial_numeric_casts, unused_extern_crates)]

/// A type wrapping a small integer index should implement `EntityRef` so it
/// can be used as the key of a [`PrimaryMap`] or [`SecondaryMap`].
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small integer.
    /// This should crash if the requested index is not representable.
    fn new(index: usize) -> Self;

    /// Get the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Macro which provides the common implementation of a 32-bit entity
/// reference: `EntityRef`, `ReservedValue`, `Display`, and `Debug`.
#[macro_export]
macro_rules! entity_impl {
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            #[inline]
            fn new(index: usize) -> Self {
                debug_assert!(index < (u32::MAX as usize));
                $entity(index as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $crate::packed_option::ReservedValue for $entity {
            #[inline]
            fn reserved_value() -> $entity {
                $entity(u32::MAX)
            }

            #[inline]
            fn is_reserved_value(&self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl $entity {
            /// Return the underlying index value as a `u32`.
            #[allow(dead_code)]
            #[inline]
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };

    ($entity:ident, $display_prefix:expr) => {
        $crate::entity_impl!($entity);

        impl core::fmt::Display for $entity {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl core::fmt::Debug for $entity {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                (self as &dyn core::fmt::Display).fmt(f)
            }
        }
    };
}

pub mod packed_option;

mod map;
mod primary;
mod set;

pub use self::map::SecondaryMap;
pub use self::primary::{Keys, PrimaryMap};
pub use self::set::EntitySet;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    struct E(u32);
    entity_impl!(E, "e");

    #[test]
    fn entity_display() {
        assert_eq!(E::new(0).to_string(), "e0");
        assert_eq!(E::new(42).to_string(), "e42");
        assert_eq!(format!("{:?}", E::new(7)), "e7");
    }

    #[test]
    fn entity_roundtrip() {
        for i in [0usize, 1, 55, 70_000] {
            assert_eq!(E::new(i).index(), i);
        }
    }
}
