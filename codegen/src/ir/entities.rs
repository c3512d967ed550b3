//! IR entity references.
//!
//! Instructions need to reference other entities in the graph: blocks,
//! other instructions, environments, loops. These references are not Rust
//! references — the graph is cyclic and we want a compact in-memory
//! representation — but typed `u32` indices into tables owned by the
//! [`Graph`](super::Graph). Compact data structures use the
//! `PackedOption<T>` representation, while function arguments and return
//! values prefer the more Rust-like `Option<T>` variant.
//!
//! The entity references all implement the `Display` trait in a way that
//! matches the textual IR format.

use gantry_entity::entity_impl;

/// An opaque reference to a basic block in a [`Graph`](super::Graph).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an instruction.
///
/// Instructions are SSA values: an instruction defines at most one result,
/// and the `Inst` reference doubles as the reference to that value wherever
/// another instruction consumes it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "i");

/// An opaque reference to a deoptimization environment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Env(u32);
entity_impl!(Env, "env");

/// An opaque reference to a natural loop discovered by loop analysis.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

/// An opaque reference to a heap location (alias class) assigned by
/// load-store analysis.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(u32);
entity_impl!(Location, "loc");

/// A runtime class, resolved by the front end. Opaque to the optimizer:
/// equal ids mean the same class, distinct ids mean provably distinct
/// classes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Class(u32);
entity_impl!(Class, "class");

/// A callee method reference, resolved by the front end. The optimizer
/// treats calls as opaque.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Method(u32);
entity_impl!(Method, "method");
