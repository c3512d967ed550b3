//! The gantry optimization core.
//!
//! This crate contains the middle end of a method-at-a-time JIT/AOT
//! compiler: an SSA control-flow-graph IR and the analyses and
//! transformations that reason about control flow, loops, memory effects,
//! and object escape. The front end hands over a [`ir::Graph`] satisfying
//! the structural invariants checked by [`verifier`]; the
//! [`passes::PassManager`] runs a configured sequence of optimizations that
//! mutate the graph in place; the optimized graph is then handed to a back
//! end for register allocation and emission (out of scope here).
//!
//! The major pieces:
//!
//! - [`ir`] — the IR kernel: graph, blocks, instructions, environments,
//!   and the structural editing API that keeps use-def information
//!   consistent.
//! - [`dominator_tree`], [`loop_analysis`], [`linear_order`] — control-flow
//!   analyses.
//! - [`side_effects`], [`induction`], [`load_store_analysis`] — dataflow
//!   analyses consumed by the optimizations.
//! - [`passes`] — the optimizations themselves, including code sinking,
//!   loop optimization and vectorization, scalar and partial load-store
//!   elimination, and CHA guard optimization.

#![warn(missing_docs)]
#![deny(trivial_numeric_casts, unused_extern_crates)]

pub use gantry_entity as entity;

pub mod dominator_tree;
pub mod induction;
pub mod ir;
pub mod isa;
pub mod linear_order;
pub mod load_store_analysis;
pub mod loop_analysis;
pub mod passes;
pub mod side_effects;
pub mod stats;
pub mod timing;
pub mod verifier;

mod fx;
mod scoped_hash_map;
