//! Intermediate representation of a method under compilation.
//!
//! The IR is a control-flow graph of basic blocks holding instructions in
//! SSA form: every instruction defines at most one value and the
//! instruction reference doubles as the value reference. Phis reconcile
//! values at control-flow joins; deoptimization environments pin values
//! for the runtime without counting as data uses.

mod entities;
mod graph;
mod instructions;
mod types;

pub mod builder;

pub use self::entities::{Block, Class, Env, Inst, Location, Loop, Method};
pub use self::graph::{BlockData, EnvUse, EnvironmentData, Graph, Use};
pub use self::instructions::{FieldRef, InstList, InstructionData, Opcode};
pub use self::types::Type;
