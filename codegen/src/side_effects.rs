//! Side-effects summaries.
//!
//! Each instruction gets a compact summary of the abstract heap state it
//! reads and writes, split into alias classes: instance fields and array
//! elements, each per component type, plus GC coupling and the
//! throw/deoptimize bits. The summaries compose by union, which gives the
//! per-block and per-loop effects the loop and memory optimizations
//! consult.

use crate::ir::{Block, Graph, Inst, InstructionData, Opcode, Type};
use crate::loop_analysis::LoopForest;
use crate::timing;
use gantry_entity::SecondaryMap;
use core::fmt;

const NUM_TYPES: u64 = 10;

const FIELD_WRITE_OFFSET: u64 = 0;
const ARRAY_WRITE_OFFSET: u64 = FIELD_WRITE_OFFSET + NUM_TYPES;
const CAN_TRIGGER_GC_BIT: u64 = ARRAY_WRITE_OFFSET + NUM_TYPES;
const FIELD_READ_OFFSET: u64 = CAN_TRIGGER_GC_BIT + 1;
const ARRAY_READ_OFFSET: u64 = FIELD_READ_OFFSET + NUM_TYPES;
const DEPENDS_ON_GC_BIT: u64 = ARRAY_READ_OFFSET + NUM_TYPES;
const MAY_THROW_BIT: u64 = DEPENDS_ON_GC_BIT + 1;
const MAY_DEOPT_BIT: u64 = MAY_THROW_BIT + 1;

const ALL_WRITE_BITS: u64 = ((1 << (2 * NUM_TYPES)) - 1) << FIELD_WRITE_OFFSET;
const ALL_READ_BITS: u64 = ((1 << (2 * NUM_TYPES)) - 1) << FIELD_READ_OFFSET;

fn type_bit(ty: Type) -> u64 {
    ty as u64
}

/// Summary of the observable effects of an instruction (or a region, by
/// union).
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SideEffects {
    bits: u64,
}

impl SideEffects {
    /// No effects at all.
    pub fn none() -> Self {
        Self { bits: 0 }
    }

    /// Writes every alias class and may throw, deoptimize, and trigger GC.
    /// The summary of an opaque call.
    pub fn all() -> Self {
        Self {
            bits: ALL_WRITE_BITS
                | ALL_READ_BITS
                | (1 << CAN_TRIGGER_GC_BIT)
                | (1 << DEPENDS_ON_GC_BIT)
                | (1 << MAY_THROW_BIT),
        }
    }

    /// Writes every alias class. The conservative barrier for volatile
    /// accesses.
    pub fn all_writes() -> Self {
        Self {
            bits: ALL_WRITE_BITS,
        }
    }

    /// Reads every alias class.
    pub fn all_reads() -> Self {
        Self {
            bits: ALL_READ_BITS,
        }
    }

    /// A write to an instance field of component type `ty`.
    pub fn field_write_of(ty: Type) -> Self {
        Self {
            bits: 1 << (FIELD_WRITE_OFFSET + type_bit(ty)),
        }
    }

    /// A write to an array element of component type `ty`.
    pub fn array_write_of(ty: Type) -> Self {
        Self {
            bits: 1 << (ARRAY_WRITE_OFFSET + type_bit(ty)),
        }
    }

    /// A read of an instance field of component type `ty`.
    pub fn field_read_of(ty: Type) -> Self {
        Self {
            bits: 1 << (FIELD_READ_OFFSET + type_bit(ty)),
        }
    }

    /// A read of an array element of component type `ty`.
    pub fn array_read_of(ty: Type) -> Self {
        Self {
            bits: 1 << (ARRAY_READ_OFFSET + type_bit(ty)),
        }
    }

    /// Allocation pressure: the instruction may trigger a collection.
    pub fn can_trigger_gc() -> Self {
        Self {
            bits: 1 << CAN_TRIGGER_GC_BIT,
        }
    }

    /// The instruction observes object identity that a collection may
    /// change.
    pub fn depends_on_gc() -> Self {
        Self {
            bits: 1 << DEPENDS_ON_GC_BIT,
        }
    }

    /// The instruction may throw.
    pub fn may_throw() -> Self {
        Self {
            bits: 1 << MAY_THROW_BIT,
        }
    }

    /// The instruction may deoptimize or suspend the frame.
    pub fn may_deopt() -> Self {
        Self {
            bits: 1 << MAY_DEOPT_BIT,
        }
    }

    /// The union of two summaries.
    pub fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Does this summary include any heap write?
    pub fn does_any_write(self) -> bool {
        self.bits & ALL_WRITE_BITS != 0
    }

    /// Does this summary include any heap read?
    pub fn does_any_read(self) -> bool {
        self.bits & ALL_READ_BITS != 0
    }

    /// May this summary throw?
    pub fn does_throw(self) -> bool {
        self.bits & (1 << MAY_THROW_BIT) != 0
    }

    /// May this summary deoptimize?
    pub fn does_deopt(self) -> bool {
        self.bits & (1 << MAY_DEOPT_BIT) != 0
    }

    /// Is this summary free of writes, throws, and deopts?
    pub fn has_side_effects(self) -> bool {
        self.does_any_write() || self.does_throw() || self.does_deopt()
    }

    /// Do the writes of `self` intersect the writes of `other`? Used with
    /// a location's write class as `other` to test whether an instruction
    /// can clobber the location.
    pub fn writes_intersect(self, other: Self) -> bool {
        self.bits & other.bits & ALL_WRITE_BITS != 0
    }

    /// Do the reads of `self` possibly observe the writes of `other`?
    pub fn may_depend_on(self, other: Self) -> bool {
        let reads = (self.bits & ALL_READ_BITS) >> FIELD_READ_OFFSET;
        let writes = (other.bits & ALL_WRITE_BITS) >> FIELD_WRITE_OFFSET;
        if reads & writes != 0 {
            return true;
        }
        // GC movement pairs a dependent read with a triggering write.
        self.bits & (1 << DEPENDS_ON_GC_BIT) != 0
            && other.bits & (1 << CAN_TRIGGER_GC_BIT) != 0
    }

    /// The per-instruction summary.
    pub fn of(graph: &Graph, inst: Inst) -> Self {
        let data = graph.data(inst);
        match data {
            InstructionData::FieldGet { field, .. } => {
                let base = Self::field_read_of(graph.ty(inst));
                if field.is_volatile {
                    base.union(Self::all_writes()).union(Self::all_reads())
                } else {
                    base
                }
            }
            InstructionData::PredicatedGet { .. } => Self::field_read_of(graph.ty(inst)),
            InstructionData::FieldSet { args, field } => {
                let base = Self::field_write_of(graph.ty(args[1]));
                if field.is_volatile {
                    base.union(Self::all_writes()).union(Self::all_reads())
                } else {
                    base
                }
            }
            InstructionData::PredicatedSet { args, .. } => {
                Self::field_write_of(graph.ty(args[1]))
            }
            InstructionData::ArrayGet { .. } => Self::array_read_of(graph.ty(inst)),
            InstructionData::ArraySet { args } => Self::array_write_of(graph.ty(args[2])),
            InstructionData::VecLoad { .. } => Self::array_read_of(graph.ty(inst)),
            InstructionData::VecStore { args, .. } => {
                Self::array_write_of(graph.ty(args[2]))
            }
            InstructionData::Invoke { .. } => Self::all().union(Self::may_deopt()),
            InstructionData::NewInstance { .. } | InstructionData::NewArray { .. } => {
                Self::can_trigger_gc().union(Self::may_throw())
            }
            InstructionData::LoadClass { .. } => {
                Self::can_trigger_gc().union(Self::may_throw())
            }
            _ => match data.opcode() {
                Opcode::SuspendCheck => Self::can_trigger_gc().union(Self::may_deopt()),
                Opcode::Deoptimize => Self::may_deopt(),
                Opcode::NullCheck | Opcode::BoundsCheck | Opcode::Throw => Self::may_throw(),
                _ => Self::none(),
            },
        }
    }
}

impl fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SideEffects({:#x})", self.bits)
    }
}

/// Block- and loop-level unions of instruction summaries.
pub struct SideEffectsAnalysis {
    block_effects: SecondaryMap<Block, SideEffects>,
    loop_effects: SecondaryMap<Block, SideEffects>,
    version: u64,
}

impl SideEffectsAnalysis {
    /// Compute per-block and per-loop-header effect unions for `graph`.
    pub fn compute(graph: &Graph, forest: &LoopForest) -> Self {
        let _tt = timing::side_effects();
        let mut block_effects: SecondaryMap<Block, SideEffects> = SecondaryMap::new();
        let mut loop_effects: SecondaryMap<Block, SideEffects> = SecondaryMap::new();

        for block in graph.blocks() {
            let mut effects = SideEffects::none();
            for &inst in graph.insts(block) {
                effects = effects.union(SideEffects::of(graph, inst));
            }
            block_effects[block] = effects;

            // Accumulate into every enclosing loop.
            let mut lp = forest.innermost_loop(block);
            while let Some(l) = lp {
                let header = forest.header(l);
                loop_effects[header] = loop_effects[header].union(effects);
                lp = forest.parent(l);
            }
        }

        Self {
            block_effects,
            loop_effects,
            version: graph.version(),
        }
    }

    /// Is the analysis still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// The union of effects of the instructions in `block`.
    pub fn block_effects(&self, block: Block) -> SideEffects {
        self.block_effects[block]
    }

    /// The union of effects of every block in the loop headed by `header`.
    pub fn loop_effects(&self, header: Block) -> SideEffects {
        self.loop_effects[header]
    }
}
