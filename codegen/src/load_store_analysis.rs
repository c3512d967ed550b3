//! Load-store analysis: assigns every memory-touching instruction a heap
//! location (alias class) and answers may/must-alias queries between
//! locations.
//!
//! A heap location is `(base reference, offset-or-index, component type,
//! vector width)`. The base is the *original* reference, found by looking
//! through `NullCheck` and `IntermediateAddress`; two locations with
//! provably distinct bases (two different allocations, or a non-escaping
//! allocation against anything else) never alias. Array locations with
//! constant indices compare by element ranges so a vector access of width
//! `w` overlaps the scalars `i .. i+w-1`.

use crate::fx::FxHashMap;
use crate::ir::{Graph, Inst, InstructionData, Location, Opcode, Type};
use crate::side_effects::SideEffects;
use crate::timing;
use gantry_entity::PrimaryMap;

/// Relation between two heap locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasKind {
    /// Accesses are to the same memory cells.
    MustAlias,
    /// Accesses may overlap.
    MayAlias,
    /// Accesses are provably disjoint.
    NoAlias,
}

/// Offset or index identifying the cell within the base object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Index {
    /// A field at a fixed byte offset.
    FieldOffset(u32),
    /// An array element at a constant index.
    ArrayConstant(i64),
    /// An array element at a dynamic index, identified by the index
    /// expression (canonicalized upstream by value numbering).
    ArrayValue(Inst),
}

/// The contents of one heap location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapLocationData {
    /// The original base reference.
    pub base: Inst,
    /// Cell within the base.
    pub index: Index,
    /// Component type of the access.
    pub ty: Type,
    /// Lane count for vector accesses, 1 for scalars.
    pub width: u8,
}

impl HeapLocationData {
    /// Is this an array-element location?
    pub fn is_array(&self) -> bool {
        !matches!(self.index, Index::FieldOffset(_))
    }

    /// The write-effect class of this location, for kill-set tests.
    pub fn write_class(&self) -> SideEffects {
        if self.is_array() {
            SideEffects::array_write_of(self.ty)
        } else {
            SideEffects::field_write_of(self.ty)
        }
    }
}

/// Heap locations of a graph, and the instruction mapping into them.
pub struct LoadStoreAnalysis {
    locations: PrimaryMap<Location, HeapLocationData>,
    by_key: FxHashMap<HeapLocationData, Location>,
    inst_location: FxHashMap<Inst, Location>,
    version: u64,
}

/// Look through the wrappers that forward a reference unchanged.
pub fn original_reference(graph: &Graph, mut inst: Inst) -> Inst {
    loop {
        match graph.data(inst) {
            InstructionData::Unary {
                opcode: Opcode::NullCheck,
                args,
            } => inst = args[0],
            InstructionData::Binary {
                opcode: Opcode::IntermediateAddress,
                args,
            } => inst = args[0],
            _ => return inst,
        }
    }
}

/// Does this allocation stay within the method: never stored away, passed
/// to a call, returned, thrown, or merged through a phi or select?
pub fn is_singleton(graph: &Graph, alloc: Inst) -> bool {
    debug_assert!(graph.opcode(alloc).is_allocation());
    graph.uses(alloc).iter().all(|u| {
        let user = u.user;
        match graph.data(user) {
            // Reading from it, or storing *into* it, keeps it local;
            // storing it somewhere as the value does not.
            InstructionData::FieldGet { .. } | InstructionData::ArrayGet { .. } => true,
            InstructionData::FieldSet { .. } => u.index == 0,
            InstructionData::ArraySet { .. } => u.index != 2,
            InstructionData::Unary {
                opcode: Opcode::NullCheck | Opcode::ArrayLength,
                ..
            } => is_singleton_through(graph, user),
            _ => false,
        }
    })
}

fn is_singleton_through(graph: &Graph, wrapper: Inst) -> bool {
    graph.uses(wrapper).iter().all(|u| {
        let user = u.user;
        match graph.data(user) {
            InstructionData::FieldGet { .. } | InstructionData::ArrayGet { .. } => true,
            InstructionData::FieldSet { .. } => u.index == 0,
            InstructionData::ArraySet { .. } => u.index != 2,
            _ => false,
        }
    })
}

impl LoadStoreAnalysis {
    /// Enumerate the heap locations of `graph`.
    pub fn compute(graph: &Graph) -> Self {
        let _tt = timing::load_store_analysis();
        let mut analysis = Self {
            locations: PrimaryMap::new(),
            by_key: FxHashMap::default(),
            inst_location: FxHashMap::default(),
            version: graph.version(),
        };
        for block in graph.blocks() {
            for &inst in graph.insts(block) {
                analysis.visit(graph, inst);
            }
        }
        analysis
    }

    fn visit(&mut self, graph: &Graph, inst: Inst) {
        let data = graph.data(inst);
        let key = match *data {
            InstructionData::FieldGet { args, field } => HeapLocationData {
                base: original_reference(graph, args[0]),
                index: Index::FieldOffset(field.offset),
                ty: graph.ty(inst),
                width: 1,
            },
            InstructionData::FieldSet { args, field } => HeapLocationData {
                base: original_reference(graph, args[0]),
                index: Index::FieldOffset(field.offset),
                ty: graph.ty(args[1]),
                width: 1,
            },
            InstructionData::PredicatedGet { args, field } => HeapLocationData {
                base: original_reference(graph, args[0]),
                index: Index::FieldOffset(field.offset),
                ty: graph.ty(inst),
                width: 1,
            },
            InstructionData::PredicatedSet { args, field } => HeapLocationData {
                base: original_reference(graph, args[0]),
                index: Index::FieldOffset(field.offset),
                ty: graph.ty(args[1]),
                width: 1,
            },
            InstructionData::ArrayGet { args } => self.array_key(graph, args[0], args[1], graph.ty(inst), 1),
            InstructionData::ArraySet { args } => {
                self.array_key(graph, args[0], args[1], graph.ty(args[2]), 1)
            }
            InstructionData::VecLoad { args, lanes } => {
                self.array_key(graph, args[0], args[1], graph.ty(inst), lanes)
            }
            InstructionData::VecStore { args, lanes } => {
                self.array_key(graph, args[0], args[1], graph.ty(args[2]), lanes)
            }
            _ => return,
        };
        let loc = *self.by_key.entry(key).or_insert_with(|| self.locations.push(key));
        self.inst_location.insert(inst, loc);
    }

    fn array_key(
        &self,
        graph: &Graph,
        base: Inst,
        index: Inst,
        ty: Type,
        width: u8,
    ) -> HeapLocationData {
        let index = match graph.as_int_constant(index) {
            Some(c) => Index::ArrayConstant(c),
            None => Index::ArrayValue(index),
        };
        HeapLocationData {
            base: original_reference(graph, base),
            index,
            ty,
            width,
        }
    }

    /// Is the analysis still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// The number of distinct heap locations found.
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    /// Iterate over all locations.
    pub fn locations(&self) -> gantry_entity::Keys<Location> {
        self.locations.keys()
    }

    /// The contents of `loc`.
    pub fn data(&self, loc: Location) -> &HeapLocationData {
        &self.locations[loc]
    }

    /// The location accessed by `inst`, for memory-touching instructions.
    pub fn location_of(&self, inst: Inst) -> Option<Location> {
        self.inst_location.get(&inst).copied()
    }

    /// How are the bases of two locations related?
    fn base_alias(&self, graph: &Graph, a: Inst, b: Inst) -> AliasKind {
        if a == b {
            return AliasKind::MustAlias;
        }
        let a_alloc = graph.opcode(a).is_allocation();
        let b_alloc = graph.opcode(b).is_allocation();
        if a_alloc && b_alloc {
            // Two distinct allocations are distinct objects.
            return AliasKind::NoAlias;
        }
        // A fresh allocation that never escapes cannot be reached through
        // any other reference.
        if (a_alloc && is_singleton(graph, a)) || (b_alloc && is_singleton(graph, b)) {
            return AliasKind::NoAlias;
        }
        AliasKind::MayAlias
    }

    /// The alias relation between two locations.
    pub fn alias(&self, graph: &Graph, a: Location, b: Location) -> AliasKind {
        if a == b {
            return AliasKind::MustAlias;
        }
        let (da, db) = (self.locations[a], self.locations[b]);
        // Fields and array elements live in disjoint alias classes.
        if da.is_array() != db.is_array() {
            return AliasKind::NoAlias;
        }
        let bases = self.base_alias(graph, da.base, db.base);
        if bases == AliasKind::NoAlias {
            return AliasKind::NoAlias;
        }
        match (da.index, db.index) {
            (Index::FieldOffset(x), Index::FieldOffset(y)) => {
                if x != y {
                    AliasKind::NoAlias
                } else if bases == AliasKind::MustAlias
                    && da.ty.size_in_bytes() == db.ty.size_in_bytes()
                {
                    AliasKind::MustAlias
                } else {
                    AliasKind::MayAlias
                }
            }
            (Index::ArrayConstant(x), Index::ArrayConstant(y)) => {
                if da.ty != db.ty {
                    return AliasKind::NoAlias;
                }
                // Element ranges: a vector access of width w covers
                // [i, i+w). Two different arrays of the same type either
                // are the same object or do not overlap at all, so range
                // disjointness settles both cases.
                let (xe, ye) = (x + i64::from(da.width), y + i64::from(db.width));
                if xe <= y || ye <= x {
                    AliasKind::NoAlias
                } else if bases == AliasKind::MustAlias && x == y && da.width == db.width {
                    AliasKind::MustAlias
                } else {
                    AliasKind::MayAlias
                }
            }
            (Index::ArrayValue(x), Index::ArrayValue(y)) => {
                if da.ty != db.ty {
                    AliasKind::NoAlias
                } else if bases == AliasKind::MustAlias && x == y && da.width == db.width {
                    AliasKind::MustAlias
                } else {
                    AliasKind::MayAlias
                }
            }
            // Constant against symbolic index: unknown overlap.
            _ => {
                if da.ty != db.ty {
                    AliasKind::NoAlias
                } else {
                    AliasKind::MayAlias
                }
            }
        }
    }

    /// May two locations overlap at all?
    pub fn may_alias(&self, graph: &Graph, a: Location, b: Location) -> bool {
        self.alias(graph, a, b) != AliasKind::NoAlias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::ir::FieldRef;

    struct Setup {
        g: Graph,
        body: crate::ir::Block,
    }

    fn setup() -> Setup {
        let g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        Setup { g, body }
    }

    #[test]
    fn fields_and_arrays() {
        let Setup { mut g, body } = setup();
        let obj = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let arr = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 1 },
            Type::Reference,
        );
        let f0 = g.insert_before_terminator(
            body,
            InstructionData::FieldGet {
                args: [obj],
                field: FieldRef::plain(8),
            },
            Type::Int32,
        );
        let f1 = g.insert_before_terminator(
            body,
            InstructionData::FieldGet {
                args: [obj],
                field: FieldRef::plain(12),
            },
            Type::Int32,
        );
        let c1 = g.int_constant(1);
        let a1 = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c1] },
            Type::Int32,
        );

        let lsa = LoadStoreAnalysis::compute(&g);
        let l_f0 = lsa.location_of(f0).unwrap();
        let l_f1 = lsa.location_of(f1).unwrap();
        let l_a1 = lsa.location_of(a1).unwrap();
        assert_eq!(lsa.alias(&g, l_f0, l_f1), AliasKind::NoAlias);
        assert_eq!(lsa.alias(&g, l_f0, l_f0), AliasKind::MustAlias);
        assert_eq!(lsa.alias(&g, l_f0, l_a1), AliasKind::NoAlias);
    }

    #[test]
    fn array_indices() {
        let Setup { mut g, body } = setup();
        let arr = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let i = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 1 },
            Type::Int32,
        );
        let c1 = g.int_constant(1);
        let c2 = g.int_constant(2);
        let get1 = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c1] },
            Type::Int32,
        );
        let get2 = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c2] },
            Type::Int32,
        );
        let get_i = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, i] },
            Type::Int32,
        );
        // Same cell through a null check maps to the same location.
        let checked = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::NullCheck,
                args: [arr],
            },
            Type::Reference,
        );
        let get1_checked = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet {
                args: [checked, c1],
            },
            Type::Int32,
        );

        let lsa = LoadStoreAnalysis::compute(&g);
        let l1 = lsa.location_of(get1).unwrap();
        let l2 = lsa.location_of(get2).unwrap();
        let li = lsa.location_of(get_i).unwrap();
        assert_eq!(lsa.location_of(get1_checked), Some(l1));
        assert_eq!(lsa.alias(&g, l1, l2), AliasKind::NoAlias);
        assert_eq!(lsa.alias(&g, l1, li), AliasKind::MayAlias);
    }

    #[test]
    fn vector_overlap() {
        let Setup { mut g, body } = setup();
        let arr = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let c0 = g.int_constant(0);
        let c3 = g.int_constant(3);
        let c4 = g.int_constant(4);
        let vload = g.insert_before_terminator(
            body,
            InstructionData::VecLoad {
                args: [arr, c0],
                lanes: 4,
            },
            Type::Int32,
        );
        let get3 = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c3] },
            Type::Int32,
        );
        let get4 = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c4] },
            Type::Int32,
        );

        let lsa = LoadStoreAnalysis::compute(&g);
        let lv = lsa.location_of(vload).unwrap();
        let l3 = lsa.location_of(get3).unwrap();
        let l4 = lsa.location_of(get4).unwrap();
        // The 4-wide access at 0 covers elements 0..4.
        assert_eq!(lsa.alias(&g, lv, l3), AliasKind::MayAlias);
        assert_eq!(lsa.alias(&g, lv, l4), AliasKind::NoAlias);
    }

    #[test]
    fn allocations_do_not_alias() {
        let Setup { mut g, body } = setup();
        let cls = {
            use gantry_entity::EntityRef;
            crate::ir::Class::new(0)
        };
        let o1 = g.insert_before_terminator(
            body,
            InstructionData::NewInstance { class: cls },
            Type::Reference,
        );
        let o2 = g.insert_before_terminator(
            body,
            InstructionData::NewInstance { class: cls },
            Type::Reference,
        );
        let param = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let mk_get = |g: &mut Graph, base| {
            g.insert_before_terminator(
                body,
                InstructionData::FieldGet {
                    args: [base],
                    field: FieldRef::plain(8),
                },
                Type::Int32,
            )
        };
        let g1 = mk_get(&mut g, o1);
        let g2 = mk_get(&mut g, o2);
        let gp = mk_get(&mut g, param);

        let lsa = LoadStoreAnalysis::compute(&g);
        let l1 = lsa.location_of(g1).unwrap();
        let l2 = lsa.location_of(g2).unwrap();
        let lp = lsa.location_of(gp).unwrap();
        assert_eq!(lsa.alias(&g, l1, l2), AliasKind::NoAlias);
        // o1 never escapes here, so its fields cannot be reached through
        // the parameter.
        assert_eq!(lsa.alias(&g, l1, lp), AliasKind::NoAlias);
    }
}
