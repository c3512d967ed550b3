//! Load-store elimination, scalar and partial.
//!
//! **Scalar LSE** tracks, per block and per heap location, what the
//! location is known to hold:
//!
//! - `Default` — the zero/null value it was created with;
//! - `Known(v)` — a concrete SSA value from an earlier store or load;
//! - `NeedsPhi(b)` — predecessors of `b` disagreed; a phi is built lazily
//!   if a load actually wants the value;
//! - `Unknown` — anything may have happened.
//!
//! Loads of a known value are replaced by it (a scalar load of `Default`
//! materializes the zero constant; vector loads are never synthesized from
//! `Default`), stores of the value a location already holds are removed,
//! and side-effectful instructions kill every location their write set may
//! alias. Loop headers start `Unknown` for every location written
//! anywhere in the loop and inherit the pre-header value otherwise, which
//! keeps back edges consistent by construction.
//!
//! **Partial LSE** then looks at allocations that escape on some paths
//! only. The escaping region is entered through materialization edges, on
//! which a fresh allocation replays the field history; joins reached both
//! with and without a materialized object merge the reference through a
//! `{new, null}` phi, and field accesses under such a phi become
//! predicated loads and stores with the tracked SSA value as fallback.
//! Any step that cannot be completed safely leaves the allocation to the
//! scalar results only.

use crate::dominator_tree::DominatorTree;
use crate::fx::FxHashMap;
use crate::ir::{Block, FieldRef, Graph, Inst, InstructionData, Location, Opcode, Type};
use crate::load_store_analysis::LoadStoreAnalysis;
use crate::loop_analysis::LoopForest;
use crate::passes::PassResult;
use crate::side_effects::{SideEffects, SideEffectsAnalysis};
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use gantry_entity::{EntitySet, SecondaryMap};

/// What a heap location is known to hold at a program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeapValue {
    Unknown,
    /// Still the zero/null value the object was created with.
    Default,
    Known(Inst),
    /// The merge at this block was mixed; build a phi on demand.
    NeedsPhi(Block),
}

struct ScalarLse<'a> {
    graph: &'a mut Graph,
    lsa: &'a LoadStoreAnalysis,
    forest: &'a LoopForest,
    effects: &'a SideEffectsAnalysis,
    stats: &'a mut CompilationStats,
    /// Exit state per processed block.
    exit_states: SecondaryMap<Block, Vec<HeapValue>>,
    processed: EntitySet<Block>,
    /// Phis already materialized for `NeedsPhi` markers.
    phi_cache: FxHashMap<(Block, Location), Inst>,
    changed: bool,
}

impl<'a> ScalarLse<'a> {
    fn num_locations(&self) -> usize {
        self.lsa.num_locations()
    }

    /// The state at entry of `block`, merged from its predecessors.
    fn entry_state(&self, block: Block) -> Vec<HeapValue> {
        let n = self.num_locations();
        if block == self.graph.entry_block() {
            return vec![HeapValue::Unknown; n];
        }

        // A loop header inherits the pre-header state, with every location
        // the loop may write degraded to Unknown. This makes the back-edge
        // state agree with the speculation by construction.
        if let Some(lp) = self.forest.innermost_loop(block) {
            if self.forest.header(lp) == block {
                let loop_effects = self.effects.loop_effects(block);
                let pre_state = self
                    .forest
                    .pre_header(lp)
                    .filter(|&pre| self.processed.contains(pre))
                    .map(|pre| self.exit_states[pre].clone());
                let mut state = pre_state.unwrap_or_else(|| vec![HeapValue::Unknown; n]);
                for loc in self.lsa.locations() {
                    if loop_effects.writes_intersect(self.lsa.data(loc).write_class()) {
                        state[loc_index(loc)] = HeapValue::Unknown;
                    }
                }
                return state;
            }
        }

        let mut state = vec![HeapValue::Unknown; n];
        let preds = self.graph.preds(block);
        for (i, value) in state.iter_mut().enumerate() {
            let mut merged: Option<HeapValue> = None;
            let mut mixed = false;
            for &pred in preds {
                let v = if self.processed.contains(pred) {
                    self.exit_states[pred][i]
                } else {
                    HeapValue::Unknown
                };
                match merged {
                    None => merged = Some(v),
                    Some(m) if m == v => {}
                    Some(_) => mixed = true,
                }
            }
            *value = match merged {
                None => HeapValue::Unknown,
                Some(_) if mixed => {
                    // Unknown poisons the merge; concrete disagreement can
                    // still be reconciled by a phi.
                    if preds.iter().any(|&p| {
                        !self.processed.contains(p)
                            || self.exit_states[p][i] == HeapValue::Unknown
                    }) {
                        HeapValue::Unknown
                    } else {
                        HeapValue::NeedsPhi(block)
                    }
                }
                Some(m) => m,
            };
        }
        state
    }

    /// Resolve a heap value to a concrete instruction for a reader of type
    /// `ty`, materializing phis where merges were mixed. Returns `None`
    /// for `Unknown`.
    fn materialize(&mut self, value: HeapValue, loc: Location, ty: Type) -> Option<Inst> {
        match value {
            HeapValue::Unknown => None,
            HeapValue::Known(v) => Some(v),
            HeapValue::Default => Some(self.graph.zero_constant(ty)),
            HeapValue::NeedsPhi(block) => {
                if let Some(&phi) = self.phi_cache.get(&(block, loc)) {
                    return Some(phi);
                }
                // Create the phi first so the cache breaks recursion, then
                // fill the per-predecessor inputs.
                let preds = self.graph.preds(block).to_vec();
                let placeholder = self.graph.zero_constant(ty);
                let phi = self
                    .graph
                    .add_phi(block, &vec![placeholder; preds.len()], ty.promoted());
                self.phi_cache.insert((block, loc), phi);
                for (k, &pred) in preds.iter().enumerate() {
                    let pred_value = self.exit_states[pred][loc_index(loc)];
                    let input = self
                        .materialize(pred_value, loc, ty)
                        .expect("mixed merges never include Unknown");
                    self.graph.replace_input(phi, k, input);
                }
                self.changed = true;
                Some(phi)
            }
        }
    }

    fn run(&mut self) {
        let domtree = DominatorTree::compute(self.graph);
        let rpo: Vec<Block> = domtree.cfg_rpo().collect();
        for block in rpo {
            let mut state = self.entry_state(block);
            for inst in self.graph.insts(block).to_vec() {
                self.visit(inst, &mut state);
            }
            self.exit_states[block] = state;
            self.processed.insert(block);
        }
    }

    fn visit(&mut self, inst: Inst, state: &mut Vec<HeapValue>) {
        let data = self.graph.data(inst).clone();
        match data {
            // A fresh allocation: its locations hold their default value.
            InstructionData::NewInstance { .. } | InstructionData::NewArray { .. } => {
                for loc in self.lsa.locations() {
                    if self.lsa.data(loc).base == inst {
                        state[loc_index(loc)] = HeapValue::Default;
                    }
                }
            }
            InstructionData::FieldGet { field, .. } if field.is_volatile => {
                // A volatile load is an acquire barrier.
                self.kill_all(state);
            }
            InstructionData::FieldGet { .. }
            | InstructionData::ArrayGet { .. }
            | InstructionData::VecLoad { .. } => {
                let Some(loc) = self.lsa.location_of(inst) else {
                    return;
                };
                let ty = self.graph.ty(inst);
                let is_vector = data.opcode() == Opcode::VecLoad;
                let current = state[loc_index(loc)];
                // Vector loads are never synthesized from the default
                // value; reconstructing the lanes is the backend's job.
                let forwardable = !(is_vector
                    && matches!(current, HeapValue::Default | HeapValue::NeedsPhi(_)));
                if forwardable {
                    if let Some(v) = self.materialize(current, loc, ty) {
                        log::trace!("lse: forwarding {} to {}", inst, v);
                        self.graph.replace_all_uses_with(inst, v);
                        self.graph.remove(inst);
                        self.stats.record(Stat::LoadEliminated);
                        self.changed = true;
                        return;
                    }
                }
                state[loc_index(loc)] = HeapValue::Known(inst);
            }
            InstructionData::FieldSet { args, field } => {
                if field.is_volatile {
                    self.kill_all(state);
                    return;
                }
                self.visit_store(inst, args[1], state);
            }
            InstructionData::ArraySet { args } => self.visit_store(inst, args[2], state),
            InstructionData::VecStore { args, .. } => self.visit_store(inst, args[2], state),
            InstructionData::PredicatedSet { args, .. } => {
                // The store may or may not happen; the location becomes
                // unpredictable, and everything it may alias with it.
                let _ = args;
                if let Some(loc) = self.lsa.location_of(inst) {
                    self.kill_may_alias(loc, state);
                    state[loc_index(loc)] = HeapValue::Unknown;
                }
            }
            InstructionData::PredicatedGet { .. } => {}
            _ => {
                let effects = SideEffects::of(self.graph, inst);
                if effects.does_any_write() {
                    for loc in self.lsa.locations() {
                        if effects.writes_intersect(self.lsa.data(loc).write_class()) {
                            state[loc_index(loc)] = HeapValue::Unknown;
                        }
                    }
                }
            }
        }
    }

    fn visit_store(&mut self, inst: Inst, value: Inst, state: &mut Vec<HeapValue>) {
        let Some(loc) = self.lsa.location_of(inst) else {
            return;
        };
        let current = state[loc_index(loc)];
        let storing_default = matches!(current, HeapValue::Default)
            && self.graph.as_int_constant(value) == Some(0);
        if current == HeapValue::Known(value) || storing_default {
            log::trace!("lse: removing redundant store {}", inst);
            self.graph.remove(inst);
            self.stats.record(Stat::StoreEliminated);
            self.changed = true;
            return;
        }
        self.kill_may_alias(loc, state);
        state[loc_index(loc)] = HeapValue::Known(value);
    }

    /// A write to `loc` makes every possibly-overlapping location
    /// unpredictable.
    fn kill_may_alias(&self, loc: Location, state: &mut [HeapValue]) {
        for other in self.lsa.locations() {
            if other != loc && self.lsa.may_alias(self.graph, loc, other) {
                state[loc_index(other)] = HeapValue::Unknown;
            }
        }
    }

    fn kill_all(&self, state: &mut [HeapValue]) {
        for v in state.iter_mut() {
            *v = HeapValue::Unknown;
        }
    }
}

fn loc_index(loc: Location) -> usize {
    gantry_entity::EntityRef::index(loc)
}

// ---------------------------------------------------------------------------
// Partial LSE.

/// Is pinning `alloc` in this environment an escape? The single predicate
/// deciding the debuggable-deopt open question: pins escape only when the
/// frame is observable (debuggable graph) or the holder itself deoptimizes
/// it (`Deoptimize` always, `SuspendCheck` when compiling OSR).
fn env_use_escapes(graph: &Graph, holder: Inst) -> bool {
    graph.is_debuggable()
        || graph.opcode(holder) == Opcode::Deoptimize
        || (graph.opcode(holder) == Opcode::SuspendCheck && graph.is_compiling_osr())
}

/// Classified uses of one allocation.
struct UseClassification {
    /// `FieldGet` users with the allocation as base.
    gets: Vec<Inst>,
    /// `FieldSet` users with the allocation as base.
    sets: Vec<Inst>,
    /// Users through which the reference escapes.
    escapes: Vec<Inst>,
}

/// Classify the uses of `alloc`.
fn classify_uses(graph: &Graph, alloc: Inst) -> UseClassification {
    let mut c = UseClassification {
        gets: Vec::new(),
        sets: Vec::new(),
        escapes: Vec::new(),
    };
    for u in graph.uses(alloc) {
        match *graph.data(u.user) {
            InstructionData::FieldGet { .. } => c.gets.push(u.user),
            InstructionData::FieldSet { .. } if u.index == 0 => {
                // Storing another partial candidate in here would entangle
                // the two materializations; handled conservatively by the
                // caller.
                c.sets.push(u.user)
            }
            _ => c.escapes.push(u.user),
        }
    }
    for eu in graph.env_uses(alloc) {
        let holder = graph.env_holder(eu.env);
        if env_use_escapes(graph, holder) {
            c.escapes.push(holder);
        }
    }
    c
}

/// The field contents of a not-yet-escaped allocation at a program point.
type FieldMap = FxHashMap<u32, Inst>;

struct PartialLse<'a> {
    graph: &'a mut Graph,
    stats: &'a mut CompilationStats,
    changed: bool,
}

impl<'a> PartialLse<'a> {
    /// Try to sink `alloc` into its escaping cohort. Returns `false` (with
    /// the graph untouched) when any precondition fails.
    fn sink_allocation(&mut self, alloc: Inst, domtree: &DominatorTree, forest: &LoopForest) -> bool {
        let InstructionData::NewInstance { class } = *self.graph.data(alloc) else {
            return false;
        };
        let def_block = match self.graph.block_of(alloc) {
            Some(b) => b,
            None => return false,
        };
        let uses = classify_uses(self.graph, alloc);
        if uses.escapes.is_empty() {
            return false;
        }
        // A phi carrying the reference would need the materialization
        // value of each predecessor edge rather than of a block; such
        // cohorts stay scalar.
        for &user in &uses.escapes {
            if self.graph.is_phi(user) {
                return false;
            }
        }
        // A stored field value that is itself an allocation would chain
        // materializations; fall back to the scalar results.
        for &set in &uses.sets {
            let value = self.graph.args(set)[1];
            if self.graph.opcode(value).is_allocation() || value == alloc {
                return false;
            }
        }

        // Escaping blocks: a use makes its block escaped, and everything
        // reachable from there stays escaped.
        let mut seeds: EntitySet<Block> = EntitySet::new();
        for &user in &uses.escapes {
            let block = self.graph.block_of(user).expect("user in a block");
            seeds.insert(block);
        }
        if seeds.contains(def_block) {
            // The reference escapes in its own block; nothing to sink.
            return false;
        }
        let mut escaped = seeds.clone();
        let mut worklist: Vec<Block> = escaped.iter().collect();
        while let Some(block) = worklist.pop() {
            for &succ in self.graph.succs(block) {
                if escaped.insert(succ) {
                    worklist.push(succ);
                }
            }
        }
        // Which blocks can still reach an escape use ahead?
        let mut reach: EntitySet<Block> = seeds.clone();
        let mut again = true;
        while again {
            again = false;
            for block in self.graph.blocks().collect::<Vec<_>>() {
                if reach.contains(block) {
                    continue;
                }
                if self.graph.succs(block).iter().any(|&s| reach.contains(s)) {
                    reach.insert(block);
                    again = true;
                }
            }
        }

        // Cohorts overlapping loops are left to the scalar results; the
        // frontier would cross back edges.
        for block in escaped.iter().chain(core::iter::once(def_block)) {
            if forest.innermost_loop(block).is_some() {
                return false;
            }
        }

        // Frontier edges, materialization happening on those whose head
        // still reaches an escape.
        let mut frontier: Vec<(Block, Block)> = Vec::new();
        for block in self.graph.blocks().collect::<Vec<_>>() {
            if escaped.contains(block) {
                continue;
            }
            for &succ in self.graph.succs(block).to_vec().iter() {
                if escaped.contains(succ) {
                    frontier.push((block, succ));
                }
            }
        }
        // Every materialization must replay a history that starts at the
        // allocation.
        for &(p, _) in &frontier {
            if !domtree.dominates(def_block, p) {
                return false;
            }
        }

        // Field contents along the non-escaped region, one map per block
        // exit. Disagreeing merges would need value phis before the object
        // even escapes; those cohorts stay scalar.
        let offsets: Vec<FieldRef> = {
            let mut seen: Vec<FieldRef> = Vec::new();
            for &access in uses.gets.iter().chain(uses.sets.iter()) {
                let field = self.graph.data(access).field().expect("field access");
                if field.is_volatile {
                    return false;
                }
                if !seen.contains(&field) {
                    seen.push(field);
                }
            }
            seen
        };
        let Some(field_maps) = self.compute_field_maps(alloc, def_block, &escaped, domtree)
        else {
            return false;
        };

        // ---- Point of no return: all checks passed. ----
        log::debug!("partial lse: sinking {} past {} frontier edges", alloc, frontier.len());

        // Materialize on each frontier edge whose head leads to an escape.
        let mut materialized: FxHashMap<(Block, Block), Inst> = FxHashMap::default();
        let mut mat_blocks: FxHashMap<Block, (Block, Block)> = FxHashMap::default();
        for &(p, s) in &frontier {
            if !reach.contains(s) {
                continue;
            }
            let m = self.graph.split_edge(p, s);
            let new_obj = self.graph.insert_before_terminator(
                m,
                InstructionData::NewInstance { class },
                Type::Reference,
            );
            // Replay the field history as of the end of `p`.
            let history = field_maps.get(&p).cloned().unwrap_or_default();
            for field in &offsets {
                if let Some(&value) = history.get(&field.offset) {
                    self.graph.insert_before_terminator(
                        m,
                        InstructionData::FieldSet {
                            args: [new_obj, value],
                            field: *field,
                        },
                        Type::Void,
                    );
                }
            }
            materialized.insert((p, s), new_obj);
            mat_blocks.insert(m, (p, s));
            self.stats.record(Stat::AllocationSunk);
        }

        // Reference and fallback values through the escaped region, in
        // RPO. The reference is the materialized object, a `{new, null}`
        // phi at partial joins; the fallback tracks the field value along
        // the paths that did not materialize.
        let domtree = DominatorTree::compute(self.graph);
        let null = self.graph.null_constant();
        let mut ref_value: FxHashMap<Block, Inst> = FxHashMap::default();
        let mut certain: FxHashMap<Block, bool> = FxHashMap::default();
        let mut fallback: FxHashMap<Block, FieldMap> = FxHashMap::default();

        let rpo: Vec<Block> = domtree.cfg_rpo().collect();
        for block in rpo {
            if !escaped.contains(block) {
                continue;
            }
            // Merge predecessor contributions.
            let preds = self.graph.preds(block).to_vec();
            let mut contributions: Vec<(Inst, bool, FieldMap)> = Vec::new();
            for &pred in &preds {
                if let Some(&(p, _s)) = mat_blocks.get(&pred) {
                    // A materialization edge: the object exists for sure.
                    let obj = materialized[&(p, block)];
                    let mut fields = FieldMap::default();
                    for field in &offsets {
                        fields.insert(field.offset, self.zero_for(*field, &uses));
                    }
                    contributions.push((obj, true, fields));
                } else if escaped.contains(pred) {
                    let obj = ref_value.get(&pred).copied().unwrap_or(null);
                    let is_certain = certain.get(&pred).copied().unwrap_or(false);
                    let fields = fallback.get(&pred).cloned().unwrap_or_default();
                    contributions.push((obj, is_certain, fields));
                } else {
                    // A frontier edge that does not materialize: the
                    // object does not exist along it.
                    let fields = field_maps.get(&pred).cloned().unwrap_or_default();
                    contributions.push((null, false, fields));
                }
            }

            let all_certain = contributions.iter().all(|(_, c, _)| *c);
            let (reference, is_certain) = match contributions.as_slice() {
                [] => (null, false),
                [(obj, certain, _)] => (*obj, *certain),
                _ => {
                    let first = contributions[0].0;
                    if contributions.iter().all(|(o, ..)| *o == first) {
                        (first, all_certain)
                    } else {
                        let inputs: Vec<Inst> =
                            contributions.iter().map(|(o, ..)| *o).collect();
                        let phi = self.graph.add_phi(block, &inputs, Type::Reference);
                        (phi, all_certain)
                    }
                }
            };
            // Fallback field values, merged per offset (value phis at
            // partial joins).
            let mut fields = FieldMap::default();
            for field in &offsets {
                let inputs: Vec<Inst> = contributions
                    .iter()
                    .map(|(_, _, m)| {
                        m.get(&field.offset)
                            .copied()
                            .unwrap_or_else(|| self.zero_for(*field, &uses))
                    })
                    .collect();
                let merged = match inputs.as_slice() {
                    [] => self.zero_for(*field, &uses),
                    [v] => *v,
                    _ if inputs.iter().all(|&v| v == inputs[0]) => inputs[0],
                    _ => {
                        let ty = self.graph.ty(inputs[0]).promoted();
                        self.graph.add_phi(block, &inputs, ty)
                    }
                };
                fields.insert(field.offset, merged);
            }

            // Walk the block, rewriting accesses to the allocation.
            for inst in self.graph.insts(block).to_vec() {
                match *self.graph.data(inst) {
                    InstructionData::FieldGet { args, field } if args[0] == alloc => {
                        if is_certain {
                            self.graph.replace_input(inst, 0, reference);
                        } else {
                            let fb = fields
                                .get(&field.offset)
                                .copied()
                                .unwrap_or_else(|| self.zero_for(field, &uses));
                            let predicated = self.graph.insert_before(
                                InstructionData::PredicatedGet {
                                    args: [reference, fb],
                                    field,
                                },
                                self.graph.ty(inst),
                                inst,
                            );
                            self.graph.replace_all_uses_with(inst, predicated);
                            self.graph.remove(inst);
                            self.stats.record(Stat::PredicatedMemoryOp);
                        }
                        self.changed = true;
                    }
                    InstructionData::FieldSet { args, field } if args[0] == alloc => {
                        let value = args[1];
                        if is_certain {
                            self.graph.replace_input(inst, 0, reference);
                        } else {
                            self.graph.insert_before(
                                InstructionData::PredicatedSet {
                                    args: [reference, value],
                                    field,
                                },
                                Type::Void,
                                inst,
                            );
                            self.graph.remove(inst);
                            self.stats.record(Stat::PredicatedMemoryOp);
                        }
                        fields.insert(field.offset, value);
                        self.changed = true;
                    }
                    _ => {
                        // Escape uses take the reference itself.
                        if self.graph.args(inst).contains(&alloc) {
                            for (index, &arg) in
                                self.graph.args(inst).to_vec().iter().enumerate()
                            {
                                if arg == alloc {
                                    self.graph.replace_input(inst, index, reference);
                                }
                            }
                            self.changed = true;
                        }
                    }
                }
                // The object the pin refers to is now the materialized
                // one.
                if let Some(env) = self.graph.env_of(inst) {
                    let values: Vec<Option<Inst>> = self
                        .graph
                        .env_data(env)
                        .values
                        .iter()
                        .map(|v| v.expand())
                        .collect();
                    for (slot, value) in values.into_iter().enumerate() {
                        if value == Some(alloc) {
                            self.graph.env_set_value(env, slot, Some(reference));
                        }
                    }
                }
            }

            ref_value.insert(block, reference);
            certain.insert(block, is_certain);
            fallback.insert(block, fields);
        }

        // Non-escaped accesses: reads were folded to tracked values during
        // the field-map computation; the stores only feed materialization
        // replays now.
        self.rewrite_non_escaped(alloc, &escaped, &field_maps);

        // Environment pins along never-escaping paths have nothing to
        // refer to in a non-debuggable frame.
        for eu in self.graph.env_uses(alloc).to_vec() {
            self.graph.env_set_value(eu.env, eu.index as usize, None);
        }

        debug_assert!(!self.graph.has_uses(alloc), "all uses rewritten");
        self.graph.remove(alloc);
        self.changed = true;
        true
    }

    /// The zero constant for a field, typed by the accesses that touch it.
    fn zero_for(&mut self, field: FieldRef, uses: &UseClassification) -> Inst {
        for &get in &uses.gets {
            if self.graph.is_in_block(get) {
                if let Some(f) = self.graph.data(get).field() {
                    if f.offset == field.offset {
                        let ty = self.graph.ty(get);
                        return self.graph.zero_constant(ty);
                    }
                }
            }
        }
        for &set in &uses.sets {
            if self.graph.is_in_block(set) {
                if let Some(f) = self.graph.data(set).field() {
                    if f.offset == field.offset {
                        let ty = self.graph.ty(self.graph.args(set)[1]);
                        return self.graph.zero_constant(ty);
                    }
                }
            }
        }
        self.graph.int_constant(0)
    }

    /// Field contents at the exit of every non-escaped block the object
    /// lives in. `None` when a merge disagrees (that would need value phis
    /// before any escape).
    fn compute_field_maps(
        &self,
        alloc: Inst,
        def_block: Block,
        escaped: &EntitySet<Block>,
        domtree: &DominatorTree,
    ) -> Option<FxHashMap<Block, FieldMap>> {
        let mut maps: FxHashMap<Block, FieldMap> = FxHashMap::default();
        let rpo: Vec<Block> = domtree.cfg_rpo().collect();
        for block in rpo {
            if escaped.contains(block) || !domtree.dominates(def_block, block) {
                continue;
            }
            let mut fields = if block == def_block {
                FieldMap::default()
            } else {
                // Merge predecessors; everything is dominated by the
                // definition, so predecessors are in the region too.
                let preds = self.graph.preds(block);
                let mut merged: Option<FieldMap> = None;
                for &pred in preds {
                    let m = maps.get(&pred).cloned().unwrap_or_default();
                    match &merged {
                        None => merged = Some(m),
                        Some(existing) if *existing == m => {}
                        Some(_) => return None,
                    }
                }
                merged.unwrap_or_default()
            };
            for inst in self.graph.insts(block) {
                if let InstructionData::FieldSet { args, field } = *self.graph.data(*inst) {
                    if args[0] == alloc {
                        fields.insert(field.offset, args[1]);
                    }
                }
            }
            maps.insert(block, fields);
        }
        Some(maps)
    }

    /// Forward non-escaped reads to the tracked value and drop the
    /// non-escaped stores (their history lives in the materializations).
    fn rewrite_non_escaped(
        &mut self,
        alloc: Inst,
        escaped: &EntitySet<Block>,
        field_maps: &FxHashMap<Block, FieldMap>,
    ) {
        for u in self.graph.uses(alloc).to_vec() {
            let user = u.user;
            let Some(block) = self.graph.block_of(user) else {
                continue;
            };
            if escaped.contains(block) {
                continue;
            }
            match *self.graph.data(user) {
                InstructionData::FieldGet { field, .. } => {
                    // Value at this point: replay the block prefix over the
                    // entry map.
                    let mut fields = self.entry_field_map(block, field_maps);
                    for inst in self.graph.insts(block).to_vec() {
                        if inst == user {
                            break;
                        }
                        if let InstructionData::FieldSet { args, field } =
                            *self.graph.data(inst)
                        {
                            if args[0] == alloc {
                                fields.insert(field.offset, args[1]);
                            }
                        }
                    }
                    let ty = self.graph.ty(user);
                    let value = fields
                        .get(&field.offset)
                        .copied()
                        .unwrap_or_else(|| self.graph.zero_constant(ty));
                    self.graph.replace_all_uses_with(user, value);
                    self.graph.remove(user);
                    self.stats.record(Stat::LoadEliminated);
                }
                InstructionData::FieldSet { .. } => {
                    self.graph.remove(user);
                    self.stats.record(Stat::StoreEliminated);
                }
                _ => unreachable!("classified uses only"),
            }
        }
    }

    fn entry_field_map(
        &self,
        block: Block,
        field_maps: &FxHashMap<Block, FieldMap>,
    ) -> FieldMap {
        let preds = self.graph.preds(block);
        if preds.is_empty() {
            return FieldMap::default();
        }
        field_maps.get(&preds[0]).cloned().unwrap_or_default()
    }
}

/// Remove stores into allocations that never escape and whose loads were
/// all forwarded: the writes are unobservable.
fn remove_unobserved_stores(graph: &mut Graph, stats: &mut CompilationStats) -> bool {
    let mut changed = false;
    let allocs: Vec<Inst> = graph
        .blocks()
        .flat_map(|b| graph.insts(b).to_vec())
        .filter(|&i| graph.opcode(i) == Opcode::NewInstance)
        .collect();
    for alloc in allocs {
        let uses = classify_uses(graph, alloc);
        if !uses.escapes.is_empty() || !uses.gets.is_empty() {
            continue;
        }
        if graph
            .env_uses(alloc)
            .iter()
            .any(|eu| env_use_escapes(graph, graph.env_holder(eu.env)))
        {
            continue;
        }
        for set in uses.sets {
            log::trace!("lse: dropping unobserved store {}", set);
            graph.remove(set);
            stats.record(Stat::StoreEliminated);
            changed = true;
        }
    }
    changed
}

/// Run load-store elimination (scalar, then partial) over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::load_store_elimination();
    if graph.has_try_catch() {
        return Err(crate::passes::Bailout::UnsupportedIr("try/catch"));
    }
    if graph.has_irreducible_loops() {
        return Err(crate::passes::Bailout::UnsupportedIr("irreducible loops"));
    }

    let mut changed = false;

    // Scalar LSE.
    {
        let domtree = DominatorTree::compute(graph);
        let forest = LoopForest::compute(graph, &domtree);
        if forest.has_irreducible() {
            return Err(crate::passes::Bailout::UnsupportedIr("irreducible loops"));
        }
        let effects = SideEffectsAnalysis::compute(graph, &forest);
        let lsa = LoadStoreAnalysis::compute(graph);
        let mut scalar = ScalarLse {
            graph,
            lsa: &lsa,
            forest: &forest,
            effects: &effects,
            stats,
            exit_states: SecondaryMap::new(),
            processed: EntitySet::new(),
            phi_cache: FxHashMap::default(),
            changed: false,
        };
        scalar.run();
        changed |= scalar.changed;
    }

    changed |= remove_unobserved_stores(graph, stats);

    // Partial LSE over the partially-escaping allocations.
    {
        let domtree = DominatorTree::compute(graph);
        let forest = LoopForest::compute(graph, &domtree);
        let allocs: Vec<Inst> = graph
            .blocks()
            .flat_map(|b| graph.insts(b).to_vec())
            .filter(|&i| graph.opcode(i) == Opcode::NewInstance)
            .collect();
        let mut partial = PartialLse {
            graph,
            stats,
            changed: false,
        };
        for alloc in allocs {
            if partial.sink_allocation(alloc, &domtree, &forest) {
                // The CFG changed; later candidates see fresh analyses.
                break;
            }
        }
        changed |= partial.changed;
    }

    Ok(changed)
}
