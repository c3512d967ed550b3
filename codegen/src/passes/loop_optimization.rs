//! Loop optimization.
//!
//! Builds a loop hierarchy over the linearization order and traverses it
//! inner-to-outer. Per loop, repeatedly:
//!
//! - **induction simplification**: an induction cycle whose value is only
//!   consumed after the loop is replaced by its last value and deleted;
//! - **block simplification**: dead instructions are removed, straight
//!   pairs of blocks merge, and a trivial `If` whose arms reconverge into
//!   an empty merge is bypassed;
//! - **empty and unit-trip loop removal**: a body with no observable
//!   effects beyond iteration (or a loop that runs exactly once) is spliced
//!   out, external uses of the induction taking the last value;
//! - innermost counted loops are handed to the [`vectorizer`].
//!
//! Block-level surgery invalidates the control-flow analyses, so the pass
//! restarts its analyses after each structural change; every such change
//! strictly shrinks the graph or consumes a loop, which bounds the number
//! of rounds.
//!
//! [`vectorizer`]: crate::passes::vectorizer

use crate::dominator_tree::DominatorTree;
use crate::fx::FxHashSet;
use crate::induction::{InductionAnalysis, InductionClass};
use crate::ir::{Block, Graph, Inst, Loop, Opcode};
use crate::isa::IsaInfo;
use crate::linear_order::linearize;
use crate::loop_analysis::LoopForest;
use crate::passes::{vectorizer, Bailout, PassResult};
use crate::stats::{CompilationStats, Stat};
use crate::timing;

/// Enables vectorization (SIMDization) in the loop optimizer.
const ENABLE_VECTORIZATION: bool = true;

/// Upper bound on analyze-transform rounds, well above anything a real
/// method reaches.
const MAX_ROUNDS: usize = 64;

/// One node of the loop hierarchy, linked in linearization order.
struct LoopNode {
    lp: Loop,
    outer: Option<usize>,
    inner: Option<usize>,
    previous: Option<usize>,
    next: Option<usize>,
}

struct Hierarchy {
    nodes: Vec<LoopNode>,
    top: Option<usize>,
}

/// Build the nested-and-sibling forest by scanning loop headers in
/// linearization order.
fn build_hierarchy(forest: &LoopForest, order: &[Block]) -> Hierarchy {
    let mut hierarchy = Hierarchy {
        nodes: Vec::new(),
        top: None,
    };
    let mut last: Option<usize> = None;
    for &block in order {
        if !forest.is_loop_header(block) {
            continue;
        }
        let lp = forest.innermost_loop(block).expect("header has a loop");
        let node = hierarchy.nodes.len();
        hierarchy.nodes.push(LoopNode {
            lp,
            outer: None,
            inner: None,
            previous: None,
            next: None,
        });
        match last {
            None => {
                hierarchy.top = Some(node);
            }
            Some(mut prev) => {
                if forest.is_in(lp, hierarchy.nodes[prev].lp) {
                    // Inner loop.
                    hierarchy.nodes[node].outer = Some(prev);
                    debug_assert!(hierarchy.nodes[prev].inner.is_none());
                    hierarchy.nodes[prev].inner = Some(node);
                } else {
                    // Subsequent loop: walk out to the first enclosing
                    // context this loop still belongs to.
                    while let Some(outer) = hierarchy.nodes[prev].outer {
                        if forest.is_in(lp, hierarchy.nodes[outer].lp) {
                            break;
                        }
                        prev = outer;
                    }
                    hierarchy.nodes[node].outer = hierarchy.nodes[prev].outer;
                    hierarchy.nodes[node].previous = Some(prev);
                    debug_assert!(hierarchy.nodes[prev].next.is_none());
                    hierarchy.nodes[prev].next = Some(node);
                }
            }
        }
        last = Some(node);
    }
    hierarchy
}

/// What a traversal round did.
#[derive(PartialEq, Eq)]
enum Outcome {
    /// Nothing structural; the analyses are still valid.
    Done,
    /// Blocks or loops changed; recompute everything and go again.
    Restart,
}

struct LoopOptimizer<'a> {
    graph: &'a mut Graph,
    isa: &'a IsaInfo,
    stats: &'a mut CompilationStats,
    forest: LoopForest,
    induction: InductionAnalysis,
    changed: bool,
}

impl<'a> LoopOptimizer<'a> {
    fn traverse_inner_to_outer(&mut self, hierarchy: &Hierarchy, start: Option<usize>) -> Outcome {
        let mut node = start;
        while let Some(n) = node {
            if let Some(inner) = hierarchy.nodes[n].inner {
                if self.traverse_inner_to_outer(hierarchy, Some(inner)) == Outcome::Restart {
                    return Outcome::Restart;
                }
            }
            // Repeat simplifications until no more changes occur; each
            // round only eliminates code, so this is finite.
            loop {
                let mut simplified = self.simplify_induction(hierarchy.nodes[n].lp);
                match self.simplify_blocks(hierarchy.nodes[n].lp) {
                    Outcome::Restart => return Outcome::Restart,
                    Outcome::Done => {}
                }
                simplified |= self.dead_instruction_round(hierarchy.nodes[n].lp);
                if !simplified {
                    break;
                }
            }
            if hierarchy.nodes[n].inner.is_none()
                && self.optimize_inner_loop(hierarchy.nodes[n].lp) == Outcome::Restart
            {
                return Outcome::Restart;
            }
            node = hierarchy.nodes[n].next;
        }
        Outcome::Done
    }

    /// Remove induction cycles only used outside the loop, rewriting those
    /// uses to the last value.
    fn simplify_induction(&mut self, lp: Loop) -> bool {
        let header = self.forest.header(lp);
        let Some(pre_header) = self.forest.pre_header(lp) else {
            return false;
        };
        let mut simplified = false;
        for phi in self.graph.phis(header).to_vec() {
            if !self.graph.is_in_block(phi) {
                continue;
            }
            let Some(iset) = self.phi_induction_set(phi, true) else {
                continue;
            };
            if !self.try_assign_last_value(lp, phi, &iset, pre_header, false) {
                continue;
            }
            for &member in &iset {
                if self.graph.is_in_block(member) {
                    self.graph.remove_unchecked(member);
                }
            }
            self.stats.record(Stat::InductionCycleRemoved);
            self.changed = true;
            simplified = true;
        }
        simplified
    }

    /// The induction cycle of `phi` as a set, when every member is
    /// removable and (with `restrict_uses`) the non-phi members are only
    /// consumed within the cycle.
    fn phi_induction_set(&self, phi: Inst, restrict_uses: bool) -> Option<FxHashSet<Inst>> {
        let info = self.induction.info(phi)?;
        if info.class == InductionClass::Unknown {
            return None;
        }
        let cycle: FxHashSet<Inst> = info.cycle.iter().copied().collect();
        for &member in &cycle {
            if !self.graph.is_in_block(member) {
                continue;
            }
            if !self.graph.data(member).is_removable() {
                return None;
            }
            if member != phi && restrict_uses {
                for u in self.graph.uses(member) {
                    if !cycle.contains(&u.user) {
                        return None;
                    }
                }
            }
        }
        Some(cycle)
    }

    fn try_assign_last_value(
        &mut self,
        lp: Loop,
        phi: Inst,
        iset: &FxHashSet<Inst>,
        emit_at: Block,
        collect_loop_uses: bool,
    ) -> bool {
        assign_last_value(
            self.graph,
            &self.forest,
            &self.induction,
            lp,
            phi,
            iset,
            emit_at,
            collect_loop_uses,
        )
    }

    /// Remove dead instructions from the loop body.
    fn dead_instruction_round(&mut self, lp: Loop) -> bool {
        let mut removed = false;
        for block in self.forest.blocks(lp).collect::<Vec<_>>() {
            if !self.graph.is_block_live(block) {
                continue;
            }
            for inst in self.graph.insts(block).to_vec().into_iter().rev() {
                if self.graph.data(inst).is_removable()
                    && !self.graph.has_uses(inst)
                    && !self.graph.has_env_uses(inst)
                {
                    self.graph.remove(inst);
                    removed = true;
                    self.changed = true;
                }
            }
        }
        removed
    }

    /// Merge trivial control flow inside the loop body.
    fn simplify_blocks(&mut self, lp: Loop) -> Outcome {
        let header = self.forest.header(lp);
        for block in self.forest.blocks(lp).collect::<Vec<_>>() {
            if !self.graph.is_block_live(block) || block == header {
                continue;
            }
            // Merge a straight pair of blocks.
            if self.graph.preds(block).len() == 1 && self.graph.succs(block).len() == 1 {
                let succ = self.graph.succs(block)[0];
                if self.graph.preds(succ).len() == 1
                    && succ != header
                    && self
                        .graph
                        .terminator(block)
                        .map(|t| self.graph.opcode(t) == Opcode::Goto)
                        .unwrap_or(false)
                {
                    log::trace!("loop_optimization: merging {} into {}", succ, block);
                    self.graph.merge_with(block);
                    self.changed = true;
                    return Outcome::Restart;
                }
            }
            // Bypass a trivial if whose empty arms reconverge.
            if self.graph.succs(block).len() == 2 {
                let succ0 = self.graph.succs(block)[0];
                let succ1 = self.graph.succs(block)[1];
                let meet0 = single_goto_target(self.graph, succ0);
                let meet1 = single_goto_target(self.graph, succ1);
                if let (Some(meet0), Some(meet1)) = (meet0, meet1) {
                    if succ0 != succ1
                        && meet0 == meet1
                        && meet0 != block
                        && self.graph.phis(meet0).is_empty()
                    {
                        log::trace!("loop_optimization: bypassing trivial if at {}", block);
                        let terminator = self.graph.terminator(block).unwrap();
                        self.graph.disconnect_and_delete(succ0);
                        self.graph.remove(terminator);
                        self.graph.append(
                            block,
                            crate::ir::InstructionData::Nullary {
                                opcode: Opcode::Goto,
                            },
                            crate::ir::Type::Void,
                        );
                        self.changed = true;
                        return Outcome::Restart;
                    }
                }
            }
        }
        Outcome::Done
    }

    /// The `SuspendCheck + Condition + If` header shape; returns the
    /// excluded instruction set (induction cycle, suspend check,
    /// condition) on success.
    fn simple_loop_header(&self, lp: Loop) -> Option<FxHashSet<Inst>> {
        let header = self.forest.header(lp);
        let &[phi] = self.graph.phis(header) else {
            return None;
        };
        let mut iset = self.phi_induction_set(phi, false)?;
        let &[suspend, cond, terminator] = self.graph.insts(header) else {
            return None;
        };
        if self.graph.opcode(suspend) != Opcode::SuspendCheck {
            return None;
        }
        if !self.graph.opcode(cond).is_condition() || self.graph.uses(cond).len() != 1 {
            return None;
        }
        if self.graph.opcode(terminator) != Opcode::If || self.graph.args(terminator) != &[cond] {
            return None;
        }
        iset.insert(suspend);
        iset.insert(cond);
        Some(iset)
    }

    /// A body with no observable effects beyond iteration.
    fn is_empty_body(&self, body: Block, iset: &FxHashSet<Inst>) -> bool {
        self.graph.phis(body).is_empty()
            && self.graph.insts(body).iter().all(|&inst| {
                self.graph.opcode(inst) == Opcode::Goto || iset.contains(&inst)
            })
    }

    /// Empty/unit-trip removal and vectorization of an innermost loop.
    fn optimize_inner_loop(&mut self, lp: Loop) -> Outcome {
        let header = self.forest.header(lp);
        let Some(pre_header) = self.forest.pre_header(lp) else {
            return Outcome::Done;
        };
        // Ensure the loop header logic is finite.
        if !self.induction.is_finite(lp) {
            return Outcome::Done;
        }
        // A single body block besides the header.
        let mut body = None;
        for block in self.forest.blocks(lp) {
            if block != header {
                if body.is_some() {
                    return Outcome::Done;
                }
                body = Some(block);
            }
        }
        let Some(body) = body else {
            return Outcome::Done;
        };
        // A single exit point, reached only from this loop.
        let succs = self.graph.succs(header);
        if succs.len() != 2 {
            return Outcome::Done;
        }
        let exit = if succs[0] == body { succs[1] } else { succs[0] };
        if self.graph.preds(exit).len() != 1 || !self.graph.phis(exit).is_empty() {
            return Outcome::Done;
        }

        let Some(iset) = self.simple_loop_header(lp) else {
            return Outcome::Done;
        };
        let phi = self.graph.phis(header)[0];
        let trip_count = self.induction.trip_count(lp).map(|tc| tc.known);

        let is_empty = self.is_empty_body(body, &iset);
        if (is_empty || trip_count == Some(Some(1)))
            && self.try_assign_last_value(lp, phi, &iset, pre_header, true)
        {
            if !is_empty {
                // Unroll the loop body, which sees the initial value of
                // the index.
                let init = self.graph.args(phi)[0];
                self.graph.replace_all_uses_with(phi, init);
                self.graph.hoist_instructions_into(body, pre_header);
            }
            self.remove_counted_loop(lp, header, body, exit, pre_header);
            self.stats.record(if is_empty {
                Stat::EmptyLoopRemoved
            } else {
                Stat::UnitTripLoopRemoved
            });
            self.changed = true;
            return Outcome::Restart;
        }

        // Vectorize the loop, if possible and valid.
        if ENABLE_VECTORIZATION {
            let vectorized = vectorizer::vectorize_loop(vectorizer::Candidate {
                graph: &mut *self.graph,
                isa: self.isa,
                stats: &mut *self.stats,
                forest: &self.forest,
                induction: &self.induction,
                lp,
                header,
                body,
                exit,
                pre_header,
                iset: &iset,
            });
            if vectorized {
                self.changed = true;
                return Outcome::Restart;
            }
        }
        Outcome::Done
    }

    /// Splice the pre-header into the exit, deleting the header and body.
    fn remove_counted_loop(
        &mut self,
        _lp: Loop,
        header: Block,
        body: Block,
        exit: Block,
        pre_header: Block,
    ) {
        self.graph.disconnect_edge(header, exit);
        for inst in self.graph.insts(header).to_vec().into_iter().rev() {
            self.graph.remove_unchecked(inst);
        }
        for phi in self.graph.phis(header).to_vec() {
            self.graph.remove_unchecked(phi);
        }
        self.graph.disconnect_and_delete(body);
        self.graph.disconnect_and_delete(header);
        self.graph.add_edge(pre_header, exit);
    }
}

/// Replace uses of `phi` outside `iset` with the loop's last value.
/// Succeeds trivially when there are no such uses; otherwise the loop must
/// have no early exit and a computable last value. With
/// `collect_loop_uses`, uses inside the loop are tolerated by joining the
/// excluded set (for a loop about to be dismantled); otherwise they block
/// the transformation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assign_last_value(
    graph: &mut Graph,
    forest: &LoopForest,
    induction: &InductionAnalysis,
    lp: Loop,
    phi: Inst,
    iset: &FxHashSet<Inst>,
    emit_at: Block,
    collect_loop_uses: bool,
) -> bool {
    let mut iset = iset.clone();
    let mut use_count = 0usize;
    for u in graph.uses(phi).to_vec() {
        if iset.contains(&u.user) {
            continue;
        }
        let user_block = graph.block_of(u.user).expect("user in a block");
        let in_loop = match forest.innermost_loop(user_block) {
            Some(l) => forest.is_in(l, lp),
            None => false,
        };
        if in_loop {
            if collect_loop_uses {
                iset.insert(u.user);
                continue;
            }
            return false;
        }
        use_count += 1;
    }
    let env_outside = graph
        .env_uses(phi)
        .iter()
        .filter(|eu| !iset.contains(&graph.env_holder(eu.env)))
        .count();

    if use_count == 0 && env_outside == 0 {
        return true;
    }
    if !induction.can_generate_last_value(graph, forest, lp, phi) {
        return false;
    }
    let last = induction.generate_last_value(graph, lp, phi, emit_at);
    for u in graph.uses(phi).to_vec() {
        if !iset.contains(&u.user) {
            graph.replace_input(u.user, u.index as usize, last);
        }
    }
    for eu in graph.env_uses(phi).to_vec() {
        if !iset.contains(&graph.env_holder(eu.env)) {
            graph.env_set_value(eu.env, eu.index as usize, Some(last));
        }
    }
    true
}

/// A single-goto block forwards to its successor.
fn single_goto_target(graph: &Graph, block: Block) -> Option<Block> {
    if graph.preds(block).len() == 1
        && graph.succs(block).len() == 1
        && graph.phis(block).is_empty()
        && graph.insts(block).len() == 1
        && graph.opcode(graph.insts(block)[0]) == Opcode::Goto
    {
        Some(graph.succs(block)[0])
    } else {
        None
    }
}

/// Run loop optimization over `graph`.
pub fn run(graph: &mut Graph, isa: &IsaInfo, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::loop_optimization();
    // Skip if there is no loop or the graph has try-catch or irreducible
    // loops.
    if !graph.has_loops() {
        return Ok(false);
    }
    if graph.has_try_catch() {
        return Err(Bailout::UnsupportedIr("try/catch"));
    }
    if graph.has_irreducible_loops() {
        return Err(Bailout::UnsupportedIr("irreducible loops"));
    }

    let mut changed = false;
    for _round in 0..MAX_ROUNDS {
        let domtree = DominatorTree::compute(graph);
        let forest = LoopForest::compute(graph, &domtree);
        if forest.has_irreducible() {
            return if changed {
                Ok(true)
            } else {
                Err(Bailout::UnsupportedIr("irreducible loops"))
            };
        }
        if forest.is_empty() {
            // No more loops.
            graph.set_has_loops(false);
            break;
        }
        let induction = InductionAnalysis::compute(graph, &forest);
        let order = linearize(graph, &forest);
        let hierarchy = build_hierarchy(&forest, &order);

        let mut optimizer = LoopOptimizer {
            graph,
            isa,
            stats,
            forest,
            induction,
            changed: false,
        };
        let outcome = optimizer.traverse_inner_to_outer(&hierarchy, hierarchy.top);
        changed |= optimizer.changed;
        if outcome == Outcome::Done {
            break;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::ir::{InstructionData, Type};
    use crate::verifier::assert_valid;
    use core::str::FromStr;

    fn isa() -> IsaInfo {
        // A target with no SIMD, so these tests exercise only the scalar
        // loop transforms.
        IsaInfo::new(target_lexicon::Triple::from_str("riscv64gc-unknown-linux-gnu").unwrap())
    }

    #[test]
    fn empty_loop_is_removed() {
        let (mut g, l) = testgraph::counted_loop(None);
        // One external use of i after the loop.
        let user = g.insert_before_terminator(
            l.exit,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [l.phi],
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &isa(), &mut stats), Ok(true));
        assert!(!g.is_block_live(l.header));
        assert!(!g.is_block_live(l.body));
        assert!(g.succs(l.preheader).contains(&l.exit));
        // The external use now reads the loop bound (`n`, since the loop
        // ran `i` from 0 to n).
        assert_eq!(g.args(user), &[l.bound]);
        assert!(!g.has_loops());
        assert_eq!(stats.count(Stat::EmptyLoopRemoved), 1);
        assert_valid(&g);
    }

    #[test]
    fn unit_trip_loop_is_unrolled() {
        let (mut g, l) = testgraph::counted_loop(Some(1));
        let arr = g.insert_before(
            InstructionData::Parameter { index: 1 },
            Type::Reference,
            g.terminator(l.preheader).unwrap(),
        );
        // A store in the body makes it non-empty: a[i] = i.
        let store = g.insert_before_terminator(
            l.body,
            InstructionData::ArraySet {
                args: [arr, l.phi, l.phi],
            },
            Type::Void,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &isa(), &mut stats), Ok(true));
        assert!(!g.is_block_live(l.header));
        assert!(!g.is_block_live(l.body));
        // The store ran once with i = 0.
        assert_eq!(g.block_of(store), Some(l.preheader));
        let zero = g.int_constant(0);
        assert_eq!(g.args(store), &[arr, zero, zero]);
        assert_eq!(stats.count(Stat::UnitTripLoopRemoved), 1);
        assert_valid(&g);
    }

    #[test]
    fn induction_cycle_used_inside_is_kept() {
        let (mut g, l) = testgraph::counted_loop(None);
        let arr = g.insert_before(
            InstructionData::Parameter { index: 1 },
            Type::Reference,
            g.terminator(l.preheader).unwrap(),
        );
        let store = g.insert_before_terminator(
            l.body,
            InstructionData::ArraySet {
                args: [arr, l.phi, l.phi],
            },
            Type::Void,
        );

        let mut stats = CompilationStats::new();
        run(&mut g, &isa(), &mut stats).unwrap();
        // The loop must survive: the body has observable effects.
        assert!(g.is_block_live(l.header));
        assert!(g.is_in_block(store));
        assert!(g.has_loops());
        assert_valid(&g);
    }

    #[test]
    fn secondary_induction_is_simplified() {
        // for (i = 0; i < n; i++, k++) { } return k; with k starting at 5.
        let (mut g, l) = testgraph::counted_loop(None);
        let five = g.int_constant(5);
        let one = g.int_constant(1);
        let k = g.add_phi(l.header, &[five, five], Type::Int32);
        let k_update = g.insert_before_terminator(
            l.body,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [k, one],
            },
            Type::Int32,
        );
        g.replace_input(k, 1, k_update);
        let user = g.insert_before_terminator(
            l.exit,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [k],
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &isa(), &mut stats), Ok(true));
        assert!(!g.is_in_block(k));
        assert!(!g.is_in_block(k_update));
        // k's last value is 5 + n.
        let last = g.args(user)[0];
        assert_eq!(g.opcode(last), Opcode::Add);
        assert_eq!(g.args(last)[0], five);
        assert_eq!(g.args(last)[1], l.bound);
        assert!(stats.count(Stat::InductionCycleRemoved) >= 1);
        assert_valid(&g);
    }
}
