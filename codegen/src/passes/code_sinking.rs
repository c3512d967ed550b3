//! Code sinking.
//!
//! Moves side-effect-free computations (and heap stores into objects that
//! can themselves move) into blocks reachable only through uncommon
//! branches, so the hot path no longer pays for values that are only
//! consumed when throwing. Uncommon branches are currently identified by
//! `Throw` terminators among the exit block's predecessors.
//!
//! For each throwing exit predecessor `end`:
//!
//! 1. walk the post-order to find a conservative subset of blocks
//!    post-dominated by `end` (loops are never included);
//! 2. grow a worklist of candidates from the inputs of instructions in
//!    that subset, accepting an instruction once all its users are in the
//!    subset or are accepted candidates themselves, and its environment
//!    uses elsewhere tolerate the move;
//! 3. move each candidate to the common dominator of its users, hoisted
//!    out of loops while the dominator chain stays inside the subset.
//!
//! Anything ambiguous stays where it is; the pass never produces an
//! invalid graph.

use crate::dominator_tree::DominatorTree;
use crate::fx::FxHashSet;
use crate::ir::{Block, Graph, Inst, InstructionData, Opcode};
use crate::loop_analysis::LoopForest;
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use gantry_entity::EntitySet;

fn is_interesting(graph: &Graph, inst: Inst) -> bool {
    // Instructions from the entry block (constants, parameters) are never
    // interesting to move.
    if graph.block_of(inst) == Some(graph.entry_block()) {
        return false;
    }
    let data = graph.data(inst);
    // Volatile stores cannot be moved.
    if let InstructionData::FieldSet { field, .. } = data {
        if field.is_volatile {
            return false;
        }
    }
    // Allocations can throw, but it is safe to move them.
    if data.opcode().is_allocation() {
        return true;
    }
    // All other instructions that can throw cannot be moved.
    if data.opcode().can_throw() {
        return false;
    }
    matches!(
        data.opcode(),
        Opcode::InstanceFieldSet | Opcode::ArraySet
    ) || data.can_be_moved()
}

/// Stores into an allocation that is itself being sunk are placed after
/// the allocation in a second step; when locating the allocation's
/// position they must not be counted as users.
fn should_filter_use(
    graph: &Graph,
    inst: Inst,
    user: Inst,
    post_dominated: &EntitySet<Block>,
) -> bool {
    let filtered = match graph.opcode(inst) {
        Opcode::NewInstance => graph.opcode(user) == Opcode::InstanceFieldSet,
        Opcode::NewArray => graph.opcode(user) == Opcode::ArraySet,
        _ => return false,
    };
    filtered
        && graph.args(user)[0] == inst
        && !post_dominated.contains(graph.block_of(user).expect("user in a block"))
}

struct Sinker<'a> {
    graph: &'a mut Graph,
    domtree: DominatorTree,
    forest: LoopForest,
    stats: &'a mut CompilationStats,
    changed: bool,
}

impl<'a> Sinker<'a> {
    /// Find the ideal position for moving `inst` into the post-dominated
    /// subset, or `None` when its users give no usable anchor.
    fn find_ideal_position(
        &self,
        inst: Inst,
        post_dominated: &EntitySet<Block>,
        filter: bool,
    ) -> Option<Inst> {
        let graph = &*self.graph;
        debug_assert!(!graph.is_phi(inst));

        // Target block: common dominator of every (unfiltered) use site.
        let mut target_block: Option<Block> = None;
        let update = |block: Block, target: &mut Option<Block>| {
            *target = Some(match *target {
                None => block,
                Some(cur) => self.domtree.common_dominator(cur, block),
            });
        };
        for u in graph.uses(inst) {
            if filter && should_filter_use(graph, inst, u.user, post_dominated) {
                continue;
            }
            let block = if graph.is_phi(u.user) {
                let phi_block = graph.block_of(u.user).expect("phi in a block");
                graph.preds(phi_block)[u.index as usize]
            } else {
                graph.block_of(u.user).expect("user in a block")
            };
            update(block, &mut target_block);
        }
        for eu in graph.env_uses(inst) {
            let holder = graph.env_holder(eu.env);
            update(
                graph.block_of(holder).expect("env holder in a block"),
                &mut target_block,
            );
        }
        // No user we can go next to? Likely a LSE or DCE limitation.
        let mut target_block = target_block?;

        // Move to the first dominator not in a loop, while the walk stays
        // inside the post-dominated subset.
        while self.forest.innermost_loop(target_block).is_some() {
            let idom = self.domtree.idom(target_block)?;
            if !post_dominated.contains(idom) {
                break;
            }
            target_block = idom;
        }

        // Find the insertion position: right above the first user in the
        // target block, otherwise in front of the terminator.
        let mut insert_pos: Option<Inst> = None;
        for u in graph.uses(inst) {
            let user = u.user;
            if graph.is_phi(user) || graph.block_of(user) != Some(target_block) {
                continue;
            }
            if insert_pos.map_or(true, |pos| self.domtree.strictly_dominates_inst(graph, user, pos))
            {
                insert_pos = Some(user);
            }
        }
        for eu in graph.env_uses(inst) {
            let holder = graph.env_holder(eu.env);
            if graph.block_of(holder) != Some(target_block) {
                continue;
            }
            if insert_pos.map_or(true, |pos| {
                self.domtree.strictly_dominates_inst(graph, holder, pos)
            }) {
                insert_pos = Some(holder);
            }
        }
        let insert_pos = match insert_pos {
            Some(pos) => pos,
            None => {
                // Avoid splitting a condition from its consuming `If`,
                // which would force the condition to materialize.
                let terminator = graph.terminator(target_block)?;
                if graph.opcode(terminator) == Opcode::If {
                    let cond = graph.args(terminator)[0];
                    let insts = graph.insts(target_block);
                    if insts.len() >= 2 && insts[insts.len() - 2] == cond {
                        return Some(cond);
                    }
                }
                terminator
            }
        };
        debug_assert!(!graph.is_phi(insert_pos));
        Some(insert_pos)
    }

    fn sink_code_to_uncommon_branch(&mut self, end_block: Block) {
        // Step (1): a conservative subset of blocks post-dominated by
        // `end_block`, taken from the post-order.
        let mut post_dominated: EntitySet<Block> = EntitySet::new();
        let mut found = false;
        for &block in self.domtree.cfg_postorder() {
            if block == end_block {
                found = true;
                post_dominated.insert(block);
            } else if found {
                let succs = self.graph.succs(block);
                let all_in = !succs.is_empty()
                    && succs.iter().all(|&s| post_dominated.contains(s));
                if all_in {
                    post_dominated.insert(block);
                }
            }
        }

        // Common dominator of the subset, to filter out users we could
        // never move past in step (2).
        let mut common_dominator = end_block;
        let mut worklist: Vec<Inst> = Vec::new();
        let mut processed: FxHashSet<Inst> = FxHashSet::default();
        let members: Vec<Block> = post_dominated.iter().collect();
        for &block in &members {
            common_dominator = self.domtree.common_dominator(common_dominator, block);
            for inst in self
                .graph
                .phis(block)
                .iter()
                .chain(self.graph.insts(block).iter())
            {
                for &input in self.graph.args(*inst) {
                    self.add_instruction(input, &post_dominated, &processed, &mut worklist);
                }
            }
        }

        // Step (2): find sinking candidates.
        let mut can_move: FxHashSet<Inst> = FxHashSet::default();
        let mut move_in_order: Vec<Inst> = Vec::new();
        while let Some(&inst) = worklist.last() {
            if processed.contains(&inst) {
                // Reached through several instructions; already decided.
                worklist.pop();
                continue;
            }
            let mut all_users_inside = true;
            let mut movable = true;
            for u in self.graph.uses(inst) {
                let user = u.user;
                let user_block = self.graph.block_of(user).expect("user in a block");
                if !post_dominated.contains(user_block) && !can_move.contains(&user) {
                    all_users_inside = false;
                    // The user would have to move first; if it cannot, or
                    // it sits below the region's dominator, give up. The
                    // domination check approximates post-dominance, which
                    // we do not have here.
                    if processed.contains(&user)
                        || !is_interesting(self.graph, user)
                        || !self.domtree.dominates(user_block, common_dominator)
                    {
                        movable = false;
                        break;
                    }
                }
            }
            if movable && all_users_inside {
                for eu in self.graph.env_uses(inst) {
                    let holder = self.graph.env_holder(eu.env);
                    let holder_block = self.graph.block_of(holder).expect("holder in a block");
                    if !post_dominated.contains(holder_block) {
                        let unsafe_user = self.graph.is_debuggable()
                            || self.graph.opcode(holder) == Opcode::Deoptimize
                            || (self.graph.opcode(holder).can_throw()
                                && self.graph.has_try_catch())
                            || (self.graph.opcode(holder) == Opcode::SuspendCheck
                                && self.graph.is_compiling_osr());
                        if unsafe_user {
                            movable = false;
                            break;
                        }
                    }
                }
            }
            if !movable {
                processed.insert(inst);
                worklist.pop();
            } else if all_users_inside {
                can_move.insert(inst);
                move_in_order.push(inst);
                processed.insert(inst);
                worklist.pop();
                for &input in self.graph.args(inst).to_vec().iter() {
                    self.add_instruction(input, &post_dominated, &processed, &mut worklist);
                }
                // Drop environment pins outside the subset; they would
                // otherwise anchor the instruction when we look for its
                // position in step (3).
                for eu in self.graph.env_uses(inst).to_vec() {
                    let holder = self.graph.env_holder(eu.env);
                    let holder_block = self.graph.block_of(holder).expect("holder in a block");
                    if !post_dominated.contains(holder_block) {
                        self.graph.env_set_value(eu.env, eu.index as usize, None);
                    }
                }
            } else {
                // Not enough information on the users yet; queue them and
                // revisit this instruction afterwards.
                for u in self.graph.uses(inst).to_vec() {
                    self.add_instruction(u.user, &post_dominated, &processed, &mut worklist);
                }
            }
        }

        // Step (3): move the candidates, stores after their target
        // allocation.
        for inst in move_in_order {
            let position = if matches!(
                self.graph.opcode(inst),
                Opcode::InstanceFieldSet | Opcode::ArraySet
            ) {
                let target = self.graph.args(inst)[0];
                if !can_move.contains(&target) {
                    // A store can only follow a heap location that is
                    // moving along with it.
                    continue;
                }
                let pos = self.find_ideal_position(target, &post_dominated, true);
                // The store must dominate the position to move there.
                match pos {
                    Some(pos) => {
                        let store_block = self.graph.block_of(inst).expect("store in a block");
                        let pos_block = self.graph.block_of(pos).expect("position in a block");
                        if !self.domtree.dominates(store_block, pos_block) {
                            continue;
                        }
                        pos
                    }
                    None => continue,
                }
            } else {
                match self.find_ideal_position(inst, &post_dominated, false) {
                    Some(pos) => pos,
                    None => continue,
                }
            };
            let pos_block = self.graph.block_of(position).expect("position in a block");
            if !post_dominated.contains(pos_block) {
                // Multiple users whose common dominator lies outside the
                // subset; bail for this instruction.
                continue;
            }
            log::trace!("code sinking: moving {} before {}", inst, position);
            self.graph.move_before(inst, position);
            self.stats.record(Stat::InstructionSunk);
            self.changed = true;
        }
    }

    fn add_instruction(
        &self,
        inst: Inst,
        post_dominated: &EntitySet<Block>,
        processed: &FxHashSet<Inst>,
        worklist: &mut Vec<Inst>,
    ) {
        let block = match self.graph.block_of(inst) {
            Some(b) => b,
            None => return,
        };
        if !post_dominated.contains(block)
            && !processed.contains(&inst)
            && is_interesting(self.graph, inst)
        {
            worklist.push(inst);
        }
    }
}

/// Run code sinking over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::code_sinking();
    let Some(exit) = graph.exit_block() else {
        // Infinite loop, just bail.
        return Ok(false);
    };
    let domtree = DominatorTree::compute(graph);
    let forest = LoopForest::compute(graph, &domtree);
    let mut sinker = Sinker {
        graph,
        domtree,
        forest,
        stats,
        changed: false,
    };
    for pred in sinker.graph.preds(exit).to_vec() {
        let Some(terminator) = sinker.graph.terminator(pred) else {
            continue;
        };
        if sinker.graph.opcode(terminator) == Opcode::Throw {
            sinker.sink_code_to_uncommon_branch(pred);
        }
    }
    Ok(sinker.changed)
}
