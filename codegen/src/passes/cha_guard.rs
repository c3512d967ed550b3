//! CHA guard optimization.
//!
//! Devirtualization backed by class-hierarchy analysis plants a guard
//! triple in front of the inlined body:
//!
//! ```text
//! flag = ShouldDeoptimizeFlag(receiver)
//! ne   = NotEqual(flag, 0)
//! Deoptimize(ne)
//! ```
//!
//! A guard is removable when the receiver is a method parameter (the
//! parameter pre-existed any invalidation of this compiled method, so the
//! fact the method is running proves the assumptions), or when another
//! guard between the receiver's definition and this point already
//! verified the same receiver. A guard on a loop-invariant receiver is
//! hoisted to the pre-header, reusing the loop suspend check's environment
//! with loop phis rewound to their pre-header values.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, Graph, Inst, InstructionData, Opcode, Type};
use crate::loop_analysis::LoopForest;
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use gantry_entity::EntitySet;

struct GuardTriple {
    flag: Inst,
    not_equal: Inst,
    deoptimize: Inst,
}

/// The `(flag, not_equal, deoptimize)` triple starting at `flag`, if the
/// front end's shape is intact.
fn guard_triple(graph: &Graph, block: Block, flag: Inst) -> Option<GuardTriple> {
    let insts = graph.insts(block);
    let pos = insts.iter().position(|&i| i == flag)?;
    let not_equal = *insts.get(pos + 1)?;
    if graph.opcode(not_equal) != Opcode::NotEqual || !graph.args(not_equal).contains(&flag) {
        return None;
    }
    let deoptimize = *insts.get(pos + 2)?;
    if graph.opcode(deoptimize) != Opcode::Deoptimize || graph.args(deoptimize) != &[not_equal] {
        return None;
    }
    Some(GuardTriple {
        flag,
        not_equal,
        deoptimize,
    })
}

fn remove_guard(graph: &mut Graph, triple: &GuardTriple) {
    graph.remove(triple.deoptimize);
    graph.remove(triple.not_equal);
    graph.remove(triple.flag);
}

struct ChaGuardPass<'a> {
    graph: &'a mut Graph,
    domtree: DominatorTree,
    forest: LoopForest,
    block_has_cha_guard: EntitySet<Block>,
    stats: &'a mut CompilationStats,
    changed: bool,
}

impl<'a> ChaGuardPass<'a> {
    fn optimize_guard(&mut self, block: Block, triple: GuardTriple) {
        // The guard logic keys on the receiver's definition point; the flag
        // itself does not need the receiver once we are done deciding.
        let mut receiver = self.graph.args(triple.flag)[0];
        let null = self.graph.null_constant();
        self.graph.replace_input(triple.flag, 0, null);
        if let InstructionData::Unary {
            opcode: Opcode::NullCheck,
            args,
        } = *self.graph.data(receiver)
        {
            receiver = args[0];
        }

        if self.optimize_for_parameter(&triple, receiver) {
            return;
        }
        if self.optimize_with_dominating_guard(block, &triple, receiver) {
            return;
        }
        if self.hoist_guard(block, &triple, receiver) {
            return;
        }

        // Need to keep the guard in place.
        self.block_has_cha_guard.insert(block);
        self.graph.set_has_cha_guards(true);
    }

    /// A parameter receiver pre-exists any invalidation of this method.
    fn optimize_for_parameter(&mut self, triple: &GuardTriple, receiver: Inst) -> bool {
        if self.graph.opcode(receiver) == Opcode::ParameterValue {
            remove_guard(self.graph, triple);
            self.stats.record(Stat::ChaGuardRemoved);
            self.changed = true;
            return true;
        }
        false
    }

    /// A dominating guard past the receiver's definition covers this one.
    fn optimize_with_dominating_guard(
        &mut self,
        block: Block,
        triple: &GuardTriple,
        receiver: Inst,
    ) -> bool {
        let receiver_def_block = self.graph.block_of(receiver);
        let mut dominator = block;
        while Some(dominator) != receiver_def_block {
            if self.block_has_cha_guard.contains(dominator) {
                remove_guard(self.graph, triple);
                self.stats.record(Stat::ChaGuardRemoved);
                self.changed = true;
                return true;
            }
            match self.domtree.idom(dominator) {
                Some(idom) => dominator = idom,
                None => break,
            }
        }

        // Linear search within the block holding the receiver definition:
        // any guard after it verifies the same receiver value.
        let insts = self.graph.insts(dominator).to_vec();
        let start = if dominator == block {
            insts.iter().position(|&i| i == triple.flag)
        } else {
            Some(insts.len())
        };
        let Some(start) = start else { return false };
        for &inst in insts[..start].iter().rev() {
            if inst == receiver {
                break;
            }
            if self.graph.opcode(inst) == Opcode::ShouldDeoptimizeFlag {
                remove_guard(self.graph, triple);
                self.stats.record(Stat::ChaGuardRemoved);
                self.changed = true;
                return true;
            }
        }
        false
    }

    /// Hoist a guard on a loop-invariant receiver to the pre-header.
    fn hoist_guard(&mut self, block: Block, triple: &GuardTriple, receiver: Inst) -> bool {
        let Some(lp) = self.forest.innermost_loop(block) else {
            return false;
        };
        let Some(pre_header) = self.forest.pre_header(lp) else {
            return false;
        };
        let Some(suspend) = self.forest.suspend_check(lp) else {
            return false;
        };
        if !self.forest.is_defined_out_of_loop(self.graph, lp, receiver) {
            return false;
        }

        let anchor = self
            .graph
            .terminator(pre_header)
            .expect("pre-header has a terminator");
        self.graph.move_before(triple.flag, anchor);
        self.graph.move_before(triple.not_equal, anchor);
        self.graph.remove(triple.deoptimize);

        let deoptimize = self.graph.insert_before(
            InstructionData::Unary {
                opcode: Opcode::Deoptimize,
                args: [triple.not_equal],
            },
            Type::Void,
            anchor,
        );
        let header = self.forest.header(lp);
        self.graph
            .copy_env_with_loop_phi_adjustment(suspend, deoptimize, header);

        self.block_has_cha_guard.insert(pre_header);
        self.graph.set_has_cha_guards(true);
        self.stats.record(Stat::ChaGuardHoisted);
        self.changed = true;
        true
    }
}

/// Run CHA guard optimization over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::cha_guard_optimization();
    if !graph.has_cha_guards() {
        return Ok(false);
    }
    let domtree = DominatorTree::compute(graph);
    let forest = LoopForest::compute(graph, &domtree);

    // Re-derive the flag from what actually survives the pass.
    graph.set_has_cha_guards(false);

    let rpo: Vec<Block> = domtree.cfg_rpo().collect();
    let mut pass = ChaGuardPass {
        graph,
        domtree,
        forest,
        block_has_cha_guard: EntitySet::new(),
        stats,
        changed: false,
    };
    // A single pass suffices: a kept guard is visible as a dominator to
    // every later guard in the traversal; removed guards are never
    // reconsidered.
    for block in rpo {
        for inst in pass.graph.insts(block).to_vec() {
            if pass.graph.opcode(inst) != Opcode::ShouldDeoptimizeFlag
                || !pass.graph.is_in_block(inst)
            {
                continue;
            }
            if let Some(triple) = guard_triple(pass.graph, block, inst) {
                pass.optimize_guard(block, triple);
            }
        }
    }
    Ok(pass.changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::verifier::assert_valid;

    fn add_guard(graph: &mut Graph, block: Block, receiver: Inst) -> (Inst, Inst, Inst) {
        let zero = graph.int_constant(0);
        let anchor = graph.terminator(block).unwrap();
        let flag = graph.insert_before(
            InstructionData::Unary {
                opcode: Opcode::ShouldDeoptimizeFlag,
                args: [receiver],
            },
            Type::Int32,
            anchor,
        );
        let ne = graph.insert_before(
            InstructionData::Binary {
                opcode: Opcode::NotEqual,
                args: [flag, zero],
            },
            Type::Bool,
            anchor,
        );
        let deopt = graph.insert_before(
            InstructionData::Unary {
                opcode: Opcode::Deoptimize,
                args: [ne],
            },
            Type::Void,
            anchor,
        );
        graph.set_has_cha_guards(true);
        (flag, ne, deopt)
    }

    #[test]
    fn parameter_receiver_guard_removed() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let receiver = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let (flag, ne, deopt) = add_guard(&mut g, body, receiver);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert!(!g.is_in_block(flag));
        assert!(!g.is_in_block(ne));
        assert!(!g.is_in_block(deopt));
        assert!(!g.has_cha_guards());
        assert_eq!(stats.count(Stat::ChaGuardRemoved), 1);
        assert_valid(&g);
    }

    #[test]
    fn dominating_guard_removes_duplicate() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        // A non-parameter receiver: a field load.
        let obj = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let receiver = g.insert_before_terminator(
            body,
            InstructionData::FieldGet {
                args: [obj],
                field: crate::ir::FieldRef::plain(8),
            },
            Type::Reference,
        );
        let (flag1, ..) = add_guard(&mut g, body, receiver);
        let (flag2, ne2, deopt2) = add_guard(&mut g, body, receiver);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        // The first guard stays, the second is covered by it.
        assert!(g.is_in_block(flag1));
        assert!(!g.is_in_block(flag2));
        assert!(!g.is_in_block(ne2));
        assert!(!g.is_in_block(deopt2));
        assert!(g.has_cha_guards());
        assert_valid(&g);
    }

    #[test]
    fn invariant_guard_hoisted_out_of_loop() {
        let (mut g, l) = testgraph::counted_loop(Some(10));
        let obj = g.insert_before(
            InstructionData::Parameter { index: 0 },
            Type::Reference,
            g.terminator(l.preheader).unwrap(),
        );
        let receiver = g.insert_before(
            InstructionData::FieldGet {
                args: [obj],
                field: crate::ir::FieldRef::plain(8),
            },
            Type::Reference,
            g.terminator(l.preheader).unwrap(),
        );
        // Give the suspend check an environment pinning the loop phi.
        g.create_env(l.suspend, &[Some(l.phi), Some(receiver)]);
        let (flag, ne, _deopt) = add_guard(&mut g, l.body, receiver);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert_eq!(g.block_of(flag), Some(l.preheader));
        assert_eq!(g.block_of(ne), Some(l.preheader));
        // A fresh Deoptimize in the pre-header carries the adjusted env:
        // the loop phi entry is rewound to its initial value.
        let deopt = g
            .insts(l.preheader)
            .iter()
            .copied()
            .find(|&i| g.opcode(i) == Opcode::Deoptimize)
            .unwrap();
        let env = g.env_of(deopt).unwrap();
        let values: Vec<_> = g.env_data(env).values.iter().map(|v| v.expand()).collect();
        assert_eq!(values[0], Some(g.args(l.phi)[0]));
        assert_eq!(values[1], Some(receiver));
        assert!(g.has_cha_guards());
        assert_eq!(stats.count(Stat::ChaGuardHoisted), 1);
        assert_valid(&g);
    }
}
