//! Loop-invariant code motion.
//!
//! Hoists pure computations whose operands are defined outside the loop
//! into the loop pre-header. Loads are not hoisted (the loop may write the
//! location; that interplay belongs to load-store elimination), and
//! instructions that can throw stay put so exception order is preserved.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Graph, Inst, Opcode};
use crate::loop_analysis::LoopForest;
use crate::passes::{Bailout, PassResult};
use crate::stats::{CompilationStats, Stat};
use crate::timing;

fn is_candidate(graph: &Graph, inst: Inst) -> bool {
    let data = graph.data(inst);
    data.can_be_moved()
        && !data.has_side_effects()
        && !data.opcode().does_any_read()
        && data.opcode() != Opcode::Phi
}

/// Run loop-invariant code motion over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::licm();
    if !graph.has_loops() {
        return Ok(false);
    }
    if graph.has_try_catch() {
        return Err(Bailout::UnsupportedIr("try/catch"));
    }
    let domtree = DominatorTree::compute(graph);
    let forest = LoopForest::compute(graph, &domtree);
    if forest.has_irreducible() || graph.has_irreducible_loops() {
        return Err(Bailout::UnsupportedIr("irreducible loops"));
    }

    let mut changed = false;
    // Inner loops first; an inner pre-header is itself a block of the
    // outer loop, so outer processing can hoist further.
    let loops: Vec<_> = forest.loops().collect();
    for &lp in loops.iter().rev() {
        let Some(pre_header) = forest.pre_header(lp) else {
            continue;
        };
        loop {
            let mut hoisted_any = false;
            let member_blocks: Vec<_> = forest.blocks(lp).collect();
            for &block in &member_blocks {
                for inst in graph.insts(block).to_vec() {
                    if !is_candidate(graph, inst) {
                        continue;
                    }
                    let invariant = graph
                        .args(inst)
                        .iter()
                        .all(|&arg| forest.is_defined_out_of_loop(graph, lp, arg));
                    if !invariant {
                        continue;
                    }
                    let anchor = graph.terminator(pre_header).expect("pre-header terminator");
                    log::trace!("licm: hoisting {} out of loop at {}", inst, block);
                    graph.move_before(inst, anchor);
                    stats.record(Stat::InvariantHoisted);
                    hoisted_any = true;
                    changed = true;
                }
            }
            if !hoisted_any {
                break;
            }
        }
    }
    Ok(changed)
}
