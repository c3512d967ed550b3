//! Select generation.
//!
//! Rewrites the classic diamond
//!
//! ```text
//!          block
//!          /   \
//!      left     right      (both empty, single goto)
//!          \   /
//!          merge           (exactly one phi)
//! ```
//!
//! into a single `Select` in `block`, deleting the arms and the branch.
//! Fewer blocks and no branch means cheaper code on both paths when the
//! values are already available.

use crate::ir::{Block, Graph, InstructionData, Opcode, Type};
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;

/// A block is an empty arm when it contains nothing but a `Goto` and has a
/// single predecessor and successor.
fn is_empty_arm(graph: &Graph, block: Block) -> Option<Block> {
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

fn try_generate(graph: &mut Graph, block: Block, stats: &mut CompilationStats) -> bool {
    let Some(terminator) = graph.terminator(block) else {
        return false;
    };
    if graph.opcode(terminator) != Opcode::If {
        return false;
    }
    let true_block = graph.succs(block)[0];
    let false_block = graph.succs(block)[1];
    if true_block == false_block {
        return false;
    }
    let (Some(merge), Some(merge2)) = (
        is_empty_arm(graph, true_block),
        is_empty_arm(graph, false_block),
    ) else {
        return false;
    };
    if merge != merge2 || merge == block {
        return false;
    }
    // The merge must join exactly these two arms through exactly one phi.
    if graph.preds(merge).len() != 2 || graph.phis(merge).len() != 1 {
        return false;
    }
    let phi = graph.phis(merge)[0];
    let true_index = graph
        .preds(merge)
        .iter()
        .position(|&p| p == true_block)
        .expect("arm is a merge predecessor");
    let true_value = graph.args(phi)[true_index];
    let false_value = graph.args(phi)[1 - true_index];
    let condition = graph.args(terminator)[0];
    let ty = graph.ty(phi);

    log::trace!(
        "select_generator: {} over {} / {}",
        phi,
        true_value,
        false_value
    );
    let select = graph.insert_before(
        InstructionData::Select {
            args: [condition, true_value, false_value],
        },
        ty,
        terminator,
    );
    graph.replace_all_uses_with(phi, select);
    graph.remove(phi);
    graph.disconnect_and_delete(true_block);
    graph.disconnect_and_delete(false_block);
    graph.remove(terminator);
    graph.add_edge(block, merge);
    graph.append(block, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
    stats.record(Stat::SelectGenerated);
    true
}

/// Run select generation over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::select_generator();
    let mut changed = false;
    let blocks: Vec<_> = graph.blocks().collect();
    for block in blocks {
        if graph.is_block_live(block) && try_generate(graph, block, stats) {
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::verifier::assert_valid;

    #[test]
    fn diamond_becomes_select() {
        let (mut g, d) = testgraph::diamond();
        let a = g.int_constant(10);
        let b = g.int_constant(20);
        let phi = g.add_phi(d.join, &[a, b], Type::Int32);
        let user = g.insert_before_terminator(
            d.join,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [phi],
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert!(!g.is_block_live(d.left));
        assert!(!g.is_block_live(d.right));
        assert_eq!(g.succs(d.entry), &[d.join]);
        let select = g.args(user)[0];
        assert_eq!(g.opcode(select), Opcode::Select);
        assert_eq!(g.args(select), &[d.cond, a, b]);
        assert_eq!(stats.count(Stat::SelectGenerated), 1);
        assert_valid(&g);

        // Idempotent: nothing else to transform.
        assert_eq!(run(&mut g, &mut stats), Ok(false));
    }

    #[test]
    fn arm_with_computation_is_kept() {
        let (mut g, d) = testgraph::diamond();
        let a = g.int_constant(10);
        let neg = g.insert_before_terminator(
            d.left,
            InstructionData::Unary {
                opcode: Opcode::Neg,
                args: [a],
            },
            Type::Int32,
        );
        g.add_phi(d.join, &[neg, a], Type::Int32);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(false));
        assert!(g.is_block_live(d.left));
        assert_valid(&g);
    }

    #[test]
    fn two_phis_are_kept() {
        let (mut g, d) = testgraph::diamond();
        let a = g.int_constant(10);
        let b = g.int_constant(20);
        g.add_phi(d.join, &[a, b], Type::Int32);
        g.add_phi(d.join, &[b, a], Type::Int32);
        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(false));
        assert_valid(&g);
    }
}
