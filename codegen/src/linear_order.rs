//! Graph linearization.
//!
//! Produces a total order of the reachable blocks such that (1) a block
//! always comes after its dominator and (2) the blocks of a loop are
//! contiguous. The order is the iteration basis of the loop optimizer's
//! hierarchy construction and of any pass that wants loop bodies laid out
//! together.

use crate::ir::{Block, Graph};
use crate::loop_analysis::LoopForest;
use crate::timing;
use gantry_entity::SecondaryMap;

fn is_back_edge(forest: &LoopForest, from: Block, to: Block) -> bool {
    match forest.innermost_loop(to) {
        Some(lp) => forest.header(lp) == to && forest.contains_block(lp, from),
        None => false,
    }
}

fn in_same_loop(a: Option<crate::ir::Loop>, b: Option<crate::ir::Loop>) -> bool {
    a == b
}

fn is_inner_loop(
    forest: &LoopForest,
    outer: Option<crate::ir::Loop>,
    inner: Option<crate::ir::Loop>,
) -> bool {
    match (outer, inner) {
        (Some(o), Some(i)) => i != o && forest.is_in(i, o),
        _ => false,
    }
}

/// Insert `block` into the worklist so that blocks of the innermost active
/// loop are taken first, keeping each loop's blocks contiguous in the
/// emitted order.
fn add_for_linearization(forest: &LoopForest, worklist: &mut Vec<Block>, block: Block) {
    let block_loop = forest.innermost_loop(block);
    let mut insert_at = worklist.len();
    while insert_at > 0 {
        let current = worklist[insert_at - 1];
        let current_loop = forest.innermost_loop(current);
        if in_same_loop(block_loop, current_loop)
            || is_inner_loop(forest, current_loop, block_loop)
        {
            break;
        }
        insert_at -= 1;
    }
    worklist.insert(insert_at, block);
}

/// Linearize `graph`: emit blocks in a dominator-consistent order with
/// loop bodies contiguous.
pub fn linearize(graph: &Graph, forest: &LoopForest) -> Vec<Block> {
    let _tt = timing::linear_order();
    debug_assert!(forest.is_valid(graph));

    // Number of forward (non-back-edge) predecessors per block; a block is
    // ready once all of them are emitted.
    let mut forward_preds: SecondaryMap<Block, u32> = SecondaryMap::new();
    for block in graph.blocks() {
        for &succ in graph.succs(block) {
            if !is_back_edge(forest, block, succ) {
                forward_preds[succ] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(graph.num_blocks());
    let mut worklist = vec![graph.entry_block()];
    while let Some(current) = worklist.pop() {
        order.push(current);
        for &succ in graph.succs(current) {
            if is_back_edge(forest, current, succ) {
                continue;
            }
            forward_preds[succ] -= 1;
            if forward_preds[succ] == 0 {
                add_for_linearization(forest, &mut worklist, succ);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::builder::testgraph;

    fn check_properties(graph: &Graph, forest: &LoopForest, order: &[Block]) {
        let domtree = DominatorTree::compute(graph);
        let pos = |b: Block| order.iter().position(|&x| x == b).unwrap();
        // Every block after its dominator.
        for &b in order {
            if let Some(idom) = domtree.idom(b) {
                assert!(pos(idom) < pos(b), "{} not after its dominator", b);
            }
        }
        // Loop blocks contiguous.
        for lp in forest.loops() {
            let positions: Vec<usize> = forest.blocks(lp).map(pos).collect();
            let min = *positions.iter().min().unwrap();
            let max = *positions.iter().max().unwrap();
            assert_eq!(max - min + 1, positions.len(), "loop not contiguous");
        }
    }

    #[test]
    fn counted_loop() {
        let (g, l) = testgraph::counted_loop(Some(4));
        let domtree = DominatorTree::compute(&g);
        let forest = LoopForest::compute(&g, &domtree);
        let order = linearize(&g, &forest);
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], l.preheader);
        check_properties(&g, &forest, &order);
        // Header immediately followed by the body.
        let hpos = order.iter().position(|&b| b == l.header).unwrap();
        assert_eq!(order[hpos + 1], l.body);
    }

    #[test]
    fn diamond_order() {
        let (g, d) = testgraph::diamond();
        let domtree = DominatorTree::compute(&g);
        let forest = LoopForest::compute(&g, &domtree);
        let order = linearize(&g, &forest);
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], d.entry);
        assert_eq!(order[4], d.exit);
        check_properties(&g, &forest, &order);
    }
}
