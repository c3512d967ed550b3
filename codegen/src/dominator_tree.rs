//! Dominator and post-dominator trees, represented as mappings of blocks to
//! their immediate (post-)dominator.

use crate::ir::{Block, Graph, Inst};
use crate::timing;
use gantry_entity::packed_option::PackedOption;
use gantry_entity::SecondaryMap;
use core::cmp::Ordering;

/// Special RPO numbers used during `compute_postorder`.
const DONE: u32 = 1;
const SEEN: u32 = 2;

/// Dominator tree node. We keep one of these per block.
#[derive(Clone, Default)]
struct DomNode {
    /// Number of this node in a reverse post-order traversal of the CFG,
    /// starting from 2. Unreachable nodes get number 0, all others are
    /// positive.
    rpo_number: u32,

    /// The immediate dominator of this block.
    ///
    /// This is `None` for unreachable blocks and the root, which has no
    /// immediate dominator.
    idom: PackedOption<Block>,
}

/// Shared machinery of the dominator and post-dominator trees: the same
/// iterative algorithm runs forward from the entry or backward from the
/// exit.
struct DomTreeCore {
    nodes: SecondaryMap<Block, DomNode>,
    postorder: Vec<Block>,
    /// Scratch memory used by `compute_postorder()`.
    stack: Vec<Block>,
}

/// Direction of the underlying traversal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Forward,
    Backward,
}

impl Dir {
    fn next<'a>(self, graph: &'a Graph, block: Block) -> &'a [Block] {
        match self {
            Dir::Forward => graph.succs(block),
            Dir::Backward => graph.preds(block),
        }
    }

    fn prev<'a>(self, graph: &'a Graph, block: Block) -> &'a [Block] {
        match self {
            Dir::Forward => graph.preds(block),
            Dir::Backward => graph.succs(block),
        }
    }
}

impl DomTreeCore {
    fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            postorder: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn compute(&mut self, graph: &Graph, root: Block, dir: Dir) {
        self.compute_postorder(graph, root, dir);
        self.compute_domtree(graph, dir);
    }

    /// Reset all internal data structures and compute a post-order of the
    /// traversal from `root`.
    ///
    /// This leaves `rpo_number == DONE` for all reachable blocks, 0 for
    /// unreachable ones.
    fn compute_postorder(&mut self, graph: &Graph, root: Block, dir: Dir) {
        self.nodes.clear();
        self.postorder.clear();
        debug_assert!(self.stack.is_empty());

        // Depth-first traversal with an explicit two-visit stack protocol:
        //
        //   0:    block has not yet been reached in the pre-order.
        //   SEEN: block has been pushed on the stack but children not yet.
        //   DONE: children pushed; next pop emits the block.
        self.stack.push(root);
        self.nodes[root].rpo_number = SEEN;

        while let Some(block) = self.stack.pop() {
            match self.nodes[block].rpo_number {
                SEEN => {
                    self.nodes[block].rpo_number = DONE;
                    self.stack.push(block);
                    // Children are pushed in reverse so the first child is
                    // visited first, keeping the post-order split-invariant.
                    for &succ in dir.next(graph, block).iter().rev() {
                        if self.nodes[succ].rpo_number == 0 {
                            self.nodes[succ].rpo_number = SEEN;
                            self.stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(block),
                _ => unreachable!(),
            }
        }
    }

    /// Build the dominator tree using Keith D. Cooper's
    /// "Simple, Fast Dominator Algorithm."
    fn compute_domtree(&mut self, graph: &Graph, dir: Dir) {
        // We'll be iterating over a reverse post-order of the CFG, skipping
        // the root.
        let (root, postorder) = match self.postorder.as_slice().split_last() {
            Some((&root, rest)) => (root, rest),
            None => return,
        };

        // First pass: assign RPO numbers and initial idom estimates. Due to
        // the nature of the post-order traversal, every node we visit has at
        // least one predecessor that was already visited in this RPO, so
        // `compute_idom` always finds a starting point.
        self.nodes[root].rpo_number = 2;
        for (rpo_idx, &block) in postorder.iter().rev().enumerate() {
            // Compute the idom estimate before numbering the block itself
            // so a self-loop edge is not considered a processed predecessor.
            let idom = self.compute_idom(graph, block, dir);
            self.nodes[block].idom = idom.into();
            self.nodes[block].rpo_number = rpo_idx as u32 + 3;
        }

        // Iterate until convergence. Without irreducible control flow this
        // exits after one extra iteration.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in postorder.iter().rev() {
                let idom: PackedOption<Block> = self.compute_idom(graph, block, dir).into();
                if self.nodes[block].idom != idom {
                    self.nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    /// Compute the immediate dominator for `block` from the current `idom`
    /// states of its already-numbered predecessors.
    fn compute_idom(&self, graph: &Graph, block: Block, dir: Dir) -> Block {
        let mut preds = dir
            .prev(graph, block)
            .iter()
            .copied()
            .filter(|&pred| self.nodes[pred].rpo_number > DONE);

        let mut idom = preds
            .next()
            .expect("block must have one numbered predecessor");
        for pred in preds {
            idom = self.common_dominator(idom, pred);
        }
        idom
    }

    fn common_dominator(&self, mut a: Block, mut b: Block) -> Block {
        loop {
            match self.nodes[a].rpo_number.cmp(&self.nodes[b].rpo_number) {
                Ordering::Less => b = self.nodes[b].idom.expect("unreachable block"),
                Ordering::Greater => a = self.nodes[a].idom.expect("unreachable block"),
                Ordering::Equal => break,
            }
        }
        debug_assert_eq!(a, b, "unreachable block in common_dominator");
        a
    }

    fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// `a` dominates `b` in the chosen direction.
    fn dominates(&self, a: Block, mut b: Block) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let rpo_a = self.nodes[a].rpo_number;
        while rpo_a < self.nodes[b].rpo_number {
            match self.nodes[b].idom.expand() {
                Some(idom) => b = idom,
                None => return false,
            }
        }
        a == b
    }
}

/// The dominator tree for a graph.
pub struct DominatorTree {
    core: DomTreeCore,
    version: u64,
}

impl DominatorTree {
    /// Compute the dominator tree of `graph`.
    pub fn compute(graph: &Graph) -> Self {
        let _tt = timing::domtree();
        let mut core = DomTreeCore::new();
        core.compute(graph, graph.entry_block(), Dir::Forward);
        Self {
            core,
            version: graph.version(),
        }
    }

    /// Is the tree still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.core.is_reachable(block)
    }

    /// The CFG post-order that was used to compute the dominator tree.
    ///
    /// This is not updated automatically when the CFG is modified; it is
    /// computed from scratch and cached by `compute()`.
    pub fn cfg_postorder(&self) -> &[Block] {
        &self.core.postorder
    }

    /// Iterate over the reachable blocks in reverse post-order.
    pub fn cfg_rpo(&self) -> impl Iterator<Item = Block> + '_ {
        self.core.postorder.iter().rev().copied()
    }

    /// The immediate dominator of `block`, or `None` for the entry and
    /// unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.core.nodes[block].idom.expand()
    }

    /// Returns `true` if `a` dominates `b`: every path from the entry to
    /// `b` passes through `a`. A block dominates itself. Returns `false`
    /// when either block is unreachable.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        self.core.dominates(a, b)
    }

    /// Compute the common dominator of two reachable basic blocks.
    pub fn common_dominator(&self, a: Block, b: Block) -> Block {
        self.core.common_dominator(a, b)
    }

    /// Compare two blocks relative to the reverse post-order.
    pub fn rpo_cmp(&self, a: Block, b: Block) -> Ordering {
        self.core.nodes[a]
            .rpo_number
            .cmp(&self.core.nodes[b].rpo_number)
    }

    /// Does the value defined by `a` dominate the program point of `b`?
    ///
    /// Instructions in the same block compare by position, with phis ahead
    /// of ordinary instructions. An instruction does not dominate itself
    /// here (this is strict dominance, the condition for `b` to use `a`).
    pub fn strictly_dominates_inst(&self, graph: &Graph, a: Inst, b: Inst) -> bool {
        if a == b {
            return false;
        }
        let block_a = match graph.block_of(a) {
            Some(b) => b,
            None => return false,
        };
        let block_b = match graph.block_of(b) {
            Some(b) => b,
            None => return false,
        };
        if block_a == block_b {
            graph.comes_before_in_block(a, b)
        } else {
            self.dominates(block_a, block_b)
        }
    }
}

/// The post-dominator tree: the dominator tree of the reversed CFG, rooted
/// at the exit block.
pub struct PostDominatorTree {
    core: DomTreeCore,
    version: u64,
}

impl PostDominatorTree {
    /// Compute the post-dominator tree of `graph`. Requires an exit block;
    /// a method that cannot return (infinite loop) has no post-dominance
    /// relation and every query on the resulting tree is `false`.
    pub fn compute(graph: &Graph) -> Self {
        let _tt = timing::postdomtree();
        let mut core = DomTreeCore::new();
        if let Some(exit) = graph.exit_block() {
            core.compute(graph, exit, Dir::Backward);
        }
        Self {
            core,
            version: graph.version(),
        }
    }

    /// Is the tree still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// The immediate post-dominator of `block`.
    pub fn ipostdom(&self, block: Block) -> Option<Block> {
        self.core.nodes[block].idom.expand()
    }

    /// Returns `true` if `a` post-dominates `b`: every path from `b` to the
    /// exit passes through `a`. A block post-dominates itself.
    pub fn post_dominates(&self, a: Block, b: Block) -> bool {
        self.core.dominates(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;

    #[test]
    fn straight_line() {
        let g = testgraph::straight_line();
        let entry = g.entry_block();
        let body = g.succs(entry)[0];
        let exit = g.exit_block().unwrap();

        let dt = DominatorTree::compute(&g);
        assert!(dt.is_valid(&g));
        assert_eq!(dt.idom(entry), None);
        assert_eq!(dt.idom(body), Some(entry));
        assert_eq!(dt.idom(exit), Some(body));
        assert!(dt.dominates(entry, exit));
        assert!(dt.dominates(body, body));
        assert!(!dt.dominates(exit, body));
        assert_eq!(dt.cfg_postorder().last(), Some(&entry));

        let pdt = PostDominatorTree::compute(&g);
        assert!(pdt.post_dominates(exit, entry));
        assert!(pdt.post_dominates(body, entry));
        assert!(!pdt.post_dominates(entry, body));
        assert_eq!(pdt.ipostdom(entry), Some(body));
    }

    #[test]
    fn diamond() {
        let (g, d) = testgraph::diamond();
        let dt = DominatorTree::compute(&g);
        assert_eq!(dt.idom(d.left), Some(d.entry));
        assert_eq!(dt.idom(d.right), Some(d.entry));
        assert_eq!(dt.idom(d.join), Some(d.entry));
        assert!(!dt.dominates(d.left, d.join));
        assert_eq!(dt.common_dominator(d.left, d.right), d.entry);
        assert_eq!(dt.common_dominator(d.left, d.join), d.entry);
        assert_eq!(dt.common_dominator(d.join, d.exit), d.join);

        let pdt = PostDominatorTree::compute(&g);
        assert!(pdt.post_dominates(d.join, d.entry));
        assert!(pdt.post_dominates(d.join, d.left));
        assert!(!pdt.post_dominates(d.left, d.entry));
    }

    #[test]
    fn loop_dominance() {
        let (g, l) = testgraph::counted_loop(Some(10));
        let dt = DominatorTree::compute(&g);
        assert_eq!(dt.idom(l.header), Some(l.preheader));
        assert_eq!(dt.idom(l.body), Some(l.header));
        assert_eq!(dt.idom(l.exit), Some(l.header));
        assert!(dt.dominates(l.header, l.body));
        assert!(!dt.dominates(l.body, l.exit));
    }

    #[test]
    fn instruction_dominance() {
        let (g, l) = testgraph::counted_loop(Some(10));
        let dt = DominatorTree::compute(&g);
        // The phi strictly dominates the condition using it.
        assert!(dt.strictly_dominates_inst(&g, l.phi, l.condition));
        assert!(!dt.strictly_dominates_inst(&g, l.condition, l.phi));
        // The update in the body does not dominate the header condition.
        assert!(!dt.strictly_dominates_inst(&g, l.update, l.condition));
        // Nothing strictly dominates itself.
        assert!(!dt.strictly_dominates_inst(&g, l.phi, l.phi));
    }

    #[test]
    fn version_tracking() {
        let (mut g, _) = testgraph::counted_loop(Some(3));
        let dt = DominatorTree::compute(&g);
        assert!(dt.is_valid(&g));
        g.create_block();
        assert!(!dt.is_valid(&g));
    }
}
