//! Natural-loop analysis: discovers the loop forest of a graph.
//!
//! A loop is identified by its header block. A back edge is a CFG edge
//! `latch -> header` where the header dominates the latch; the loop body is
//! everything that can reach the latch without passing through the header.
//! A back edge whose target does not dominate its source makes the loop
//! irreducible; the optimizations all bail out on such graphs, so the
//! analysis only records the fact.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, Graph, Inst, Loop, Opcode};
use crate::timing;
use gantry_entity::packed_option::PackedOption;
use gantry_entity::{EntitySet, PrimaryMap, SecondaryMap};

/// Data about one natural loop.
#[derive(Clone)]
pub struct LoopData {
    header: Block,
    /// Immediately enclosing loop.
    parent: PackedOption<Loop>,
    /// Member blocks, header included.
    blocks: EntitySet<Block>,
    /// Sources of the back edges into the header.
    back_edges: Vec<Block>,
    /// The unique block outside the loop whose only successor is the
    /// header, when the front end has created one.
    pre_header: PackedOption<Block>,
    /// The suspend check at the head of the header, if present.
    suspend_check: PackedOption<Inst>,
    /// Nesting depth; outermost loops have depth 1.
    depth: u32,
}

/// The loop forest of a graph.
pub struct LoopForest {
    loops: PrimaryMap<Loop, LoopData>,
    /// Innermost loop containing each block.
    block_loop: SecondaryMap<Block, PackedOption<Loop>>,
    irreducible: bool,
    version: u64,
}

impl LoopForest {
    /// Compute the loop forest of `graph`.
    pub fn compute(graph: &Graph, domtree: &DominatorTree) -> Self {
        let _tt = timing::loop_analysis();
        debug_assert!(domtree.is_valid(graph));
        let mut forest = Self {
            loops: PrimaryMap::new(),
            block_loop: SecondaryMap::new(),
            irreducible: false,
            version: graph.version(),
        };
        forest.find_loops(graph, domtree);
        forest.assign_membership(graph);
        forest.connect_forest();
        forest.find_pre_headers_and_suspend_checks(graph);
        forest
    }

    /// Is the forest still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// Did loop discovery see a back edge whose header does not dominate
    /// its source?
    pub fn has_irreducible(&self) -> bool {
        self.irreducible
    }

    /// The number of loops found.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Are there no loops at all?
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Iterate over all loops. Headers were discovered in reverse
    /// post-order, so outer loops come before the loops they contain.
    pub fn loops(&self) -> gantry_entity::Keys<Loop> {
        self.loops.keys()
    }

    /// The header block of `lp`.
    pub fn header(&self, lp: Loop) -> Block {
        self.loops[lp].header
    }

    /// The immediately enclosing loop of `lp`.
    pub fn parent(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    /// Nesting depth of `lp`; outermost loops have depth 1.
    pub fn depth(&self, lp: Loop) -> u32 {
        self.loops[lp].depth
    }

    /// The sources of the back edges of `lp`.
    pub fn back_edges(&self, lp: Loop) -> &[Block] {
        &self.loops[lp].back_edges
    }

    /// The pre-header of `lp`, when the front end created one.
    pub fn pre_header(&self, lp: Loop) -> Option<Block> {
        self.loops[lp].pre_header.expand()
    }

    /// The suspend check at the head of `lp`'s header, if present.
    pub fn suspend_check(&self, lp: Loop) -> Option<Inst> {
        self.loops[lp].suspend_check.expand()
    }

    /// Does `lp` contain `block`?
    pub fn contains_block(&self, lp: Loop, block: Block) -> bool {
        self.loops[lp].blocks.contains(block)
    }

    /// Iterate over the member blocks of `lp` in block-id order.
    pub fn blocks(&self, lp: Loop) -> impl Iterator<Item = Block> + '_ {
        self.loops[lp].blocks.iter()
    }

    /// The number of member blocks of `lp`, header included.
    pub fn num_blocks(&self, lp: Loop) -> usize {
        self.loops[lp].blocks.cardinality()
    }

    /// The innermost loop containing `block`, if any.
    pub fn innermost_loop(&self, block: Block) -> Option<Loop> {
        self.block_loop[block].expand()
    }

    /// Is `block` the header of the loop it belongs to?
    pub fn is_loop_header(&self, block: Block) -> bool {
        match self.innermost_loop(block) {
            Some(lp) => self.header(lp) == block,
            None => false,
        }
    }

    /// Is `inner` equal to or nested inside `outer`?
    pub fn is_in(&self, inner: Loop, outer: Loop) -> bool {
        let mut lp = Some(inner);
        while let Some(l) = lp {
            if l == outer {
                return true;
            }
            lp = self.parent(l);
        }
        false
    }

    /// Is the value defined by `inst` available before entering `lp`?
    /// Constants and parameters are materialized in the entry block and are
    /// always loop-invariant.
    pub fn is_defined_out_of_loop(&self, graph: &Graph, lp: Loop, inst: Inst) -> bool {
        match graph.block_of(inst) {
            Some(block) => !self.contains_block(lp, block),
            None => false,
        }
    }

    /// Does any member block of `lp` have a successor outside the loop,
    /// other than the header itself?
    pub fn has_early_exit(&self, graph: &Graph, lp: Loop) -> bool {
        self.blocks(lp)
            .filter(|&b| b != self.header(lp))
            .any(|b| {
                graph
                    .succs(b)
                    .iter()
                    .any(|&s| !self.contains_block(lp, s))
            })
    }

    fn find_loops(&mut self, graph: &Graph, domtree: &DominatorTree) {
        for header in domtree.cfg_rpo() {
            let mut back_edges = Vec::new();
            for &pred in graph.preds(header) {
                if !domtree.is_reachable(pred) {
                    continue;
                }
                // A back edge in a reducible loop has its source dominated
                // by its target.
                if domtree.dominates(header, pred) {
                    back_edges.push(pred);
                } else if domtree.rpo_cmp(header, pred) == core::cmp::Ordering::Less {
                    // A retreating edge whose target does not dominate its
                    // source enters a loop somewhere other than its header.
                    self.irreducible = true;
                }
            }
            if !back_edges.is_empty() {
                let mut blocks = EntitySet::new();
                blocks.insert(header);
                self.loops.push(LoopData {
                    header,
                    parent: Default::default(),
                    blocks,
                    back_edges,
                    pre_header: Default::default(),
                    suspend_check: Default::default(),
                    depth: 0,
                });
            }
        }
    }

    fn assign_membership(&mut self, graph: &Graph) {
        for lp in self.loops.keys() {
            let header = self.loops[lp].header;
            let mut stack = self.loops[lp].back_edges.clone();
            while let Some(block) = stack.pop() {
                if block == header || !self.loops[lp].blocks.insert(block) {
                    continue;
                }
                for &pred in graph.preds(block) {
                    stack.push(pred);
                }
            }
        }
    }

    fn connect_forest(&mut self) {
        // The innermost containing loop is the smallest one by member
        // count; loop member sets either nest or are disjoint.
        let keys: Vec<Loop> = self.loops.keys().collect();
        for &lp in &keys {
            let header = self.loops[lp].header;
            let mut best: Option<(usize, Loop)> = None;
            for &other in &keys {
                if other == lp || !self.loops[other].blocks.contains(header) {
                    continue;
                }
                let size = self.loops[other].blocks.cardinality();
                if best.map_or(true, |(bs, _)| size < bs) {
                    best = Some((size, other));
                }
            }
            self.loops[lp].parent = best.map(|(_, l)| l).into();
        }
        // Depths, walking parent chains (the forest is shallow).
        for &lp in &keys {
            let mut depth = 1;
            let mut cur = self.loops[lp].parent;
            while let Some(p) = cur.expand() {
                depth += 1;
                cur = self.loops[p].parent;
            }
            self.loops[lp].depth = depth;
        }
        // Innermost loop per block.
        for &lp in &keys {
            let members: Vec<Block> = self.loops[lp].blocks.iter().collect();
            for block in members {
                match self.block_loop[block].expand() {
                    Some(cur) if self.loops[cur].depth >= self.loops[lp].depth => {}
                    _ => self.block_loop[block] = lp.into(),
                }
            }
        }
    }

    fn find_pre_headers_and_suspend_checks(&mut self, graph: &Graph) {
        for lp in self.loops.keys() {
            let header = self.loops[lp].header;
            let outside: Vec<Block> = graph
                .preds(header)
                .iter()
                .copied()
                .filter(|&p| !self.loops[lp].blocks.contains(p))
                .collect();
            if let [pre] = outside.as_slice() {
                if graph.succs(*pre) == &[header] {
                    self.loops[lp].pre_header = (*pre).into();
                }
            }
            if let Some(&first) = graph.insts(header).first() {
                if graph.opcode(first) == Opcode::SuspendCheck {
                    self.loops[lp].suspend_check = first.into();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::ir::{InstructionData, Type};

    #[test]
    fn no_loops() {
        let (g, _) = testgraph::diamond();
        let domtree = DominatorTree::compute(&g);
        let forest = LoopForest::compute(&g, &domtree);
        assert!(forest.is_empty());
        assert!(!forest.has_irreducible());
    }

    #[test]
    fn single_loop() {
        let (g, l) = testgraph::counted_loop(Some(10));
        let domtree = DominatorTree::compute(&g);
        let forest = LoopForest::compute(&g, &domtree);
        assert_eq!(forest.len(), 1);
        let lp = forest.loops().next().unwrap();
        assert_eq!(forest.header(lp), l.header);
        assert_eq!(forest.back_edges(lp), &[l.body]);
        assert!(forest.contains_block(lp, l.body));
        assert!(!forest.contains_block(lp, l.exit));
        assert_eq!(forest.pre_header(lp), Some(l.preheader));
        assert_eq!(forest.suspend_check(lp), Some(l.suspend));
        assert_eq!(forest.depth(lp), 1);
        assert!(forest.is_loop_header(l.header));
        assert!(!forest.is_loop_header(l.body));
        assert!(!forest.has_early_exit(&g, lp));
        assert!(forest.is_defined_out_of_loop(&g, lp, l.bound));
        assert!(!forest.is_defined_out_of_loop(&g, lp, l.update));
    }

    #[test]
    fn nested_loops() {
        // Build an outer loop whose body contains the inner counted loop:
        // preheader -> outer_header; outer_header -> {graph exit path,
        // inner...}; inner loop exits to outer_latch -> outer_header.
        let mut g = Graph::new();
        let entry = g.create_block();
        let outer_header = g.create_block();
        let inner_header = g.create_block();
        let inner_body = g.create_block();
        let outer_latch = g.create_block();
        let exit = g.create_block();
        g.set_entry_block(entry);
        g.set_exit_block(exit);
        g.add_edge(entry, outer_header);
        g.add_edge(outer_header, exit);
        g.add_edge(outer_header, inner_header);
        g.add_edge(inner_header, outer_latch);
        g.add_edge(inner_header, inner_body);
        g.add_edge(inner_body, inner_header);
        g.add_edge(outer_latch, outer_header);

        let cond = g.append(entry, InstructionData::Parameter { index: 0 }, Type::Bool);
        g.append(entry, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(outer_header, InstructionData::Unary { opcode: Opcode::If, args: [cond] }, Type::Void);
        g.append(inner_header, InstructionData::Unary { opcode: Opcode::If, args: [cond] }, Type::Void);
        g.append(inner_body, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(outer_latch, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);

        let domtree = DominatorTree::compute(&g);
        let forest = LoopForest::compute(&g, &domtree);
        assert_eq!(forest.len(), 2);

        let outer = forest
            .loops()
            .find(|&lp| forest.header(lp) == outer_header)
            .unwrap();
        let inner = forest
            .loops()
            .find(|&lp| forest.header(lp) == inner_header)
            .unwrap();
        assert_eq!(forest.parent(inner), Some(outer));
        assert_eq!(forest.parent(outer), None);
        assert_eq!(forest.depth(outer), 1);
        assert_eq!(forest.depth(inner), 2);
        assert!(forest.is_in(inner, outer));
        assert!(!forest.is_in(outer, inner));
        assert_eq!(forest.innermost_loop(inner_body), Some(inner));
        assert_eq!(forest.innermost_loop(outer_latch), Some(outer));
        assert!(forest.contains_block(outer, inner_body));
        // The inner loop has no pre-header: its header's outside
        // predecessor branches.
        assert_eq!(forest.pre_header(inner), None);
    }
}
