//! Global value numbering.
//!
//! Walks the dominator tree with a scoped hash map, merging pure
//! computations that repeat an expression already available in a
//! dominating block. Memory reads are excluded on purpose: proving a load
//! redundant requires the heap-location machinery, and that is
//! load-store elimination's job.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, Graph, Inst, InstructionData, Opcode, Type};
use crate::passes::PassResult;
use crate::scoped_hash_map::ScopedHashMap;
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use gantry_entity::SecondaryMap;
use smallvec::SmallVec;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    opcode: Opcode,
    ty: Type,
    args: SmallVec<[Inst; 2]>,
    extra: u64,
}

fn key_of(graph: &Graph, inst: Inst) -> Option<Key> {
    let data = graph.data(inst);
    let opcode = data.opcode();
    if !data.can_be_moved()
        || data.has_side_effects()
        || opcode.does_any_read()
        || opcode == Opcode::Phi
    {
        return None;
    }
    let extra = u64::from(data.lanes().unwrap_or(0));
    Some(Key {
        opcode,
        ty: graph.ty(inst),
        args: data.arguments().iter().copied().collect(),
        extra,
    })
}

/// Run global value numbering over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::gvn();
    let domtree = DominatorTree::compute(graph);

    // Dominator-tree children, for the scoped DFS.
    let mut children: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
    for block in graph.blocks() {
        if let Some(idom) = domtree.idom(block) {
            children[idom].push(block);
        }
    }

    enum Visit {
        Enter(Block),
        Exit,
    }

    let mut changed = false;
    let mut map: ScopedHashMap<Key, Inst> = ScopedHashMap::new();
    let mut stack = vec![Visit::Enter(graph.entry_block())];
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(block) => {
                map.increment_depth();
                stack.push(Visit::Exit);
                for &child in &children[block] {
                    stack.push(Visit::Enter(child));
                }
                for inst in graph.insts(block).to_vec() {
                    let Some(key) = key_of(graph, inst) else {
                        continue;
                    };
                    match map.get(&key) {
                        Some(&existing) => {
                            log::trace!("gvn: {} is {}", inst, existing);
                            graph.replace_all_uses_with(inst, existing);
                            graph.remove(inst);
                            stats.record(Stat::GvnMerged);
                            changed = true;
                        }
                        None => map.insert(key, inst),
                    }
                }
            }
            Visit::Exit => map.decrement_depth(),
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
    fn merges_dominating_expression() {
        let (mut g, d) = testgraph::diamond();
        let x = g.insert_before(
            InstructionData::Parameter { index: 1 },
            Type::Int32,
            g.terminator(d.entry).unwrap(),
        );
        let y = g.insert_before(
            InstructionData::Parameter { index: 2 },
            Type::Int32,
            g.terminator(d.entry).unwrap(),
        );
        let mk_add = |g: &mut Graph, block| {
            g.insert_before_terminator(
                block,
                InstructionData::Binary {
                    opcode: Opcode::Add,
                    args: [x, y],
                },
                Type::Int32,
            )
        };
        let add_entry = mk_add(&mut g, d.entry);
        let add_left = mk_add(&mut g, d.left);
        let add_right = mk_add(&mut g, d.right);
        let phi = g.add_phi(d.join, &[add_left, add_right], Type::Int32);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert!(!g.is_in_block(add_left));
        assert!(!g.is_in_block(add_right));
        assert_eq!(g.args(phi), &[add_entry, add_entry]);
        assert_eq!(stats.count(Stat::GvnMerged), 2);
        assert_valid(&g);
    }

    #[test]
    fn does_not_merge_across_siblings() {
        let (mut g, d) = testgraph::diamond();
        let x = g.insert_before(
            InstructionData::Parameter { index: 1 },
            Type::Int32,
            g.terminator(d.entry).unwrap(),
        );
        let mk_neg = |g: &mut Graph, block| {
            g.insert_before_terminator(
                block,
                InstructionData::Unary {
                    opcode: Opcode::Neg,
                    args: [x],
                },
                Type::Int32,
            )
        };
        let neg_left = mk_neg(&mut g, d.left);
        let neg_right = mk_neg(&mut g, d.right);
        let phi = g.add_phi(d.join, &[neg_left, neg_right], Type::Int32);

        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        // Neither branch dominates the other; both negations stay.
        assert!(g.is_in_block(neg_left));
        assert!(g.is_in_block(neg_right));
        assert_eq!(g.args(phi), &[neg_left, neg_right]);
        assert_valid(&g);
    }

    #[test]
    fn ignores_memory_reads() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let obj = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let mk_get = |g: &mut Graph| {
            g.insert_before_terminator(
                body,
                InstructionData::FieldGet {
                    args: [obj],
                    field: crate::ir::FieldRef::plain(8),
                },
                Type::Int32,
            )
        };
        let g1 = mk_get(&mut g);
        let g2 = mk_get(&mut g);
        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        assert!(g.is_in_block(g1));
        assert!(g.is_in_block(g2));
    }
}
