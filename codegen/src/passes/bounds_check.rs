//! Bounds check elimination.
//!
//! Two cheap cases cover a large share of checks without full range
//! analysis:
//!
//! 1. a check whose index and length are both known constants with
//!    `0 <= index < length` (the length coming either from an integer
//!    constant or from `ArrayLength` of an array allocated with a constant
//!    size);
//! 2. a check dominated by an identical check of the same index against
//!    the same length.
//!
//! A removed check's users are redirected to the raw index, which is what
//! the check would have produced.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Graph, Inst, InstructionData, Opcode};
use crate::load_store_analysis::original_reference;
use crate::passes::PassResult;
use crate::scoped_hash_map::ScopedHashMap;
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use gantry_entity::SecondaryMap;

/// The statically-known element count behind `length`, if any.
fn known_length(graph: &Graph, length: Inst) -> Option<i64> {
    if let Some(n) = graph.as_int_constant(length) {
        return Some(n);
    }
    if let InstructionData::Unary {
        opcode: Opcode::ArrayLength,
        args,
    } = *graph.data(length)
    {
        let array = original_reference(graph, args[0]);
        if let InstructionData::NewArray { args, .. } = *graph.data(array) {
            return graph.as_int_constant(args[0]);
        }
    }
    None
}

/// Run bounds check elimination over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::bounds_check_elimination();
    let domtree = DominatorTree::compute(graph);

    let mut children: SecondaryMap<crate::ir::Block, Vec<crate::ir::Block>> = SecondaryMap::new();
    for block in graph.blocks() {
        if let Some(idom) = domtree.idom(block) {
            children[idom].push(block);
        }
    }

    enum Visit {
        Enter(crate::ir::Block),
        Exit,
    }

    let mut changed = false;
    // (index, length) pairs already verified on this dominator path.
    let mut seen: ScopedHashMap<(Inst, Inst), Inst> = ScopedHashMap::new();
    let mut stack = vec![Visit::Enter(graph.entry_block())];
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(block) => {
                seen.increment_depth();
                stack.push(Visit::Exit);
                for &child in &children[block] {
                    stack.push(Visit::Enter(child));
                }
                for inst in graph.insts(block).to_vec() {
                    let InstructionData::Binary {
                        opcode: Opcode::BoundsCheck,
                        args: [index, length],
                    } = *graph.data(inst)
                    else {
                        continue;
                    };

                    let statically_safe = match (
                        graph.as_int_constant(index),
                        known_length(graph, length),
                    ) {
                        (Some(i), Some(n)) => i >= 0 && i < n,
                        _ => false,
                    };
                    let dominated = seen.get(&(index, length)).is_some();
                    if statically_safe || dominated {
                        log::trace!("bce: removing {}", inst);
                        graph.replace_all_uses_with(inst, index);
                        graph.remove(inst);
                        stats.record(Stat::BoundsCheckRemoved);
                        changed = true;
                    } else {
                        seen.insert((index, length), inst);
                    }
                }
            }
            Visit::Exit => seen.decrement_depth(),
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::ir::Type;
    use crate::verifier::assert_valid;
    use gantry_entity::EntityRef;

    #[test]
    fn constant_in_range() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let ten = g.int_constant(10);
        let arr = g.insert_before_terminator(
            body,
            InstructionData::NewArray {
                args: [ten],
                class: crate::ir::Class::new(0),
            },
            Type::Reference,
        );
        let len = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::ArrayLength,
                args: [arr],
            },
            Type::Int32,
        );
        let three = g.int_constant(3);
        let check = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::BoundsCheck,
                args: [three, len],
            },
            Type::Int32,
        );
        let get = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, check] },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert!(!g.is_in_block(check));
        assert_eq!(g.args(get), &[arr, three]);
        assert_valid(&g);
    }

    #[test]
    fn out_of_range_is_kept() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let three = g.int_constant(3);
        let ten = g.int_constant(10);
        let check = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::BoundsCheck,
                args: [ten, three],
            },
            Type::Int32,
        );
        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        assert!(g.is_in_block(check));
    }

    #[test]
    fn dominated_duplicate() {
        let (mut g, d) = testgraph::diamond();
        let index = g.insert_before(
            InstructionData::Parameter { index: 1 },
            Type::Int32,
            g.terminator(d.entry).unwrap(),
        );
        let length = g.insert_before(
            InstructionData::Parameter { index: 2 },
            Type::Int32,
            g.terminator(d.entry).unwrap(),
        );
        let mk_check = |g: &mut Graph, block| {
            g.insert_before_terminator(
                block,
                InstructionData::Binary {
                    opcode: Opcode::BoundsCheck,
                    args: [index, length],
                },
                Type::Int32,
            )
        };
        let first = mk_check(&mut g, d.entry);
        let left = mk_check(&mut g, d.left);
        let join = mk_check(&mut g, d.join);

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        assert!(g.is_in_block(first));
        // Both later checks are dominated by the first.
        assert!(!g.is_in_block(left));
        assert!(!g.is_in_block(join));
        assert_eq!(stats.count(Stat::BoundsCheckRemoved), 2);
        assert_valid(&g);
    }
}
