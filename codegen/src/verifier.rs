//! Graph integrity verifier.
//!
//! Checks the structural invariants every pass must preserve:
//!
//! - every live block ends in exactly one terminator, and only there;
//! - phi input arity equals predecessor count;
//! - predecessor and successor lists agree edge for edge;
//! - use-def lists are bidirectional and complete, for data uses and for
//!   environment pins;
//! - every value dominates its uses (with the phi rule: a phi input must
//!   dominate the corresponding predecessor).
//!
//! The verifier is meant for tests and debug builds; it recomputes the
//! dominator tree itself.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Graph, Inst, Opcode};
use crate::timing;

fn err(msg: String) -> Result<(), String> {
    Err(msg)
}

/// Verify the structural invariants of `graph`.
pub fn verify(graph: &Graph) -> Result<(), String> {
    let _tt = timing::verifier();
    let domtree = DominatorTree::compute(graph);

    for block in graph.blocks() {
        // Edge symmetry.
        for &succ in graph.succs(block) {
            if !graph.preds(succ).contains(&block) {
                return err(format!("{} -> {} missing from pred list", block, succ));
            }
        }
        for &pred in graph.preds(block) {
            if !graph.succs(pred).contains(&block) {
                return err(format!("{} <- {} missing from succ list", block, pred));
            }
        }

        // Exactly one terminator, at the end.
        match graph.terminator(block) {
            None => return err(format!("{} has no instructions", block)),
            Some(t) if !graph.opcode(t).is_control_flow() => {
                return err(format!("{} does not end in a terminator", block));
            }
            _ => {}
        }
        for &inst in graph.insts(block).iter().rev().skip(1) {
            if graph.opcode(inst).is_control_flow() {
                return err(format!("{} has a terminator {} mid-block", block, inst));
            }
        }
        let terminator = graph.terminator(block).unwrap();
        let succ_count = graph.succs(block).len();
        let expected = match graph.opcode(terminator) {
            Opcode::Goto | Opcode::Return | Opcode::ReturnVoid | Opcode::Throw => Some(1),
            Opcode::If => Some(2),
            Opcode::Exit => Some(0),
            Opcode::PackedSwitch => None,
            _ => unreachable!(),
        };
        if let Some(expected) = expected {
            if succ_count != expected {
                return err(format!(
                    "{} terminator {} has {} successors, expected {}",
                    block,
                    graph.opcode(terminator),
                    succ_count,
                    expected
                ));
            }
        }

        // Phi arity.
        for &phi in graph.phis(block) {
            if !graph.is_phi(phi) {
                return err(format!("{} in phi list of {} is not a phi", phi, block));
            }
            if graph.args(phi).len() != graph.preds(block).len() {
                return err(format!(
                    "{} has {} inputs for {} predecessors",
                    phi,
                    graph.args(phi).len(),
                    graph.preds(block).len()
                ));
            }
        }

        // Use-def consistency and dominance.
        for inst in graph
            .phis(block)
            .iter()
            .chain(graph.insts(block).iter())
            .copied()
        {
            if graph.block_of(inst) != Some(block) {
                return err(format!("{} does not know it is in {}", inst, block));
            }
            check_inst(graph, &domtree, block, inst)?;
        }
    }

    Ok(())
}

fn check_inst(
    graph: &Graph,
    domtree: &DominatorTree,
    block: crate::ir::Block,
    inst: Inst,
) -> Result<(), String> {
    let is_phi = graph.is_phi(inst);
    for (index, &arg) in graph.args(inst).iter().enumerate() {
        // Bidirectional edge.
        if !graph
            .uses(arg)
            .iter()
            .any(|u| u.user == inst && u.index == index as u32)
        {
            return err(format!(
                "{} input {} ({}) does not list the use",
                inst, index, arg
            ));
        }
        let def_block = match graph.block_of(arg) {
            Some(b) => b,
            None => return err(format!("{} uses detached {}", inst, arg)),
        };
        if !domtree.is_reachable(block) {
            continue;
        }
        // Dominance: a phi input must dominate the corresponding
        // predecessor, an ordinary input must dominate the user.
        if is_phi {
            let pred = graph.preds(block)[index];
            if !domtree.dominates(def_block, pred) {
                return err(format!(
                    "{} input {} ({}) does not dominate predecessor {}",
                    inst, index, arg, pred
                ));
            }
        } else if def_block == block {
            if !graph.comes_before_in_block(arg, inst) {
                return err(format!("{} uses {} defined after it", inst, arg));
            }
        } else if !domtree.dominates(def_block, block) {
            return err(format!(
                "{} uses {} whose block {} does not dominate {}",
                inst, arg, def_block, block
            ));
        }
    }

    // Use records of this instruction must point back to real operands,
    // and detached instructions must not appear on any use list.
    for u in graph.uses(inst) {
        if !graph.is_in_block(u.user) {
            return err(format!("{} is used by detached {}", inst, u.user));
        }
        let args = graph.args(u.user);
        if args.get(u.index as usize) != Some(&inst) {
            return err(format!(
                "{} use record ({}, {}) does not match operand",
                inst, u.user, u.index
            ));
        }
    }
    for eu in graph.env_uses(inst) {
        let env = graph.env_data(eu.env);
        if env.values.get(eu.index as usize).and_then(|v| v.expand()) != Some(inst) {
            return err(format!("{} env-use record {:?} does not match slot", inst, eu));
        }
    }
    Ok(())
}

/// Panic with the verifier message if `graph` is malformed. Test helper.
pub fn assert_valid(graph: &Graph) {
    if let Err(msg) = verify(graph) {
        panic!("graph verification failed: {}\n{}", msg, graph);
    }
}
