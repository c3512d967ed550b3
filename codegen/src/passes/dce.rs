//! Dead code elimination.
//!
//! Removes instructions whose results are unused and whose execution has no
//! observable effect. Runs backwards over each block so a chain of dead
//! instructions disappears in one sweep, and iterates until no more
//! removals happen (a dead phi can expose dead inputs in earlier blocks).
//!
//! Constants and parameters are left in place even when unused: the
//! constant pool canonicalizes them, and a later pass may ask for the same
//! constant again.

use crate::ir::{Graph, Opcode};
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;

fn is_dead(graph: &Graph, inst: crate::ir::Inst) -> bool {
    if graph.has_uses(inst) || graph.has_env_uses(inst) {
        return false;
    }
    let data = graph.data(inst);
    if !data.is_removable() {
        return false;
    }
    !matches!(
        data.opcode(),
        Opcode::IntConstant
            | Opcode::LongConstant
            | Opcode::FloatConstant
            | Opcode::DoubleConstant
            | Opcode::NullConstant
            | Opcode::ParameterValue
    )
}

/// Run dead code elimination over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::dce();
    let mut changed = false;
    let mut removed = 0u64;
    loop {
        let mut round_changed = false;
        let blocks: Vec<_> = graph.blocks().collect();
        for &block in &blocks {
            for inst in graph.insts(block).to_vec().into_iter().rev() {
                if is_dead(graph, inst) {
                    log::trace!("dce: removing {}", inst);
                    graph.remove(inst);
                    removed += 1;
                    round_changed = true;
                }
            }
            for phi in graph.phis(block).to_vec() {
                if is_dead(graph, phi) {
                    log::trace!("dce: removing dead {}", phi);
                    graph.remove(phi);
                    removed += 1;
                    round_changed = true;
                }
            }
        }
        if !round_changed {
            break;
        }
        changed = true;
    }
    stats.record_n(Stat::InstructionsDce, removed);
    Ok(changed)
}
