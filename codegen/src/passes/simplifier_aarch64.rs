//! aarch64-specific instruction simplification.
//!
//! Folds the array data offset into an `IntermediateAddress` so the
//! backend can use the reg+reg addressing mode for the element access:
//!
//! ```text
//! ArrayGet(arr, i)  =>  addr = IntermediateAddress(arr, #data_offset)
//!                       ArrayGet(addr, i)
//! ```
//!
//! Runs late, after the target-independent pipeline, because the extra
//! address node would otherwise obscure loop-invariant bases from the
//! vectorizer.

use crate::ir::{Graph, InstructionData, Opcode, Type};
use crate::isa::IsaInfo;
use crate::passes::{Bailout, PassResult};
use crate::stats::{CompilationStats, Stat};
use crate::timing;
use target_lexicon::Architecture;

/// Offset of the first element from the array reference.
const ARRAY_DATA_OFFSET: i32 = 16;

/// Run the aarch64 simplifier over `graph`.
pub fn run(graph: &mut Graph, isa: &IsaInfo, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::instruction_simplifier();
    if !matches!(isa.triple().architecture, Architecture::Aarch64(_)) {
        return Err(Bailout::UnsupportedIr("not an aarch64 target"));
    }
    // Environments must stay materializable; rewriting bases under a
    // debugger would expose the interior pointer.
    if graph.is_debuggable() {
        return Err(Bailout::UnsupportedIr("debuggable graph"));
    }

    let mut changed = false;
    let blocks: Vec<_> = graph.blocks().collect();
    for &block in &blocks {
        for inst in graph.insts(block).to_vec() {
            let (base, index) = match *graph.data(inst) {
                InstructionData::ArrayGet { args } => (args[0], args[1]),
                InstructionData::ArraySet { args } => (args[0], args[1]),
                _ => continue,
            };
            // Constant indices fold into the displacement directly; an
            // already-formed address needs no second one.
            if graph.as_int_constant(index).is_some()
                || graph.opcode(base) == Opcode::IntermediateAddress
            {
                continue;
            }
            let offset = graph.int_constant(ARRAY_DATA_OFFSET);
            let address = graph.insert_before(
                InstructionData::Binary {
                    opcode: Opcode::IntermediateAddress,
                    args: [base, offset],
                },
                Type::Reference,
                inst,
            );
            graph.replace_input(inst, 0, address);
            stats.record(Stat::IntermediateAddressFormed);
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
    use core::str::FromStr;
    use target_lexicon::Triple;

    fn a64() -> IsaInfo {
        IsaInfo::new(Triple::from_str("aarch64-unknown-linux-gnu").unwrap())
    }

    #[test]
    fn forms_intermediate_address() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let arr = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let i = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 1 },
            Type::Int32,
        );
        let get = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, i] },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &a64(), &mut stats), Ok(true));
        let addr = g.args(get)[0];
        assert_eq!(g.opcode(addr), Opcode::IntermediateAddress);
        assert_eq!(g.args(addr)[0], arr);
        assert_valid(&g);

        // Idempotent: the base is already an address.
        assert_eq!(run(&mut g, &a64(), &mut stats), Ok(false));
    }

    #[test]
    fn constant_index_untouched() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let arr = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Reference,
        );
        let c = g.int_constant(4);
        let get = g.insert_before_terminator(
            body,
            InstructionData::ArrayGet { args: [arr, c] },
            Type::Int32,
        );
        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &a64(), &mut stats), Ok(false));
        assert_eq!(g.args(get), &[arr, c]);
    }

    #[test]
    fn other_targets_bail() {
        let mut g = testgraph::straight_line();
        let isa = IsaInfo::new(Triple::from_str("riscv64gc-unknown-linux-gnu").unwrap());
        let mut stats = CompilationStats::new();
        assert!(run(&mut g, &isa, &mut stats).is_err());
    }
}
