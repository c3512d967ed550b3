//! Graph construction helpers.
//!
//! The front end builds graphs directly through the structural API on
//! [`Graph`]; the helpers here capture the handful of CFG shapes the test
//! suites build over and over.

use super::entities::{Block, Inst};
use super::graph::Graph;
use super::instructions::{InstructionData, Opcode};
use super::types::Type;

/// Canonical little graphs for tests.
pub mod testgraph {
    use super::*;

    /// `entry -> body -> exit`, all terminators in place.
    pub fn straight_line() -> Graph {
        let mut g = Graph::new();
        let entry = g.create_block();
        let body = g.create_block();
        let exit = g.create_block();
        g.set_entry_block(entry);
        g.set_exit_block(exit);
        g.add_edge(entry, body);
        g.add_edge(body, exit);
        g.append(entry, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(body, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);
        g
    }

    /// The blocks of a [`diamond`] graph.
    pub struct Diamond {
        /// Entry block, ends with `If(cond)`.
        pub entry: Block,
        /// If-true arm.
        pub left: Block,
        /// If-false arm.
        pub right: Block,
        /// The join, ends with `Goto`.
        pub join: Block,
        /// Exit block.
        pub exit: Block,
        /// The branch condition (parameter 0).
        pub cond: Inst,
    }

    /// A diamond: `entry -> {left, right} -> join -> exit`, branching on a
    /// boolean parameter.
    pub fn diamond() -> (Graph, Diamond) {
        let mut g = Graph::new();
        let entry = g.create_block();
        let left = g.create_block();
        let right = g.create_block();
        let join = g.create_block();
        let exit = g.create_block();
        g.set_entry_block(entry);
        g.set_exit_block(exit);
        g.add_edge(entry, left);
        g.add_edge(entry, right);
        g.add_edge(left, join);
        g.add_edge(right, join);
        g.add_edge(join, exit);

        let cond = g.append(entry, InstructionData::Parameter { index: 0 }, Type::Bool);
        g.append(entry, InstructionData::Unary { opcode: Opcode::If, args: [cond] }, Type::Void);
        g.append(left, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(right, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(join, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);

        (
            g,
            Diamond {
                entry,
                left,
                right,
                join,
                exit,
                cond,
            },
        )
    }

    /// The pieces of a [`counted_loop`] graph.
    pub struct CountedLoop {
        /// The loop pre-header (also the graph entry).
        pub preheader: Block,
        /// The loop header: `phi; SuspendCheck; cond; If`.
        pub header: Block,
        /// The single body block, ending with the back-edge `Goto`.
        pub body: Block,
        /// The loop exit, `header`'s if-true successor.
        pub exit: Block,
        /// The graph exit block.
        pub graph_exit: Block,
        /// The induction phi `i = phi(0, i + 1)`.
        pub phi: Inst,
        /// The update `i + 1` in the body.
        pub update: Inst,
        /// The loop bound.
        pub bound: Inst,
        /// The header condition `i >= bound`.
        pub condition: Inst,
        /// The header's suspend check.
        pub suspend: Inst,
    }

    /// A canonical counted loop `for (i = 0; i < bound; i += 1)`.
    ///
    /// The header tests `i >= bound` and exits on true, so successor 0 of
    /// the header is the exit and successor 1 is the body. `bound` is the
    /// constant `n` if given, otherwise an `Int32` parameter.
    pub fn counted_loop(n: Option<i32>) -> (Graph, CountedLoop) {
        let mut g = Graph::new();
        let preheader = g.create_block();
        let header = g.create_block();
        let body = g.create_block();
        let exit = g.create_block();
        let graph_exit = g.create_block();
        g.set_entry_block(preheader);
        g.set_exit_block(graph_exit);
        g.add_edge(preheader, header);
        g.add_edge(header, exit);
        g.add_edge(header, body);
        g.add_edge(body, header);
        g.add_edge(exit, graph_exit);

        let bound = match n {
            Some(n) => g.int_constant(n),
            None => g.append(preheader, InstructionData::Parameter { index: 0 }, Type::Int32),
        };
        let zero = g.int_constant(0);
        let one = g.int_constant(1);
        g.append(preheader, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);

        // The phi's back-edge input starts as a placeholder and is patched
        // to the update below.
        let phi = g.add_phi(header, &[zero, zero], Type::Int32);
        let suspend = g.append(
            header,
            InstructionData::Nullary {
                opcode: Opcode::SuspendCheck,
            },
            Type::Void,
        );
        let condition = g.append(
            header,
            InstructionData::Binary {
                opcode: Opcode::GreaterThanOrEqual,
                args: [phi, bound],
            },
            Type::Bool,
        );
        g.append(
            header,
            InstructionData::Unary {
                opcode: Opcode::If,
                args: [condition],
            },
            Type::Void,
        );

        let update = g.append(
            body,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [phi, one],
            },
            Type::Int32,
        );
        g.append(body, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.replace_input(phi, 1, update);

        g.append(exit, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(graph_exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);
        g.set_has_loops(true);

        (
            g,
            CountedLoop {
                preheader,
                header,
                body,
                exit,
                graph_exit,
                phi,
                update,
                bound,
                condition,
                suspend,
            },
        )
    }
}
