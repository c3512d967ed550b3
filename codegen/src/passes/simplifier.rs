//! Instruction simplification: algebraic identities that neither fold to a
//! constant nor need global information.
//!
//! Identities are applied only to integral values; floating-point algebra
//! (`x + 0.0`, `x * 1.0`) changes the meaning of signed zeros and NaNs and
//! is deliberately left alone.

use crate::ir::{Graph, Inst, InstructionData, Opcode, Type};
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;

fn is_const(graph: &Graph, inst: Inst, value: i64) -> bool {
    graph.as_int_constant(inst) == Some(value)
}

/// The value `inst` simplifies to, if any.
fn simplify(graph: &mut Graph, inst: Inst) -> Option<Inst> {
    let ty = graph.ty(inst);
    let integral = ty.is_integral() || ty == Type::Bool;
    match *graph.data(inst) {
        InstructionData::Binary { opcode, args } if integral => {
            let [x, y] = args;
            match opcode {
                Opcode::Add => {
                    if is_const(graph, y, 0) {
                        return Some(x);
                    }
                    if is_const(graph, x, 0) {
                        return Some(y);
                    }
                }
                Opcode::Sub => {
                    if is_const(graph, y, 0) {
                        return Some(x);
                    }
                    if x == y {
                        return Some(graph.zero_constant(ty.promoted()));
                    }
                }
                Opcode::Mul => {
                    if is_const(graph, y, 1) {
                        return Some(x);
                    }
                    if is_const(graph, x, 1) {
                        return Some(y);
                    }
                    if is_const(graph, y, 0) || is_const(graph, x, 0) {
                        return Some(graph.zero_constant(ty.promoted()));
                    }
                }
                Opcode::Div => {
                    if is_const(graph, y, 1) {
                        return Some(x);
                    }
                }
                Opcode::And => {
                    if x == y || is_const(graph, y, -1) {
                        return Some(x);
                    }
                    if is_const(graph, x, -1) {
                        return Some(y);
                    }
                    if is_const(graph, y, 0) || is_const(graph, x, 0) {
                        return Some(graph.zero_constant(ty.promoted()));
                    }
                }
                Opcode::Or => {
                    if x == y || is_const(graph, y, 0) {
                        return Some(x);
                    }
                    if is_const(graph, x, 0) {
                        return Some(y);
                    }
                }
                Opcode::Xor => {
                    if is_const(graph, y, 0) {
                        return Some(x);
                    }
                    if is_const(graph, x, 0) {
                        return Some(y);
                    }
                    if x == y {
                        return Some(graph.zero_constant(ty.promoted()));
                    }
                }
                Opcode::Shl | Opcode::Shr | Opcode::UShr => {
                    if is_const(graph, y, 0) {
                        return Some(x);
                    }
                }
                _ => {}
            }
            None
        }
        InstructionData::Unary { opcode, args } => {
            let x = args[0];
            match (opcode, graph.data(x)) {
                // Double negation and double complement cancel.
                (
                    Opcode::Neg,
                    InstructionData::Unary {
                        opcode: Opcode::Neg,
                        args: inner,
                    },
                )
                | (
                    Opcode::Not,
                    InstructionData::Unary {
                        opcode: Opcode::Not,
                        args: inner,
                    },
                )
                | (
                    Opcode::BooleanNot,
                    InstructionData::Unary {
                        opcode: Opcode::BooleanNot,
                        args: inner,
                    },
                ) => Some(inner[0]),
                // A freshly allocated object is never null.
                (Opcode::NullCheck, data) if data.opcode().is_allocation() => Some(x),
                _ => None,
            }
        }
        InstructionData::Select { args } => {
            if args[1] == args[2] {
                Some(args[1])
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Run the instruction simplifier over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::instruction_simplifier();
    let mut changed = false;
    let blocks: Vec<_> = graph.blocks().collect();
    for &block in &blocks {
        for inst in graph.insts(block).to_vec() {
            if graph.opcode(inst).is_control_flow() {
                continue;
            }
            if let Some(replacement) = simplify(graph, inst) {
                log::trace!("simplifier: {} -> {}", inst, replacement);
                graph.replace_all_uses_with(inst, replacement);
                if graph.data(inst).is_removable() {
                    graph.remove(inst);
                }
                stats.record(Stat::InstructionSimplified);
                changed = true;
            }
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;
    use crate::verifier::assert_valid;

    fn body_of(g: &Graph) -> crate::ir::Block {
        g.succs(g.entry_block())[0]
    }

    #[test]
    fn identities() {
        let mut g = testgraph::straight_line();
        let body = body_of(&g);
        let x = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Int32,
        );
        let zero = g.int_constant(0);
        let add = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [x, zero],
            },
            Type::Int32,
        );
        let xor = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Xor,
                args: [x, x],
            },
            Type::Int32,
        );
        let user = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Or,
                args: [add, xor],
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        // x + 0 -> x and x ^ x -> 0 feed x | 0 -> x within the same sweep.
        assert!(!g.is_in_block(add));
        assert!(!g.is_in_block(xor));
        assert!(!g.is_in_block(user));
        assert_eq!(g.args(user), &[x, zero]);
        assert_eq!(run(&mut g, &mut stats), Ok(false));
        assert_valid(&g);
    }

    #[test]
    fn null_check_on_allocation() {
        use gantry_entity::EntityRef;
        let mut g = testgraph::straight_line();
        let body = body_of(&g);
        let obj = g.insert_before_terminator(
            body,
            InstructionData::NewInstance {
                class: crate::ir::Class::new(0),
            },
            Type::Reference,
        );
        let check = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::NullCheck,
                args: [obj],
            },
            Type::Reference,
        );
        let field = g.insert_before_terminator(
            body,
            InstructionData::FieldGet {
                args: [check],
                field: crate::ir::FieldRef::plain(8),
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        assert_eq!(g.args(field), &[obj]);
        assert_valid(&g);
    }

    #[test]
    fn select_same_arms() {
        let mut g = testgraph::straight_line();
        let body = body_of(&g);
        let cond = g.insert_before_terminator(
            body,
            InstructionData::Parameter { index: 0 },
            Type::Bool,
        );
        let v = g.int_constant(9);
        let sel = g.insert_before_terminator(
            body,
            InstructionData::Select {
                args: [cond, v, v],
            },
            Type::Int32,
        );
        let user = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [sel],
            },
            Type::Int32,
        );
        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        assert_eq!(g.args(user), &[v]);
        assert!(!g.is_in_block(sel));
    }
}
