//! Constant folding.
//!
//! Evaluates integral arithmetic, logic, shifts, comparisons, and integer
//! type conversions whose operands are constants, replacing the
//! instruction's uses with the canonical constant. Floating-point
//! expressions are left alone (rounding modes and NaN payloads belong to
//! the backend's constant evaluator).

use crate::ir::{Graph, Inst, InstructionData, Opcode, Type};
use crate::passes::PassResult;
use crate::stats::{CompilationStats, Stat};
use crate::timing;

fn fold_unary(op: Opcode, ty: Type, x: i64) -> Option<i64> {
    Some(match op {
        Opcode::Neg => x.wrapping_neg(),
        Opcode::Not => !x,
        Opcode::BooleanNot => (x == 0) as i64,
        Opcode::Abs => x.wrapping_abs(),
        Opcode::TypeConversion => match ty {
            Type::Byte => x as i8 as i64,
            Type::Char => x as u16 as i64,
            Type::Short => x as i16 as i64,
            Type::Int32 => x as i32 as i64,
            Type::Int64 => x,
            _ => return None,
        },
        _ => return None,
    })
}

fn fold_binary(op: Opcode, wide: bool, x: i64, y: i64) -> Option<i64> {
    let shift_mask = if wide { 63 } else { 31 };
    let v = match op {
        Opcode::Add => x.wrapping_add(y),
        Opcode::Sub => x.wrapping_sub(y),
        Opcode::Mul => x.wrapping_mul(y),
        Opcode::Div => {
            if y == 0 {
                return None;
            }
            x.wrapping_div(y)
        }
        Opcode::Rem => {
            if y == 0 {
                return None;
            }
            x.wrapping_rem(y)
        }
        Opcode::And => x & y,
        Opcode::Or => x | y,
        Opcode::Xor => x ^ y,
        Opcode::Shl => x.wrapping_shl((y & shift_mask) as u32),
        Opcode::Shr => x.wrapping_shr((y & shift_mask) as u32),
        Opcode::UShr => {
            if wide {
                ((x as u64) >> (y & shift_mask)) as i64
            } else {
                ((x as u32 as u64) >> (y & shift_mask)) as i64
            }
        }
        Opcode::Equal => (x == y) as i64,
        Opcode::NotEqual => (x != y) as i64,
        Opcode::LessThan => (x < y) as i64,
        Opcode::LessThanOrEqual => (x <= y) as i64,
        Opcode::GreaterThan => (x > y) as i64,
        Opcode::GreaterThanOrEqual => (x >= y) as i64,
        Opcode::Below => ((x as u64) < (y as u64)) as i64,
        Opcode::BelowOrEqual => ((x as u64) <= (y as u64)) as i64,
        Opcode::Above => ((x as u64) > (y as u64)) as i64,
        Opcode::AboveOrEqual => ((x as u64) >= (y as u64)) as i64,
        _ => return None,
    };
    // Results of 32-bit operations stay in 32-bit range.
    Some(if wide || op.is_condition() {
        v
    } else {
        v as i32 as i64
    })
}

fn try_fold(graph: &mut Graph, inst: Inst) -> Option<Inst> {
    let ty = graph.ty(inst);
    let folded = match *graph.data(inst) {
        InstructionData::Unary { opcode, args } => {
            let x = graph.as_int_constant(args[0])?;
            fold_unary(opcode, ty, x)?
        }
        InstructionData::Binary { opcode, args } => {
            if !(ty.is_integral() || ty == Type::Bool) {
                return None;
            }
            let x = graph.as_int_constant(args[0])?;
            let y = graph.as_int_constant(args[1])?;
            let wide = graph.ty(args[0]) == Type::Int64;
            fold_binary(opcode, wide, x, y)?
        }
        InstructionData::Select { args } => {
            let c = graph.as_int_constant(args[0])?;
            return Some(if c != 0 { args[1] } else { args[2] });
        }
        _ => return None,
    };
    Some(if ty == Type::Int64 {
        graph.long_constant(folded)
    } else {
        graph.int_constant(folded as i32)
    })
}

/// Run constant folding over `graph`.
pub fn run(graph: &mut Graph, stats: &mut CompilationStats) -> PassResult {
    let _tt = timing::constant_folding();
    let mut changed = false;
    // Forward over blocks so folded operands are available to their users
    // within the same sweep.
    let blocks: Vec<_> = graph.blocks().collect();
    for &block in &blocks {
        for inst in graph.insts(block).to_vec() {
            if graph.opcode(inst).is_control_flow() {
                continue;
            }
            if let Some(replacement) = try_fold(graph, inst) {
                log::trace!("constant folding {} into {}", inst, replacement);
                graph.replace_all_uses_with(inst, replacement);
                graph.remove(inst);
                stats.record(Stat::ConstantFolded);
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

    #[test]
    fn folds_arithmetic() {
        let mut g = testgraph::straight_line();
        let a = g.int_constant(6);
        let b = g.int_constant(7);
        let body = g.succs(g.entry_block())[0];
        let mul = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [a, b],
            },
            Type::Int32,
        );
        let lt = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::LessThan,
                args: [a, mul],
            },
            Type::Bool,
        );
        let sel = g.insert_before_terminator(
            body,
            InstructionData::Select {
                args: [lt, mul, a],
            },
            Type::Int32,
        );
        let ret = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [sel],
            },
            Type::Int32,
        );

        let mut stats = CompilationStats::new();
        assert_eq!(run(&mut g, &mut stats), Ok(true));
        // 6*7 folds, 6 < 42 folds, the select picks the true side, and the
        // abs of the result folds in turn.
        assert!(!g.is_in_block(mul));
        assert!(!g.is_in_block(lt));
        assert!(!g.is_in_block(sel));
        assert_eq!(g.as_int_constant(g.args(ret)[0]), Some(42));
        assert_valid(&g);
        assert!(stats.count(Stat::ConstantFolded) >= 3);
    }

    #[test]
    fn folds_shifts_with_masked_count() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let x = g.int_constant(1);
        let big = g.int_constant(33);
        let shl = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Shl,
                args: [x, big],
            },
            Type::Int32,
        );
        let user = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [shl],
            },
            Type::Int32,
        );
        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        // 1 << 33 masks to 1 << 1 for 32-bit values.
        assert_eq!(g.as_int_constant(g.args(user)[0]), Some(2));
    }

    #[test]
    fn no_fold_of_division_by_zero() {
        let (g, result) = {
            let mut g = testgraph::straight_line();
            let body = g.succs(g.entry_block())[0];
            let a = g.int_constant(5);
            let z = g.int_constant(0);
            let div = g.insert_before_terminator(
                body,
                InstructionData::Binary {
                    opcode: Opcode::Div,
                    args: [a, z],
                },
                Type::Int32,
            );
            let mut stats = CompilationStats::new();
            run(&mut g, &mut stats).unwrap();
            let still_there = g.is_in_block(div);
            (g, still_there)
        };
        let _ = g;
        assert!(result);
    }

    #[test]
    fn narrowing_conversion() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let big = g.int_constant(0x1ff);
        let cnv = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::TypeConversion,
                args: [big],
            },
            Type::Byte,
        );
        let user = g.insert_before_terminator(
            body,
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args: [cnv],
            },
            Type::Int32,
        );
        let mut stats = CompilationStats::new();
        run(&mut g, &mut stats).unwrap();
        assert_eq!(g.as_int_constant(g.args(user)[0]), Some(-1));
    }
}
