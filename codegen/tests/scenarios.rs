//! End-to-end scenarios exercised through the public pass interface.

use gantry_codegen::ir::builder::testgraph;
use gantry_codegen::ir::{
    Block, Class, FieldRef, Graph, Inst, InstructionData, Method, Opcode, Type,
};
use gantry_codegen::isa::IsaInfo;
use gantry_codegen::passes::{run_pass, OptimizationPass, PassManager};
use gantry_codegen::stats::{CompilationStats, Stat};
use gantry_codegen::verifier;
use gantry_entity::EntityRef;
use std::str::FromStr;
use target_lexicon::Triple;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn x86_sse41() -> IsaInfo {
    IsaInfo::new(Triple::from_str("x86_64-unknown-linux-gnu").unwrap()).with_sse41(true)
}

fn run(pass: OptimizationPass, graph: &mut Graph, stats: &mut CompilationStats) -> bool {
    let isa = x86_sse41();
    let changed = run_pass(pass, graph, &isa, stats).unwrap_or(false);
    verifier::assert_valid(graph);
    changed
}

/// Scenario 1: a CHA guard whose receiver is a parameter disappears
/// entirely, clearing `has_cha_guards`.
#[test]
fn cha_guard_parameter_receiver() {
    init_logging();
    let mut g = testgraph::straight_line();
    let body = g.succs(g.entry_block())[0];
    let receiver = g.insert_before_terminator(
        body,
        InstructionData::Parameter { index: 0 },
        Type::Reference,
    );
    let zero = g.int_constant(0);
    let anchor = g.terminator(body).unwrap();
    let flag = g.insert_before(
        InstructionData::Unary {
            opcode: Opcode::ShouldDeoptimizeFlag,
            args: [receiver],
        },
        Type::Int32,
        anchor,
    );
    let ne = g.insert_before(
        InstructionData::Binary {
            opcode: Opcode::NotEqual,
            args: [flag, zero],
        },
        Type::Bool,
        anchor,
    );
    let deopt = g.insert_before(
        InstructionData::Unary {
            opcode: Opcode::Deoptimize,
            args: [ne],
        },
        Type::Void,
        anchor,
    );
    g.set_has_cha_guards(true);

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::ChaGuardOptimization, &mut g, &mut stats));
    assert!(!g.is_in_block(flag));
    assert!(!g.is_in_block(ne));
    assert!(!g.is_in_block(deopt));
    assert!(!g.has_cha_guards());
}

/// Scenario 2: an add computed on the hot path but consumed only in a
/// throwing branch moves into that branch, right above its user.
#[test]
fn code_sink_into_throw_branch() {
    init_logging();
    let mut g = Graph::new();
    let entry = g.create_block();
    let a = g.create_block();
    let normal = g.create_block();
    let throwing = g.create_block();
    let exit = g.create_block();
    g.set_entry_block(entry);
    g.set_exit_block(exit);
    g.add_edge(entry, a);
    g.add_edge(a, normal);
    g.add_edge(a, throwing);
    g.add_edge(normal, exit);
    g.add_edge(throwing, exit);

    let cond = g.append(entry, InstructionData::Parameter { index: 0 }, Type::Bool);
    let x = g.append(entry, InstructionData::Parameter { index: 1 }, Type::Int32);
    let y = g.append(entry, InstructionData::Parameter { index: 2 }, Type::Int32);
    let exception = g.append(entry, InstructionData::Parameter { index: 3 }, Type::Reference);
    g.append(entry, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
    let t = g.append(
        a,
        InstructionData::Binary {
            opcode: Opcode::Add,
            args: [x, y],
        },
        Type::Int32,
    );
    g.append(a, InstructionData::Unary { opcode: Opcode::If, args: [cond] }, Type::Void);
    g.append(normal, InstructionData::Nullary { opcode: Opcode::ReturnVoid }, Type::Void);
    let _user = g.append(
        throwing,
        InstructionData::Unary {
            opcode: Opcode::Abs,
            args: [t],
        },
        Type::Int32,
    );
    g.append(
        throwing,
        InstructionData::Unary {
            opcode: Opcode::Throw,
            args: [exception],
        },
        Type::Void,
    );
    g.append(exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::CodeSinking, &mut g, &mut stats));
    assert_eq!(g.block_of(t), Some(throwing));
    assert_eq!(g.insts(throwing)[0], t);
    assert_eq!(stats.count(Stat::InstructionSunk), 1);

    // Sinking again moves nothing: idempotence.
    let mut stats2 = CompilationStats::new();
    run(OptimizationPass::CodeSinking, &mut g, &mut stats2);
    assert_eq!(stats2.count(Stat::InstructionSunk), 0);
}

/// Scenario 3: an effect-free counted loop with one external use of its
/// induction is removed; the use reads `n`.
#[test]
fn empty_loop_removal() {
    init_logging();
    let (mut g, l) = testgraph::counted_loop(None);
    let user = g.insert_before_terminator(
        l.exit,
        InstructionData::Unary {
            opcode: Opcode::Abs,
            args: [l.phi],
        },
        Type::Int32,
    );

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::LoopOptimization, &mut g, &mut stats));
    assert!(!g.is_block_live(l.body));
    assert!(!g.is_block_live(l.header));
    assert!(g.succs(l.preheader).contains(&l.exit));
    assert_eq!(g.args(user), &[l.bound]);
    assert_eq!(stats.count(Stat::EmptyLoopRemoved), 1);
}

/// Scenario 4: same-value stores. `a[1]=1; a[1]=1` keeps only the first;
/// with an intervening may-aliasing `a[i]=3` all three stay.
#[test]
fn lse_same_value_store() {
    init_logging();
    let mut g = testgraph::straight_line();
    let body = g.succs(g.entry_block())[0];
    let arr = g.insert_before_terminator(
        body,
        InstructionData::Parameter { index: 0 },
        Type::Reference,
    );
    let c1 = g.int_constant(1);
    let s1 = g.insert_before_terminator(
        body,
        InstructionData::ArraySet { args: [arr, c1, c1] },
        Type::Void,
    );
    let s2 = g.insert_before_terminator(
        body,
        InstructionData::ArraySet { args: [arr, c1, c1] },
        Type::Void,
    );

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::LoadStoreElimination, &mut g, &mut stats));
    assert!(g.is_in_block(s1));
    assert!(!g.is_in_block(s2));

    // Variant with a may-aliasing store in between.
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
    let c1 = g.int_constant(1);
    let c3 = g.int_constant(3);
    let s1 = g.insert_before_terminator(
        body,
        InstructionData::ArraySet { args: [arr, c1, c1] },
        Type::Void,
    );
    let s2 = g.insert_before_terminator(
        body,
        InstructionData::ArraySet { args: [arr, i, c3] },
        Type::Void,
    );
    let s3 = g.insert_before_terminator(
        body,
        InstructionData::ArraySet { args: [arr, c1, c1] },
        Type::Void,
    );
    let mut stats = CompilationStats::new();
    run(OptimizationPass::LoadStoreElimination, &mut g, &mut stats);
    assert!(g.is_in_block(s1));
    assert!(g.is_in_block(s2));
    assert!(g.is_in_block(s3));
}

/// Builds the partial-escape diamond of scenario 5 and returns
/// `(graph, left, right, join, escape call, right store, read user)`.
fn partial_escape_graph() -> (Graph, Block, Block, Block, Inst, Inst, Inst) {
    let (mut g, d) = testgraph::diamond();
    let field = FieldRef::plain(8);
    let obj = g.insert_before(
        InstructionData::NewInstance { class: Class::new(0) },
        Type::Reference,
        g.terminator(d.entry).unwrap(),
    );
    let c1 = g.int_constant(1);
    let escape = g.insert_before(
        InstructionData::Invoke {
            args: [obj].iter().copied().collect(),
            method: Method::new(0),
        },
        Type::Void,
        g.terminator(d.left).unwrap(),
    );
    let store = g.insert_before(
        InstructionData::FieldSet {
            args: [obj, c1],
            field,
        },
        Type::Void,
        g.terminator(d.right).unwrap(),
    );
    let load = g.insert_before(
        InstructionData::FieldGet { args: [obj], field },
        Type::Int32,
        g.terminator(d.join).unwrap(),
    );
    let user = g.insert_before(
        InstructionData::Unary {
            opcode: Opcode::Abs,
            args: [load],
        },
        Type::Int32,
        g.terminator(d.join).unwrap(),
    );
    (g, d.left, d.right, d.join, escape, store, user)
}

fn check_partial_escape_result(
    g: &Graph,
    left: Block,
    escape: Inst,
    store: Inst,
    user: Inst,
) {
    // The left path materializes the allocation before the escape.
    let mat_block = g.preds(left)[0];
    let mat = g.insts(mat_block)[0];
    assert_eq!(g.opcode(mat), Opcode::NewInstance);
    assert_eq!(g.args(escape), &[mat]);
    // The right branch's store is gone.
    assert!(!g.is_in_block(store));
    // The read is predicated on a {new, null} phi.
    let predicated = g.args(user)[0];
    assert_eq!(g.opcode(predicated), Opcode::PredicatedFieldGet);
    let reference = g.args(predicated)[0];
    assert!(g.is_phi(reference));
    assert!(g.args(reference).contains(&mat));
}

/// Scenario 5: a diamond where only one arm escapes the allocation.
#[test]
fn partial_lse_diamond() {
    init_logging();
    let (mut g, left, _right, _join, escape, store, user) = partial_escape_graph();
    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::LoadStoreElimination, &mut g, &mut stats));
    check_partial_escape_result(&g, left, escape, store, user);
    assert!(stats.count(Stat::AllocationSunk) >= 1);
}

/// The pass-ordering question: code sinking before or after partial LSE
/// must both leave a well-formed graph with the same shape of result.
#[test]
fn partial_lse_and_code_sinking_commute_here() {
    init_logging();
    for lse_first in [true, false] {
        let (mut g, left, _right, _join, escape, store, user) = partial_escape_graph();
        let mut stats = CompilationStats::new();
        let order = if lse_first {
            [
                OptimizationPass::LoadStoreElimination,
                OptimizationPass::CodeSinking,
            ]
        } else {
            [
                OptimizationPass::CodeSinking,
                OptimizationPass::LoadStoreElimination,
            ]
        };
        for pass in order {
            run(pass, &mut g, &mut stats);
        }
        check_partial_escape_result(&g, left, escape, store, user);
    }
}

/// Scenario 6: `for (i = 0; i < n; i++) a[i] = a[i] + 1` with unknown `n`
/// becomes a 4-wide vector loop plus a scalar cleanup loop.
#[test]
fn vectorization_with_cleanup() {
    init_logging();
    let (mut g, l) = testgraph::counted_loop(None);
    let arr = g.insert_before(
        InstructionData::Parameter { index: 1 },
        Type::Reference,
        g.terminator(l.preheader).unwrap(),
    );
    let one = g.int_constant(1);
    let load = g.insert_before(
        InstructionData::ArrayGet { args: [arr, l.phi] },
        Type::Int32,
        l.update,
    );
    let add = g.insert_before(
        InstructionData::Binary {
            opcode: Opcode::Add,
            args: [load, one],
        },
        Type::Int32,
        l.update,
    );
    g.insert_before(
        InstructionData::ArraySet {
            args: [arr, l.phi, add],
        },
        Type::Void,
        l.update,
    );

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::LoopOptimization, &mut g, &mut stats));
    assert!(g.has_simd());
    assert!(!g.is_block_live(l.body));
    assert_eq!(stats.count(Stat::LoopsVectorized), 1);

    let mut vec_stores = 0;
    let mut scalar_stores = 0;
    let mut step4 = false;
    for block in g.blocks().collect::<Vec<_>>() {
        for &inst in g.insts(block) {
            match g.opcode(inst) {
                Opcode::VecStore => {
                    vec_stores += 1;
                    assert_eq!(g.data(inst).lanes(), Some(4));
                }
                Opcode::ArraySet => scalar_stores += 1,
                Opcode::Add => {
                    if g.as_int_constant(g.args(inst)[1]) == Some(4) {
                        step4 = true;
                    }
                }
                _ => {}
            }
        }
    }
    assert_eq!(vec_stores, 1);
    assert_eq!(scalar_stores, 1);
    assert!(step4, "vector loop advances by the lane count");
}

/// Scalar LSE applied twice yields the same graph (idempotence).
#[test]
fn lse_idempotent() {
    init_logging();
    let mut g = testgraph::straight_line();
    let body = g.succs(g.entry_block())[0];
    let obj = g.insert_before_terminator(
        body,
        InstructionData::Parameter { index: 0 },
        Type::Reference,
    );
    let v = g.insert_before_terminator(
        body,
        InstructionData::Parameter { index: 1 },
        Type::Int32,
    );
    let field = FieldRef::plain(16);
    g.insert_before_terminator(
        body,
        InstructionData::FieldSet { args: [obj, v], field },
        Type::Void,
    );
    let load = g.insert_before_terminator(
        body,
        InstructionData::FieldGet { args: [obj], field },
        Type::Int32,
    );
    g.insert_before_terminator(
        body,
        InstructionData::Unary {
            opcode: Opcode::Abs,
            args: [load],
        },
        Type::Int32,
    );

    let mut stats = CompilationStats::new();
    assert!(run(OptimizationPass::LoadStoreElimination, &mut g, &mut stats));
    assert!(!run(OptimizationPass::LoadStoreElimination, &mut g, &mut stats));
}

/// The default pipeline runs front to back over a small method and leaves
/// a valid graph.
#[test]
fn default_pipeline_end_to_end() {
    init_logging();
    let (mut g, l) = testgraph::counted_loop(None);
    let arr = g.insert_before(
        InstructionData::Parameter { index: 1 },
        Type::Reference,
        g.terminator(l.preheader).unwrap(),
    );
    let one = g.int_constant(1);
    let load = g.insert_before(
        InstructionData::ArrayGet { args: [arr, l.phi] },
        Type::Int32,
        l.update,
    );
    let add = g.insert_before(
        InstructionData::Binary {
            opcode: Opcode::Add,
            args: [load, one],
        },
        Type::Int32,
        l.update,
    );
    g.insert_before(
        InstructionData::ArraySet {
            args: [arr, l.phi, add],
        },
        Type::Void,
        l.update,
    );

    let isa = x86_sse41();
    let pm = PassManager::new(&isa);
    let mut stats = CompilationStats::new();
    pm.run(&mut g, &mut stats, PassManager::default_pipeline())
        .unwrap();
    verifier::assert_valid(&g);
    assert!(g.has_simd());
}
