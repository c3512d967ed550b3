//! Induction variable analysis.
//!
//! Classifies the phis of each loop header and, for the common counted
//! shape (a 32-bit linear induction with constant ±1 stride tested against
//! a loop-invariant bound), derives a symbolic trip count. The loop
//! optimizer and the vectorizer consume the results through
//! `lookup_cycle`, `is_unit_stride`, `generate_trip_count` and
//! `generate_last_value`.
//!
//! Last-value generation assumes the canonical counted-loop shape where
//! the bound is not below the initial value, the form the front end's
//! range checks establish; loops that cannot be proven finite simply get
//! no trip count and the transformations leave them alone.

use crate::fx::FxHashMap;
use crate::ir::{Graph, Inst, InstructionData, Loop, Opcode, Type};
use crate::loop_analysis::LoopForest;
use crate::timing;

/// Classification of a loop-header phi.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InductionClass {
    /// `i = a·n + b`: the update adds a loop-invariant stride.
    Linear,
    /// The update adds another induction (sum of inductions).
    Polynomial,
    /// The update multiplies by a loop-invariant factor.
    Geometric,
    /// The phi takes a loop-invariant value after the first iteration.
    WrapAround,
    /// The phi alternates between values (`x = c - x` and similar).
    Periodic,
    /// Anything else.
    Unknown,
}

/// What is known about one header phi.
#[derive(Clone, Debug)]
pub struct InductionInfo {
    /// The classification.
    pub class: InductionClass,
    /// The loop-invariant initial value (the pre-header input).
    pub init: Inst,
    /// The constant stride, for linear inductions with a constant step.
    pub stride: Option<i64>,
    /// The instructions forming the induction cycle (the phi and its
    /// update chain).
    pub cycle: Vec<Inst>,
}

/// The continue-condition comparison of a counted loop, normalized to have
/// the induction phi on the left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContinueOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

/// A symbolic trip count for a counted loop.
#[derive(Clone, Debug)]
pub struct TripCount {
    /// The induction phi the exit test runs on.
    pub phi: Inst,
    /// Loop-invariant bound of the exit test.
    pub bound: Inst,
    /// The initial value of the induction.
    pub init: Inst,
    /// The stride, `1` or `-1`.
    pub stride: i64,
    /// The exact iteration count when `init` and `bound` are constants.
    pub known: Option<i64>,
    op: ContinueOp,
}

/// Induction analysis results for every loop of a graph.
pub struct InductionAnalysis {
    info: FxHashMap<Inst, InductionInfo>,
    trip_counts: FxHashMap<Loop, TripCount>,
    version: u64,
}

impl InductionAnalysis {
    /// Analyze every loop of `graph`.
    pub fn compute(graph: &Graph, forest: &LoopForest) -> Self {
        let _tt = timing::induction_analysis();
        debug_assert!(forest.is_valid(graph));
        let mut analysis = Self {
            info: FxHashMap::default(),
            trip_counts: FxHashMap::default(),
            version: graph.version(),
        };
        for lp in forest.loops() {
            analysis.classify_loop(graph, forest, lp);
            analysis.find_trip_count(graph, forest, lp);
        }
        analysis
    }

    /// Is the analysis still in sync with the graph?
    pub fn is_valid(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    /// What is known about `phi`, a loop-header phi.
    pub fn info(&self, phi: Inst) -> Option<&InductionInfo> {
        self.info.get(&phi)
    }

    /// The classification of `phi`.
    pub fn class_of(&self, phi: Inst) -> InductionClass {
        self.info
            .get(&phi)
            .map_or(InductionClass::Unknown, |i| i.class)
    }

    /// The instructions forming `phi`'s induction cycle.
    pub fn lookup_cycle(&self, phi: Inst) -> Option<&[Inst]> {
        self.info.get(&phi).map(|i| i.cycle.as_slice())
    }

    /// The trip count of `lp`, if the loop is a recognized counted loop.
    pub fn trip_count(&self, lp: Loop) -> Option<&TripCount> {
        self.trip_counts.get(&lp)
    }

    /// Is `lp` provably finite (has a recognized trip count)?
    pub fn is_finite(&self, lp: Loop) -> bool {
        self.trip_counts.contains_key(&lp)
    }

    /// Does the counted loop `lp` start its induction at constant zero?
    pub fn starts_at_zero(&self, graph: &Graph, lp: Loop) -> bool {
        self.trip_count(lp)
            .map_or(false, |tc| graph.as_int_constant(tc.init) == Some(0))
    }

    /// Is `index` the loop induction plus an optional loop-invariant
    /// offset, advancing by exactly one per iteration?
    ///
    /// Returns `Some(offset)` on success; `offset` is `None` when `index`
    /// is the induction phi itself.
    pub fn is_unit_stride(
        &self,
        graph: &Graph,
        forest: &LoopForest,
        lp: Loop,
        index: Inst,
    ) -> Option<Option<Inst>> {
        let tc = self.trip_count(lp)?;
        if tc.stride != 1 {
            return None;
        }
        if index == tc.phi {
            return Some(None);
        }
        if let InstructionData::Binary {
            opcode: Opcode::Add,
            args,
        } = *graph.data(index)
        {
            for (a, b) in [(args[0], args[1]), (args[1], args[0])] {
                if a == tc.phi && forest.is_defined_out_of_loop(graph, lp, b) {
                    return Some(Some(b));
                }
            }
        }
        None
    }

    /// Materialize the trip count of `lp` as an `Int32` value in front of
    /// the terminator of `at`.
    pub fn generate_trip_count(&self, graph: &mut Graph, lp: Loop, at: crate::ir::Block) -> Inst {
        let tc = self.trip_counts.get(&lp).expect("loop has no trip count");
        if let Some(n) = tc.known {
            return graph.int_constant(n as i32);
        }
        let (a, b) = match tc.stride {
            1 => (tc.bound, tc.init),
            _ => (tc.init, tc.bound),
        };
        let mut count = if graph.as_int_constant(b) == Some(0) {
            a
        } else {
            graph.insert_before_terminator(
                at,
                InstructionData::Binary {
                    opcode: Opcode::Sub,
                    args: [a, b],
                },
                Type::Int32,
            )
        };
        if matches!(tc.op, ContinueOp::Le | ContinueOp::Ge) {
            let one = graph.int_constant(1);
            count = graph.insert_before_terminator(
                at,
                InstructionData::Binary {
                    opcode: Opcode::Add,
                    args: [count, one],
                },
                Type::Int32,
            );
        }
        count
    }

    /// Can the value `phi` holds after the loop be expressed without
    /// running the loop? `phi` must be a linear induction with a constant
    /// stride in a loop with a recognized trip count and no early exit.
    pub fn can_generate_last_value(
        &self,
        graph: &Graph,
        forest: &LoopForest,
        lp: Loop,
        phi: Inst,
    ) -> bool {
        if forest.has_early_exit(graph, lp) || !self.is_finite(lp) {
            return false;
        }
        matches!(
            self.info.get(&phi),
            Some(InductionInfo {
                class: InductionClass::Linear,
                stride: Some(_),
                ..
            })
        )
    }

    /// Materialize the value `phi` holds after the loop exits
    /// (`init + stride * trip_count`), in front of the terminator of `at`.
    /// Callers check `can_generate_last_value`.
    pub fn generate_last_value(
        &self,
        graph: &mut Graph,
        lp: Loop,
        phi: Inst,
        at: crate::ir::Block,
    ) -> Inst {
        let tc = self.trip_counts.get(&lp).expect("loop has no trip count");
        let info = self.info.get(&phi).expect("phi is not an induction");
        let stride = info.stride.expect("stride is not a constant");

        if let (Some(init), Some(count)) = (graph.as_int_constant(info.init), tc.known) {
            return graph.int_constant((init + stride * count) as i32);
        }
        // The exit-test induction with ±1 stride folds to the bound,
        // offset by one for inclusive tests.
        if tc.phi == phi {
            match tc.op {
                ContinueOp::Lt | ContinueOp::Ne | ContinueOp::Gt => return tc.bound,
                ContinueOp::Le => {
                    let one = graph.int_constant(1);
                    return graph.insert_before_terminator(
                        at,
                        InstructionData::Binary {
                            opcode: Opcode::Add,
                            args: [tc.bound, one],
                        },
                        Type::Int32,
                    );
                }
                ContinueOp::Ge => {
                    let one = graph.int_constant(1);
                    return graph.insert_before_terminator(
                        at,
                        InstructionData::Binary {
                            opcode: Opcode::Sub,
                            args: [tc.bound, one],
                        },
                        Type::Int32,
                    );
                }
            }
        }
        // General case: init + stride * count.
        let count = self.generate_trip_count(graph, lp, at);
        let scaled = if stride == 1 {
            count
        } else {
            let stride_const = graph.int_constant(stride as i32);
            graph.insert_before_terminator(
                at,
                InstructionData::Binary {
                    opcode: Opcode::Mul,
                    args: [count, stride_const],
                },
                Type::Int32,
            )
        };
        if graph.as_int_constant(info.init) == Some(0) {
            scaled
        } else {
            graph.insert_before_terminator(
                at,
                InstructionData::Binary {
                    opcode: Opcode::Add,
                    args: [info.init, scaled],
                },
                Type::Int32,
            )
        }
    }

    fn classify_loop(&mut self, graph: &Graph, forest: &LoopForest, lp: Loop) {
        let header = forest.header(lp);
        for &phi in graph.phis(header) {
            let info = self.classify_phi(graph, forest, lp, phi);
            self.info.insert(phi, info);
        }
    }

    fn classify_phi(
        &self,
        graph: &Graph,
        forest: &LoopForest,
        lp: Loop,
        phi: Inst,
    ) -> InductionInfo {
        let args = graph.args(phi);
        let unknown = |init: Inst| InductionInfo {
            class: InductionClass::Unknown,
            init,
            stride: None,
            cycle: vec![phi],
        };
        // Only the canonical two-input shape: pre-header value then a
        // single back edge.
        if args.len() != 2 {
            return unknown(*args.first().unwrap_or(&phi));
        }
        let init = args[0];
        let update = args[1];
        if !forest.is_defined_out_of_loop(graph, lp, init) {
            return unknown(init);
        }
        if forest.is_defined_out_of_loop(graph, lp, update) {
            return InductionInfo {
                class: InductionClass::WrapAround,
                init,
                stride: None,
                cycle: vec![phi],
            };
        }
        if graph.ty(phi) != Type::Int32 {
            return unknown(init);
        }
        if let InstructionData::Binary { opcode, args: uargs } = *graph.data(update) {
            let (x, y) = (uargs[0], uargs[1]);
            let invariant = |v: Inst| forest.is_defined_out_of_loop(graph, lp, v);
            match opcode {
                Opcode::Add => {
                    for (p, c) in [(x, y), (y, x)] {
                        if p == phi && invariant(c) {
                            return InductionInfo {
                                class: InductionClass::Linear,
                                init,
                                stride: graph.as_int_constant(c),
                                cycle: vec![phi, update],
                            };
                        }
                    }
                    // i = i + j with j an induction of the same loop.
                    for (p, other) in [(x, y), (y, x)] {
                        if p == phi
                            && graph.is_phi(other)
                            && graph.block_of(other) == Some(forest.header(lp))
                        {
                            return InductionInfo {
                                class: InductionClass::Polynomial,
                                init,
                                stride: None,
                                cycle: vec![phi, update],
                            };
                        }
                    }
                }
                Opcode::Sub => {
                    if x == phi && invariant(y) {
                        return InductionInfo {
                            class: InductionClass::Linear,
                            init,
                            stride: graph.as_int_constant(y).map(|c| -c),
                            cycle: vec![phi, update],
                        };
                    }
                    // x = c - x alternates between two values.
                    if y == phi && invariant(x) {
                        return InductionInfo {
                            class: InductionClass::Periodic,
                            init,
                            stride: None,
                            cycle: vec![phi, update],
                        };
                    }
                }
                Opcode::Mul => {
                    for (p, c) in [(x, y), (y, x)] {
                        if p == phi && invariant(c) {
                            return InductionInfo {
                                class: InductionClass::Geometric,
                                init,
                                stride: None,
                                cycle: vec![phi, update],
                            };
                        }
                    }
                }
                Opcode::Xor => {
                    for (p, c) in [(x, y), (y, x)] {
                        if p == phi && invariant(c) {
                            return InductionInfo {
                                class: InductionClass::Periodic,
                                init,
                                stride: None,
                                cycle: vec![phi, update],
                            };
                        }
                    }
                }
                _ => {}
            }
        }
        unknown(init)
    }

    fn find_trip_count(&mut self, graph: &Graph, forest: &LoopForest, lp: Loop) {
        let header = forest.header(lp);
        // Single exit through the header.
        if forest.has_early_exit(graph, lp) {
            return;
        }
        let terminator = match graph.terminator(header) {
            Some(t) if graph.opcode(t) == Opcode::If => t,
            _ => return,
        };
        let succs = graph.succs(header);
        if succs.len() != 2 {
            return;
        }
        let (true_in_loop, false_in_loop) = (
            forest.contains_block(lp, succs[0]),
            forest.contains_block(lp, succs[1]),
        );
        // Exactly one side must leave the loop.
        if true_in_loop == false_in_loop {
            return;
        }
        let cond = graph.args(terminator)[0];
        let InstructionData::Binary { opcode, args } = *graph.data(cond) else {
            return;
        };
        if !opcode.is_condition() {
            return;
        }

        // Normalize to "continue while `phi op bound`".
        let (mut lhs, mut rhs, mut op) = (args[0], args[1], opcode);
        let phi_on_right = graph.is_phi(rhs) && graph.block_of(rhs) == Some(header);
        if phi_on_right {
            core::mem::swap(&mut lhs, &mut rhs);
            op = mirror(op);
        }
        if !(graph.is_phi(lhs) && graph.block_of(lhs) == Some(header)) {
            return;
        }
        if !forest.is_defined_out_of_loop(graph, lp, rhs) {
            return;
        }
        let continue_on_true = true_in_loop;
        let op = if continue_on_true { op } else { negate(op) };
        let op = match op {
            Opcode::LessThan => ContinueOp::Lt,
            Opcode::LessThanOrEqual => ContinueOp::Le,
            Opcode::GreaterThan => ContinueOp::Gt,
            Opcode::GreaterThanOrEqual => ContinueOp::Ge,
            Opcode::NotEqual => ContinueOp::Ne,
            _ => return,
        };

        let info = match self.info.get(&lhs) {
            Some(i) if i.class == InductionClass::Linear => i,
            _ => return,
        };
        let stride = match info.stride {
            Some(s @ (1 | -1)) => s,
            _ => return,
        };
        // The stride must move the induction toward the exit.
        let compatible = match op {
            ContinueOp::Lt | ContinueOp::Le => stride == 1,
            ContinueOp::Gt | ContinueOp::Ge => stride == -1,
            ContinueOp::Ne => true,
        };
        if !compatible {
            return;
        }

        let known = match (graph.as_int_constant(info.init), graph.as_int_constant(rhs)) {
            (Some(init), Some(bound)) => {
                let raw = match op {
                    ContinueOp::Lt | ContinueOp::Ne if stride == 1 => bound - init,
                    ContinueOp::Le => bound - init + 1,
                    ContinueOp::Gt | ContinueOp::Ne => init - bound,
                    ContinueOp::Ge => init - bound + 1,
                    ContinueOp::Lt => bound - init,
                };
                Some(raw.max(0))
            }
            _ => None,
        };

        self.trip_counts.insert(
            lp,
            TripCount {
                phi: lhs,
                bound: rhs,
                init: info.init,
                stride,
                known,
                op,
            },
        );
    }
}

fn mirror(op: Opcode) -> Opcode {
    match op {
        Opcode::LessThan => Opcode::GreaterThan,
        Opcode::LessThanOrEqual => Opcode::GreaterThanOrEqual,
        Opcode::GreaterThan => Opcode::LessThan,
        Opcode::GreaterThanOrEqual => Opcode::LessThanOrEqual,
        other => other,
    }
}

fn negate(op: Opcode) -> Opcode {
    match op {
        Opcode::Equal => Opcode::NotEqual,
        Opcode::NotEqual => Opcode::Equal,
        Opcode::LessThan => Opcode::GreaterThanOrEqual,
        Opcode::LessThanOrEqual => Opcode::GreaterThan,
        Opcode::GreaterThan => Opcode::LessThanOrEqual,
        Opcode::GreaterThanOrEqual => Opcode::LessThan,
        Opcode::Below => Opcode::AboveOrEqual,
        Opcode::BelowOrEqual => Opcode::Above,
        Opcode::Above => Opcode::BelowOrEqual,
        Opcode::AboveOrEqual => Opcode::Below,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::builder::testgraph;

    fn analyze(
        graph: &Graph,
    ) -> (LoopForest, InductionAnalysis, Loop) {
        let domtree = DominatorTree::compute(graph);
        let forest = LoopForest::compute(graph, &domtree);
        let lp = forest.loops().next().unwrap();
        let analysis = InductionAnalysis::compute(graph, &forest);
        (forest, analysis, lp)
    }

    #[test]
    fn canonical_counted_loop() {
        let (g, l) = testgraph::counted_loop(Some(10));
        let (forest, analysis, lp) = analyze(&g);

        let info = analysis.info(l.phi).unwrap();
        assert_eq!(info.class, InductionClass::Linear);
        assert_eq!(info.stride, Some(1));
        assert_eq!(info.cycle, vec![l.phi, l.update]);

        assert!(analysis.is_finite(lp));
        let tc = analysis.trip_count(lp).unwrap();
        assert_eq!(tc.known, Some(10));
        assert_eq!(tc.stride, 1);
        assert!(analysis.starts_at_zero(&g, lp));
        assert!(analysis.can_generate_last_value(&g, &forest, lp, l.phi));
    }

    #[test]
    fn symbolic_bound() {
        let (g, l) = testgraph::counted_loop(None);
        let (forest, analysis, lp) = analyze(&g);
        let tc = analysis.trip_count(lp).unwrap();
        assert_eq!(tc.known, None);
        assert_eq!(tc.bound, l.bound);
        assert!(analysis.starts_at_zero(&g, lp));

        // i itself is a unit stride; i + inv is a unit stride with the
        // invariant as offset.
        assert_eq!(
            analysis.is_unit_stride(&g, &forest, lp, l.phi),
            Some(None)
        );
        let one = g.args(l.update)[1];
        assert_eq!(
            analysis.is_unit_stride(&g, &forest, lp, l.update),
            Some(Some(one))
        );
    }

    #[test]
    fn trip_count_generation() {
        let (mut g, _l) = testgraph::counted_loop(None);
        let (_forest, analysis, lp) = analyze(&g);
        let pre = g.entry_block();
        let count = analysis.generate_trip_count(&mut g, lp, pre);
        // For `i < n` from zero the count folds to the bound itself.
        assert_eq!(g.opcode(count), Opcode::ParameterValue);
    }

    #[test]
    fn last_value_constant() {
        let (mut g, l) = testgraph::counted_loop(Some(10));
        let (_forest, analysis, lp) = analyze(&g);
        let pre = g.entry_block();
        let last = analysis.generate_last_value(&mut g, lp, l.phi, pre);
        assert_eq!(g.as_int_constant(last), Some(10));
    }

    #[test]
    fn last_value_symbolic_is_the_bound() {
        let (mut g, l) = testgraph::counted_loop(None);
        let (_forest, analysis, lp) = analyze(&g);
        let pre = g.entry_block();
        let last = analysis.generate_last_value(&mut g, lp, l.phi, pre);
        assert_eq!(last, l.bound);
    }
}
