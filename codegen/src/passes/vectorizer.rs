//! Vectorization of innermost counted loops.
//!
//! The approach follows the classic SIMDization recipe: scan the loop body
//! starting a right-hand-side tree traversal at each left-hand-side array
//! store, passing operator restrictions down the use tree; pick one lane
//! count for the whole loop; run a coarse data-dependence test over the
//! collected references (same-typed arrays either coincide or are fully
//! disjoint, so equal subscripts are the only accepted dependence shape,
//! with at most one `a != b` runtime disambiguation between two distinct
//! bases); then synthesize
//!
//! ```text
//! stc = <trip-count>; vtc = stc - (stc % VL);     // in the pre-header
//! for (i = 0; i < vtc; i += VL)  <vector body>
//! for (     ; i < stc; i += 1)   <scalar cleanup body>
//! ```
//!
//! and disconnect the original loop. Both generated headers keep the
//! `SuspendCheck + Condition + If` shape. Any unmet condition rejects the
//! loop silently and leaves it to the scalar pipeline.

use crate::fx::FxHashSet;
use crate::induction::InductionAnalysis;
use crate::ir::{Block, Graph, Inst, InstructionData, Loop, Opcode, Type};
use crate::isa::{vector_opcode, IsaInfo, Restrictions};
use crate::loop_analysis::LoopForest;
use crate::passes::loop_optimization::assign_last_value;
use crate::stats::{CompilationStats, Stat};
use crate::timing;

/// An innermost counted loop handed over by the loop optimizer: single
/// body block, single exit, `SuspendCheck + Condition + If` header whose
/// excluded instructions are in `iset`.
pub struct Candidate<'a> {
    /// The graph under optimization.
    pub graph: &'a mut Graph,
    /// Target description for lane counts and restrictions.
    pub isa: &'a IsaInfo,
    /// Statistics sink.
    pub stats: &'a mut CompilationStats,
    /// Loop forest the candidate was found in.
    pub forest: &'a LoopForest,
    /// Induction analysis for the same graph version.
    pub induction: &'a InductionAnalysis,
    /// The loop.
    pub lp: Loop,
    /// Loop header.
    pub header: Block,
    /// The single body block.
    pub body: Block,
    /// The single exit block (one predecessor, no phis).
    pub exit: Block,
    /// The loop pre-header.
    pub pre_header: Block,
    /// Induction cycle, suspend check, and condition of the header.
    pub iset: &'a FxHashSet<Inst>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct VecRef {
    base: Inst,
    offset: Option<Inst>,
    ty: Type,
    lhs: bool,
}

struct Vectorizer<'a> {
    graph: &'a mut Graph,
    isa: &'a IsaInfo,
    forest: &'a LoopForest,
    induction: &'a InductionAnalysis,
    lp: Loop,
    body: Block,
    pre_header: Block,

    // Analysis state.
    vector_length: u8,
    refs: Vec<VecRef>,
    runtime_test: Option<(Inst, Inst)>,

    // Synthesis state for the loop currently being generated.
    simd: bool,
    map: crate::fx::FxHashMap<Inst, Inst>,
    induc: Inst,
    gen_body: Block,
}

impl<'a> Vectorizer<'a> {
    /// One lane count per loop: the first accepted type decides, all later
    /// types must agree.
    fn accept_type(&mut self, ty: Type, restrictions: &mut Restrictions) -> bool {
        match self.isa.vector_support(ty) {
            Some((lanes, extra)) => {
                *restrictions = restrictions.union(extra);
                if self.vector_length == 0 {
                    self.vector_length = lanes;
                }
                self.vector_length == lanes
            }
            None => false,
        }
    }

    fn is_used_outside_loop(&self, inst: Inst) -> bool {
        self.graph.uses(inst).iter().any(|u| {
            let block = self.graph.block_of(u.user).expect("user in a block");
            self.forest.innermost_loop(block) != Some(self.lp)
        })
    }

    fn add_ref(&mut self, base: Inst, offset: Option<Inst>, ty: Type, lhs: bool) {
        let r = VecRef {
            base,
            offset,
            ty,
            lhs,
        };
        if !self.refs.contains(&r) {
            self.refs.push(r);
        }
    }

    /// Accept a loop-body definition: an array store with a vectorizable
    /// right-hand side, the back edge, or an effect-free expression
    /// consumed within the loop (inspected during the store's tree
    /// traversal).
    fn vectorize_def(&mut self, inst: Inst, gen: bool) -> bool {
        if let InstructionData::ArraySet { args } = *self.graph.data(inst) {
            let [base, index, value] = args;
            let ty = self.graph.ty(value);
            let mut restrictions = Restrictions::NONE;
            if !self.accept_type(ty, &mut restrictions) {
                return false;
            }
            if !self.forest.is_defined_out_of_loop(self.graph, self.lp, base) {
                return false;
            }
            let Some(offset) =
                self.induction
                    .is_unit_stride(self.graph, self.forest, self.lp, index)
            else {
                return false;
            };
            if !self.vectorize_use(value, gen, ty, restrictions) {
                return false;
            }
            if gen {
                self.gen_sub(index, offset);
                let subscript = self.map[&index];
                let stored = self.map[&value];
                self.gen_mem(inst, subscript, Some(stored), ty);
            } else {
                self.add_ref(base, offset, ty, true);
            }
            return true;
        }
        // Branch back okay.
        if self.graph.opcode(inst) == Opcode::Goto {
            return true;
        }
        // Otherwise accept only expressions with no effects outside the
        // immediate loop body; actual uses are inspected during the
        // right-hand-side tree traversal.
        !self.is_used_outside_loop(inst) && !self.graph.opcode(inst).does_any_write()
    }

    /// Accept (and with `gen`, translate) a right-hand-side operand tree.
    fn vectorize_use(
        &mut self,
        inst: Inst,
        gen: bool,
        ty: Type,
        restrictions: Restrictions,
    ) -> bool {
        // Accept anything for which code has already been generated.
        if gen && self.map.contains_key(&inst) {
            return true;
        }
        // Invariant values expand to all lanes outside the loop.
        if self.forest.is_defined_out_of_loop(self.graph, self.lp, inst) {
            if gen {
                self.gen_inv(inst, ty);
            }
            return true;
        }
        match *self.graph.data(inst) {
            InstructionData::ArrayGet { args } => {
                let [base, index] = args;
                if self.graph.ty(inst) != ty {
                    return false;
                }
                if !self.forest.is_defined_out_of_loop(self.graph, self.lp, base) {
                    return false;
                }
                let Some(offset) =
                    self.induction
                        .is_unit_stride(self.graph, self.forest, self.lp, index)
                else {
                    return false;
                };
                if gen {
                    self.gen_sub(index, offset);
                    let subscript = self.map[&index];
                    self.gen_mem(inst, subscript, None, ty);
                } else {
                    self.add_ref(base, offset, ty, false);
                }
                true
            }
            InstructionData::Unary {
                opcode: Opcode::TypeConversion,
                args,
            } => {
                let opa = args[0];
                let from = self.graph.ty(opa);
                let to = self.graph.ty(inst);
                if matches!(to, Type::Bool | Type::Byte | Type::Char | Type::Short)
                    && from == Type::Int32
                {
                    // A narrowing conversion of a wider computation is a
                    // lane-width no-op, provided nothing below feeds in
                    // higher-order bits.
                    if to == ty
                        && self.vectorize_use(
                            opa,
                            gen,
                            ty,
                            restrictions.union(Restrictions::NO_HI_BITS),
                        )
                    {
                        if gen {
                            if self.simd {
                                let mapped = self.map[&opa];
                                self.map.insert(inst, mapped);
                            } else {
                                self.gen_op(inst, self.map[&opa], None, ty);
                            }
                        }
                        return true;
                    }
                    false
                } else if to == Type::Float32 && from == Type::Int32 {
                    let mut restrictions = restrictions;
                    if self.accept_type(from, &mut restrictions)
                        && self.vectorize_use(opa, gen, from, restrictions)
                    {
                        if gen {
                            self.gen_op(inst, self.map[&opa], None, ty);
                        }
                        return true;
                    }
                    false
                } else {
                    false
                }
            }
            InstructionData::Unary { opcode, args }
                if matches!(opcode, Opcode::Neg | Opcode::Not | Opcode::BooleanNot) =>
            {
                let opa = args[0];
                if self.vectorize_use(opa, gen, ty, restrictions) {
                    if gen {
                        self.gen_op(inst, self.map[&opa], None, ty);
                    }
                    return true;
                }
                false
            }
            InstructionData::Unary {
                opcode: Opcode::Abs,
                args,
            } if ty == Type::Float32 => {
                // Float abs is a sign-bit mask in vector code, which needs
                // an integral replicate of the same width.
                let opa = args[0];
                let mut int_restrictions = restrictions;
                if self.vectorize_use(opa, gen, ty, restrictions)
                    && self.accept_type(Type::Int32, &mut int_restrictions)
                {
                    if gen {
                        if self.simd {
                            let mask = self.graph.int_constant(0x7fff_ffff);
                            self.gen_inv(mask, Type::Int32);
                            let masked = self.graph.create_detached(
                                InstructionData::VecBinary {
                                    opcode: Opcode::VecAnd,
                                    args: [self.map[&opa], self.map[&mask]],
                                    lanes: self.vector_length,
                                },
                                ty,
                            );
                            self.map.insert(inst, masked);
                        } else {
                            self.gen_op(inst, self.map[&opa], None, ty);
                        }
                    }
                    return true;
                }
                false
            }
            InstructionData::Binary { opcode, args }
                if matches!(
                    opcode,
                    Opcode::Add
                        | Opcode::Sub
                        | Opcode::Mul
                        | Opcode::Div
                        | Opcode::And
                        | Opcode::Or
                        | Opcode::Xor
                ) =>
            {
                // Deal with vector restrictions.
                if (opcode == Opcode::Mul && restrictions.intersects(Restrictions::NO_MUL))
                    || (opcode == Opcode::Div && restrictions.intersects(Restrictions::NO_DIV))
                {
                    return false;
                }
                let [opa, opb] = args;
                if self.vectorize_use(opa, gen, ty, restrictions)
                    && self.vectorize_use(opb, gen, ty, restrictions)
                {
                    if gen {
                        let (a, b) = (self.map[&opa], self.map[&opb]);
                        self.gen_op(inst, a, Some(b), ty);
                    }
                    return true;
                }
                false
            }
            InstructionData::Binary { opcode, args }
                if matches!(opcode, Opcode::Shl | Opcode::Shr | Opcode::UShr) =>
            {
                if restrictions.intersects(Restrictions::NO_SHIFT)
                    || (opcode == Opcode::Shr && restrictions.intersects(Restrictions::NO_SHR))
                {
                    return false; // unsupported instruction
                }
                if matches!(opcode, Opcode::Shr | Opcode::UShr)
                    && restrictions.intersects(Restrictions::NO_HI_BITS)
                {
                    return false; // hibits may impact lobits
                }
                let [opa, opb] = args;
                let Some(distance) = self.graph.as_int_constant(opb) else {
                    return false;
                };
                if self.vectorize_use(opa, gen, ty, restrictions) {
                    if gen {
                        // Shift factors only look at the lower bits, as
                        // defined for sequential shifts.
                        let mask: i64 = if self.graph.ty(inst) == Type::Int64 {
                            63
                        } else {
                            31
                        };
                        let masked = self.graph.int_constant((distance & mask) as i32);
                        let a = self.map[&opa];
                        self.gen_op(inst, a, Some(masked), ty);
                    }
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Scalar expansion of a loop invariant: a replicate in the vector
    /// pre-header, a self pass-through in scalar code.
    fn gen_inv(&mut self, org: Inst, ty: Type) {
        if self.map.contains_key(&org) {
            return;
        }
        if !self.simd {
            self.map.insert(org, org);
            return;
        }
        let replicate = self.graph.insert_before_terminator(
            self.pre_header,
            InstructionData::VecUnary {
                opcode: Opcode::VecReplicateScalar,
                args: [org],
                lanes: self.vector_length,
            },
            ty,
        );
        self.map.insert(org, replicate);
    }

    /// Map an original subscript to the generated loop's induction,
    /// keeping any loop-invariant offset.
    fn gen_sub(&mut self, org: Inst, offset: Option<Inst>) {
        if self.map.contains_key(&org) {
            return;
        }
        let subscript = match offset {
            None => self.induc,
            Some(offset) => self.graph.create_detached(
                InstructionData::Binary {
                    opcode: Opcode::Add,
                    args: [self.induc, offset],
                },
                Type::Int32,
            ),
        };
        self.map.insert(org, subscript);
    }

    /// The generated counterpart of a memory access.
    fn gen_mem(&mut self, org: Inst, subscript: Inst, stored: Option<Inst>, ty: Type) {
        let base = self.graph.args(org)[0];
        let generated = if self.simd {
            match stored {
                Some(value) => self.graph.create_detached(
                    InstructionData::VecStore {
                        args: [base, subscript, value],
                        lanes: self.vector_length,
                    },
                    Type::Void,
                ),
                None => self.graph.create_detached(
                    InstructionData::VecLoad {
                        args: [base, subscript],
                        lanes: self.vector_length,
                    },
                    ty,
                ),
            }
        } else {
            match stored {
                Some(value) => self.graph.create_detached(
                    InstructionData::ArraySet {
                        args: [base, subscript, value],
                    },
                    Type::Void,
                ),
                None => self
                    .graph
                    .create_detached(InstructionData::ArrayGet { args: [base, subscript] }, ty),
            }
        };
        self.map.insert(org, generated);
    }

    /// The generated counterpart of an arithmetic operation.
    fn gen_op(&mut self, org: Inst, opa: Inst, opb: Option<Inst>, ty: Type) {
        let opcode = self.graph.opcode(org);
        let generated = if self.simd {
            let vector = vector_opcode(opcode).expect("accepted operator has a vector form");
            match opb {
                Some(opb) => self.graph.create_detached(
                    InstructionData::VecBinary {
                        opcode: vector,
                        args: [opa, opb],
                        lanes: self.vector_length,
                    },
                    ty,
                ),
                None => self.graph.create_detached(
                    InstructionData::VecUnary {
                        opcode: vector,
                        args: [opa],
                        lanes: self.vector_length,
                    },
                    ty,
                ),
            }
        } else {
            // Scalar code follows implicit integral promotion, except for
            // the final narrowing conversion which keeps its target type.
            let scalar_ty = if opcode == Opcode::TypeConversion {
                ty
            } else {
                ty.promoted()
            };
            match opb {
                Some(opb) => self.graph.create_detached(
                    InstructionData::Binary {
                        opcode,
                        args: [opa, opb],
                    },
                    scalar_ty,
                ),
                None => self.graph.create_detached(
                    InstructionData::Unary {
                        opcode,
                        args: [opa],
                    },
                    scalar_ty,
                ),
            }
        };
        self.map.insert(org, generated);
    }

    /// Lay generated instructions out in the original body order.
    fn lay_out(&mut self) {
        for inst in self.graph.insts(self.body).to_vec() {
            if let Some(&generated) = self.map.get(&inst) {
                if !self.graph.is_in_block(generated) {
                    let anchor = self
                        .graph
                        .terminator(self.gen_body)
                        .expect("generated body has a terminator");
                    self.graph.insert_inst_before(generated, anchor);
                }
            }
        }
    }
}

/// Attempt to vectorize `candidate`; returns `true` when the graph was
/// rewritten (requiring the caller to recompute its analyses).
pub fn vectorize_loop(candidate: Candidate) -> bool {
    let _tt = timing::vectorizer();
    let Candidate {
        graph,
        isa,
        stats,
        forest,
        induction,
        lp,
        header,
        body,
        exit,
        pre_header,
        iset,
    } = candidate;

    // Only the canonical zero-based, upward-counting shape.
    let Some(tc) = induction.trip_count(lp) else {
        return false;
    };
    if tc.stride != 1 || !induction.starts_at_zero(graph, lp) {
        return false;
    }
    let (phi, known_tc) = (tc.phi, tc.known);
    if !graph.phis(body).is_empty() {
        return false;
    }

    let mut vectorizer = Vectorizer {
        graph,
        isa,
        forest,
        induction,
        lp,
        body,
        pre_header,
        vector_length: 0,
        refs: Vec::new(),
        runtime_test: None,
        simd: false,
        map: crate::fx::FxHashMap::default(),
        induc: phi,
        gen_body: body,
    };

    // Scan the loop body, starting a right-hand-side tree traversal at
    // each left-hand-side occurrence.
    for inst in vectorizer.graph.insts(body).to_vec() {
        if !vectorizer.vectorize_def(inst, false) {
            return false;
        }
    }
    if vectorizer.vector_length == 0 {
        return false; // nothing found
    }
    let vl = i64::from(vectorizer.vector_length);
    if let Some(k) = known_tc {
        if 0 < k && k < vl {
            return false; // insufficient iterations
        }
    }

    // Data dependence analysis: same-typed references where at least one
    // writes. Same base: accept only equal subscripts. Different bases:
    // equal subscripts, or one runtime disambiguation test.
    for i in 0..vectorizer.refs.len() {
        for j in i + 1..vectorizer.refs.len() {
            let (a, b) = (vectorizer.refs[i], vectorizer.refs[j]);
            if a.ty != b.ty || !(a.lhs || b.lhs) {
                continue;
            }
            if a.base == b.base {
                if a.offset != b.offset {
                    return false;
                }
            } else if a.offset != b.offset {
                // For now, reject after one test to avoid excessive
                // overhead.
                if vectorizer.runtime_test.is_some() {
                    return false;
                }
                vectorizer.runtime_test = Some((a.base, b.base));
            }
        }
    }

    // External uses of the induction take the last value.
    if !assign_last_value(
        vectorizer.graph,
        forest,
        induction,
        lp,
        phi,
        iset,
        pre_header,
        true,
    ) {
        return false;
    }

    // ----- Synthesis -----
    let vector_length = vectorizer.vector_length;
    log::debug!(
        "vectorizer: loop at {} with VL {} ({} refs)",
        header,
        vector_length,
        vectorizer.refs.len()
    );

    // Pre-header: stc = <trip count>; vtc = stc - (stc % VL).
    let stc = induction.generate_trip_count(vectorizer.graph, lp, pre_header);
    let mut needs_cleanup = known_tc.map_or(true, |k| k % vl != 0);
    let mut vtc = stc;
    if needs_cleanup {
        let mask = vectorizer.graph.int_constant(i32::from(vector_length) - 1);
        let rem = vectorizer.graph.insert_before_terminator(
            pre_header,
            InstructionData::Binary {
                opcode: Opcode::And,
                args: [stc, mask],
            },
            Type::Int32,
        );
        vtc = vectorizer.graph.insert_before_terminator(
            pre_header,
            InstructionData::Binary {
                opcode: Opcode::Sub,
                args: [stc, rem],
            },
            Type::Int32,
        );
    }
    // Runtime disambiguation: vtc = (a != b) ? vtc : 0.
    if let Some((a, b)) = vectorizer.runtime_test {
        let rt = vectorizer.graph.insert_before_terminator(
            pre_header,
            InstructionData::Binary {
                opcode: Opcode::NotEqual,
                args: [a, b],
            },
            Type::Bool,
        );
        let zero = vectorizer.graph.int_constant(0);
        vtc = vectorizer.graph.insert_before_terminator(
            pre_header,
            InstructionData::Select {
                args: [rt, vtc, zero],
            },
            Type::Int32,
        );
        needs_cleanup = true;
    }

    // Vector loop skeleton: for (i = 0; i < vtc; i += VL).
    let graph = &mut *vectorizer.graph;
    let vheader = graph.create_block();
    let vbody = graph.create_block();
    graph.disconnect_edge(pre_header, header);
    graph.disconnect_edge(header, exit);
    graph.add_edge(pre_header, vheader);
    let exit_target = if needs_cleanup {
        let cpre = graph.create_block();
        graph.append(cpre, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        cpre
    } else {
        exit
    };
    graph.add_edge(vheader, exit_target);
    graph.add_edge(vheader, vbody);
    graph.add_edge(vbody, vheader);
    let zero = graph.int_constant(0);
    let vinduc = graph.add_phi(vheader, &[zero, zero], Type::Int32);
    graph.append(
        vheader,
        InstructionData::Nullary {
            opcode: Opcode::SuspendCheck,
        },
        Type::Void,
    );
    let vcond = graph.append(
        vheader,
        InstructionData::Binary {
            opcode: Opcode::AboveOrEqual,
            args: [vinduc, vtc],
        },
        Type::Bool,
    );
    graph.append(
        vheader,
        InstructionData::Unary {
            opcode: Opcode::If,
            args: [vcond],
        },
        Type::Void,
    );
    graph.append(vbody, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);

    // Vector body.
    vectorizer.simd = true;
    vectorizer.map.clear();
    vectorizer.induc = vinduc;
    vectorizer.gen_body = vbody;
    for inst in vectorizer.graph.insts(body).to_vec() {
        let vectorized_def = vectorizer.vectorize_def(inst, true);
        debug_assert!(vectorized_def);
    }
    vectorizer.lay_out();
    let graph = &mut *vectorizer.graph;
    let vl_const = graph.int_constant(i32::from(vector_length));
    let vinc = graph.insert_before_terminator(
        vbody,
        InstructionData::Binary {
            opcode: Opcode::Add,
            args: [vinduc, vl_const],
        },
        Type::Int32,
    );
    graph.replace_input(vinduc, 1, vinc);

    // Cleanup loop: for ( ; i < stc; i += 1).
    if needs_cleanup {
        let cpre = exit_target;
        let graph = &mut *vectorizer.graph;
        let cheader = graph.create_block();
        let cbody = graph.create_block();
        graph.add_edge(cpre, cheader);
        graph.add_edge(cheader, exit);
        graph.add_edge(cheader, cbody);
        graph.add_edge(cbody, cheader);
        let cphi = graph.add_phi(cheader, &[vinduc, vinduc], Type::Int32);
        graph.append(
            cheader,
            InstructionData::Nullary {
                opcode: Opcode::SuspendCheck,
            },
            Type::Void,
        );
        let ccond = graph.append(
            cheader,
            InstructionData::Binary {
                opcode: Opcode::AboveOrEqual,
                args: [cphi, stc],
            },
            Type::Bool,
        );
        graph.append(
            cheader,
            InstructionData::Unary {
                opcode: Opcode::If,
                args: [ccond],
            },
            Type::Void,
        );
        graph.append(cbody, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);

        vectorizer.simd = false;
        vectorizer.map.clear();
        vectorizer.induc = cphi;
        vectorizer.gen_body = cbody;
        for inst in vectorizer.graph.insts(body).to_vec() {
            let vectorized_def = vectorizer.vectorize_def(inst, true);
            debug_assert!(vectorized_def);
        }
        vectorizer.lay_out();
        let graph = &mut *vectorizer.graph;
        let one = graph.int_constant(1);
        let cinc = graph.insert_before_terminator(
            cbody,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [cphi, one],
            },
            Type::Int32,
        );
        graph.replace_input(cphi, 1, cinc);
    }

    // Remove the original loop: strip the header, then disconnect the
    // body and the emptied header.
    let graph = &mut *vectorizer.graph;
    for inst in graph.insts(header).to_vec().into_iter().rev() {
        graph.remove_unchecked(inst);
    }
    for phi in graph.phis(header).to_vec() {
        graph.remove_unchecked(phi);
    }
    graph.disconnect_and_delete(body);
    graph.disconnect_and_delete(header);

    graph.set_has_simd(true);
    stats.record(Stat::LoopsVectorized);
    true
}
