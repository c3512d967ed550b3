//! The SSA graph and its structural editing API.
//!
//! A [`Graph`] owns every entity of one method under compilation: basic
//! blocks, instructions, deoptimization environments, and the canonicalized
//! constant pool. All IR storage is arena-style (`PrimaryMap`), so entity
//! references stay valid until the whole graph is dropped; removal detaches
//! an instruction from the graph without reclaiming its slot.
//!
//! Use-def information is bidirectional and is maintained exclusively by
//! the methods here: for every operand edge `user -> input` the input's use
//! list contains `(user, index)`, and environments participate through a
//! distinct edge class so escape analysis can tell data uses from
//! deoptimization pins. Mutating operands by any other means would leave
//! the lists inconsistent, which is why `InstructionData::arguments_mut` is
//! crate-private.

use super::entities::{Block, Env, Inst};
use super::instructions::{InstructionData, Opcode};
use super::types::Type;
use crate::fx::FxHashMap;
use gantry_entity::packed_option::PackedOption;
use gantry_entity::{PrimaryMap, SecondaryMap};
use core::fmt;

/// A data-use edge: `user`'s operand number `index` is the instruction
/// whose use list this edge lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Use {
    /// The consuming instruction.
    pub user: Inst,
    /// Which operand of the user.
    pub index: u32,
}

/// An environment-use edge: slot `index` of `env` pins the instruction
/// whose env-use list this edge lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvUse {
    /// The environment holding the pin.
    pub env: Env,
    /// Which slot of the environment.
    pub index: u32,
}

/// A deoptimization environment: an ordered list of values that must be
/// materializable if the holder deoptimizes or suspends. Slots may be empty
/// (the frame location is dead at that point).
#[derive(Clone, Debug, Default)]
pub struct EnvironmentData {
    /// The instruction this environment belongs to.
    pub holder: PackedOption<Inst>,
    /// The pinned values.
    pub values: Vec<PackedOption<Inst>>,
}

/// The data associated with one basic block.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Ordered predecessors. Phi input `k` flows from predecessor `k`.
    preds: Vec<Block>,
    /// Ordered successors. For an `If` terminator, successor 0 is the
    /// if-true target and successor 1 the if-false target.
    succs: Vec<Block>,
    /// Phis at the block head.
    phis: Vec<Inst>,
    /// Ordinary instructions, terminator last.
    insts: Vec<Inst>,
    /// A disconnected block. Its id is never reused, but iteration skips it.
    dead: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Null,
}

/// An SSA control-flow graph for one method.
pub struct Graph {
    blocks: PrimaryMap<Block, BlockData>,
    insts: PrimaryMap<Inst, InstructionData>,
    inst_type: SecondaryMap<Inst, Type>,
    inst_block: SecondaryMap<Inst, PackedOption<Block>>,
    uses: SecondaryMap<Inst, Vec<Use>>,
    env_uses: SecondaryMap<Inst, Vec<EnvUse>>,
    environments: PrimaryMap<Env, EnvironmentData>,
    inst_env: SecondaryMap<Inst, PackedOption<Env>>,
    constants: FxHashMap<ConstKey, Inst>,

    entry: PackedOption<Block>,
    exit: PackedOption<Block>,

    /// Bumped by every structural mutation; analyses record the value they
    /// were computed at and refuse to be used when stale.
    version: u64,

    has_loops: bool,
    has_irreducible_loops: bool,
    has_try_catch: bool,
    has_cha_guards: bool,
    has_simd: bool,
    debuggable: bool,
    compiling_osr: bool,
}

impl Graph {
    /// Create an empty graph. The front end (or a test) then creates
    /// blocks, designates entry and exit, and fills in instructions.
    pub fn new() -> Self {
        Self {
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            inst_type: SecondaryMap::with_default(Type::Void),
            inst_block: SecondaryMap::new(),
            uses: SecondaryMap::new(),
            env_uses: SecondaryMap::new(),
            environments: PrimaryMap::new(),
            inst_env: SecondaryMap::new(),
            constants: FxHashMap::default(),
            entry: Default::default(),
            exit: Default::default(),
            version: 0,
            has_loops: false,
            has_irreducible_loops: false,
            has_try_catch: false,
            has_cha_guards: false,
            has_simd: false,
            debuggable: false,
            compiling_osr: false,
        }
    }

    // ---------------------------------------------------------------------
    // Queries.

    /// The entry block. Panics if the graph is still under construction.
    pub fn entry_block(&self) -> Block {
        self.entry.expect("graph has no entry block")
    }

    /// The exit block, if the method can return.
    pub fn exit_block(&self) -> Option<Block> {
        self.exit.expand()
    }

    /// The analysis validity token. Analyses remember the token at
    /// computation time; a mismatch means the analysis is stale.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The total number of block ids allocated, including dead ones.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The total number of instruction ids allocated, including detached
    /// ones.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Iterate over the live blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks
            .keys()
            .filter(move |&b| !self.blocks[b].dead)
    }

    /// Is `block` still part of the CFG?
    pub fn is_block_live(&self, block: Block) -> bool {
        !self.blocks[block].dead
    }

    /// The ordered predecessors of `block`.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    /// The ordered successors of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    /// The phis at the head of `block`.
    pub fn phis(&self, block: Block) -> &[Inst] {
        &self.blocks[block].phis
    }

    /// The ordinary instructions of `block`, terminator last.
    pub fn insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    /// The terminator of `block`, if the block is non-empty.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        self.blocks[block].insts.last().copied()
    }

    /// The single successor of a block that has exactly one.
    pub fn single_succ(&self, block: Block) -> Option<Block> {
        match self.blocks[block].succs.as_slice() {
            &[s] => Some(s),
            _ => None,
        }
    }

    /// The contents of `inst`.
    pub fn data(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }

    /// The opcode of `inst`.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self.insts[inst].opcode()
    }

    /// The result type of `inst`.
    pub fn ty(&self, inst: Inst) -> Type {
        self.inst_type[inst]
    }

    /// The data operands of `inst`.
    pub fn args(&self, inst: Inst) -> &[Inst] {
        self.insts[inst].arguments()
    }

    /// The block currently containing `inst`, or `None` if it is detached.
    pub fn block_of(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst].expand()
    }

    /// Is `inst` currently inserted in a block?
    pub fn is_in_block(&self, inst: Inst) -> bool {
        self.inst_block[inst].is_some()
    }

    /// The data uses of `inst`.
    pub fn uses(&self, inst: Inst) -> &[Use] {
        &self.uses[inst]
    }

    /// The environment uses (deoptimization pins) of `inst`.
    pub fn env_uses(&self, inst: Inst) -> &[EnvUse] {
        &self.env_uses[inst]
    }

    /// Does `inst` have any data uses?
    pub fn has_uses(&self, inst: Inst) -> bool {
        !self.uses[inst].is_empty()
    }

    /// Does `inst` have any environment uses?
    pub fn has_env_uses(&self, inst: Inst) -> bool {
        !self.env_uses[inst].is_empty()
    }

    /// The environment attached to `inst`, if any.
    pub fn env_of(&self, inst: Inst) -> Option<Env> {
        self.inst_env[inst].expand()
    }

    /// The contents of `env`.
    pub fn env_data(&self, env: Env) -> &EnvironmentData {
        &self.environments[env]
    }

    /// The instruction holding `env`.
    pub fn env_holder(&self, env: Env) -> Inst {
        self.environments[env].holder.expect("detached environment")
    }

    /// Is `inst` a phi?
    pub fn is_phi(&self, inst: Inst) -> bool {
        self.opcode(inst) == Opcode::Phi
    }

    /// The signed integer value of `inst` when it is an `IntConstant` or
    /// `LongConstant`.
    pub fn as_int_constant(&self, inst: Inst) -> Option<i64> {
        match *self.data(inst) {
            InstructionData::Constant {
                opcode: Opcode::IntConstant,
                bits,
            }
            | InstructionData::Constant {
                opcode: Opcode::LongConstant,
                bits,
            } => Some(bits),
            _ => None,
        }
    }

    /// Position of `inst` within its block, phis counting before ordinary
    /// instructions. Used for intra-block program-point comparisons.
    fn local_position(&self, inst: Inst) -> usize {
        let block = self.block_of(inst).expect("instruction not in a block");
        let data = &self.blocks[block];
        if let Some(i) = data.phis.iter().position(|&p| p == inst) {
            return i;
        }
        data.phis.len()
            + data
                .insts
                .iter()
                .position(|&i| i == inst)
                .expect("instruction not in its block's list")
    }

    /// Does `a` come strictly before `b` within the same block?
    pub fn comes_before_in_block(&self, a: Inst, b: Inst) -> bool {
        debug_assert_eq!(self.block_of(a), self.block_of(b));
        self.local_position(a) < self.local_position(b)
    }

    // ---------------------------------------------------------------------
    // Flags.

    /// Does the graph contain loops?
    pub fn has_loops(&self) -> bool {
        self.has_loops
    }
    /// Update the loop flag.
    pub fn set_has_loops(&mut self, v: bool) {
        self.has_loops = v;
    }
    /// Does the graph contain irreducible loops?
    pub fn has_irreducible_loops(&self) -> bool {
        self.has_irreducible_loops
    }
    /// Update the irreducible-loop flag.
    pub fn set_has_irreducible_loops(&mut self, v: bool) {
        self.has_irreducible_loops = v;
    }
    /// Does the method have try/catch regions?
    pub fn has_try_catch(&self) -> bool {
        self.has_try_catch
    }
    /// Update the try/catch flag.
    pub fn set_has_try_catch(&mut self, v: bool) {
        self.has_try_catch = v;
    }
    /// Does the graph still contain CHA guards?
    pub fn has_cha_guards(&self) -> bool {
        self.has_cha_guards
    }
    /// Update the CHA guard flag.
    pub fn set_has_cha_guards(&mut self, v: bool) {
        self.has_cha_guards = v;
    }
    /// Has vectorization produced SIMD instructions?
    pub fn has_simd(&self) -> bool {
        self.has_simd
    }
    /// Update the SIMD flag.
    pub fn set_has_simd(&mut self, v: bool) {
        self.has_simd = v;
    }
    /// Is the method compiled for a debuggable runtime? Debuggable frames
    /// keep every environment value observable.
    pub fn is_debuggable(&self) -> bool {
        self.debuggable
    }
    /// Update the debuggable flag.
    pub fn set_debuggable(&mut self, v: bool) {
        self.debuggable = v;
    }
    /// Is this an on-stack-replacement compilation?
    pub fn is_compiling_osr(&self) -> bool {
        self.compiling_osr
    }
    /// Update the OSR flag.
    pub fn set_compiling_osr(&mut self, v: bool) {
        self.compiling_osr = v;
    }

    // ---------------------------------------------------------------------
    // Block construction and CFG edits.

    fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Create a new, empty, unconnected block.
    pub fn create_block(&mut self) -> Block {
        self.bump_version();
        self.blocks.push(BlockData::default())
    }

    /// Designate `block` as the entry block.
    pub fn set_entry_block(&mut self, block: Block) {
        self.entry = block.into();
    }

    /// Designate `block` as the exit block.
    pub fn set_exit_block(&mut self, block: Block) {
        self.exit = block.into();
    }

    /// Add a CFG edge `pred -> succ` at the end of both orderings. Phis in
    /// `succ` must be extended by the caller if the block already has any.
    pub fn add_edge(&mut self, pred: Block, succ: Block) {
        self.bump_version();
        self.blocks[pred].succs.push(succ);
        self.blocks[succ].preds.push(pred);
    }

    /// Replace successor `old` of `block` with `new`, keeping its position
    /// so that branch polarity is preserved.
    pub fn replace_successor(&mut self, block: Block, old: Block, new: Block) {
        self.bump_version();
        let pos = self.blocks[block]
            .succs
            .iter()
            .position(|&s| s == old)
            .expect("not a successor");
        self.blocks[block].succs[pos] = new;
    }

    /// Replace predecessor `old` of `block` with `new`, keeping its
    /// position so that phi inputs keep their meaning.
    pub fn replace_predecessor(&mut self, block: Block, old: Block, new: Block) {
        self.bump_version();
        let pos = self.blocks[block]
            .preds
            .iter()
            .position(|&p| p == old)
            .expect("not a predecessor");
        self.blocks[block].preds[pos] = new;
    }

    /// Remove the CFG edge `pred -> succ`, dropping the corresponding phi
    /// input from every phi in `succ`.
    pub fn disconnect_edge(&mut self, pred: Block, succ: Block) {
        self.bump_version();
        let spos = self.blocks[pred]
            .succs
            .iter()
            .position(|&s| s == succ)
            .expect("not a successor");
        self.blocks[pred].succs.remove(spos);
        let ppos = self.blocks[succ]
            .preds
            .iter()
            .position(|&p| p == pred)
            .expect("not a predecessor");
        self.blocks[succ].preds.remove(ppos);
        for phi in self.blocks[succ].phis.clone() {
            self.remove_phi_input(phi, ppos);
        }
    }

    /// Split the edge `pred -> succ` by inserting a block containing a
    /// single `Goto`. Phi inputs in `succ` are unaffected because the new
    /// block takes over `pred`'s position. Returns the new block.
    pub fn split_edge(&mut self, pred: Block, succ: Block) -> Block {
        let middle = self.create_block();
        self.replace_successor(pred, succ, middle);
        self.replace_predecessor(succ, pred, middle);
        self.blocks[middle].preds.push(pred);
        self.blocks[middle].succs.push(succ);
        self.append(middle, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        middle
    }

    /// Split `pred -> succ` only if it is a critical edge (branching
    /// predecessor into a join). Returns the block now heading the edge.
    pub fn split_critical_edge(&mut self, pred: Block, succ: Block) -> Block {
        if self.succs(pred).len() > 1 && self.preds(succ).len() > 1 {
            self.split_edge(pred, succ)
        } else {
            pred
        }
    }

    /// Disconnect `block` from the CFG and delete its contents.
    ///
    /// Successor phis lose the corresponding input. Every instruction in
    /// the block is force-removed: operand uses are unlinked first so that
    /// cycles among the block's own instructions do not trip the no-users
    /// check, and any environment slots elsewhere pinning these
    /// instructions are cleared (the pinning frames are on dead paths).
    /// Instructions in other blocks must no longer use this block's
    /// instructions as data operands.
    pub fn disconnect_and_delete(&mut self, block: Block) {
        self.bump_version();
        for succ in self.blocks[block].succs.clone() {
            let ppos = self.blocks[succ]
                .preds
                .iter()
                .position(|&p| p == block)
                .expect("inconsistent CFG");
            self.blocks[succ].preds.remove(ppos);
            for phi in self.blocks[succ].phis.clone() {
                self.remove_phi_input(phi, ppos);
            }
        }
        for pred in self.blocks[block].preds.clone() {
            self.blocks[pred].succs.retain(|&s| s != block);
        }
        self.blocks[block].preds.clear();
        self.blocks[block].succs.clear();

        let doomed: Vec<Inst> = self.blocks[block]
            .phis
            .iter()
            .chain(self.blocks[block].insts.iter())
            .copied()
            .collect();
        // Unlink all operand edges first; the no-user assertion below then
        // only fires for genuine dangling uses from live code.
        for &inst in &doomed {
            self.unlink_arguments(inst);
            self.clear_env(inst);
        }
        for &inst in &doomed {
            debug_assert!(
                self.uses[inst].is_empty(),
                "{} in deleted {} still has users",
                inst,
                block
            );
            for env_use in core::mem::take(&mut self.env_uses[inst]) {
                self.environments[env_use.env].values[env_use.index as usize] = None.into();
            }
            self.inst_block[inst] = None.into();
        }
        self.blocks[block].phis.clear();
        self.blocks[block].insts.clear();
        self.blocks[block].dead = true;
    }

    /// Merge `block` with its single successor, which must have `block` as
    /// its single predecessor. The successor's phis are replaced by their
    /// unique input and its instructions are appended to `block`, which
    /// takes over the successor's out-edges.
    pub fn merge_with(&mut self, block: Block) {
        self.bump_version();
        let succ = self.single_succ(block).expect("merge needs a single successor");
        debug_assert_eq!(self.preds(succ), &[block], "successor must have a single pred");

        let terminator = self.terminator(block).expect("block has no terminator");
        debug_assert_eq!(self.opcode(terminator), Opcode::Goto);
        self.remove(terminator);

        for phi in self.blocks[succ].phis.clone() {
            let input = self.args(phi)[0];
            self.replace_all_uses_with(phi, input);
            self.remove(phi);
        }
        for inst in self.blocks[succ].insts.clone() {
            self.inst_block[inst] = block.into();
            self.blocks[block].insts.push(inst);
        }
        self.blocks[succ].insts.clear();

        let new_succs = core::mem::take(&mut self.blocks[succ].succs);
        for &s in &new_succs {
            self.replace_predecessor(s, succ, block);
        }
        self.blocks[block].succs = new_succs;
        self.blocks[succ].preds.clear();
        self.blocks[succ].dead = true;
    }

    /// Move every non-terminator instruction of `from` in front of the
    /// terminator of `to`, in order. Used when unrolling a unit-trip loop
    /// body into its pre-header.
    pub fn hoist_instructions_into(&mut self, from: Block, to: Block) {
        debug_assert!(self.blocks[from].phis.is_empty());
        let insts = self.blocks[from].insts.clone();
        for &inst in &insts {
            if !self.opcode(inst).is_control_flow() {
                let anchor = self.terminator(to).expect("target has no terminator");
                self.move_before(inst, anchor);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Instruction creation and editing.

    fn create_inst(&mut self, data: InstructionData, ty: Type) -> Inst {
        let inst = self.insts.push(data);
        self.inst_type[inst] = ty;
        self.link_arguments(inst);
        inst
    }

    fn link_arguments(&mut self, inst: Inst) {
        let args: smallvec::SmallVec<[Inst; 4]> =
            self.insts[inst].arguments().iter().copied().collect();
        for (index, &arg) in args.iter().enumerate() {
            self.uses[arg].push(Use {
                user: inst,
                index: index as u32,
            });
        }
    }

    fn unlink_arguments(&mut self, inst: Inst) {
        let args: smallvec::SmallVec<[Inst; 4]> =
            self.insts[inst].arguments().iter().copied().collect();
        for (index, &arg) in args.iter().enumerate() {
            let pos = self.uses[arg]
                .iter()
                .position(|u| u.user == inst && u.index == index as u32);
            if let Some(pos) = pos {
                self.uses[arg].remove(pos);
            }
        }
    }

    /// Create `data` and append it at the end of `block`. The caller is
    /// building the block and appends the terminator last.
    pub fn append(&mut self, block: Block, data: InstructionData, ty: Type) -> Inst {
        if data.opcode().is_control_flow() {
            self.bump_version();
        }
        let inst = self.create_inst(data, ty);
        self.inst_block[inst] = block.into();
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Create `data` as a detached instruction that is not yet in any
    /// block. Used by transformation passes that lay instructions out
    /// after building them.
    pub fn create_detached(&mut self, data: InstructionData, ty: Type) -> Inst {
        self.create_inst(data, ty)
    }

    /// Insert the detached instruction `inst` immediately before `anchor`.
    pub fn insert_inst_before(&mut self, inst: Inst, anchor: Inst) {
        debug_assert!(!self.is_in_block(inst), "instruction already placed");
        let block = self.block_of(anchor).expect("anchor not in a block");
        debug_assert!(!self.is_phi(anchor), "cannot insert before a phi");
        let pos = self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == anchor)
            .expect("anchor not in its block");
        self.blocks[block].insts.insert(pos, inst);
        self.inst_block[inst] = block.into();
    }

    /// Create `data` and insert it immediately before `anchor`.
    pub fn insert_before(&mut self, data: InstructionData, ty: Type, anchor: Inst) -> Inst {
        let inst = self.create_inst(data, ty);
        self.insert_inst_before(inst, anchor);
        inst
    }

    /// Create `data` and insert it in front of the terminator of `block`.
    pub fn insert_before_terminator(
        &mut self,
        block: Block,
        data: InstructionData,
        ty: Type,
    ) -> Inst {
        let anchor = self.terminator(block).expect("block has no terminator");
        self.insert_before(data, ty, anchor)
    }

    /// Append a phi to `block`. `inputs` must match the predecessor count
    /// and order.
    pub fn add_phi(&mut self, block: Block, inputs: &[Inst], ty: Type) -> Inst {
        debug_assert_eq!(inputs.len(), self.blocks[block].preds.len());
        let inst = self.create_inst(
            InstructionData::Phi {
                args: inputs.iter().copied().collect(),
                is_catch: false,
            },
            ty,
        );
        self.inst_block[inst] = block.into();
        self.blocks[block].phis.push(inst);
        inst
    }

    /// Append an input to a phi under construction (the corresponding
    /// predecessor edge must be added around the same time).
    pub fn phi_add_input(&mut self, phi: Inst, value: Inst) {
        let index = match &mut self.insts[phi] {
            InstructionData::Phi { args, .. } => {
                args.push(value);
                (args.len() - 1) as u32
            }
            _ => panic!("not a phi"),
        };
        self.uses[value].push(Use { user: phi, index });
    }

    /// Remove phi input `index`, shifting later inputs down. Exclusively
    /// for CFG edits that also remove predecessor `index`.
    fn remove_phi_input(&mut self, phi: Inst, index: usize) {
        self.unlink_arguments(phi);
        match &mut self.insts[phi] {
            InstructionData::Phi { args, .. } => {
                args.remove(index);
            }
            _ => panic!("not a phi"),
        }
        self.link_arguments(phi);
    }

    /// Rewrite operand `index` of `user` to `new`.
    pub fn replace_input(&mut self, user: Inst, index: usize, new: Inst) {
        let old = self.insts[user].arguments()[index];
        if old == new {
            return;
        }
        let pos = self.uses[old]
            .iter()
            .position(|u| u.user == user && u.index == index as u32)
            .expect("use lists inconsistent");
        self.uses[old].remove(pos);
        self.insts[user].arguments_mut()[index] = new;
        self.uses[new].push(Use {
            user,
            index: index as u32,
        });
    }

    /// Redirect every data use and every environment pin of `old` to
    /// `new`, leaving `old` without users. The types must agree.
    pub fn replace_all_uses_with(&mut self, old: Inst, new: Inst) {
        debug_assert_ne!(old, new);
        // Sub-word values share the 32-bit computation type, so a byte load
        // may legitimately be replaced by an Int32 zero.
        debug_assert_eq!(
            self.ty(old).promoted(),
            self.ty(new).promoted(),
            "type mismatch in replace"
        );
        for u in core::mem::take(&mut self.uses[old]) {
            self.insts[u.user].arguments_mut()[u.index as usize] = new;
            self.uses[new].push(u);
        }
        for eu in core::mem::take(&mut self.env_uses[old]) {
            self.environments[eu.env].values[eu.index as usize] = new.into();
            self.env_uses[new].push(eu);
        }
    }

    /// Remove `inst` from the graph. It must have no remaining data users;
    /// environment pins of it are cleared (the deoptimization value is
    /// lost, so callers only do this for values they proved dead or
    /// replaced).
    pub fn remove(&mut self, inst: Inst) {
        assert!(
            self.uses[inst].is_empty(),
            "removing {} which still has users",
            inst
        );
        self.remove_unchecked(inst)
    }

    /// Remove `inst` without the no-users check. For dismantling cycles
    /// (an induction phi and its update use each other) where the caller
    /// removes every member.
    pub fn remove_unchecked(&mut self, inst: Inst) {
        if self.opcode(inst).is_control_flow() {
            self.bump_version();
        }
        self.unlink_arguments(inst);
        self.clear_env(inst);
        for env_use in core::mem::take(&mut self.env_uses[inst]) {
            self.environments[env_use.env].values[env_use.index as usize] = None.into();
        }
        let block = self.inst_block[inst].expect("instruction already detached");
        let bd = &mut self.blocks[block];
        if let Some(pos) = bd.phis.iter().position(|&p| p == inst) {
            bd.phis.remove(pos);
        } else {
            let pos = bd
                .insts
                .iter()
                .position(|&i| i == inst)
                .expect("instruction not in its block");
            bd.insts.remove(pos);
        }
        self.inst_block[inst] = None.into();
    }

    /// Move `inst` from its current position to immediately before
    /// `anchor`, which must not be a phi. The caller is responsible for
    /// dominance safety.
    pub fn move_before(&mut self, inst: Inst, anchor: Inst) {
        debug_assert!(!self.is_phi(inst), "cannot move a phi");
        let from = self.block_of(inst).expect("moving a detached instruction");
        let pos = self.blocks[from]
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not in its block");
        self.blocks[from].insts.remove(pos);
        self.inst_block[inst] = None.into();
        self.insert_inst_before(inst, anchor);
    }

    // ---------------------------------------------------------------------
    // Environments.

    /// Attach a fresh environment with the given pinned values to `holder`.
    pub fn create_env(&mut self, holder: Inst, values: &[Option<Inst>]) -> Env {
        debug_assert!(self.inst_env[holder].is_none(), "holder already has an env");
        let env = self.environments.push(EnvironmentData {
            holder: holder.into(),
            values: values.iter().map(|&v| v.into()).collect(),
        });
        for (index, &value) in values.iter().enumerate() {
            if let Some(value) = value {
                self.env_uses[value].push(EnvUse {
                    env,
                    index: index as u32,
                });
            }
        }
        self.inst_env[holder] = env.into();
        env
    }

    /// Overwrite slot `index` of `env`, maintaining env-use lists.
    pub fn env_set_value(&mut self, env: Env, index: usize, value: Option<Inst>) {
        if let Some(old) = self.environments[env].values[index].expand() {
            let pos = self.env_uses[old]
                .iter()
                .position(|eu| eu.env == env && eu.index == index as u32)
                .expect("env-use lists inconsistent");
            self.env_uses[old].remove(pos);
        }
        self.environments[env].values[index] = value.into();
        if let Some(new) = value {
            self.env_uses[new].push(EnvUse {
                env,
                index: index as u32,
            });
        }
    }

    /// Detach and drop the environment of `inst`, if any.
    pub fn clear_env(&mut self, inst: Inst) {
        if let Some(env) = self.inst_env[inst].take() {
            let values: Vec<Option<Inst>> = self.environments[env]
                .values
                .iter()
                .map(|v| v.expand())
                .collect();
            for (index, value) in values.into_iter().enumerate() {
                if let Some(value) = value {
                    let pos = self.env_uses[value]
                        .iter()
                        .position(|eu| eu.env == env && eu.index == index as u32)
                        .expect("env-use lists inconsistent");
                    self.env_uses[value].remove(pos);
                }
            }
            self.environments[env].values.clear();
            self.environments[env].holder = None.into();
        }
    }

    /// Copy the environment of `src` onto `dst`, adjusting values that are
    /// phis of `loop_header` to the value flowing in from outside the loop
    /// (input 0, the pre-header input). Used when hoisting a deoptimizing
    /// instruction out of a loop.
    pub fn copy_env_with_loop_phi_adjustment(
        &mut self,
        src: Inst,
        dst: Inst,
        loop_header: Block,
    ) {
        let Some(env) = self.inst_env[src].expand() else {
            return;
        };
        let values: Vec<Option<Inst>> = self.environments[env]
            .values
            .iter()
            .map(|v| v.expand())
            .collect();
        let adjusted: Vec<Option<Inst>> = values
            .into_iter()
            .map(|v| {
                v.map(|value| {
                    if self.is_phi(value) && self.block_of(value) == Some(loop_header) {
                        self.args(value)[0]
                    } else {
                        value
                    }
                })
            })
            .collect();
        self.create_env(dst, &adjusted);
    }

    // ---------------------------------------------------------------------
    // Constants.

    fn make_constant(&mut self, key: ConstKey, data: InstructionData, ty: Type) -> Inst {
        if let Some(&c) = self.constants.get(&key) {
            return c;
        }
        let entry = self.entry_block();
        let inst = match self.terminator(entry) {
            Some(anchor) if self.opcode(anchor).is_control_flow() => {
                self.insert_before(data, ty, anchor)
            }
            _ => self.append(entry, data, ty),
        };
        self.constants.insert(key, inst);
        inst
    }

    /// The canonical 32-bit integer constant `value`.
    pub fn int_constant(&mut self, value: i32) -> Inst {
        self.make_constant(
            ConstKey::Int(value),
            InstructionData::Constant {
                opcode: Opcode::IntConstant,
                bits: value as i64,
            },
            Type::Int32,
        )
    }

    /// The canonical 64-bit integer constant `value`.
    pub fn long_constant(&mut self, value: i64) -> Inst {
        self.make_constant(
            ConstKey::Long(value),
            InstructionData::Constant {
                opcode: Opcode::LongConstant,
                bits: value,
            },
            Type::Int64,
        )
    }

    /// The canonical 32-bit float constant `value`.
    pub fn float_constant(&mut self, value: f32) -> Inst {
        self.make_constant(
            ConstKey::Float(value.to_bits()),
            InstructionData::Constant {
                opcode: Opcode::FloatConstant,
                bits: value.to_bits() as i64,
            },
            Type::Float32,
        )
    }

    /// The canonical 64-bit float constant `value`.
    pub fn double_constant(&mut self, value: f64) -> Inst {
        self.make_constant(
            ConstKey::Double(value.to_bits()),
            InstructionData::Constant {
                opcode: Opcode::DoubleConstant,
                bits: value.to_bits() as i64,
            },
            Type::Float64,
        )
    }

    /// The canonical null reference constant.
    pub fn null_constant(&mut self) -> Inst {
        self.make_constant(
            ConstKey::Null,
            InstructionData::Constant {
                opcode: Opcode::NullConstant,
                bits: 0,
            },
            Type::Reference,
        )
    }

    /// The canonical zero value of `ty`, used when a load is known to
    /// observe a freshly initialized location.
    pub fn zero_constant(&mut self, ty: Type) -> Inst {
        match ty {
            Type::Reference => self.null_constant(),
            Type::Int64 => self.long_constant(0),
            Type::Float32 => self.float_constant(0.0),
            Type::Float64 => self.double_constant(0.0),
            _ => self.int_constant(0),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<Inst> for Graph {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for block in self.blocks() {
            writeln!(
                f,
                "{}: preds={:?} succs={:?}",
                block,
                self.preds(block),
                self.succs(block)
            )?;
            for &phi in self.phis(block) {
                writeln!(
                    f,
                    "    {} = Phi {:?} : {}",
                    phi,
                    self.args(phi),
                    self.ty(phi)
                )?;
            }
            for &inst in self.insts(block) {
                write!(f, "    {} = {}", inst, self.opcode(inst))?;
                if !self.args(inst).is_empty() {
                    write!(f, " {:?}", self.args(inst))?;
                }
                writeln!(f, " : {}", self.ty(inst))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::testgraph;

    #[test]
    fn constants_are_canonical() {
        let mut g = testgraph::straight_line();
        let a = g.int_constant(7);
        let b = g.int_constant(7);
        let c = g.int_constant(8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(g.block_of(a), Some(g.entry_block()));
        assert_eq!(g.as_int_constant(a), Some(7));
    }

    #[test]
    fn use_lists_track_edits() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let one = g.int_constant(1);
        let two = g.int_constant(2);
        let add = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Add,
                args: [one, two],
            },
            Type::Int32,
        );
        assert_eq!(g.uses(one), &[Use { user: add, index: 0 }]);
        assert_eq!(g.uses(two), &[Use { user: add, index: 1 }]);

        let three = g.int_constant(3);
        g.replace_input(add, 1, three);
        assert!(g.uses(two).is_empty());
        assert_eq!(g.uses(three), &[Use { user: add, index: 1 }]);

        let mul = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Mul,
                args: [add, add],
            },
            Type::Int32,
        );
        assert_eq!(g.uses(add).len(), 2);

        let other = g.insert_before_terminator(
            body,
            InstructionData::Binary {
                opcode: Opcode::Sub,
                args: [one, three],
            },
            Type::Int32,
        );
        g.replace_all_uses_with(add, other);
        assert!(g.uses(add).is_empty());
        assert_eq!(g.uses(other).len(), 2);
        assert_eq!(g.args(mul), &[other, other]);

        g.remove(add);
        assert!(!g.is_in_block(add));
        assert!(g.uses(one).iter().all(|u| u.user != add));
    }

    #[test]
    fn environments_are_a_separate_edge_class() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let c = g.int_constant(5);
        let check = g.insert_before_terminator(
            body,
            InstructionData::Nullary {
                opcode: Opcode::SuspendCheck,
            },
            Type::Void,
        );
        let env = g.create_env(check, &[Some(c), None]);
        assert!(g.uses(c).is_empty());
        assert_eq!(g.env_uses(c).len(), 1);
        assert_eq!(g.env_holder(env), check);

        g.env_set_value(env, 0, None);
        assert!(g.env_uses(c).is_empty());

        g.env_set_value(env, 1, Some(c));
        g.clear_env(check);
        assert!(g.env_uses(c).is_empty());
        assert_eq!(g.env_of(check), None);
    }

    #[test]
    fn split_critical_edge_keeps_phi_meaning() {
        // entry -> a, a branches to join and b; b falls through to join.
        let mut g = Graph::new();
        let entry = g.create_block();
        let a = g.create_block();
        let b = g.create_block();
        let join = g.create_block();
        let exit = g.create_block();
        g.set_entry_block(entry);
        g.set_exit_block(exit);
        g.add_edge(entry, a);
        g.add_edge(a, join);
        g.add_edge(a, b);
        g.add_edge(b, join);
        g.add_edge(join, exit);

        let c0 = g.int_constant(0);
        let c1 = g.int_constant(1);
        let cond = g.append(
            a,
            InstructionData::Binary {
                opcode: Opcode::Equal,
                args: [c0, c1],
            },
            Type::Bool,
        );
        g.append(entry, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(a, InstructionData::Unary { opcode: Opcode::If, args: [cond] }, Type::Void);
        g.append(b, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(join, InstructionData::Nullary { opcode: Opcode::Goto }, Type::Void);
        g.append(exit, InstructionData::Nullary { opcode: Opcode::Exit }, Type::Void);

        let phi = g.add_phi(join, &[c0, c1], Type::Int32);

        // a -> join is critical: a has two successors, join two preds.
        let middle = g.split_critical_edge(a, join);
        assert_ne!(middle, a);
        assert_eq!(g.preds(join), &[middle, b]);
        assert_eq!(g.succs(a), &[middle, b]);
        assert_eq!(g.args(phi), &[c0, c1]);
        assert_eq!(g.opcode(g.terminator(middle).unwrap()), Opcode::Goto);

        // b -> join is not critical.
        assert_eq!(g.split_critical_edge(b, join), b);
    }

    #[test]
    fn disconnect_edge_drops_phi_inputs() {
        let mut g = Graph::new();
        let entry = g.create_block();
        let a = g.create_block();
        let b = g.create_block();
        let join = g.create_block();
        g.set_entry_block(entry);
        g.add_edge(entry, a);
        g.add_edge(entry, b);
        g.add_edge(a, join);
        g.add_edge(b, join);
        let c0 = g.int_constant(0);
        let c1 = g.int_constant(1);
        let phi = g.add_phi(join, &[c0, c1], Type::Int32);

        g.disconnect_edge(a, join);
        assert_eq!(g.preds(join), &[b]);
        assert_eq!(g.args(phi), &[c1]);
        assert!(g.uses(c0).is_empty());
    }

    #[test]
    fn merge_with_absorbs_single_successor() {
        let mut g = testgraph::straight_line();
        let body = g.succs(g.entry_block())[0];
        let old_succ = g.succs(body)[0];
        // Interpose a block: body -> tail -> old successor of body.
        let tail = g.split_edge(body, old_succ);

        let c = g.int_constant(3);
        let neg = g.insert_before_terminator(
            tail,
            InstructionData::Unary {
                opcode: Opcode::Neg,
                args: [c],
            },
            Type::Int32,
        );

        g.merge_with(body);
        assert!(!g.is_block_live(tail));
        assert_eq!(g.block_of(neg), Some(body));
        assert_eq!(g.preds(old_succ), &[body]);
        assert_eq!(g.opcode(g.terminator(body).unwrap()), Opcode::Goto);
    }
}
