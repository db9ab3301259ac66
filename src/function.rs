//! Function container (C10): the orchestrator that owns one function's
//! block graph, operation store, value-cell store, heritage engine,
//! high-variable layer, union resolution map, jump-table recovery state, and
//! symbol table, and exposes the canonical editing API (§4.10) every
//! mutation — rule-driven or direct — goes through.

use std::collections::HashSet;
use std::rc::Rc;

use crate::address::{Address, SeqNum};
use crate::arch::Architecture;
use crate::block::{BlockFlags, BlockGraph, BlockId};
use crate::datatype::{
    pick_union_field, propagate_fixed_point, DefaultTypingRule, ResolvedUnionMap, TypingRule, UnionEdgeKey, UnionResolution,
};
use crate::error::{AnalysisError, Result, Warning};
use crate::external::{Loader, TypeDatabase, TypeId as DataTypeId};
use crate::heritage::{HeritageEngine, HeritageReport};
use crate::highvar::{HighVarId, HighVariableLayer};
use crate::jumptable::{JumpTable, JumpTableRecovery, RecoveryErrorCode};
use crate::opcode::OpCode;
use crate::operation::{OpId, OperationStore};
use crate::rewrite::{ActionGroup, Editor, RewriteDriver};
use crate::symbol::SymbolTable;
use crate::valuecell::{CellFlags, Storage, ValueCellStore, ValueId};

/// One decompiled function's complete, mutable intermediate representation.
///
/// Holds every per-function store named by §3 plus the process-wide
/// [`Architecture`] handle; everything else in this crate is either a
/// passive data structure this type owns or a stateless driver it invokes.
pub struct Function {
    pub arch: Rc<Architecture>,
    pub blocks: BlockGraph,
    pub ops: OperationStore,
    pub cells: ValueCellStore,
    pub heritage: HeritageEngine,
    pub high_vars: HighVariableLayer,
    pub unions: ResolvedUnionMap,
    pub jump_tables: JumpTableRecovery,
    pub symbols: SymbolTable,
    pub warnings: Vec<Warning>,
    /// Cells currently flagged `TYPELOCK`, tracked outside the store so
    /// `propagate_types` can seed without an arena-wide scan.
    locked_types: HashSet<ValueId>,
    /// Next free offset in the architecture's unique-temp space, for
    /// `new_unique_out`.
    next_unique_offset: u64,
}

impl Function {
    pub fn new(arch: Rc<Architecture>) -> Self {
        Self {
            arch,
            blocks: BlockGraph::new(),
            ops: OperationStore::new(),
            cells: ValueCellStore::new(),
            heritage: HeritageEngine::new(),
            high_vars: HighVariableLayer::new(),
            unions: ResolvedUnionMap::new(),
            jump_tables: JumpTableRecovery::new(),
            symbols: SymbolTable::new(),
            warnings: Vec::new(),
            locked_types: HashSet::new(),
            next_unique_offset: 0,
        }
    }

    pub fn warn_at(&mut self, text: impl Into<String>, address: Address) {
        self.warnings.push(Warning::AtAddress { text: text.into(), address });
    }

    pub fn warn_header(&mut self, text: impl Into<String>) {
        self.warnings.push(Warning::Header { text: text.into() });
    }

    // ---- constant-clone policy (§4.10) --------------------------------

    /// Records a use of `value` at `(user, slot)`, cloning it first if it is
    /// a non-spacebase constant already carrying a use: a constant cell with
    /// more than one use is cloned on second use so each use site keeps its
    /// own cell.
    fn record_use(&mut self, value: ValueId, user: SeqNum, slot: u32) -> ValueId {
        let Some(cell) = self.cells.get(value) else { return value };
        if cell.is_constant() && !cell.flags.contains(CellFlags::SPACEBASE) && !cell.uses().is_empty() {
            let storage = cell.storage;
            let flags = cell.flags;
            let clone = self.cells.create(storage, flags);
            self.cells.add_use(clone, user, slot);
            return clone;
        }
        self.cells.add_use(value, user, slot);
        value
    }

    // ---- creation (§4.10) ---------------------------------------------

    /// Creates a new operation and wires its inputs/output. Per C4, creation
    /// always yields a dead op: the caller must insert it into a block with
    /// one of the `op_insert_*` methods before it becomes alive.
    pub fn new_op(&mut self, opcode: OpCode, address: Address, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
        let id = self.ops.create(opcode, address, Vec::new(), output);
        let seq = self.ops.get(id).expect("just created").seq;
        let mut wired = Vec::with_capacity(inputs.len());
        for (slot, v) in inputs.into_iter().enumerate() {
            wired.push(self.record_use(v, seq, slot as u32));
        }
        self.ops.get_mut(id).unwrap().inputs = wired;
        if let Some(out) = output {
            self.cells.set_definition(out, seq, opcode);
        }
        id
    }

    /// Creates a storage-backed value cell with no definition (an input or
    /// a free cell, depending on `flags`).
    pub fn new_varnode(&mut self, address: Address, size: u32) -> ValueId {
        self.cells.create(Storage::new(address, size), CellFlags::empty())
    }

    pub fn new_constant(&mut self, value: u64, size: u32) -> ValueId {
        let address = Address::new(self.arch.constant_space, value);
        self.cells.create(Storage::new(address, size), CellFlags::CONSTANT)
    }

    /// A constant cell carrying a code address, used for branch-target
    /// literals before the block graph resolves them into real edges.
    pub fn new_code_ref(&mut self, target: Address) -> ValueId {
        let word_size = self.arch.space(self.arch.default_code_space).map(|s| s.word_size).unwrap_or(4);
        let address = Address::new(self.arch.constant_space, target.offset);
        self.cells.create(Storage::new(address, word_size), CellFlags::CONSTANT)
    }

    /// A fresh cell in the architecture's unique-temp space: never aliases
    /// any other storage, so heritage treats it as trivially single-def.
    pub fn new_unique_out(&mut self, size: u32) -> ValueId {
        let offset = self.next_unique_offset;
        self.next_unique_offset += u64::from(size).max(1);
        let address = Address::new(self.arch.default_unique_space, offset);
        self.cells.create(Storage::new(address, size), CellFlags::empty())
    }

    // ---- op-level edits (§4.10) ----------------------------------------

    /// Rejected (per policy) when `opcode` is `BRANCH` and the op's block
    /// still has more than one out-edge: collapsing to an unconditional
    /// branch while other out-edges remain would silently orphan them, so
    /// the caller must remove the non-primary edges in the same step.
    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) -> Result<()> {
        if opcode == OpCode::Branch {
            if let Some(block) = self.ops.get(op).and_then(|o| o.parent) {
                let fan_out = self.blocks.get(block).map(|b| b.succs.len()).unwrap_or(0);
                if fan_out > 1 {
                    return Err(AnalysisError::invariant(
                        "opSetOpcode(BRANCH) on a block with fan-out > 1 requires removing the non-primary out-edges first",
                    ));
                }
            }
        }
        if let Some(o) = self.ops.get_mut(op) {
            o.opcode = opcode;
        }
        Ok(())
    }

    pub fn op_set_input(&mut self, op: OpId, slot: usize, value: ValueId) {
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        if let Some(old) = self.ops.get(op).and_then(|o| o.inputs.get(slot).copied()) {
            self.cells.remove_use(old, seq, slot as u32);
        }
        let wired = self.record_use(value, seq, slot as u32);
        if let Some(o) = self.ops.get_mut(op) {
            if slot < o.inputs.len() {
                o.inputs[slot] = wired;
            }
        }
    }

    pub fn op_set_output(&mut self, op: OpId, value: Option<ValueId>) {
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        let opcode = self.ops.get(op).map(|o| o.opcode);
        if let Some(old) = self.ops.get(op).and_then(|o| o.output) {
            self.cells.clear_definition(old);
        }
        if let (Some(v), Some(opcode)) = (value, opcode) {
            self.cells.set_definition(v, seq, opcode);
        }
        if let Some(o) = self.ops.get_mut(op) {
            o.output = value;
        }
    }

    /// Swaps two input slots, fixing up the moved values' use records so
    /// they still point at the slot they actually occupy (used to
    /// canonicalize commutative ops).
    pub fn op_swap_input(&mut self, op: OpId, slot_a: usize, slot_b: usize) {
        if slot_a == slot_b {
            return;
        }
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        let Some(o) = self.ops.get_mut(op) else { return };
        if slot_a >= o.inputs.len() || slot_b >= o.inputs.len() {
            return;
        }
        o.inputs.swap(slot_a, slot_b);
        let (va, vb) = (o.inputs[slot_a], o.inputs[slot_b]);
        self.cells.remove_use(va, seq, slot_b as u32);
        self.cells.add_use(va, seq, slot_a as u32);
        self.cells.remove_use(vb, seq, slot_a as u32);
        self.cells.add_use(vb, seq, slot_b as u32);
    }

    pub fn op_insert_input(&mut self, op: OpId, slot: usize, value: ValueId) {
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        let input_count = self.ops.get(op).map(|o| o.inputs.len()).unwrap_or(0);
        for s in (slot..input_count).rev() {
            if let Some(v) = self.ops.get(op).and_then(|o| o.inputs.get(s).copied()) {
                self.cells.remove_use(v, seq, s as u32);
                self.cells.add_use(v, seq, (s + 1) as u32);
            }
        }
        let wired = self.record_use(value, seq, slot as u32);
        if let Some(o) = self.ops.get_mut(op) {
            let slot = slot.min(o.inputs.len());
            o.inputs.insert(slot, wired);
        }
    }

    pub fn op_remove_input(&mut self, op: OpId, slot: usize) {
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        let input_count = self.ops.get(op).map(|o| o.inputs.len()).unwrap_or(0);
        if slot >= input_count {
            return;
        }
        if let Some(removed) = self.ops.get(op).and_then(|o| o.inputs.get(slot).copied()) {
            self.cells.remove_use(removed, seq, slot as u32);
        }
        for s in (slot + 1)..input_count {
            if let Some(v) = self.ops.get(op).and_then(|o| o.inputs.get(s).copied()) {
                self.cells.remove_use(v, seq, s as u32);
                self.cells.add_use(v, seq, (s - 1) as u32);
            }
        }
        if let Some(o) = self.ops.get_mut(op) {
            o.inputs.remove(slot);
        }
    }

    /// Drops the use-link for an input slot without resizing `inputs` (the
    /// slot's value is left in place, unlinked); `op_set_input` and
    /// `op_remove_input` are the usual callers.
    pub fn op_unset_input(&mut self, op: OpId, slot: usize) {
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        if let Some(v) = self.ops.get(op).and_then(|o| o.inputs.get(slot).copied()) {
            self.cells.remove_use(v, seq, slot as u32);
        }
    }

    pub fn op_unset_output(&mut self, op: OpId) {
        if let Some(old) = self.ops.get(op).and_then(|o| o.output) {
            self.cells.clear_definition(old);
        }
    }

    // ---- block-position edits (§4.10) ----------------------------------

    fn link_op_at(&mut self, op: OpId, block: BlockId, index: usize) {
        self.ops.mark_alive(op, block);
        if let Some(b) = self.blocks.get_mut(block) {
            let index = index.min(b.ops.len());
            b.ops.insert(index, op);
        }
    }

    /// Inserts `op` immediately before `before`. Skips backward over any
    /// indirect-effect ops sharing `before`'s address: an `INDIRECT` op must
    /// stay immediately before the op whose side effect it models, so a new
    /// op goes in front of that run rather than splitting it.
    pub fn op_insert_before(&mut self, op: OpId, before: OpId) {
        let Some(block) = self.ops.get(before).and_then(|o| o.parent) else { return };
        let before_address = self.ops.get(before).map(|o| o.seq.address);
        let Some(before_address) = before_address else { return };
        let mut index = self.blocks.get(block).and_then(|b| b.ops.iter().position(|&id| id == before)).unwrap_or(0);
        while index > 0 {
            let prev = self.blocks.get(block).unwrap().ops[index - 1];
            let is_adjacent_indirect = self
                .ops
                .get(prev)
                .map(|o| o.opcode.is_indirect_effect() && o.seq.address == before_address)
                .unwrap_or(false);
            if is_adjacent_indirect {
                index -= 1;
            } else {
                break;
            }
        }
        self.link_op_at(op, block, index);
    }

    pub fn op_insert_after(&mut self, op: OpId, after: OpId) {
        let Some(block) = self.ops.get(after).and_then(|o| o.parent) else { return };
        let index = self.blocks.get(block).and_then(|b| b.ops.iter().position(|&id| id == after)).map(|i| i + 1).unwrap_or(0);
        self.link_op_at(op, block, index);
    }

    /// Inserts `op` at the start of `block`, skipping any leading phi ops:
    /// phis must stay the first ops of a block.
    pub fn op_insert_begin(&mut self, op: OpId, block: BlockId) {
        let index = self
            .blocks
            .get(block)
            .map(|b| b.ops.iter().position(|&id| self.ops.get(id).map(|o| !o.opcode.is_phi()).unwrap_or(true)).unwrap_or(b.ops.len()))
            .unwrap_or(0);
        self.link_op_at(op, block, index);
    }

    /// Inserts `op` at the end of `block`, staying before a trailing
    /// block-terminal op (branch/call/return) if one is present: a
    /// terminal op must remain the block's last op.
    pub fn op_insert_end(&mut self, op: OpId, block: BlockId) {
        let index = self
            .blocks
            .get(block)
            .map(|b| match b.ops.last() {
                Some(&last) if self.ops.get(last).map(|o| o.opcode.is_block_terminal()).unwrap_or(false) => b.ops.len() - 1,
                _ => b.ops.len(),
            })
            .unwrap_or(0);
        self.link_op_at(op, block, index);
    }

    /// Removes `op` from its block's op list and returns it to the dead
    /// list, leaving its input/output use links untouched.
    pub fn op_uninsert(&mut self, op: OpId) {
        if let Some(block) = self.ops.get(op).and_then(|o| o.parent) {
            if let Some(b) = self.blocks.get_mut(block) {
                b.ops.retain(|&id| id != op);
            }
        }
        self.ops.mark_dead(op);
    }

    /// Like `op_uninsert`, but also drops every input use-link and clears
    /// the output's definition, fully disconnecting the op from the IR
    /// while keeping it alive in the dead list (so it can still be
    /// re-linked, e.g. by `total_replace`-style rewrites).
    pub fn op_unlink(&mut self, op: OpId) {
        self.op_uninsert(op);
        let Some(seq) = self.ops.get(op).map(|o| o.seq) else { return };
        let inputs = self.ops.get(op).map(|o| o.inputs.clone()).unwrap_or_default();
        for (slot, v) in inputs.into_iter().enumerate() {
            self.cells.remove_use(v, seq, slot as u32);
        }
        if let Some(out) = self.ops.get(op).and_then(|o| o.output) {
            self.cells.clear_definition(out);
        }
    }

    pub fn op_destroy(&mut self, op: OpId) {
        self.op_unlink(op);
        self.ops.destroy(op);
    }

    /// Destroys `op` and, if its output cell is left with no uses, destroys
    /// that cell too: used to tear down ops created in error (e.g. a
    /// speculative clone) without leaving an orphaned free cell behind.
    pub fn op_destroy_raw(&mut self, op: OpId) {
        let output = self.ops.get(op).and_then(|o| o.output);
        self.op_unlink(op);
        self.ops.destroy(op);
        if let Some(out) = output {
            if self.cells.get(out).map(|c| c.uses().is_empty()).unwrap_or(false) {
                self.cells.destroy(out);
            }
        }
    }

    // ---- whole-cell replacement (§4.10) --------------------------------

    /// Rewrites every use of `old` to `new`, leaving `old`'s own definition
    /// untouched (the caller is responsible for destroying it once unused).
    pub fn total_replace(&mut self, old: ValueId, new: ValueId) {
        let uses: Vec<(SeqNum, u32)> = self.cells.get(old).map(|c| c.uses().to_vec()).unwrap_or_default();
        for (seq, slot) in uses {
            if let Some(op_id) = self.ops.op_at_seq(seq) {
                if let Some(o) = self.ops.get_mut(op_id) {
                    if let Some(slot_value) = o.inputs.get_mut(slot as usize) {
                        *slot_value = new;
                    }
                }
            }
            self.cells.remove_use(old, seq, slot);
            self.cells.add_use(new, seq, slot);
        }
    }

    /// Rewrites every use of `old` to a freshly minted constant cell of
    /// `new_value`/`size` — a distinct cell per use, honoring the same
    /// single-use-per-constant policy `new_op` enforces.
    pub fn total_replace_constant(&mut self, old: ValueId, new_value: u64, size: u32) {
        let uses: Vec<(SeqNum, u32)> = self.cells.get(old).map(|c| c.uses().to_vec()).unwrap_or_default();
        for (seq, slot) in uses {
            let constant = self.new_constant(new_value, size);
            if let Some(op_id) = self.ops.op_at_seq(seq) {
                if let Some(o) = self.ops.get_mut(op_id) {
                    if let Some(slot_value) = o.inputs.get_mut(slot as usize) {
                        *slot_value = constant;
                    }
                }
            }
            self.cells.remove_use(old, seq, slot);
            self.cells.add_use(constant, seq, slot);
        }
    }

    // ---- block-level edits (§4.5) --------------------------------------

    /// Detaches every out-edge of `block`, fixing up phi ops in each
    /// successor so they drop the input slot that corresponded to the
    /// removed edge. If the dropped input was itself defined by a phi in
    /// `block`, that phi's own inputs are spliced into the successor's phi
    /// in its place, preserving data flow across the removal. Callers still
    /// need to detach `block`'s in-edges and call `blocks.remove_block`
    /// themselves once it is fully isolated.
    pub fn remove_from_flow(&mut self, block: BlockId) {
        let succs: Vec<BlockId> = self.blocks.get(block).map(|b| b.succs.clone()).unwrap_or_default();
        for succ in succs {
            let Some(slot) = self.blocks.get(succ).and_then(|s| s.preds.iter().position(|&p| p == block)) else {
                continue;
            };
            let phi_ops: Vec<OpId> = self
                .blocks
                .get(succ)
                .map(|b| b.ops.iter().copied().filter(|&id| self.ops.get(id).map(|o| o.opcode.is_phi()).unwrap_or(false)).collect())
                .unwrap_or_default();
            for phi in phi_ops {
                let dropped = self.ops.get(phi).and_then(|o| o.inputs.get(slot).copied());
                let replacement = dropped.and_then(|v| self.phi_inputs_if_defined_in(v, block));
                self.op_remove_input(phi, slot);
                if let Some(extra) = replacement {
                    for (i, v) in extra.into_iter().enumerate() {
                        self.op_insert_input(phi, slot + i, v);
                    }
                }
            }
            self.blocks.remove_edge(block, succ);
        }
    }

    /// If `value` is defined by a phi op that lives in `block`, returns that
    /// phi's own input list.
    fn phi_inputs_if_defined_in(&self, value: ValueId, block: BlockId) -> Option<Vec<ValueId>> {
        let def_seq = self.cells.get(value)?.definition?;
        let def_op_id = self.ops.op_at_seq(def_seq)?;
        let def_op = self.ops.get(def_op_id)?;
        (def_op.opcode.is_phi() && def_op.parent == Some(block)).then(|| def_op.inputs.clone())
    }

    /// Duplicates `block` (its full non-phi op sequence) into a fresh
    /// clone, moves the single in-edge `pred -> block` onto the clone, and
    /// gives the clone the same out-edges as `block`. Each phi in `block`
    /// contributes a `COPY` of the input slot that corresponded to `pred`
    /// at the head of the clone, and loses that slot in the original.
    /// Returns the new block.
    pub fn node_split(&mut self, block: BlockId, pred: BlockId) -> BlockId {
        let clone_id = self.blocks.new_block_basic();
        let original_ops: Vec<OpId> = self.blocks.get(block).map(|b| b.ops.clone()).unwrap_or_default();

        let slot = self.blocks.get(block).and_then(|b| b.preds.iter().position(|&p| p == pred)).unwrap_or(0);

        let mut copy_ops = Vec::new();
        for &phi in &original_ops {
            let Some(op) = self.ops.get(phi) else { continue };
            if !op.opcode.is_phi() {
                continue;
            }
            let Some(phi_input) = op.inputs.get(slot).copied() else { continue };
            let address = op.seq.address;
            let Some(output_storage) = op.output.and_then(|o| self.cells.get(o)).map(|c| c.storage) else { continue };
            let copy_out = self.cells.create(output_storage, CellFlags::empty());
            let copy_op = self.new_op(OpCode::Copy, address, vec![phi_input], Some(copy_out));
            copy_ops.push(copy_op);
            self.op_remove_input(phi, slot);
        }

        let mut body_ops = Vec::new();
        for &op_id in &original_ops {
            let Some(op) = self.ops.get(op_id) else { continue };
            if op.opcode.is_phi() {
                continue;
            }
            let cloned_output = op.output.and_then(|v| self.cells.get(v)).map(|c| (c.storage, c.flags));
            let cloned_output = cloned_output.map(|(storage, flags)| self.cells.create(storage, flags));
            let inputs = op.inputs.clone();
            let opcode = op.opcode;
            let address = op.seq.address;
            let new_op = self.new_op(opcode, address, inputs, cloned_output);
            body_ops.push(new_op);
        }

        for op in copy_ops.into_iter().chain(body_ops) {
            self.ops.mark_alive(op, clone_id);
            if let Some(b) = self.blocks.get_mut(clone_id) {
                b.ops.push(op);
            }
        }
        if let Some(b) = self.blocks.get_mut(clone_id) {
            b.flags.insert(BlockFlags::DUPLICATE);
        }

        self.blocks.switch_edge(pred, block, clone_id);
        let succs: Vec<BlockId> = self.blocks.get(block).map(|b| b.succs.clone()).unwrap_or_default();
        for succ in succs {
            self.blocks.add_edge(clone_id, succ);
        }
        clone_id
    }

    // ---- pipeline drivers ------------------------------------------------

    pub fn run_heritage(&mut self) -> HeritageReport {
        self.heritage.heritage(&self.arch, &mut self.blocks, &mut self.ops, &mut self.cells)
    }

    pub fn run_rewrite_group(&mut self, group: &ActionGroup) -> Result<u32> {
        RewriteDriver::run_group(group, self)
    }

    pub fn recover_jump_table(&mut self, loader: &dyn Loader, branch: OpId) -> std::result::Result<&JumpTable, RecoveryErrorCode> {
        self.jump_tables.recover(&self.arch, &mut self.blocks, &mut self.ops, &mut self.cells, loader, branch)
    }

    /// Captures the high-level threshold (§4.8): every cell created from
    /// this point on needs a high-variable of its own unless later merged.
    pub fn set_high_level(&mut self) {
        let index = self.cells.next_creation_index();
        self.high_vars.set_high_level(index);
    }

    /// Ensures every past-high-level, non-annotation cell has a
    /// high-variable, creating singleton ones for cells that don't have one
    /// yet.
    pub fn ensure_high_variables(&mut self, space: crate::address::SpaceId) {
        let candidates: Vec<ValueId> = self.cells.iter_space(space).collect();
        for id in candidates {
            let Some(cell) = self.cells.get(id) else { continue };
            if cell.high_var.is_some() || cell.flags.contains(CellFlags::ANNOTATION) {
                continue;
            }
            if !self.high_vars.is_past_high_level(cell.creation_seq) {
                continue;
            }
            let hv = self.high_vars.create_for(id);
            if let Some(c) = self.cells.get_mut(id) {
                c.high_var = Some(hv);
            }
        }
    }

    /// Attempts to merge the high-variables of `a` and `b`, consulting the
    /// cover-intersection cache first. Returns whether the merge happened
    /// (it is refused when their covers genuinely intersect).
    pub fn try_merge_high(&mut self, a: HighVarId, b: HighVarId) -> bool {
        if a == b {
            return true;
        }
        let Some(cover_a) = self.high_vars.get(a).map(|h| h.cover.clone()) else { return false };
        let Some(cover_b) = self.high_vars.get(b).map(|h| h.cover.clone()) else { return false };
        let members_a = self.high_vars.get(a).map(|h| h.members.clone()).unwrap_or_default();
        let members_b = self.high_vars.get(b).map(|h| h.members.clone()).unwrap_or_default();
        let coarse = cover_a.coarse_touch(&cover_b);
        let shadowed = is_copy_shadowed(&self.ops, &self.cells, &members_a, &members_b);
        let intersects = self.high_vars.cache.intersects(a, b, || coarse, || shadowed);
        if !intersects {
            self.high_vars.merge(a, b);
        }
        !intersects
    }

    /// Runs data-type propagation (§4.9) from every `TYPELOCK`ed cell,
    /// across one edge per `(input, output)` pair of every alive op, to a
    /// fixed point (bounded by `cap` passes). Writes resolved types back
    /// onto value cells.
    pub fn propagate_types(&mut self, db: &dyn TypeDatabase, rule: &dyn TypingRule, cap: u32) -> u32 {
        let mut seed = std::collections::HashMap::new();
        for &id in &self.locked_types {
            if let Some(ty) = self.cells.get(id).and_then(|c| c.data_type) {
                seed.insert(id, ty);
            }
        }
        let edges = self.typing_edges();
        let mut changes = Vec::new();
        let passes = propagate_fixed_point(seed, &edges, rule, db, cap, |cell, ty| changes.push((cell, ty)));
        for (cell, ty) in changes {
            if let Some(c) = self.cells.get_mut(cell) {
                c.data_type = Some(ty);
            }
        }
        passes
    }

    /// Uses the default typing rule. Most callers that don't layer in an
    /// architecture-specific rule set want this.
    pub fn propagate_types_default(&mut self, db: &dyn TypeDatabase, cap: u32) -> u32 {
        self.propagate_types(db, &DefaultTypingRule, cap)
    }

    pub fn lock_type(&mut self, cell: ValueId, ty: DataTypeId) {
        if let Some(c) = self.cells.get_mut(cell) {
            c.data_type = Some(ty);
            c.flags.insert(CellFlags::TYPELOCK);
        }
        self.locked_types.insert(cell);
    }

    fn typing_edges(&self) -> Vec<(ValueId, ValueId, OpCode, u32, u32)> {
        let mut edges = Vec::new();
        for &op_id in self.ops.alive_ops() {
            let Some(op) = self.ops.get(op_id) else { continue };
            let Some(out) = op.output else { continue };
            for (slot, &input) in op.inputs.iter().enumerate() {
                edges.push((input, out, op.opcode, slot as u32, 0));
            }
        }
        edges
    }

    /// Resolves which field of `union_type` the edge `(op, slot)` reads,
    /// given the byte offset/size it carries, and records the resolution.
    pub fn resolve_union_edge(&mut self, db: &dyn TypeDatabase, union_type: DataTypeId, op: SeqNum, slot: u32, byte_offset: u64, value_size: u32) -> UnionResolution {
        let field = pick_union_field(db, union_type, byte_offset, value_size);
        self.unions.resolve(UnionEdgeKey { union_type, op, slot }, field)
    }
}

/// Two cells related by a `COPY`/`CAST` at a shared point do not count as a
/// real cover intersection: the copy already makes their values identical
/// at that point, so treating it as aliasing would be spurious.
fn is_copy_shadowed(ops: &OperationStore, cells: &ValueCellStore, members_a: &[ValueId], members_b: &[ValueId]) -> bool {
    let touches = |defining: &[ValueId], other: &[ValueId]| -> bool {
        defining.iter().any(|&v| {
            let Some(cell) = cells.get(v) else { return false };
            let Some(seq) = cell.definition else { return false };
            let Some(op_id) = ops.op_at_seq(seq) else { return false };
            let Some(op) = ops.get(op_id) else { return false };
            op.opcode.is_copy_like() && op.inputs.iter().any(|i| other.contains(i))
        })
    };
    touches(members_a, members_b) || touches(members_b, members_a)
}

impl Editor for Function {
    fn opcode(&self, op: OpId) -> Option<OpCode> {
        self.ops.get(op).map(|o| o.opcode)
    }

    fn input(&self, op: OpId, slot: usize) -> Option<ValueId> {
        self.ops.get(op)?.inputs.get(slot).copied()
    }

    fn input_count(&self, op: OpId) -> usize {
        self.ops.get(op).map(|o| o.inputs.len()).unwrap_or(0)
    }

    fn output(&self, op: OpId) -> Option<ValueId> {
        self.ops.get(op).and_then(|o| o.output)
    }

    fn alive_ops(&self) -> Vec<OpId> {
        self.ops.alive_ops().to_vec()
    }

    fn constant_value(&self, value: ValueId) -> Option<u64> {
        let cell = self.cells.get(value)?;
        cell.is_constant().then_some(cell.storage.address.offset)
    }

    fn value_size(&self, value: ValueId) -> Option<u32> {
        self.cells.get(value).map(|c| c.storage.size)
    }

    /// Signedness is a property of a cell's resolved `TypeId`, which needs a
    /// `TypeDatabase` to interpret; `Editor` callers that need it should
    /// consult the database directly rather than through this trait method.
    /// Rules that don't have a database in scope get the conservative
    /// unsigned default.
    fn is_signed(&self, _value: ValueId) -> bool {
        false
    }

    fn set_opcode(&mut self, op: OpId, opcode: OpCode) {
        let _ = self.op_set_opcode(op, opcode);
    }

    fn set_input(&mut self, op: OpId, slot: usize, value: ValueId) {
        self.op_set_input(op, slot, value);
    }

    fn remove_input(&mut self, op: OpId, slot: usize) {
        self.op_remove_input(op, slot);
    }

    fn set_output(&mut self, op: OpId, value: Option<ValueId>) {
        self.op_set_output(op, value);
    }

    fn new_constant(&mut self, value: u64, size: u32) -> ValueId {
        Function::new_constant(self, value, size)
    }

    fn new_unique_out(&mut self, size: u32) -> ValueId {
        Function::new_unique_out(self, size)
    }

    fn new_op_after(&mut self, anchor: OpId, opcode: OpCode, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
        let address = self.ops.get(anchor).map(|o| o.seq.address).unwrap_or(Address::new(self.arch.default_code_space, 0));
        let id = self.new_op(opcode, address, inputs, output);
        self.op_insert_after(id, anchor);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;
    use crate::arch::Architecture;
    use crate::block::EdgeFlags;

    fn test_arch() -> Rc<Architecture> {
        Rc::new(
            Architecture::builder()
                .add_space(SpaceId(0), "ram", crate::address::SpaceKind::Data, 1)
                .add_space(SpaceId(1), "unique", crate::address::SpaceKind::Unique, 1)
                .add_space(SpaceId(2), "code", crate::address::SpaceKind::Code, 1)
                .add_space(SpaceId(3), "const", crate::address::SpaceKind::Constant, 1)
                .build()
                .unwrap(),
        )
    }

    fn addr(space: SpaceId, off: u64) -> Address {
        Address::new(space, off)
    }

    #[test]
    fn constant_is_cloned_on_second_use() {
        let mut f = Function::new(test_arch());
        let c = f.new_constant(5, 4);
        let block = f.blocks.new_block_basic();
        let a = f.new_varnode(addr(SpaceId(0), 0), 4);
        let op1 = f.new_op(OpCode::Copy, addr(SpaceId(2), 0x10), vec![c], Some(a));
        f.op_insert_end(op1, block);
        let b = f.new_varnode(addr(SpaceId(0), 4), 4);
        let op2 = f.new_op(OpCode::Copy, addr(SpaceId(2), 0x20), vec![c], Some(b));
        f.op_insert_end(op2, block);

        let first_input = f.ops.get(op1).unwrap().inputs[0];
        let second_input = f.ops.get(op2).unwrap().inputs[0];
        assert_eq!(first_input, c);
        assert_ne!(second_input, c, "second use of a constant must be a fresh cell");
        assert_eq!(f.cells.get(c).unwrap().uses().len(), 1);
        assert_eq!(f.cells.get(second_input).unwrap().uses().len(), 1);
    }

    #[test]
    fn op_insert_before_stays_after_adjacent_indirect_effect() {
        let mut f = Function::new(test_arch());
        let block = f.blocks.new_block_basic();
        let shared_address = addr(SpaceId(2), 0x100);
        let indirect = f.new_op(OpCode::Indirect, shared_address, vec![], None);
        f.op_insert_end(indirect, block);
        let target = f.new_op(OpCode::Copy, shared_address, vec![], None);
        f.op_insert_end(target, block);

        let new_op = f.new_op(OpCode::Copy, shared_address, vec![], None);
        f.op_insert_before(new_op, target);

        let ops = &f.blocks.get(block).unwrap().ops;
        assert_eq!(ops, &vec![new_op, indirect, target]);
    }

    #[test]
    fn op_insert_begin_skips_leading_phis() {
        let mut f = Function::new(test_arch());
        let block = f.blocks.new_block_basic();
        let phi_out = f.new_varnode(addr(SpaceId(0), 0), 4);
        let phi = f.new_op(OpCode::MultiEqual, addr(SpaceId(2), 0x10), vec![], Some(phi_out));
        f.op_insert_begin(phi, block);
        let body = f.new_op(OpCode::Copy, addr(SpaceId(2), 0x10), vec![], None);
        f.op_insert_begin(body, block);

        let ops = &f.blocks.get(block).unwrap().ops;
        assert_eq!(ops, &vec![phi, body]);
    }

    #[test]
    fn op_set_opcode_rejects_branch_with_multiple_successors() {
        let mut f = Function::new(test_arch());
        let a = f.blocks.new_block_basic();
        let b = f.blocks.new_block_basic();
        let c = f.blocks.new_block_basic();
        f.blocks.add_edge(a, b);
        f.blocks.add_edge(a, c);
        let op = f.new_op(OpCode::CBranch, addr(SpaceId(2), 0), vec![], None);
        f.op_insert_end(op, a);

        assert!(f.op_set_opcode(op, OpCode::Branch).is_err());

        f.blocks.remove_edge(a, c);
        assert!(f.op_set_opcode(op, OpCode::Branch).is_ok());
    }

    #[test]
    fn total_replace_rewires_every_use() {
        let mut f = Function::new(test_arch());
        let block = f.blocks.new_block_basic();
        let old = f.new_varnode(addr(SpaceId(0), 0), 4);
        let new = f.new_varnode(addr(SpaceId(0), 8), 4);
        let out = f.new_varnode(addr(SpaceId(0), 16), 4);
        let op = f.new_op(OpCode::Copy, addr(SpaceId(2), 0x10), vec![old], Some(out));
        f.op_insert_end(op, block);

        f.total_replace(old, new);

        assert_eq!(f.ops.get(op).unwrap().inputs[0], new);
        assert!(f.cells.get(old).unwrap().uses().is_empty());
        assert_eq!(f.cells.get(new).unwrap().uses().len(), 1);
    }

    #[test]
    fn remove_from_flow_drops_phi_slot_for_removed_predecessor() {
        let mut f = Function::new(test_arch());
        let p0 = f.blocks.new_block_basic();
        let p1 = f.blocks.new_block_basic();
        let merge = f.blocks.new_block_basic();
        f.blocks.add_edge(p0, merge);
        f.blocks.add_edge(p1, merge);

        let v0 = f.new_varnode(addr(SpaceId(0), 0), 4);
        let v1 = f.new_varnode(addr(SpaceId(0), 4), 4);
        let phi_out = f.new_varnode(addr(SpaceId(0), 8), 4);
        let phi = f.new_op(OpCode::MultiEqual, addr(SpaceId(2), 0x30), vec![v0, v1], Some(phi_out));
        f.op_insert_begin(phi, merge);

        f.remove_from_flow(p0);

        assert_eq!(f.ops.get(phi).unwrap().inputs, vec![v1]);
        assert!(f.blocks.get(merge).unwrap().preds == vec![p1]);
    }

    #[test]
    fn node_split_converts_phi_input_to_copy_in_clone() {
        let mut f = Function::new(test_arch());
        let pred = f.blocks.new_block_basic();
        let other_pred = f.blocks.new_block_basic();
        let shared = f.blocks.new_block_basic();
        f.blocks.add_edge(pred, shared);
        f.blocks.add_edge(other_pred, shared);

        let from_pred = f.new_varnode(addr(SpaceId(0), 0), 4);
        let from_other = f.new_varnode(addr(SpaceId(0), 4), 4);
        let phi_out = f.new_varnode(addr(SpaceId(0), 8), 4);
        let phi = f.new_op(OpCode::MultiEqual, addr(SpaceId(2), 0x40), vec![from_pred, from_other], Some(phi_out));
        f.op_insert_begin(phi, shared);
        let body = f.new_op(OpCode::IntAdd, addr(SpaceId(2), 0x40), vec![phi_out, phi_out], None);
        f.op_insert_end(body, shared);

        let clone = f.node_split(shared, pred);

        assert_eq!(f.blocks.get(pred).unwrap().succs, vec![clone]);
        assert_eq!(f.ops.get(phi).unwrap().inputs, vec![from_other]);
        let clone_ops = &f.blocks.get(clone).unwrap().ops;
        assert_eq!(clone_ops.len(), 2, "one COPY for the dropped phi slot, one cloned body op");
        let copy_op = f.ops.get(clone_ops[0]).unwrap();
        assert_eq!(copy_op.opcode, OpCode::Copy);
        assert_eq!(copy_op.inputs, vec![from_pred]);
    }

    #[test]
    fn editor_alive_ops_reflects_op_insert_end() {
        let mut f = Function::new(test_arch());
        let block = f.blocks.new_block_basic();
        let op = f.new_op(OpCode::Copy, addr(SpaceId(2), 0), vec![], None);
        assert!(Editor::alive_ops(&f).is_empty());
        f.op_insert_end(op, block);
        assert_eq!(Editor::alive_ops(&f), vec![op]);
    }

    #[test]
    fn editor_new_op_after_inserts_immediately_following_anchor() {
        let mut f = Function::new(test_arch());
        let block = f.blocks.new_block_basic();
        let anchor = f.new_op(OpCode::Copy, addr(SpaceId(2), 0), vec![], None);
        f.op_insert_end(anchor, block);

        let created = Editor::new_op_after(&mut f, anchor, OpCode::Copy, vec![], None);
        assert_eq!(f.blocks.get(block).unwrap().ops, vec![anchor, created]);
    }

    #[test]
    fn try_merge_high_refuses_when_covers_genuinely_intersect() {
        let mut f = Function::new(test_arch());
        let m1 = f.new_varnode(addr(SpaceId(0), 0), 4);
        let m2 = f.new_varnode(addr(SpaceId(0), 4), 4);
        f.set_high_level();
        let a = f.high_vars.create_for(m1);
        let b = f.high_vars.create_for(m2);
        f.high_vars.get_mut(a).unwrap().cover.add_interval(BlockId(0), 0, 10);
        f.high_vars.get_mut(b).unwrap().cover.add_interval(BlockId(0), 5, 15);

        assert!(!f.try_merge_high(a, b));
        assert!(f.high_vars.get(a).is_some() && f.high_vars.get(b).is_some());
    }

    #[test]
    fn try_merge_high_allows_disjoint_covers() {
        let mut f = Function::new(test_arch());
        let m1 = f.new_varnode(addr(SpaceId(0), 0), 4);
        let m2 = f.new_varnode(addr(SpaceId(0), 4), 4);
        let a = f.high_vars.create_for(m1);
        let b = f.high_vars.create_for(m2);
        f.high_vars.get_mut(a).unwrap().cover.add_interval(BlockId(0), 0, 5);
        f.high_vars.get_mut(b).unwrap().cover.add_interval(BlockId(0), 20, 25);

        assert!(f.try_merge_high(a, b));
        assert!(f.high_vars.get(b).is_none(), "b should be merged away");
    }

    #[test]
    fn op_destroy_raw_also_frees_an_unused_output_cell() {
        let mut f = Function::new(test_arch());
        let out = f.new_unique_out(4);
        let op = f.new_op(OpCode::Copy, addr(SpaceId(2), 0), vec![], Some(out));
        f.op_destroy_raw(op);
        assert!(f.cells.get(out).is_none());
        assert!(f.ops.get(op).is_none());
    }

    #[test]
    fn new_block_basic_entry_flag_is_unused_directly_but_edges_wire_correctly() {
        // sanity check that Function's use of BlockGraph/OperationStore
        // composes the way the rest of the module assumes.
        let mut f = Function::new(test_arch());
        let a = f.blocks.new_block_basic();
        let b = f.blocks.new_block_basic();
        f.blocks.add_edge(a, b);
        assert_eq!(f.blocks.get(a).unwrap().out_edge_flags, vec![EdgeFlags::default()]);
    }
}
