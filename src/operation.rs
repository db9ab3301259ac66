//! Operation store (C4): owns all operations, indexed by address, by
//! op-code, and by live/dead state.

use std::collections::{BTreeMap, HashMap};

use crate::address::{Address, SeqNum, SpaceId};
use crate::block::BlockId;
use crate::opcode::OpCode;
use crate::valuecell::ValueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OpId(pub u32);

crate::bitflags_like! {
    /// Operation flags (§3).
    pub struct OpFlags: u32 {
        const STARTBASIC       = 1 << 0;
        const STARTMARK        = 1 << 1;
        const NOCOLLAPSE       = 1 << 2;
        const NONPRINTING      = 1 << 3;
        const INDIRECT_CREATE  = 1 << 4;
        const CALL_OUTPUT      = 1 << 5;
        const WARNING          = 1 << 6;
        const BOOLEAN_FLIP     = 1 << 7;
        const SPACEBASE_PTR    = 1 << 8;
        const SPECIAL_PRINT    = 1 << 9;
        const SPECIAL_PROP     = 1 << 10;
        const DEAD             = 1 << 11;
        const MARK             = 1 << 12;
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: OpCode,
    pub seq: SeqNum,
    pub inputs: Vec<ValueId>,
    pub output: Option<ValueId>,
    pub flags: OpFlags,
    /// `None` while the op is unlinked from any block (the "dead list"
    /// holding pen of §5).
    pub parent: Option<BlockId>,
}

impl Operation {
    pub fn is_alive(&self) -> bool {
        self.parent.is_some() && !self.flags.contains(OpFlags::DEAD)
    }
}

#[derive(Default)]
pub struct OperationStore {
    ops: Vec<Option<Operation>>,
    free_list: Vec<OpId>,
    alive: Vec<OpId>,
    dead: Vec<OpId>,
    /// Address-ordered index across every live op, for range lookups and
    /// the rewrite framework's "locate ops by address" need (§1 scope).
    by_address: BTreeMap<SeqNum, OpId>,
    by_opcode: HashMap<OpCode, Vec<OpId>>,
    next_order: u32,
}

impl OperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new operation. Per §4.4, creation always yields a dead op:
    /// the caller must insert it into a block (`opInsert*` family) before
    /// it becomes alive.
    pub fn create(&mut self, opcode: OpCode, address: Address, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
        let seq = SeqNum::new(address, self.next_order);
        self.next_order += 1;
        let op = Operation { opcode, seq, inputs, output, flags: OpFlags::DEAD, parent: None };
        let id = if let Some(id) = self.free_list.pop() {
            self.ops[id.0 as usize] = Some(op);
            id
        } else {
            let id = OpId(self.ops.len() as u32);
            self.ops.push(Some(op));
            id
        };
        self.by_opcode.entry(opcode).or_default().push(id);
        self.dead.push(id);
        id
    }

    pub fn get(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.0 as usize).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        self.ops.get_mut(id.0 as usize).and_then(|o| o.as_mut())
    }

    /// Moves `id` from the dead list to the alive list and parents it under
    /// `block`, indexing it by address.
    pub fn mark_alive(&mut self, id: OpId, block: BlockId) {
        let op = self.ops[id.0 as usize].as_mut().expect("unknown op");
        assert!(op.parent.is_none(), "op already alive");
        op.parent = Some(block);
        op.flags.remove(OpFlags::DEAD);
        self.by_address.insert(op.seq, id);
        self.dead.retain(|&x| x != id);
        self.alive.push(id);
    }

    /// Unlinks `id` from its block and moves it back to the dead list
    /// without freeing it (§5: the dead list is a holding pen).
    pub fn mark_dead(&mut self, id: OpId) {
        let op = self.ops[id.0 as usize].as_mut().expect("unknown op");
        op.parent = None;
        op.flags.insert(OpFlags::DEAD);
        self.by_address.remove(&op.seq);
        self.alive.retain(|&x| x != id);
        self.dead.push(id);
    }

    /// Frees `id`. Forbidden while the op is alive: callers must
    /// `mark_dead` (unlink) first (§4.4).
    pub fn destroy(&mut self, id: OpId) {
        let op = self.ops[id.0 as usize].as_ref().expect("unknown op");
        assert!(op.parent.is_none(), "destroying a live op is forbidden; unlink it first");
        let opcode = op.opcode;
        if let Some(bucket) = self.by_opcode.get_mut(&opcode) {
            bucket.retain(|&x| x != id);
        }
        self.dead.retain(|&x| x != id);
        self.ops[id.0 as usize] = None;
        self.free_list.push(id);
    }

    pub fn alive_ops(&self) -> &[OpId] {
        &self.alive
    }

    pub fn dead_ops(&self) -> &[OpId] {
        &self.dead
    }

    pub fn iter_by_opcode(&self, op: OpCode) -> impl Iterator<Item = OpId> + '_ {
        self.by_opcode.get(&op).into_iter().flatten().copied().filter(move |&id| self.get(id).map(Operation::is_alive).unwrap_or(false))
    }

    /// Ops whose address lies in `[start, end]` inclusive, in sequence
    /// order; used to locate ops by address for the jump-table early-fail
    /// walk (§4.11) and for the rewrite rule interval lookups.
    pub fn iter_address_range(&self, space: SpaceId, start: u64, end: u64) -> impl Iterator<Item = OpId> + '_ {
        let lo = SeqNum::new(Address::new(space, start), 0);
        let hi = SeqNum::new(Address::new(space, end), u32::MAX);
        self.by_address.range(lo..=hi).map(|(_, &id)| id)
    }

    pub fn at_address(&self, address: Address) -> Option<OpId> {
        let lo = SeqNum::new(address, 0);
        let hi = SeqNum::new(address, u32::MAX);
        self.by_address.range(lo..=hi).next().map(|(_, &id)| id)
    }

    /// Looks up the op whose exact sequence number is `seq`, used by
    /// heritage (C7) to recover the block owning a cell's recorded
    /// definition point.
    pub fn op_at_seq(&self, seq: SeqNum) -> Option<OpId> {
        self.by_address.get(&seq).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;

    fn addr(off: u64) -> Address {
        Address::new(SpaceId(0), off)
    }

    #[test]
    fn creation_always_yields_a_dead_op() {
        let mut store = OperationStore::new();
        let id = store.create(OpCode::IntAdd, addr(0x10), vec![], None);
        assert!(!store.get(id).unwrap().is_alive());
        assert!(store.dead_ops().contains(&id));
    }

    #[test]
    fn mark_alive_then_dead_round_trips_through_lists() {
        let mut store = OperationStore::new();
        let id = store.create(OpCode::IntAdd, addr(0x10), vec![], None);
        store.mark_alive(id, BlockId(0));
        assert!(store.get(id).unwrap().is_alive());
        assert!(store.alive_ops().contains(&id));
        store.mark_dead(id);
        assert!(!store.get(id).unwrap().is_alive());
        assert!(store.dead_ops().contains(&id));
        assert!(!store.alive_ops().contains(&id));
    }

    #[test]
    #[should_panic(expected = "forbidden")]
    fn destroying_a_live_op_is_forbidden() {
        let mut store = OperationStore::new();
        let id = store.create(OpCode::IntAdd, addr(0x10), vec![], None);
        store.mark_alive(id, BlockId(0));
        store.destroy(id);
    }

    #[test]
    fn address_range_lookup_is_sequence_ordered() {
        let mut store = OperationStore::new();
        let a = store.create(OpCode::Copy, addr(0x10), vec![], None);
        let b = store.create(OpCode::Copy, addr(0x20), vec![], None);
        store.mark_alive(a, BlockId(0));
        store.mark_alive(b, BlockId(0));
        let found: Vec<_> = store.iter_address_range(SpaceId(0), 0x10, 0x20).collect();
        assert_eq!(found, vec![a, b]);
    }
}
