//! Value-cell store (C3): owns all SSA value cells, keeping three indexes
//! over them — `loc_index` on `(space, address, size, def-pc)`, `def_index`
//! on `(def-pc, flags, address)` (§4.3), and an op-code-class bucket map —
//! and exposing the five §4.3 storage-refinement range iterators over them:
//! all (`iter_all`), space (`iter_space`), address (`iter_address`), exact
//! storage (`iter_exact_storage`), and storage+def (`iter_storage_def`).

use std::collections::{BTreeMap, HashMap};

use crate::address::{Address, SeqNum, SpaceId};
use crate::opcode::OpCode;
use crate::rangemap::SubRangeMap;

/// Index into the [`ValueCellStore`]'s arena. Stable across edits; reused
/// only after the slot it names has been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ValueId(pub u32);

crate::bitflags_like! {
    /// Value-cell flags (§3).
    pub struct CellFlags: u32 {
        const ADDRTIED       = 1 << 0;
        const ADDRFORCE      = 1 << 1;
        const INPUT          = 1 << 2;
        const CONSTANT       = 1 << 3;
        const ANNOTATION     = 1 << 4;
        const PERSISTENT     = 1 << 5;
        const INDIRECT_CREATE = 1 << 6;
        const SPACEBASE      = 1 << 7;
        const VOLATILE       = 1 << 8;
        const TYPELOCK       = 1 << 9;
        const NAMELOCK       = 1 << 10;
        const READONLY       = 1 << 11;
        const MARK           = 1 << 12;
        const IMPLICIT       = 1 << 13;
        const EXPLICIT       = 1 << 14;
        const FREE           = 1 << 15;
    }
}

/// `(address, size_in_bytes)`: the storage a cell occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Storage {
    pub address: Address,
    pub size: u32,
}

impl Storage {
    pub fn new(address: Address, size: u32) -> Self {
        Self { address, size }
    }
}

use crate::external::TypeId;
use crate::highvar::HighVarId;
use crate::symbol::SymbolId;

#[derive(Debug, Clone)]
pub struct ValueCell {
    pub storage: Storage,
    pub flags: CellFlags,
    /// Operation that defines this cell; `None` for inputs, constants, and
    /// free cells.
    pub definition: Option<SeqNum>,
    /// Op-code class of the defining operation, cached for the op-code
    /// bucket index; `None` when `definition` is `None`.
    def_opcode: Option<OpCode>,
    /// Uses of this cell, as `(user op sequence number, input slot)`.
    uses: Vec<(SeqNum, u32)>,
    pub data_type: Option<TypeId>,
    /// Bits possibly set ("non-zero mask").
    pub non_zero_mask: u64,
    /// Bits observed downstream ("consume mask").
    pub consume_mask: u64,
    pub high_var: Option<HighVarId>,
    pub symbol: Option<SymbolId>,
    /// Monotonic creation order, used by `setHighLevel()` (C8) to decide
    /// which cells predate the high-level index capture.
    pub creation_seq: u32,
}

impl ValueCell {
    pub fn is_input(&self) -> bool {
        self.flags.contains(CellFlags::INPUT)
    }
    pub fn is_constant(&self) -> bool {
        self.flags.contains(CellFlags::CONSTANT)
    }
    pub fn is_free(&self) -> bool {
        self.definition.is_none() && !self.is_input() && !self.is_constant() && !self.flags.contains(CellFlags::ANNOTATION)
    }
    pub fn uses(&self) -> &[(SeqNum, u32)] {
        &self.uses
    }
}

/// Outcome of checking a new cell's storage against the existing SSA-input
/// set (§4.3 rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOverlap {
    NoOverlap,
    /// Storage and size coincide exactly with `existing`: it is preserved.
    ExactMatch(ValueId),
    /// Partial overlap: caller must split `existing` via SUBPIECE ops.
    NeedsSplit(ValueId),
}

#[derive(Default)]
pub struct ValueCellStore {
    cells: Vec<Option<ValueCell>>,
    free_list: Vec<ValueId>,
    next_creation: u32,
    /// `(space, address, size, def-pc)` ordered index ("loc"), the backing
    /// store for the `space`/`address`/`exact storage`/`storage+def`
    /// refinement iterators below.
    loc_index: BTreeMap<(SpaceId, u64, u32, Option<SeqNum>), ValueId>,
    /// `(def-pc, flags, address)` ordered index ("def", §4.3). `flags` is
    /// stored as its raw bit pattern so the key stays `Ord` without adding
    /// a trait bound to `CellFlags`.
    def_index: BTreeMap<(Option<SeqNum>, u32, Address), ValueId>,
    /// Op-code-class buckets for quick scans.
    opcode_buckets: HashMap<OpCode, Vec<ValueId>>,
    /// Per-space SSA-input coverage, used by `set_input`'s overlap rule.
    input_ranges: HashMap<SpaceId, SubRangeMap<u64, ValueId, u8>>,
}

/// The greatest representable `SeqNum`, used only as the inclusive upper
/// bound of a `BTreeMap` range scan over keys ending in `Option<SeqNum>`
/// (`None` sorts first, so a scan covering "every def-pc" needs a concrete
/// maximum `Some(..)` to close the range).
fn max_seq_num() -> SeqNum {
    SeqNum::new(Address::new(SpaceId(u16::MAX), u64::MAX), u32::MAX)
}

impl ValueCellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The creation index the next `create()` call will stamp a cell with;
    /// used by `setHighLevel()` (C8) to capture the high-level threshold
    /// without creating a throwaway cell just to read its `creation_seq`.
    pub fn next_creation_index(&self) -> u32 {
        self.next_creation
    }

    fn insert_indexes(&mut self, id: ValueId, cell: &ValueCell) {
        self.loc_index.insert(
            (cell.storage.address.space, cell.storage.address.offset, cell.storage.size, cell.definition),
            id,
        );
        self.def_index.insert((cell.definition, cell.flags.bits(), cell.storage.address), id);
        if let Some(op) = cell.def_opcode {
            self.opcode_buckets.entry(op).or_default().push(id);
        }
    }

    fn remove_indexes(&mut self, id: ValueId, cell: &ValueCell) {
        self.loc_index
            .remove(&(cell.storage.address.space, cell.storage.address.offset, cell.storage.size, cell.definition));
        self.def_index.remove(&(cell.definition, cell.flags.bits(), cell.storage.address));
        if let Some(op) = cell.def_opcode {
            if let Some(bucket) = self.opcode_buckets.get_mut(&op) {
                bucket.retain(|&v| v != id);
            }
        }
    }

    pub fn create(&mut self, storage: Storage, flags: CellFlags) -> ValueId {
        let creation_seq = self.next_creation;
        self.next_creation += 1;
        let cell = ValueCell {
            storage,
            flags,
            definition: None,
            def_opcode: None,
            uses: Vec::new(),
            data_type: None,
            non_zero_mask: u64::MAX,
            consume_mask: u64::MAX,
            high_var: None,
            symbol: None,
            creation_seq,
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.cells[id.0 as usize] = Some(cell.clone());
            id
        } else {
            let id = ValueId(self.cells.len() as u32);
            self.cells.push(Some(cell.clone()));
            id
        };
        self.insert_indexes(id, &cell);
        id
    }

    pub fn get(&self, id: ValueId) -> Option<&ValueCell> {
        self.cells.get(id.0 as usize).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, id: ValueId) -> Option<&mut ValueCell> {
        self.cells.get_mut(id.0 as usize).and_then(|c| c.as_mut())
    }

    /// Sets the defining operation of a cell, reindexing it under the new
    /// `(def-pc, ...)` keys. Panics (invariant violation) if the cell
    /// already has a definition: §3 guarantees exactly one definition per
    /// cell.
    pub fn set_definition(&mut self, id: ValueId, seq: SeqNum, opcode: OpCode) {
        let cell = self.cells[id.0 as usize].clone().expect("set_definition on destroyed cell");
        assert!(cell.definition.is_none(), "cell already has a definition");
        self.remove_indexes(id, &cell);
        let mut cell = cell;
        cell.definition = Some(seq);
        cell.def_opcode = Some(opcode);
        self.insert_indexes(id, &cell);
        self.cells[id.0 as usize] = Some(cell);
    }

    pub fn clear_definition(&mut self, id: ValueId) {
        let cell = self.cells[id.0 as usize].clone().expect("clear_definition on destroyed cell");
        self.remove_indexes(id, &cell);
        let mut cell = cell;
        cell.definition = None;
        cell.def_opcode = None;
        self.insert_indexes(id, &cell);
        self.cells[id.0 as usize] = Some(cell);
    }

    pub fn add_use(&mut self, id: ValueId, user: SeqNum, slot: u32) {
        if let Some(cell) = self.get_mut(id) {
            cell.uses.push((user, slot));
        }
    }

    pub fn remove_use(&mut self, id: ValueId, user: SeqNum, slot: u32) {
        if let Some(cell) = self.get_mut(id) {
            cell.uses.retain(|&(u, s)| !(u == user && s == slot));
        }
    }

    /// Marks `id` as an SSA input. Checks the §4.3 overlap rule against the
    /// existing input set in the cell's space before recording it.
    pub fn check_input_overlap(&self, id: ValueId) -> InputOverlap {
        let cell = self.get(id).expect("unknown cell");
        let Some(ranges) = self.input_ranges.get(&cell.storage.address.space) else {
            return InputOverlap::NoOverlap;
        };
        let a = cell.storage.address.offset;
        let b = a + u64::from(cell.storage.size) - 1;
        match ranges.find_overlap(a, b) {
            None => InputOverlap::NoOverlap,
            Some(view) => {
                let existing = *view.records().next().expect("non-empty subrange");
                let existing_cell = self.get(existing).expect("indexed input still alive");
                if existing_cell.storage == cell.storage {
                    InputOverlap::ExactMatch(existing)
                } else {
                    InputOverlap::NeedsSplit(existing)
                }
            }
        }
    }

    pub fn set_input(&mut self, id: ValueId) {
        let cell = self.get_mut(id).expect("unknown cell");
        cell.flags.insert(CellFlags::INPUT);
        let storage = cell.storage;
        let a = storage.address.offset;
        let b = a + u64::from(storage.size) - 1;
        self.input_ranges.entry(storage.address.space).or_default().insert(id, a, b, 0u8);
    }

    pub fn destroy(&mut self, id: ValueId) {
        if let Some(cell) = self.cells[id.0 as usize].take() {
            self.remove_indexes(id, &cell);
            if cell.is_input() {
                if let Some(ranges) = self.input_ranges.get_mut(&cell.storage.address.space) {
                    ranges.erase(&id);
                }
            }
            self.free_list.push(id);
        }
    }

    /// Every live cell, in `loc_index` order. The §4.3 "all" refinement.
    pub fn iter_all(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.loc_index.values().copied()
    }

    /// All cells whose storage lies within `space`, in ascending offset
    /// order. The `loc_index` is keyed `(space, ...)` first, so this is a
    /// contiguous key range.
    pub fn iter_space(&self, space: SpaceId) -> impl Iterator<Item = ValueId> + '_ {
        let lower = (space, u64::MIN, u32::MIN, None);
        let upper = (space, u64::MAX, u32::MAX, Some(max_seq_num()));
        self.loc_index.range(lower..=upper).map(|(_, &id)| id)
    }

    /// All cells at `address`, regardless of size or def-pc. The §4.3
    /// "address" refinement.
    pub fn iter_address(&self, address: Address) -> impl Iterator<Item = ValueId> + '_ {
        let lower = (address.space, address.offset, u32::MIN, None);
        let upper = (address.space, address.offset, u32::MAX, Some(max_seq_num()));
        self.loc_index.range(lower..=upper).map(|(_, &id)| id)
    }

    /// Cells whose storage exactly matches `storage`.
    pub fn iter_exact_storage(&self, storage: Storage) -> impl Iterator<Item = ValueId> + '_ {
        let lower = (storage.address.space, storage.address.offset, storage.size, None);
        let upper = (storage.address.space, storage.address.offset, storage.size, Some(max_seq_num()));
        self.loc_index.range(lower..=upper).map(|(_, &id)| id)
    }

    /// Cells defined by `def` whose storage is `storage`, the §4.3
    /// "storage+def" refinement and the reader of the `def_index`. The
    /// index keys on `(def, flags, address)`, so only `def` is an exact
    /// prefix; the range scan spans every `flags`/`address` combination for
    /// that def and the `address`/`size` match is applied as a filter.
    pub fn iter_storage_def(&self, storage: Storage, def: Option<SeqNum>) -> impl Iterator<Item = ValueId> + '_ {
        let min_address = Address::new(SpaceId(u16::MIN), u64::MIN);
        let max_address = Address::new(SpaceId(u16::MAX), u64::MAX);
        let lower = (def, u32::MIN, min_address);
        let upper = (def, u32::MAX, max_address);
        self.def_index
            .range(lower..=upper)
            .map(|(_, &id)| id)
            .filter(move |&id| self.get(id).is_some_and(|cell| cell.storage == storage))
    }

    pub fn iter_by_opcode(&self, op: OpCode) -> impl Iterator<Item = ValueId> + '_ {
        self.opcode_buckets.get(&op).into_iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
