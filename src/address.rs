//! Byte-addressed positions within named address spaces (C1).

use std::cmp::Ordering;
use std::fmt;

/// Identifies one of the architecture's address spaces.
///
/// Spaces are opaque, interned handles: the engine never compares space
/// kinds by string, only by this id, which is assigned by the
/// [`Architecture`](crate::arch::Architecture) that owns the space table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SpaceId(pub u16);

/// The kind of storage a space represents.
///
/// Only a handful of kinds are semantically special to the core (constants
/// never have a definition, unique/iop/fspec spaces never survive into the
/// pretty-printer); everything else is "just memory" to this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SpaceKind {
    /// Executable code, used for instruction and branch-target addresses.
    Code,
    /// Ordinary data/RAM.
    Data,
    /// The stack, based on a spacebase register.
    Stack,
    /// Embedded constant-pool data (e.g. literal pools).
    ConstantPool,
    /// The constant pseudo-space: offsets here are constant *values*, not
    /// addresses. Cells here never have a definition.
    Constant,
    /// Compiler-generated temporaries with no stable storage address.
    Unique,
    /// Self-reference space: offsets index into the operation store.
    IOp,
    /// Self-reference space: offsets index into call-spec records.
    FSpec,
}

/// A single byte position: `(space, offset)`.
///
/// Ordering is first by space, then by offset; this is the order used by
/// the sub-range interval map (C2) and by the operation store's
/// address-keyed index (C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub space: SpaceId,
    pub offset: u64,
}

impl Address {
    pub const fn new(space: SpaceId, offset: u64) -> Self {
        Address { space, offset }
    }

    /// Returns the address `self + delta`, or `None` on overflow.
    pub fn advance(self, delta: u64) -> Option<Address> {
        self.offset.checked_add(delta).map(|offset| Address { offset, ..self })
    }

    pub fn is_same_space(self, other: Address) -> bool {
        self.space == other.space
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.space.cmp(&other.space).then(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space.0, self.offset)
    }
}

/// An inclusive `[first, last]` range of addresses, always within a single
/// space (cross-space ranges are a caller error, not representable here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AddressRange {
    pub space: SpaceId,
    pub first: u64,
    pub last: u64,
}

impl AddressRange {
    /// Builds a range from a starting address and a byte length; `len` must
    /// be nonzero.
    pub fn with_length(start: Address, len: u64) -> Option<Self> {
        debug_assert!(len > 0, "zero-length address range");
        let last = start.offset.checked_add(len - 1)?;
        Some(AddressRange { space: start.space, first: start.offset, last })
    }

    pub fn start(&self) -> Address {
        Address::new(self.space, self.first)
    }

    pub fn end_inclusive(&self) -> Address {
        Address::new(self.space, self.last)
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.space == self.space && addr.offset >= self.first && addr.offset <= self.last
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.space == other.space && self.first <= other.last && other.first <= self.last
    }
}

/// `(address, order)` — disambiguates multiple operations created at the
/// same address (e.g. a multi-op pseudo-instruction, or two rewrite-rule
/// outputs sharing an address because no new address is available).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SeqNum {
    pub address: Address,
    pub order: u32,
}

impl SeqNum {
    pub const fn new(address: Address, order: u32) -> Self {
        SeqNum { address, order }
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address).then(self.order.cmp(&other.order))
    }
}
