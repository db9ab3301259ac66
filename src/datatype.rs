//! Data-type propagation and union resolution (C9).
//!
//! Types themselves are opaque handles (`TypeId`) owned by the externally
//! supplied type database (C16); this module only flows them across
//! operation edges and resolves which field of a union a given edge reads.

use std::collections::HashMap;

use crate::address::SeqNum;
use crate::external::{MetaType, TypeDatabase, TypeId, TypeShape};
use crate::opcode::OpCode;
use crate::valuecell::ValueId;

/// How aggressively a typing rule should cast: `Normal` only casts when a
/// representation genuinely differs (e.g. int vs pointer); `Harsh` also
/// casts across same-representation types to surface a more specific one
/// (used once locked types have stabilized).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastStrategy {
    Normal,
    Harsh,
}

/// Per-op-code typing behavior (§4.9).
pub trait TypingRule {
    fn get_input_cast(&self, db: &dyn TypeDatabase, opcode: OpCode, slot: u32, in_type: TypeId, strategy: CastStrategy) -> Option<TypeId>;
    fn get_output_token(&self, db: &dyn TypeDatabase, opcode: OpCode, in_types: &[TypeId], strategy: CastStrategy) -> TypeId;
    /// Lateral propagation along one data-flow edge; `None` means this rule
    /// has no opinion (the caller's existing type for `out_cell` stands).
    fn propagate_type(&self, db: &dyn TypeDatabase, opcode: OpCode, in_type: TypeId, in_slot: u32, out_slot: u32) -> Option<TypeId>;
}

/// The default typing rule: identity propagation for copy-like forms,
/// pointer-arithmetic component lookup for PTRADD/PTRSUB, otherwise no
/// opinion. Architecture-specific rule sets can be layered in by wrapping
/// this with their own `TypingRule` and falling back to it.
pub struct DefaultTypingRule;

impl TypingRule for DefaultTypingRule {
    fn get_input_cast(&self, _db: &dyn TypeDatabase, _opcode: OpCode, _slot: u32, in_type: TypeId, _strategy: CastStrategy) -> Option<TypeId> {
        let _ = in_type;
        None
    }

    fn get_output_token(&self, _db: &dyn TypeDatabase, _opcode: OpCode, in_types: &[TypeId], _strategy: CastStrategy) -> TypeId {
        in_types.first().copied().unwrap_or(TypeId(0))
    }

    fn propagate_type(&self, db: &dyn TypeDatabase, opcode: OpCode, in_type: TypeId, in_slot: u32, out_slot: u32) -> Option<TypeId> {
        match opcode {
            OpCode::Copy | OpCode::MultiEqual if out_slot == 0 => Some(in_type),
            OpCode::PtrAdd | OpCode::PtrSub if in_slot == 0 => {
                // Consult the referenced composite to pick a component
                // offset, falling back to the pointer's own type.
                if let TypeShape::Pointer { element, .. } = db.shape(in_type) {
                    Some(db.get_pointer(db.size_of(in_type), element, 1))
                } else {
                    Some(in_type)
                }
            }
            _ => None,
        }
    }
}

/// Key into the resolved-union map: which field a specific edge of the
/// data-flow graph reads/writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnionEdgeKey {
    pub union_type: TypeId,
    pub op: SeqNum,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct UnionResolution {
    pub field_number: u32,
    pub locked: bool,
}

/// Cache mapping `(union_type, op_seq, slot) -> (field, locked)` (§4.9).
#[derive(Default)]
pub struct ResolvedUnionMap {
    entries: HashMap<UnionEdgeKey, UnionResolution>,
}

impl ResolvedUnionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: UnionEdgeKey) -> Option<UnionResolution> {
        self.entries.get(&key).copied()
    }

    /// Locks a facet in from a user-supplied union-facet symbol; never
    /// overwritten by later resolution.
    pub fn lock(&mut self, key: UnionEdgeKey, field_number: u32) {
        self.entries.insert(key, UnionResolution { field_number, locked: true });
    }

    /// Resolves (or re-confirms) the field for `key`, given the candidate
    /// field number a typing rule picked this pass. Locked entries are
    /// never overwritten.
    pub fn resolve(&mut self, key: UnionEdgeKey, field_number: u32) -> UnionResolution {
        if let Some(existing) = self.entries.get(&key) {
            if existing.locked {
                return *existing;
            }
        }
        let resolution = UnionResolution { field_number, locked: false };
        self.entries.insert(key, resolution);
        resolution
    }

    /// For a phi op with a union type where several input slots hold the
    /// same value cell, populates all of those slots identically (§4.9).
    pub fn propagate_phi_aliases(&mut self, union_type: TypeId, op: SeqNum, slots_sharing_value: &[u32], field_number: u32) {
        for &slot in slots_sharing_value {
            self.resolve(UnionEdgeKey { union_type, op, slot }, field_number);
        }
    }

    pub fn invalidate_op(&mut self, op: SeqNum) {
        self.entries.retain(|k, _| k.op != op);
    }
}

/// Picks a field of `union_type` for an edge carrying a value of
/// `value_size` bytes starting at `byte_offset` within the union, via the
/// type database's exact-piece lookup. Falls back to field 0 when no exact
/// piece matches (conservative: the caller should prefer an explicit lock
/// over this heuristic whenever one exists).
pub fn pick_union_field(db: &dyn TypeDatabase, union_type: TypeId, byte_offset: u64, value_size: u32) -> u32 {
    if let TypeShape::Composite { fields, is_union: true, .. } = db.shape(union_type) {
        if let Some(exact) = fields.iter().find(|f| f.byte_offset == byte_offset && f.size == value_size) {
            return exact.field_number;
        }
    }
    0
}

/// Drives the propagation loop: seeds from locked cells (represented here
/// as a caller-supplied set of `(ValueId, TypeId)` pairs with a known
/// fixed type) and iterates `edges` (an op-code plus the in/out slot types
/// for one data-flow edge at a time) until nothing changes or `cap` passes
/// elapse. The caller (the function container, C10) is responsible for
/// supplying `edges` in a stable per-pass order and for writing results
/// back onto value cells; this function stays free of `ValueCellStore` so
/// it can be unit tested against synthetic edge lists.
pub fn propagate_fixed_point<F>(mut current: HashMap<ValueId, TypeId>, edges: &[(ValueId, ValueId, OpCode, u32, u32)], rule: &dyn TypingRule, db: &dyn TypeDatabase, cap: u32, mut on_change: F) -> u32
where
    F: FnMut(ValueId, TypeId),
{
    let mut pass = 0;
    loop {
        if pass >= cap {
            break;
        }
        let mut changed = false;
        for &(in_cell, out_cell, opcode, in_slot, out_slot) in edges {
            let Some(&in_type) = current.get(&in_cell) else { continue };
            if let Some(new_type) = rule.propagate_type(db, opcode, in_type, in_slot, out_slot) {
                let prior = current.get(&out_cell).copied();
                if prior != Some(new_type) {
                    current.insert(out_cell, new_type);
                    on_change(out_cell, new_type);
                    changed = true;
                }
            }
        }
        pass += 1;
        if !changed {
            break;
        }
    }
    let _ = MetaType::Unknown;
    pass
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A minimal in-memory type database used only by this crate's own
    //! tests to exercise propagation without depending on a real database
    //! implementation (which is out of scope, §1).
    use super::*;

    pub struct FixedTypeDatabase {
        pub shapes: HashMap<u32, TypeShape>,
    }

    impl FixedTypeDatabase {
        pub fn new() -> Self {
            Self { shapes: HashMap::new() }
        }
        pub fn declare(&mut self, id: u32, shape: TypeShape) -> TypeId {
            self.shapes.insert(id, shape);
            TypeId(id)
        }
    }

    impl TypeDatabase for FixedTypeDatabase {
        fn get_base(&self, size: u32, metatype: MetaType) -> TypeId {
            let _ = (size, metatype);
            TypeId(0)
        }
        fn get_pointer(&self, _size: u32, element: TypeId, _word_size: u32) -> TypeId {
            element
        }
        fn get_typedef_immediate(&self, _ty: TypeId) -> Option<TypeId> {
            None
        }
        fn get_exact_piece(&self, composite: TypeId, byte_offset: u64, size: u32) -> Option<TypeId> {
            match self.shapes.get(&composite.0) {
                Some(TypeShape::Composite { fields, .. }) => {
                    fields.iter().find(|f| f.byte_offset == byte_offset && f.size == size).map(|f| f.field_type)
                }
                _ => None,
            }
        }
        fn shape(&self, ty: TypeId) -> TypeShape {
            self.shapes.get(&ty.0).cloned().unwrap_or(TypeShape::Scalar { size: 4, meta: MetaType::Unknown })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FixedTypeDatabase;
    use super::*;
    use crate::external::CompositeField;

    #[test]
    fn union_resolution_lock_is_never_overwritten() {
        let mut map = ResolvedUnionMap::new();
        let key = UnionEdgeKey { union_type: TypeId(1), op: dummy_seq(), slot: 0 };
        map.lock(key, 2);
        let result = map.resolve(key, 7);
        assert_eq!(result.field_number, 2);
        assert!(result.locked);
    }

    #[test]
    fn phi_alias_slots_get_identical_field() {
        let mut map = ResolvedUnionMap::new();
        let seq = dummy_seq();
        map.propagate_phi_aliases(TypeId(1), seq, &[0, 2], 3);
        assert_eq!(map.get(UnionEdgeKey { union_type: TypeId(1), op: seq, slot: 0 }).unwrap().field_number, 3);
        assert_eq!(map.get(UnionEdgeKey { union_type: TypeId(1), op: seq, slot: 2 }).unwrap().field_number, 3);
    }

    #[test]
    fn pick_union_field_matches_exact_offset_and_size() {
        let mut db = FixedTypeDatabase::new();
        let union_ty = db.declare(
            1,
            TypeShape::Composite {
                fields: vec![
                    CompositeField { field_number: 0, byte_offset: 0, size: 4, field_type: TypeId(10) },
                    CompositeField { field_number: 1, byte_offset: 0, size: 8, field_type: TypeId(11) },
                ],
                is_union: true,
                size: 8,
            },
        );
        assert_eq!(pick_union_field(&db, union_ty, 0, 8), 1);
        assert_eq!(pick_union_field(&db, union_ty, 0, 4), 0);
    }

    #[test]
    fn propagation_seeds_from_locked_cell_and_reaches_fixed_point() {
        let db = FixedTypeDatabase::new();
        let rule = DefaultTypingRule;
        let a = ValueId(0);
        let b = ValueId(1);
        let mut seed = HashMap::new();
        seed.insert(a, TypeId(5));
        let edges = vec![(a, b, OpCode::Copy, 0u32, 0u32)];
        let mut observed = Vec::new();
        let passes = propagate_fixed_point(seed, &edges, &rule, &db, 10, |cell, ty| observed.push((cell, ty)));
        assert_eq!(observed, vec![(b, TypeId(5))]);
        assert!(passes <= 2);
    }

    fn dummy_seq() -> SeqNum {
        use crate::address::{Address, SpaceId};
        SeqNum::new(Address::new(SpaceId(0), 0), 0)
    }
}
