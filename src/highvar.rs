//! High-variable layer and cover-intersection cache (C8).

use std::collections::HashMap;

use crate::block::BlockId;
use crate::external::TypeId as DataTypeId;
use crate::symbol::SymbolId;
use crate::valuecell::ValueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HighVarId(pub u32);

/// Per-block half-open sequence-position intervals describing where a
/// high-variable's value is live.
#[derive(Debug, Clone, Default)]
pub struct Cover {
    blocks: HashMap<BlockId, Vec<(u32, u32)>>,
}

/// Coarse, per-block outcome of comparing two covers, before the
/// cell-level copy-shadow refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseTouch {
    None,
    Touch,
}

impl Cover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval(&mut self, block: BlockId, start: u32, end: u32) {
        self.blocks.entry(block).or_default().push((start, end));
    }

    pub fn merge_from(&mut self, other: &Cover) {
        for (&block, intervals) in &other.blocks {
            self.blocks.entry(block).or_default().extend(intervals.iter().copied());
        }
    }

    /// Coarse per-block comparison: overlap or boundary adjacency in any
    /// shared block counts as `Touch`.
    pub fn coarse_touch(&self, other: &Cover) -> CoarseTouch {
        for (block, ivals) in &self.blocks {
            let Some(other_ivals) = other.blocks.get(block) else { continue };
            for &(s1, e1) in ivals {
                for &(s2, e2) in other_ivals {
                    let overlap = s1 < e2 && s2 < e1;
                    let boundary = e1 == s2 || e2 == s1;
                    if overlap || boundary {
                        return CoarseTouch::Touch;
                    }
                }
            }
        }
        CoarseTouch::None
    }
}

#[derive(Debug, Clone)]
pub struct HighVariable {
    pub members: Vec<ValueId>,
    pub data_type: Option<DataTypeId>,
    pub symbol: Option<SymbolId>,
    pub cover: Cover,
    pub cover_dirty: bool,
    pub mark: bool,
    /// Links this high-variable to the composite whole it is one piece of,
    /// if any.
    pub piece_of: Option<HighVarId>,
}

impl HighVariable {
    fn new(member: ValueId) -> Self {
        Self {
            members: vec![member],
            data_type: None,
            symbol: None,
            cover: Cover::new(),
            cover_dirty: true,
            mark: false,
            piece_of: None,
        }
    }
}

fn norm_key(a: HighVarId, b: HighVarId) -> (HighVarId, HighVarId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

/// Cache of `{h1, h2} -> intersects?`, keyed by unordered pair (§4.8).
#[derive(Default)]
pub struct CoverIntersectionCache {
    entries: HashMap<(HighVarId, HighVarId), bool>,
    dirty: std::collections::HashSet<HighVarId>,
}

impl CoverIntersectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, id: HighVarId) {
        self.dirty.insert(id);
    }

    fn purge_if_dirty(&mut self, id: HighVarId) {
        if self.dirty.remove(&id) {
            self.entries.retain(|&(x, y), _| x != id && y != id);
        }
    }

    /// Tests (or recalls) whether `a` and `b` intersect. `coarse` computes
    /// the per-block coarse touch; `shadowed` (invoked only when coarse
    /// reports a touch) decides whether the touch is copy-shadowed (no
    /// real intersection) or a proper overlap.
    pub fn intersects(&mut self, a: HighVarId, b: HighVarId, coarse: impl FnOnce() -> CoarseTouch, shadowed: impl FnOnce() -> bool) -> bool {
        self.purge_if_dirty(a);
        self.purge_if_dirty(b);
        let key = norm_key(a, b);
        if let Some(&v) = self.entries.get(&key) {
            return v;
        }
        let result = match coarse() {
            CoarseTouch::None => false,
            CoarseTouch::Touch => !shadowed(),
        };
        self.entries.insert(key, result);
        result
    }

    /// Moves every `{high_b, x}` entry onto `{high_a, x}` as `high_b` is
    /// merged into `high_a` (§4.8 scenario 5): `true` entries are
    /// inherited outright; `false` entries survive only if `{high_a, x}`
    /// already agreed, otherwise the pairing is dropped so it is
    /// recomputed lazily.
    pub fn merge_move(&mut self, high_a: HighVarId, high_b: HighVarId) {
        let b_entries: Vec<(HighVarId, bool)> = self
            .entries
            .iter()
            .filter_map(|(&(x, y), &v)| {
                if x == high_b && y != high_a {
                    Some((y, v))
                } else if y == high_b && x != high_a {
                    Some((x, v))
                } else {
                    None
                }
            })
            .collect();
        for (x, v) in b_entries {
            self.entries.remove(&norm_key(high_b, x));
            let key_a = norm_key(high_a, x);
            match (v, self.entries.get(&key_a).copied()) {
                (true, _) => {
                    self.entries.insert(key_a, true);
                }
                (false, Some(false)) => {} // already agrees, keep
                (false, Some(true)) | (false, None) => {
                    self.entries.remove(&key_a); // force lazy recompute
                }
            }
        }
        self.entries.remove(&norm_key(high_a, high_b));
    }
}

#[derive(Default)]
pub struct HighVariableLayer {
    vars: Vec<Option<HighVariable>>,
    free_list: Vec<HighVarId>,
    high_level_threshold: Option<u32>,
    pub cache: CoverIntersectionCache,
}

impl HighVariableLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current cell-creation index: every non-annotation cell
    /// created from this point on gets a fresh high-variable unless a
    /// merge decision groups it with another (§4.8).
    pub fn set_high_level(&mut self, creation_index: u32) {
        self.high_level_threshold = Some(creation_index);
    }

    pub fn is_past_high_level(&self, cell_creation_seq: u32) -> bool {
        self.high_level_threshold.map(|t| cell_creation_seq >= t).unwrap_or(false)
    }

    pub fn create_for(&mut self, member: ValueId) -> HighVarId {
        let hv = HighVariable::new(member);
        if let Some(id) = self.free_list.pop() {
            self.vars[id.0 as usize] = Some(hv);
            id
        } else {
            let id = HighVarId(self.vars.len() as u32);
            self.vars.push(Some(hv));
            id
        }
    }

    pub fn get(&self, id: HighVarId) -> Option<&HighVariable> {
        self.vars.get(id.0 as usize).and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, id: HighVarId) -> Option<&mut HighVariable> {
        self.vars.get_mut(id.0 as usize).and_then(|v| v.as_mut())
    }

    pub fn mark_cover_dirty(&mut self, id: HighVarId) {
        if let Some(hv) = self.get_mut(id) {
            hv.cover_dirty = true;
        }
        self.cache.mark_dirty(id);
    }

    /// Merges `high_b`'s members into `high_a`, unions their covers, moves
    /// the intersection cache, and frees `high_b`'s slot.
    pub fn merge(&mut self, high_a: HighVarId, high_b: HighVarId) {
        if high_a == high_b {
            return;
        }
        let b = self.vars[high_b.0 as usize].take().expect("unknown high-variable");
        {
            let a = self.vars[high_a.0 as usize].as_mut().expect("unknown high-variable");
            a.members.extend(b.members);
            a.cover.merge_from(&b.cover);
            a.cover_dirty = true;
        }
        self.cache.merge_move(high_a, high_b);
        self.cache.mark_dirty(high_a);
        self.free_list.push(high_b);
    }
}

/// Scoped guard over the traversal `mark` bit (§9 "mark bits" design
/// note): marks set through [`MarkScope::set`] are guaranteed cleared when
/// the scope drops, even if the traversal exits early (e.g. via `?`), so a
/// stray bit from one pass can never leak into the next. This is the only
/// way code outside this module may set a high-variable's mark bit.
pub struct MarkScope<'a> {
    layer: &'a mut HighVariableLayer,
    marked: Vec<HighVarId>,
}

impl MarkScope<'_> {
    /// Sets `id`'s mark bit, remembering it for clearing on drop. A
    /// no-op if `id` is already marked within this scope.
    pub fn set(&mut self, id: HighVarId) {
        if let Some(hv) = self.layer.get_mut(id) {
            if !hv.mark {
                hv.mark = true;
                self.marked.push(id);
            }
        }
    }

    pub fn is_marked(&self, id: HighVarId) -> bool {
        self.layer.get(id).map(|hv| hv.mark).unwrap_or(false)
    }
}

impl Drop for MarkScope<'_> {
    fn drop(&mut self) {
        for id in self.marked.drain(..) {
            if let Some(hv) = self.layer.get_mut(id) {
                hv.mark = false;
            }
        }
    }
}

impl HighVariableLayer {
    /// Opens a new mark scope. Dropping the returned [`MarkScope`] clears
    /// every mark it set, regardless of how the traversal using it exits.
    pub fn mark_scope(&mut self) -> MarkScope<'_> {
        MarkScope { layer: self, marked: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_cache_merge_matches_spec_scenario_5() {
        let mut cache = CoverIntersectionCache::new();
        let (h1, h2, h3, h4) = (HighVarId(1), HighVarId(2), HighVarId(3), HighVarId(4));
        cache.entries.insert(norm_key(h1, h3), false);
        cache.entries.insert(norm_key(h2, h3), true);
        cache.entries.insert(norm_key(h2, h4), false);
        cache.entries.insert(norm_key(h1, h4), false);

        cache.merge_move(h1, h2);

        assert_eq!(cache.entries.get(&norm_key(h1, h3)), Some(&true));
        assert_eq!(cache.entries.get(&norm_key(h1, h4)), Some(&false));
        assert!(!cache.entries.contains_key(&norm_key(h2, h3)));
        assert!(!cache.entries.contains_key(&norm_key(h2, h4)));
    }

    #[test]
    fn disjoint_covers_do_not_intersect() {
        let mut cache = CoverIntersectionCache::new();
        let mut cover_a = Cover::new();
        cover_a.add_interval(BlockId(0), 0, 5);
        let mut cover_b = Cover::new();
        cover_b.add_interval(BlockId(0), 10, 15);
        let result = cache.intersects(HighVarId(0), HighVarId(1), || cover_a.coarse_touch(&cover_b), || false);
        assert!(!result);
    }

    #[test]
    fn boundary_touch_with_copy_shadow_does_not_intersect() {
        let mut cache = CoverIntersectionCache::new();
        let mut cover_a = Cover::new();
        cover_a.add_interval(BlockId(0), 0, 5);
        let mut cover_b = Cover::new();
        cover_b.add_interval(BlockId(0), 5, 10);
        let touch = cover_a.coarse_touch(&cover_b);
        assert_eq!(touch, CoarseTouch::Touch);
        let result = cache.intersects(HighVarId(0), HighVarId(1), || touch, || true);
        assert!(!result);
    }

    #[test]
    fn merging_two_high_variables_unions_members_and_cover() {
        let mut layer = HighVariableLayer::new();
        let a = layer.create_for(ValueId(0));
        let b = layer.create_for(ValueId(1));
        layer.get_mut(b).unwrap().cover.add_interval(BlockId(0), 0, 4);
        layer.merge(a, b);
        let merged = layer.get(a).unwrap();
        assert_eq!(merged.members, vec![ValueId(0), ValueId(1)]);
        assert!(layer.get(b).is_none());
    }

    #[test]
    fn mark_scope_clears_marks_on_drop() {
        let mut layer = HighVariableLayer::new();
        let a = layer.create_for(ValueId(0));
        {
            let mut scope = layer.mark_scope();
            scope.set(a);
            assert!(scope.is_marked(a));
        }
        assert!(!layer.get(a).unwrap().mark);
    }

    #[test]
    fn mark_scope_does_not_leak_across_an_early_return() {
        let mut layer = HighVariableLayer::new();
        let a = layer.create_for(ValueId(0));

        fn traverse(layer: &mut HighVariableLayer, a: HighVarId) -> Option<()> {
            let mut scope = layer.mark_scope();
            scope.set(a);
            None? // early exit while `a` is still marked
        }
        let _ = traverse(&mut layer, a);

        assert!(!layer.get(a).unwrap().mark, "mark must not survive the scope that set it");
    }
}
