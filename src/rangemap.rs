//! Sub-range interval map (C2): a container over records whose domain is an
//! ordered linear type, refined into disjoint sub-ranges so that every point
//! can be resolved to its exact covering-record set in logarithmic time.
//!
//! Used throughout the core: symbol storage lookup (C12), laned-register
//! admissibility (C13), and the heritage pass's per-space live-range
//! bookkeeping (C7).

use std::collections::BTreeMap;

/// A domain value that supports stepping to its immediate successor and
/// predecessor. Only integral offsets (`u64`) are needed by this crate; the
/// trait exists so the map's splitting/fusing logic stays domain-agnostic.
pub trait LinearDomain: Ord + Copy {
    fn succ(self) -> Option<Self>;
    fn pred(self) -> Option<Self>;
}

impl LinearDomain for u64 {
    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }
    fn pred(self) -> Option<Self> {
        self.checked_sub(1)
    }
}

/// One record's membership in a sub-range, carrying the sub-sort key used to
/// order records that cover the same points.
#[derive(Debug, Clone)]
struct Entry<R, S> {
    record: R,
    subsort: S,
}

#[derive(Debug, Clone)]
struct SubRange<D, R, S> {
    /// Inclusive end of this sub-range. The start is the map key.
    end: D,
    covering: Vec<Entry<R, S>>,
}

/// The sub-range interval map itself.
///
/// `R` is the record identity (compared with `PartialEq`); `S` is the
/// sub-sort key used to order records sharing a boundary.
#[derive(Debug, Clone)]
pub struct SubRangeMap<D, R, S> {
    spans: BTreeMap<D, SubRange<D, R, S>>,
}

impl<D, R, S> Default for SubRangeMap<D, R, S>
where
    D: LinearDomain,
{
    fn default() -> Self {
        Self { spans: BTreeMap::new() }
    }
}

/// A view of one disjoint sub-range returned by queries.
pub struct SubRangeView<'a, D, R, S> {
    pub first: D,
    pub last: D,
    covering: &'a [Entry<R, S>],
}

impl<'a, D, R, S> SubRangeView<'a, D, R, S> {
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.covering.iter().map(|e| &e.record)
    }
}

impl<D, R, S> SubRangeMap<D, R, S>
where
    D: LinearDomain,
    R: Clone + PartialEq,
    S: Clone + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Splits the sub-range (if any) that straddles `point` so that `point`
    /// becomes the start of its own sub-range. This is the "unzip"
    /// operation of §4.2.
    fn unzip(&mut self, point: D) {
        let Some((&start, span)) = self
            .spans
            .range(..point)
            .next_back()
            .map(|(k, v)| (k, v.clone()))
        else {
            return;
        };
        if start == point || span.end < point {
            return;
        }
        // span covers [start, span.end] and start < point <= span.end:
        // split into [start, pred(point)] and [point, span.end].
        let pred = point.pred().expect("point has a predecessor: start < point");
        self.spans.get_mut(&start).unwrap().end = pred;
        self.spans.insert(point, SubRange { end: span.end, covering: span.covering });
    }

    /// Inserts `record` (ordered among co-located records by `subsort`) over
    /// the inclusive range `[a, b]`.
    pub fn insert(&mut self, record: R, a: D, b: D, subsort: S) {
        debug_assert!(a <= b, "insert with empty range");
        self.unzip(a);
        if let Some(succ) = b.succ() {
            self.unzip(succ);
        }

        // Collect the boundary starts that now lie within [a, b], plus any
        // gaps between them that need a fresh sub-range of their own.
        let mut cursor = a;
        loop {
            match self.spans.range(cursor..=b).next().map(|(&k, _)| k) {
                Some(next_start) if next_start == cursor => {
                    let span = self.spans.get_mut(&cursor).unwrap();
                    if !span.covering.iter().any(|e| e.record == record) {
                        span.covering.push(Entry { record: record.clone(), subsort: subsort.clone() });
                        span.covering.sort_by(|x, y| x.subsort.cmp(&y.subsort));
                    }
                    let after = span.end;
                    cursor = match after.succ() {
                        Some(c) if c <= b => c,
                        _ => break,
                    };
                }
                Some(next_start) => {
                    // gap [cursor, pred(next_start)]
                    let gap_end = next_start.pred().unwrap();
                    self.spans.insert(
                        cursor,
                        SubRange { end: gap_end, covering: vec![Entry { record: record.clone(), subsort: subsort.clone() }] },
                    );
                    cursor = next_start;
                }
                None => {
                    // no more existing sub-ranges up to b: fill the rest.
                    self.spans.insert(
                        cursor,
                        SubRange { end: b, covering: vec![Entry { record: record.clone(), subsort: subsort.clone() }] },
                    );
                    break;
                }
            }
            if cursor > b {
                break;
            }
        }
    }

    /// Removes every sub-range membership belonging to `record`, fusing
    /// ("zip") adjacent sub-ranges left with identical covering sets.
    pub fn erase(&mut self, record: &R) {
        let starts: Vec<D> = self.spans.keys().copied().collect();
        for start in starts {
            if let Some(span) = self.spans.get_mut(&start) {
                span.covering.retain(|e| &e.record != record);
                if span.covering.is_empty() {
                    self.spans.remove(&start);
                }
            }
        }
        self.zip_all();
    }

    /// Fuses every run of adjacent sub-ranges that share an identical
    /// covering-record set (order-insensitive).
    fn zip_all(&mut self) {
        loop {
            let starts: Vec<D> = self.spans.keys().copied().collect();
            let mut fused_any = false;
            for pair in starts.windows(2) {
                let (cur_start, next_start) = (pair[0], pair[1]);
                let Some(cur) = self.spans.get(&cur_start) else { continue };
                let Some(next) = self.spans.get(&next_start) else { continue };
                if cur.end.succ() == Some(next_start) && same_record_set(&cur.covering, &next.covering) {
                    let next = self.spans.remove(&next_start).unwrap();
                    self.spans.get_mut(&cur_start).unwrap().end = next.end;
                    fused_any = true;
                }
            }
            if !fused_any {
                break;
            }
        }
    }

    pub fn find(&self, point: D) -> Option<SubRangeView<'_, D, R, S>> {
        let (&start, span) = self.spans.range(..=point).next_back()?;
        if span.end < point {
            return None;
        }
        Some(SubRangeView { first: start, last: span.end, covering: &span.covering })
    }

    /// Returns the first (lowest-starting) sub-range intersecting `[a, b]`.
    pub fn find_overlap(&self, a: D, b: D) -> Option<SubRangeView<'_, D, R, S>> {
        if let Some((&start, span)) = self.spans.range(..=a).next_back() {
            if span.end >= a {
                return Some(SubRangeView { first: start, last: span.end, covering: &span.covering });
            }
        }
        let (&start, span) = self.spans.range(a..=b).next()?;
        Some(SubRangeView { first: start, last: span.end, covering: &span.covering })
    }

    /// Iterates all disjoint sub-ranges in ascending order, for debugging
    /// and for the invariant checks of §8.
    pub fn iter(&self) -> impl Iterator<Item = SubRangeView<'_, D, R, S>> {
        self.spans.iter().map(|(&start, span)| SubRangeView { first: start, last: span.end, covering: &span.covering })
    }
}

fn same_record_set<R: PartialEq, S>(a: &[Entry<R, S>], b: &[Entry<R, S>]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|x| b.iter().any(|y| y.record == x.record))
}
