//! Basic-block graph (C5): owns blocks, edges, and two hierarchies — the
//! raw CFG and a structured tree recomputed lazily after every edit.

use std::collections::{HashSet, VecDeque};

use crate::address::AddressRange;
use crate::operation::OpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BlockId(pub u32);

crate::bitflags_like! {
    /// Basic-block flags (§3).
    pub struct BlockFlags: u32 {
        const ENTRY                 = 1 << 0;
        const DEAD                  = 1 << 1;
        const SWITCH_OUT            = 1 << 2;
        const DUPLICATE             = 1 << 3;
        const JOINED                = 1 << 4;
        const DEFAULT_SWITCH_TARGET = 1 << 5;
    }
}

/// Per-out-edge annotation: which successor edges are "goto" (non-fall
/// through / non-structured) branches, tracked so the structured-tree
/// builder can fall back to an explicit goto node for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeFlags {
    pub is_goto: bool,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub index: BlockId,
    pub ops: Vec<OpId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub out_edge_flags: Vec<EdgeFlags>,
    pub flags: BlockFlags,
    pub dominator: Option<BlockId>,
    pub loop_headers: Vec<BlockId>,
    pub code_range: Option<AddressRange>,
}

impl BasicBlock {
    fn new(index: BlockId) -> Self {
        Self {
            index,
            ops: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            out_edge_flags: Vec::new(),
            flags: BlockFlags::empty(),
            dominator: None,
            loop_headers: Vec::new(),
            code_range: None,
        }
    }
}

/// A node of the recomputed structured tree (§3 "Basic block graph").
/// This is a simplified, spec-faithful structuring: natural loops
/// (detected via dominator back-edges) become `While`/`InfiniteLoop`
/// wrappers, single-entry/single-exit diamonds dominated by a two-way
/// branch become `IfThen`/`IfElse`, and anything the pass cannot collapse
/// (irreducible flow, cross-loop jumps) is left as an explicit `Goto` node
/// rather than guessed at — see DESIGN.md for the open-question resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredNode {
    Leaf(BlockId),
    Sequence(Vec<StructuredNode>),
    IfThen { cond: BlockId, body: Box<StructuredNode> },
    IfElse { cond: BlockId, then_body: Box<StructuredNode>, else_body: Box<StructuredNode> },
    While { header: BlockId, body: Box<StructuredNode> },
    DoWhile { header: BlockId, body: Box<StructuredNode> },
    Switch { header: BlockId, cases: Vec<StructuredNode> },
    InfiniteLoop { body: Box<StructuredNode> },
    Goto(BlockId),
}

#[derive(Default)]
pub struct BlockGraph {
    blocks: Vec<Option<BasicBlock>>,
    free_list: Vec<BlockId>,
    entry: Option<BlockId>,
    structured: Option<StructuredNode>,
    dirty: bool,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self { dirty: true, ..Self::default() }
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0 as usize).and_then(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.0 as usize).and_then(|b| b.as_mut())
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.structured = None;
    }

    /// Creates a new, edge-less basic block.
    pub fn new_block_basic(&mut self) -> BlockId {
        let id = if let Some(id) = self.free_list.pop() {
            self.blocks[id.0 as usize] = Some(BasicBlock::new(id));
            id
        } else {
            let id = BlockId(self.blocks.len() as u32);
            self.blocks.push(Some(BasicBlock::new(id)));
            id
        };
        if self.entry.is_none() {
            self.entry = Some(id);
            self.get_mut(id).unwrap().flags.insert(BlockFlags::ENTRY);
        }
        self.mark_dirty();
        id
    }

    /// Removes a block with no remaining edges. Callers must detach phi
    /// inputs in successors (`removeFromFlow`, implemented at the function
    /// container level where operation/value stores are reachable) before
    /// calling this.
    pub fn remove_block(&mut self, id: BlockId) {
        let block = self.blocks[id.0 as usize].take().expect("unknown block");
        debug_assert!(block.preds.is_empty() && block.succs.is_empty(), "remove_block requires a detached block");
        if self.entry == Some(id) {
            self.entry = None;
        }
        self.free_list.push(id);
        self.mark_dirty();
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        {
            let f = self.get_mut(from).expect("unknown block");
            f.succs.push(to);
            f.out_edge_flags.push(EdgeFlags::default());
        }
        self.get_mut(to).expect("unknown block").preds.push(from);
        self.mark_dirty();
    }

    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        {
            let f = self.get_mut(from).expect("unknown block");
            if let Some(pos) = f.succs.iter().position(|&b| b == to) {
                f.succs.remove(pos);
                f.out_edge_flags.remove(pos);
            }
        }
        let t = self.get_mut(to).expect("unknown block");
        if let Some(pos) = t.preds.iter().position(|&b| b == from) {
            t.preds.remove(pos);
        }
        self.mark_dirty();
    }

    /// Retargets the edge `from -> old` to `from -> new`, preserving edge
    /// position (and thus phi input slot order in `old`'s former
    /// successor).
    pub fn switch_edge(&mut self, from: BlockId, old: BlockId, new: BlockId) {
        let slot = {
            let f = self.get_mut(from).expect("unknown block");
            let slot = f.succs.iter().position(|&b| b == old).expect("edge not found");
            f.succs[slot] = new;
            slot
        };
        let _ = slot;
        {
            let o = self.get_mut(old).expect("unknown block");
            if let Some(pos) = o.preds.iter().position(|&b| b == from) {
                o.preds.remove(pos);
            }
        }
        self.get_mut(new).expect("unknown block").preds.push(from);
        self.mark_dirty();
    }

    /// Moves the out-edge at index `slot` of `from` so it originates from
    /// `new_from` instead (used when splicing a block in front of another).
    pub fn move_out_edge(&mut self, from: BlockId, slot: usize, new_from: BlockId) {
        let (to, edge_flags) = {
            let f = self.get_mut(from).expect("unknown block");
            let to = f.succs.remove(slot);
            let flags = f.out_edge_flags.remove(slot);
            (to, flags)
        };
        {
            let t = self.get_mut(to).expect("unknown block");
            if let Some(pos) = t.preds.iter().position(|&b| b == from) {
                t.preds[pos] = new_from;
            }
        }
        let nf = self.get_mut(new_from).expect("unknown block");
        nf.succs.push(to);
        nf.out_edge_flags.push(edge_flags);
        self.mark_dirty();
    }

    /// Inserts `middle` on the edge `from -> to`: `from -> middle -> to`.
    pub fn splice_block(&mut self, from: BlockId, to: BlockId, middle: BlockId) {
        self.remove_edge(from, to);
        self.add_edge(from, middle);
        self.add_edge(middle, to);
    }

    /// Blocks reachable from `start` by forward traversal.
    pub fn collect_reachable(&self, start: BlockId) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(block) = self.get(id) {
                for &succ in &block.succs {
                    queue.push_back(succ);
                }
            }
        }
        seen
    }

    fn all_block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().enumerate().filter_map(|(i, b)| b.as_ref().map(|_| BlockId(i as u32))).collect()
    }

    /// All live block ids, in arena order (not control-flow order). Used by
    /// passes (e.g. heritage's dominance-frontier computation) that need to
    /// visit every block regardless of reachability from the entry.
    pub fn ids(&self) -> Vec<BlockId> {
        self.all_block_ids()
    }

    fn reverse_postorder(&self, start: BlockId) -> Vec<BlockId> {
        let mut visited = HashSet::new();
        let mut postorder = Vec::new();
        let mut stack = vec![(start, 0usize)];
        visited.insert(start);
        while let Some((id, next_child)) = stack.pop() {
            let succs = &self.get(id).expect("unknown block").succs;
            if next_child < succs.len() {
                stack.push((id, next_child + 1));
                let child = succs[next_child];
                if visited.insert(child) {
                    stack.push((child, 0));
                }
            } else {
                postorder.push(id);
            }
        }
        postorder.reverse();
        postorder
    }

    /// Computes the immediate-dominator tree with the classic iterative
    /// data-flow algorithm (Cooper, Harvey & Kennedy), writing results into
    /// each block's `dominator` field.
    pub fn compute_dominators(&mut self) {
        let Some(entry) = self.entry else { return };
        let rpo = self.reverse_postorder(entry);
        let rpo_index: std::collections::HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: std::collections::HashMap<BlockId, Option<BlockId>> = rpo.iter().map(|&b| (b, None)).collect();
        idom.insert(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().filter(|&&b| b != entry) {
                let preds = &self.get(b).unwrap().preds;
                let mut new_idom = None;
                for &p in preds {
                    if idom.get(&p).copied().flatten().is_some() || p == entry {
                        new_idom = Some(match new_idom {
                            None => p,
                            Some(cur) => intersect(&idom, &rpo_index, cur, p),
                        });
                    }
                }
                if idom.get(&b).copied().flatten() != new_idom {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }

        for &b in &rpo {
            let dom = idom.get(&b).copied().flatten();
            if let Some(block) = self.get_mut(b) {
                block.dominator = if dom == Some(b) { None } else { dom };
            }
        }
    }

    /// Natural-loop headers: targets of a back edge `u -> v` where `v`
    /// dominates `u`. Populates each loop member's `loop_headers`.
    pub fn detect_loops(&mut self) {
        for id in self.all_block_ids() {
            if let Some(b) = self.get_mut(id) {
                b.loop_headers.clear();
            }
        }
        let ids = self.all_block_ids();
        for &u in &ids {
            let succs = self.get(u).unwrap().succs.clone();
            for v in succs {
                if self.dominates(v, u) {
                    let body = self.natural_loop_body(v, u);
                    for member in body {
                        let b = self.get_mut(member).unwrap();
                        if !b.loop_headers.contains(&v) {
                            b.loop_headers.push(v);
                        }
                    }
                }
            }
        }
    }

    fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = Some(b);
        while let Some(c) = cur {
            if c == a {
                return true;
            }
            cur = self.get(c).and_then(|blk| blk.dominator);
        }
        false
    }

    fn natural_loop_body(&self, header: BlockId, tail: BlockId) -> HashSet<BlockId> {
        let mut body = HashSet::from([header, tail]);
        let mut stack = vec![tail];
        while let Some(n) = stack.pop() {
            for &p in &self.get(n).unwrap().preds {
                if body.insert(p) {
                    stack.push(p);
                }
            }
        }
        body
    }

    /// Rebuilds the structured tree from the raw CFG. Any control-flow
    /// edit invalidates it; callers normally go through `structured()`,
    /// which rebuilds lazily.
    pub fn structure_loops(&mut self) {
        self.compute_dominators();
        self.detect_loops();
        let Some(entry) = self.entry else {
            self.structured = Some(StructuredNode::Sequence(vec![]));
            self.dirty = false;
            return;
        };
        let mut visited = HashSet::new();
        let node = self.structure_from(entry, &mut visited);
        self.structured = Some(node);
        self.dirty = false;
    }

    fn structure_from(&self, id: BlockId, visited: &mut HashSet<BlockId>) -> StructuredNode {
        if !visited.insert(id) {
            return StructuredNode::Goto(id);
        }
        let block = self.get(id).expect("unknown block");
        // `id` is itself a loop header iff it is a member of the loop it
        // heads, which `detect_loops` always includes by construction.
        let is_header = block.loop_headers.contains(&id);
        let body = match block.succs.len() {
            0 => StructuredNode::Leaf(id),
            1 => {
                let next = block.succs[0];
                let rest = self.structure_from(next, visited);
                StructuredNode::Sequence(vec![StructuredNode::Leaf(id), rest])
            }
            2 => {
                let (then_b, else_b) = (block.succs[0], block.succs[1]);
                let merge = self.immediate_postdominator_guess(then_b, else_b);
                let then_node = self.structure_branch(then_b, merge, visited);
                match merge {
                    Some(m) if else_b == m => StructuredNode::Sequence(vec![
                        StructuredNode::IfThen { cond: id, body: Box::new(then_node) },
                        self.structure_from(m, visited),
                    ]),
                    _ => {
                        let else_node = self.structure_branch(else_b, merge, visited);
                        let tail = merge.map(|m| self.structure_from(m, visited));
                        let ifelse = StructuredNode::IfElse {
                            cond: id,
                            then_body: Box::new(then_node),
                            else_body: Box::new(else_node),
                        };
                        match tail {
                            Some(t) => StructuredNode::Sequence(vec![ifelse, t]),
                            None => ifelse,
                        }
                    }
                }
            }
            _ => {
                let cases = block.succs.clone().into_iter().map(|c| self.structure_from(c, visited)).collect();
                StructuredNode::Switch { header: id, cases }
            }
        };
        if is_header {
            if block.succs.contains(&id) {
                StructuredNode::InfiniteLoop { body: Box::new(body) }
            } else {
                StructuredNode::While { header: id, body: Box::new(body) }
            }
        } else {
            body
        }
    }

    /// A conservative merge-point guess: the common block dominated by
    /// both branch targets that both eventually reach, found by walking the
    /// `then` branch's single-successor chain. Irreducible/cross joins fall
    /// back to `None`, which the caller renders as a `Goto`.
    fn immediate_postdominator_guess(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let reach_a = self.collect_reachable(a);
        let mut cur = b;
        let mut seen = HashSet::new();
        loop {
            if reach_a.contains(&cur) {
                return Some(cur);
            }
            if !seen.insert(cur) {
                return None;
            }
            let succs = &self.get(cur)?.succs;
            if succs.len() != 1 {
                return None;
            }
            cur = succs[0];
        }
    }

    fn structure_branch(&self, start: BlockId, stop_at: Option<BlockId>, visited: &mut HashSet<BlockId>) -> StructuredNode {
        if Some(start) == stop_at {
            return StructuredNode::Sequence(vec![]);
        }
        self.structure_from(start, visited)
    }

    pub fn structured(&mut self) -> &StructuredNode {
        if self.dirty || self.structured.is_none() {
            self.structure_loops();
        }
        self.structured.as_ref().unwrap()
    }
}

/// The `intersect` step of the Cooper/Harvey/Kennedy dominator algorithm:
/// walks both candidates up the (partial) idom chain using reverse
/// postorder number as the "finger" comparison.
fn intersect(
    idom: &std::collections::HashMap<BlockId, Option<BlockId>>,
    rpo_index: &std::collections::HashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[&a].expect("finger walked past root");
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[&b].expect("finger walked past root");
        }
    }
    a
}
