//! # Topology Module
//!
//! Rooted trees over a communicator's ranks, used to structure collective
//! communication. Three shapes are supported:
//!
//! - **Flat**: the root parents every other rank directly. Cheap to set up,
//!   root-bound; only sensible for small cohorts.
//! - **Binomial**: the classic hypercube-style construction. With
//!   `d = ceil(log2(size))` levels, relative rank `r` at level `k`
//!   communicates with `r XOR 2^k`, giving logarithmic depth.
//! - **StaticFanout**: a level-order balanced tree with a configurable
//!   number of children per interior node; the parent of relative rank
//!   `i > 0` is `(i - 1) / fanout`.
//!
//! All construction happens in *relative* rank space,
//! `rel = (rank - root) mod size`, so any rank can serve as root. The
//! public accessors return global ranks.
//!
//! Trees are memoised per `(kind, root)` in a write-once [`TopologyCache`];
//! repeated lookups hand out the same `Arc` and allocate nothing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Shape family of a collective tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    Flat,
    Binomial,
    StaticFanout,
}

/// The local rank's view of one rooted tree: its parent, its children, and
/// the descendants below each child. All ranks are global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    kind: TreeKind,
    size: u32,
    rank: u32,
    root: u32,
    parent: Option<u32>,
    children: Vec<u32>,
    descendants: Vec<Vec<u32>>,
}

impl Topology {
    /// Build the local view of the `(kind, root)` tree for `rank` in a
    /// cohort of `size`. `fanout` only matters for static-fanout trees.
    pub fn build(kind: TreeKind, size: u32, rank: u32, root: u32, fanout: u32) -> Topology {
        debug_assert!(size > 0 && rank < size && root < size);
        let rel = (rank + size - root) % size;
        let glob = |r: u32| (r + root) % size;

        let parent = rel_parent(kind, rel, fanout).map(glob);
        let child_rels = rel_children(kind, rel, size, fanout);

        // Per child, every transitive descendant below it (the child itself
        // excluded), collected depth-first.
        let descendants = child_rels
            .iter()
            .map(|&c| {
                let mut out = Vec::new();
                let mut stack = rel_children(kind, c, size, fanout);
                while let Some(d) = stack.pop() {
                    out.push(glob(d));
                    stack.extend(rel_children(kind, d, size, fanout));
                }
                out.sort_unstable();
                out
            })
            .collect();

        Topology {
            kind,
            size,
            rank,
            root,
            parent,
            children: child_rels.into_iter().map(glob).collect(),
            descendants,
        }
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Global rank of this rank's parent, `None` at the root.
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Global ranks of this rank's children.
    pub fn children(&self) -> &[u32] {
        &self.children
    }

    /// Global ranks strictly below `child` in this rank's subtree view.
    /// `child` must be one of [`children`](Self::children).
    pub fn descendants(&self, child: u32) -> &[u32] {
        let idx = self
            .children
            .iter()
            .position(|&c| c == child)
            .expect("descendants queried for a non-child rank");
        &self.descendants[idx]
    }
}

fn rel_parent(kind: TreeKind, rel: u32, fanout: u32) -> Option<u32> {
    if rel == 0 {
        return None;
    }
    Some(match kind {
        TreeKind::Flat => 0,
        // Clear the lowest set bit: the node at level k hangs under
        // rel XOR 2^k, and its subtree is the contiguous run
        // [rel, rel + 2^k).
        TreeKind::Binomial => rel & (rel - 1),
        TreeKind::StaticFanout => (rel - 1) / fanout,
    })
}

fn rel_children(kind: TreeKind, rel: u32, size: u32, fanout: u32) -> Vec<u32> {
    match kind {
        TreeKind::Flat => {
            if rel == 0 {
                (1..size).collect()
            } else {
                Vec::new()
            }
        }
        TreeKind::Binomial => {
            // Children of r are r + 2^k for every 2^k below r's lowest set
            // bit (every power of two for the root).
            let lowest = if rel == 0 { size } else { rel & rel.wrapping_neg() };
            let mut out = Vec::new();
            let mut bit = 1;
            while bit < lowest && rel + bit < size {
                out.push(rel + bit);
                bit <<= 1;
            }
            out
        }
        TreeKind::StaticFanout => (rel * fanout + 1..=rel * fanout + fanout)
            .filter(|&c| c < size)
            .collect(),
    }
}

/// Memoised tree shapes for one communicator, keyed by `(kind, root)`.
/// Entries are written once and shared as `Arc`s thereafter.
#[derive(Debug, Default)]
pub(crate) struct TopologyCache {
    entries: Mutex<HashMap<(TreeKind, u32), Arc<Topology>>>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the `(kind, root)` tree, building it on first use.
    pub fn get(
        &self,
        kind: TreeKind,
        size: u32,
        rank: u32,
        root: u32,
        fanout: u32,
    ) -> Arc<Topology> {
        let mut entries = self.entries.lock();
        entries
            .entry((kind, root))
            .or_insert_with(|| Arc::new(Topology::build(kind, size, rank, root, fanout)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn views(kind: TreeKind, size: u32, root: u32, fanout: u32) -> Vec<Topology> {
        (0..size)
            .map(|r| Topology::build(kind, size, r, root, fanout))
            .collect()
    }

    #[test]
    fn test_flat_tree() {
        let t = views(TreeKind::Flat, 5, 0, 0);
        assert_eq!(t[0].parent(), None);
        assert_eq!(t[0].children(), &[1, 2, 3, 4]);
        for view in &t[1..] {
            assert_eq!(view.parent(), Some(0));
            assert!(view.children().is_empty());
        }
    }

    #[test]
    fn test_binomial_tree_structure() {
        let t = views(TreeKind::Binomial, 8, 0, 0);
        assert_eq!(t[0].children(), &[1, 2, 4]);
        assert_eq!(t[2].children(), &[3]);
        assert_eq!(t[4].children(), &[5, 6]);
        assert_eq!(t[6].children(), &[7]);
        for leaf in [1, 3, 5, 7] {
            assert!(t[leaf].children().is_empty());
        }
        assert_eq!(t[3].parent(), Some(2));
        assert_eq!(t[5].parent(), Some(4));
        assert_eq!(t[6].parent(), Some(4));
        assert_eq!(t[7].parent(), Some(6));

        // Subtrees are contiguous relative-rank ranges.
        assert_eq!(t[0].descendants(4), &[5, 6, 7]);
        assert_eq!(t[0].descendants(2), &[3]);
        assert_eq!(t[4].descendants(6), &[7]);
    }

    #[test]
    fn test_binomial_with_offset_root() {
        // root=2, size=4: relative ranks map to globals 2,3,0,1.
        let view = Topology::build(TreeKind::Binomial, 4, 2, 2, 0);
        assert_eq!(view.parent(), None);
        assert_eq!(view.children(), &[3, 0]);
        assert_eq!(view.descendants(0), &[1]);

        let leaf = Topology::build(TreeKind::Binomial, 4, 1, 2, 0);
        assert_eq!(leaf.parent(), Some(0));
        assert!(leaf.children().is_empty());
    }

    #[test]
    fn test_static_fanout_tree() {
        let t = views(TreeKind::StaticFanout, 7, 0, 2);
        assert_eq!(t[0].children(), &[1, 2]);
        assert_eq!(t[1].children(), &[3, 4]);
        assert_eq!(t[2].children(), &[5, 6]);
        assert_eq!(t[5].parent(), Some(2));
        assert!(t[6].children().is_empty());
        assert_eq!(t[0].descendants(1), &[3, 4]);
    }

    #[test]
    fn test_every_rank_reachable() {
        for kind in [TreeKind::Flat, TreeKind::Binomial, TreeKind::StaticFanout] {
            for size in [1u32, 2, 3, 6, 11, 16] {
                for root in [0, size - 1] {
                    let root_view = Topology::build(kind, size, root, root, 3);
                    let mut seen = vec![root];
                    for &c in root_view.children() {
                        seen.push(c);
                        seen.extend_from_slice(root_view.descendants(c));
                    }
                    seen.sort_unstable();
                    let expected: Vec<u32> = (0..size).collect();
                    assert_eq!(seen, expected, "{kind:?} size={size} root={root}");
                }
            }
        }
    }

    #[test]
    fn test_cache_returns_shared_tree() {
        let cache = TopologyCache::new();
        let a = cache.get(TreeKind::Binomial, 8, 3, 0, 0);
        let b = cache.get(TreeKind::Binomial, 8, 3, 0, 0);
        // Same Arc: the second lookup built nothing.
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, *b);

        let other_root = cache.get(TreeKind::Binomial, 8, 3, 1, 0);
        assert!(!Arc::ptr_eq(&a, &other_root));
    }
}
