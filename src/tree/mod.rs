//! The Sequence Bloom Tree.
//!
//! ## Layout
//!
//! The tree is stored arena-style: two sparse maps keyed by position, one
//! for internal nodes and one for leaves, plus a set of positions known to
//! exist structurally but not yet materialized. Position 0 is the root.
//! Parent/child addressing is pure integer arithmetic
//! (`child = d * parent + slot + 1`), so no pointers are persisted and the
//! save format stays flat.
//!
//! ## Operations
//!
//! - `insert` places a new leaf, demoting an existing leaf to a deeper
//!   position when its slot must become internal, then propagates the
//!   leaf's hashes and sketch size to every ancestor aggregate.
//! - `find` runs a pruning traversal driven by a pluggable
//!   [`SearchPolicy`](crate::search::SearchPolicy).
//! - `rebuild_node` lazily materializes missing internal nodes from their
//!   children; `fill_up` sweeps the whole tree bottom-up for bulk repair.
//! - `combine` merges two trees by level-order renumbering under a fresh
//!   unioned root.

pub mod node;

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use tracing::debug;

use crate::config::Factory;
use crate::errors::{Result, SbtError};
use crate::search::SearchPolicy;
use crate::sketch::Signature;
use crate::storage::Storage;

pub use node::{Leaf, Node, MIN_N_BELOW};

const fn parent_of(pos: u64, d: u64) -> u64 {
    (pos - 1) / d
}

const fn child_of(parent: u64, slot: u64, d: u64) -> u64 {
    d * parent + slot + 1
}

/// Resolution of one tree position: internal node or leaf.
#[derive(Debug)]
pub enum TreeEntry<'a> {
    /// Position holds an internal node.
    Internal(&'a Node),
    /// Position holds a leaf.
    Terminal(&'a Leaf),
}

/// A position paired with whatever occupies it, if anything.
#[derive(Debug)]
pub struct NodePos<'a> {
    /// The position in the addressing scheme.
    pub pos: u64,
    /// The occupant, or `None` for an empty or merely-missing position.
    pub entry: Option<TreeEntry<'a>>,
}

/// Visit order for the generic traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Stack-driven descent (default).
    DepthFirst,
    /// Queue-driven level sweep.
    BreadthFirst,
}

/// Sequence Bloom Tree over position-indexed nodes and leaves.
pub struct Sbt {
    d: u32,
    factory: Factory,
    storage: Option<Rc<dyn Storage>>,
    pub(crate) nodes: HashMap<u64, Node>,
    pub(crate) leaves: HashMap<u64, Leaf>,
    pub(crate) missing_nodes: HashSet<u64>,
}

impl Sbt {
    /// Empty binary tree using `factory` for internal aggregates.
    pub fn new(factory: Factory) -> Self {
        Self::with_d(factory, 2)
    }

    /// Empty tree with branching factor `d` (must be at least 2).
    pub fn with_d(factory: Factory, d: u32) -> Self {
        assert!(d >= 2, "branching factor must be at least 2");
        Self {
            d,
            factory,
            storage: None,
            nodes: HashMap::new(),
            leaves: HashMap::new(),
            missing_nodes: HashSet::new(),
        }
    }

    pub(crate) fn from_parts(
        d: u32,
        factory: Factory,
        storage: Option<Rc<dyn Storage>>,
        nodes: HashMap<u64, Node>,
        leaves: HashMap<u64, Leaf>,
        missing_nodes: HashSet<u64>,
    ) -> Self {
        Self {
            d,
            factory,
            storage,
            nodes,
            leaves,
            missing_nodes,
        }
    }

    /// Branching factor.
    pub fn d(&self) -> u32 {
        self.d
    }

    /// Factory shared by every internal node.
    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    /// Attached storage backend, if any.
    pub fn storage(&self) -> Option<Rc<dyn Storage>> {
        self.storage.clone()
    }

    /// Attach a storage backend; propagated to entities on save/load.
    pub fn set_storage(&mut self, storage: Option<Rc<dyn Storage>>) {
        self.storage = storage;
    }

    /// Number of leaves (signatures) in the tree.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// True if no signature was inserted yet.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty() && self.nodes.is_empty()
    }

    // ---- addressing -----------------------------------------------------

    /// Parent position, or `None` for the root.
    #[inline]
    pub fn parent_pos(&self, pos: u64) -> Option<u64> {
        if pos == 0 {
            None
        } else {
            Some(parent_of(pos, u64::from(self.d)))
        }
    }

    /// Position of `slot`-th child (`slot` in `0..d`).
    #[inline]
    pub fn child_pos(&self, parent: u64, slot: u64) -> u64 {
        child_of(parent, slot, u64::from(self.d))
    }

    /// All `d` child positions of `pos`.
    #[inline]
    pub fn children_pos(&self, pos: u64) -> Vec<u64> {
        (0..u64::from(self.d)).map(|s| self.child_pos(pos, s)).collect()
    }

    /// Resolve whatever occupies `pos`.
    pub fn entry(&self, pos: u64) -> Option<TreeEntry<'_>> {
        if let Some(node) = self.nodes.get(&pos) {
            Some(TreeEntry::Internal(node))
        } else {
            self.leaves.get(&pos).map(TreeEntry::Terminal)
        }
    }

    /// Parent of `pos` as a resolved [`NodePos`]; `None` for the root.
    pub fn parent(&self, pos: u64) -> Option<NodePos<'_>> {
        let ppos = self.parent_pos(pos)?;
        Some(NodePos {
            pos: ppos,
            entry: self.entry(ppos),
        })
    }

    /// The `d` children of `pos` as resolved [`NodePos`] values.
    pub fn children(&self, pos: u64) -> Vec<NodePos<'_>> {
        self.children_pos(pos)
            .into_iter()
            .map(|c| NodePos {
                pos: c,
                entry: self.entry(c),
            })
            .collect()
    }

    pub(crate) fn occupied(&self, pos: u64) -> bool {
        self.nodes.contains_key(&pos)
            || self.leaves.contains_key(&pos)
            || self.missing_nodes.contains(&pos)
    }

    // ---- insertion ------------------------------------------------------

    /// Next position for a new leaf: fill structural gaps left below the
    /// smallest current leaf before extending past the largest one.
    fn new_node_pos(&self) -> u64 {
        if self.nodes.is_empty() && self.leaves.is_empty() {
            return 0;
        }
        if self.nodes.len() == 1 && self.leaves.is_empty() {
            return 1;
        }

        let min_leaf = self.leaves.keys().min().copied().unwrap_or(0);
        for pos in 0..min_leaf {
            if !self.occupied(pos) {
                return pos;
            }
        }

        self.leaves
            .keys()
            .max()
            .map(|m| m + 1)
            .unwrap_or_else(|| self.nodes.keys().max().map(|m| m + 1).unwrap_or(0))
    }

    fn new_internal(&self, pos: u64) -> Node {
        let mut node = Node::new(format!("internal.{}", pos), self.factory.create());
        node.set_storage(self.storage.clone());
        node
    }

    /// Insert a signature, wrapping it in a fresh leaf.
    pub fn insert(&mut self, signature: Signature) -> Result<()> {
        let mut leaf = Leaf::new(signature);
        leaf.set_storage(self.storage.clone());
        self.add_node(leaf)
    }

    /// Place `leaf` so the tree stays properly structured, then propagate
    /// its hashes and sketch size to every ancestor aggregate. Either the
    /// leaf lands and every ancestor is updated, or the tree is left
    /// unchanged and the error surfaces.
    pub fn add_node(&mut self, leaf: Leaf) -> Result<()> {
        if self.is_empty() {
            self.leaves.insert(0, leaf);
            return Ok(());
        }

        let pos = self.new_node_pos();
        let parent_pos = match self.parent_pos(pos) {
            Some(p) => p,
            None => {
                self.leaves.insert(0, leaf);
                return Ok(());
            }
        };

        if self.leaves.contains_key(&parent_pos) {
            // The parent slot holds a leaf that must become internal:
            // demote it one level and pair it with the newcomer.
            return self.demote_and_pair(parent_pos, leaf);
        }

        // Fault in everything fallible before touching the tree, so a
        // failed load cannot leave a half-committed insert.
        leaf.data()?;
        self.prepare_ancestors(pos)?;

        let pnode = self.nodes.get_mut(&parent_pos).expect("ancestors prepared above");
        leaf.update(pnode)?;
        self.leaves.insert(pos, leaf);

        self.propagate_up(pos, parent_pos)
    }

    /// Place `leaf` at an unoccupied position whose parent chain already
    /// exists, then propagate it upward. Used by the locality-aware
    /// insertion variant.
    pub(crate) fn place_leaf_at(&mut self, pos: u64, leaf: Leaf) -> Result<()> {
        debug_assert!(!self.occupied(pos), "position {} already occupied", pos);
        leaf.data()?;
        self.prepare_ancestors(pos)?;
        self.leaves.insert(pos, leaf);
        self.propagate_up(pos, pos)
    }

    /// Turn the leaf at `pos` into an internal node with that leaf and the
    /// newcomer as its children, then propagate the newcomer upward.
    pub(crate) fn demote_and_pair(&mut self, pos: u64, leaf: Leaf) -> Result<()> {
        // Build the replacement node locally before mutating the tree;
        // every fallible load happens here or in the ancestor preparation.
        let mut new_node = self.new_internal(pos);
        {
            let incumbent = self.leaves.get(&pos).expect("demoted position holds a leaf");
            incumbent.update(&mut new_node)?;
        }
        leaf.update(&mut new_node)?;
        self.prepare_ancestors(pos)?;

        let incumbent = self.leaves.remove(&pos).expect("checked above");
        let c0 = self.child_pos(pos, 0);
        let c1 = self.child_pos(pos, 1);
        self.leaves.insert(c0, incumbent);
        self.leaves.insert(c1, leaf);
        self.nodes.insert(pos, new_node);

        self.propagate_up(c1, pos)
    }

    /// Materialize and load every ancestor of `pos` so a later update walk
    /// cannot fail with the tree partially mutated.
    fn prepare_ancestors(&mut self, pos: u64) -> Result<()> {
        let mut current = pos;
        while let Some(ppos) = self.parent_pos(current) {
            if !self.nodes.contains_key(&ppos) {
                self.rebuild_node(ppos)?;
            } else {
                self.nodes[&ppos].data()?;
            }
            current = ppos;
        }
        Ok(())
    }

    /// Union the leaf at `leaf_pos` into every ancestor strictly above
    /// `from`. Ancestors must already be materialized and loaded.
    fn propagate_up(&mut self, leaf_pos: u64, from: u64) -> Result<()> {
        let mut current = from;
        while let Some(ppos) = self.parent_pos(current) {
            let placed = self.leaves.get(&leaf_pos).expect("placed above");
            let pnode = self.nodes.get_mut(&ppos).expect("ancestors prepared above");
            placed.update(pnode)?;
            current = ppos;
        }
        Ok(())
    }

    // ---- lazy repair ----------------------------------------------------

    /// Materialize the internal node at `pos` from its children. No-op if
    /// the position is already materialized; idempotent otherwise.
    pub fn rebuild_node(&mut self, pos: u64) -> Result<()> {
        if self.nodes.contains_key(&pos) {
            return Ok(());
        }
        debug!(pos, "rebuilding internal node");

        let mut new_node = self.new_internal(pos);
        for cpos in self.children_pos(pos) {
            if self.missing_nodes.contains(&cpos) {
                self.rebuild_node(cpos)?;
            }
            if let Some(child) = self.nodes.get(&cpos) {
                child.update(&mut new_node)?;
            } else if let Some(child) = self.leaves.get(&cpos) {
                child.update(&mut new_node)?;
            }
        }

        self.nodes.insert(pos, new_node);
        self.missing_nodes.remove(&pos);
        Ok(())
    }

    /// Bottom-up sweep: starting from every leaf, walk to the root applying
    /// `pass` to each internal position exactly once, children before
    /// parents.
    pub fn fill_up<F>(&mut self, mut pass: F) -> Result<()>
    where
        F: FnMut(&mut Self, u64) -> Result<()>,
    {
        let mut scheduled: HashSet<u64> = HashSet::new();
        let mut heap: BinaryHeap<u64> = self.leaves.keys().copied().collect();

        // Max-heap order: every child position is strictly greater than its
        // parent, so popping the largest position first guarantees all
        // descendants of an internal position were handled before it.
        while let Some(pos) = heap.pop() {
            if !self.leaves.contains_key(&pos) {
                pass(self, pos)?;
            }
            if let Some(ppos) = self.parent_pos(pos) {
                if scheduled.insert(ppos) {
                    heap.push(ppos);
                }
            }
        }
        Ok(())
    }

    /// Recompute `min_n_below` for every internal node from the leaf sizes
    /// upward. Required after loading formats that did not persist it.
    pub fn repair_min_n_below(&mut self) -> Result<()> {
        self.fill_up(|tree, pos| {
            let mut min = u64::MAX;
            for cpos in tree.children_pos(pos) {
                // An unmaterialized child still bounds this subtree, so it
                // must be rebuilt before taking the minimum. Its own
                // descendants were already repaired (children are processed
                // before parents).
                if tree.missing_nodes.contains(&cpos) {
                    tree.rebuild_node(cpos)?;
                }
                if let Some(child) = tree.nodes.get(&cpos) {
                    if let Some(m) = child.min_n_below() {
                        min = min.min(m);
                    }
                } else if let Some(child) = tree.leaves.get(&cpos) {
                    min = min.min(child.data()?.size() as u64);
                }
            }
            if min != u64::MAX {
                if let Some(node) = tree.nodes.get_mut(&pos) {
                    node.set_min_n_below(min);
                }
            }
            Ok(())
        })
    }

    /// Materialize every missing internal node eagerly instead of waiting
    /// for a traversal to reach it.
    pub fn repair_internal(&mut self) -> Result<()> {
        self.fill_up(|tree, pos| tree.rebuild_node(pos))
    }

    /// Record every unmaterialized ancestor of an occupied position as a
    /// missing node, restoring the parent-occupancy invariant.
    pub(crate) fn record_structural_holes(&mut self) {
        let occupied: Vec<u64> = self.nodes.keys().chain(self.leaves.keys()).copied().collect();
        for start in occupied {
            let mut pos = start;
            while let Some(ppos) = self.parent_pos(pos) {
                if !self.nodes.contains_key(&ppos) {
                    self.missing_nodes.insert(ppos);
                }
                pos = ppos;
            }
        }
    }

    // ---- search ---------------------------------------------------------

    /// Depth-first pruning search; see [`find_with`](Self::find_with).
    pub fn find(
        &mut self,
        policy: &mut dyn SearchPolicy,
        query: &Signature,
    ) -> Result<Vec<&Leaf>> {
        self.find_with(policy, query, Traversal::DepthFirst)
    }

    /// Pruning traversal from the root: positions where the policy returns
    /// `false` are pruned along with their whole subtree; leaves where it
    /// returns `true` are collected. Missing internal nodes are rebuilt on
    /// the way down. Each position is visited at most once.
    pub fn find_with(
        &mut self,
        policy: &mut dyn SearchPolicy,
        query: &Signature,
        order: Traversal,
    ) -> Result<Vec<&Leaf>> {
        let mut matches: Vec<u64> = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<u64> = VecDeque::new();
        if !self.is_empty() {
            queue.push_back(0);
        }

        while let Some(pos) = match order {
            Traversal::DepthFirst => queue.pop_back(),
            Traversal::BreadthFirst => queue.pop_front(),
        } {
            if !visited.insert(pos) {
                continue;
            }

            if self.missing_nodes.contains(&pos) {
                self.rebuild_node(pos)?;
            }

            if let Some(node) = self.nodes.get(&pos) {
                if policy.check_internal(node, query)? {
                    for c in self.children_pos(pos) {
                        queue.push_back(c);
                    }
                }
            } else if let Some(leaf) = self.leaves.get(&pos) {
                if policy.check_leaf(leaf.data()?, query)? {
                    matches.push(pos);
                }
            }
        }

        Ok(matches.iter().map(|p| &self.leaves[p]).collect())
    }

    // ---- accessors ------------------------------------------------------

    /// Every leaf in the tree, position order not guaranteed.
    pub fn leaves(&self) -> Vec<&Leaf> {
        self.leaves.values().collect()
    }

    /// Every leaf paired with its position.
    pub fn iter_leaves(&self) -> impl Iterator<Item = (u64, &Leaf)> {
        self.leaves.iter().map(|(&pos, leaf)| (pos, leaf))
    }

    /// Clones of every signature in the tree (forces lazy loads).
    pub fn signatures(&self) -> Result<Vec<Signature>> {
        self.leaves.values().map(|l| l.data().cloned()).collect()
    }

    // ---- combination ----------------------------------------------------

    /// Merge two trees: the larger one's rows are renumbered first at every
    /// level, the smaller one's after, under a fresh root unioned from both
    /// old roots. Leaf sets combine exactly; internal structure is rebuilt
    /// as an over-approximation and tightened by later repair passes.
    pub fn combine(self, other: Sbt) -> Result<Sbt> {
        if self.factory.args() != other.factory.args() {
            return Err(SbtError::FactoryMismatch {
                loaded: other.factory.args(),
                expected: self.factory.args(),
            });
        }

        let d = self.d;
        let (mut larger, mut smaller) = if other.leaves.len() > self.leaves.len() {
            (other, self)
        } else {
            (self, other)
        };
        debug!(
            larger = larger.leaves.len(),
            smaller = smaller.leaves.len(),
            "combining trees"
        );

        let factory = larger.factory.clone();
        let storage = larger.storage.clone();

        let mut root = Node::new("internal.0", factory.create());
        root.set_storage(storage.clone());
        for tree in [&mut larger, &mut smaller] {
            if tree.missing_nodes.contains(&0) {
                tree.rebuild_node(0)?;
            }
            if let Some(n) = tree.nodes.get(&0) {
                n.update(&mut root)?;
            } else if let Some(l) = tree.leaves.get(&0) {
                l.update(&mut root)?;
            }
        }

        let max_pos = larger
            .nodes
            .keys()
            .chain(larger.leaves.keys())
            .chain(smaller.nodes.keys())
            .chain(smaller.leaves.keys())
            .max()
            .copied()
            .unwrap_or(0);

        let mut nodes: HashMap<u64, Node> = HashMap::new();
        let mut leaves: HashMap<u64, Leaf> = HashMap::new();
        let mut current_pos: u64 = 1;
        let (mut start, mut end) = (0u64, 1u64);

        while start <= max_pos {
            for tree in [&larger, &smaller] {
                for pos in start..end {
                    if let Some(n) = tree.nodes.get(&pos) {
                        let mut n = n.clone();
                        n.set_name(format!("internal.{}", current_pos));
                        nodes.insert(current_pos, n);
                    } else if let Some(l) = tree.leaves.get(&pos) {
                        leaves.insert(current_pos, l.clone());
                    }
                    current_pos += 1;
                }
            }
            start = end;
            end = end * u64::from(d) + 1;
        }

        nodes.insert(0, root);

        let mut combined = Sbt::from_parts(d, factory, storage, nodes, leaves, HashSet::new());
        combined.record_structural_holes();
        Ok(combined)
    }
}

impl std::fmt::Debug for Sbt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sbt")
            .field("d", &self.d)
            .field("nodes", &self.nodes.len())
            .field("leaves", &self.leaves.len())
            .field("missing_nodes", &self.missing_nodes.len())
            .finish()
    }
}
