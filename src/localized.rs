//! Locality-aware insertion.
//!
//! Instead of always filling the next structural gap, this variant routes a
//! new signature next to the existing leaf it shares the most hashes with:
//! into a free sibling slot when one exists, otherwise by pushing that leaf
//! one level down and pairing the newcomer with it under a fresh parent.
//! Similar items end up under the same parent, which tightens node
//! aggregates and `min_n_below` bounds and lets searches prune harder.
//! Placement is a heuristic and depends on insertion order.

use crate::errors::Result;
use crate::sketch::Signature;
use crate::tree::{Leaf, Sbt};

/// A tree whose insertions co-locate similar signatures.
#[derive(Debug)]
pub struct LocalizedSbt {
    tree: Sbt,
}

impl LocalizedSbt {
    /// Wrap an empty or existing tree.
    pub fn new(tree: Sbt) -> Self {
        Self { tree }
    }

    /// Shared reference to the underlying tree (for searches).
    pub fn inner(&self) -> &Sbt {
        &self.tree
    }

    /// Mutable access to the underlying tree.
    pub fn inner_mut(&mut self) -> &mut Sbt {
        &mut self.tree
    }

    /// Unwrap into the plain tree.
    pub fn into_inner(self) -> Sbt {
        self.tree
    }

    /// Insert a signature next to its most similar existing leaf.
    pub fn insert(&mut self, signature: Signature) -> Result<()> {
        if self.tree.len() < 2 {
            return self.tree.insert(signature);
        }

        // Anchor: the leaf sharing the most hashes with the newcomer.
        // Ties break toward the lowest position for determinism.
        let mut anchor: Option<(u64, usize)> = None;
        for (pos, leaf) in self.tree.iter_leaves() {
            let common = leaf.data()?.count_common(&signature);
            let better = match anchor {
                None => true,
                Some((best_pos, best_common)) => {
                    common > best_common || (common == best_common && pos < best_pos)
                }
            };
            if better {
                anchor = Some((pos, common));
            }
        }

        let anchor_pos = match anchor {
            Some((pos, common)) if common > 0 => pos,
            // Nothing in common with any leaf: plain insertion.
            _ => return self.tree.insert(signature),
        };

        let parent_pos = match self.tree.parent_pos(anchor_pos) {
            Some(p) => p,
            // Anchor is a lone root leaf; plain insertion demotes it.
            None => return self.tree.insert(signature),
        };

        let mut leaf = Leaf::new(signature);
        leaf.set_storage(self.tree.storage());

        // Free sibling slot next to the anchor: take it.
        let free_slot = self
            .tree
            .children_pos(parent_pos)
            .into_iter()
            .find(|&c| c != anchor_pos && !self.tree.occupied(c));
        if let Some(slot) = free_slot {
            return self.tree.place_leaf_at(slot, leaf);
        }

        // Neighborhood full: push the anchor one level down and pair the
        // newcomer with it, keeping the two under one parent. The anchor's
        // hashes are already unioned into every ancestor, so only the
        // newcomer propagates.
        self.tree.demote_and_pair(anchor_pos, leaf)
    }
}
