//! Search policies plugged into the generic tree traversal.
//!
//! A policy decides, per visited entity, whether the traversal should keep
//! descending (internal node) or record a match (leaf). Node-level checks
//! work on the aggregate set and must never return `false` for a subtree
//! containing a true match; the one-sided error of the aggregate and the
//! `min_n_below` bound guarantee that for the policies here.

use crate::errors::{Result, SbtError};
use crate::sketch::Signature;
use crate::tree::Node;

/// Pluggable pruning decision for the generic traversal.
///
/// Stateful policies (running-best searches) carry their state in `&mut
/// self`, so visitation order affects how aggressively later branches are
/// pruned; results are still exact, only the amount of pruning varies.
pub trait SearchPolicy {
    /// Keep descending below this internal node?
    fn check_internal(&mut self, node: &Node, query: &Signature) -> Result<bool>;

    /// Does this leaf signature match the query?
    fn check_leaf(&mut self, leaf: &Signature, query: &Signature) -> Result<bool>;
}

/// Upper bound on the similarity of any leaf below `node` to `query`:
/// hashes of the query found in the aggregate, over the smallest sketch
/// size below the node. The true Jaccard of a descendant is at most
/// intersection over smallest-possible-union, so pruning on this bound
/// never loses a match.
fn similarity_bound(node: &Node, query: &Signature) -> Result<f64> {
    let min_n_below = node
        .min_n_below()
        .ok_or_else(|| SbtError::MissingMinNBelow(node.name().to_string()))?;
    let matched = node.data()?.matches(query.mins());
    Ok(matched as f64 / min_n_below as f64)
}

/// Fraction of the query's hashes present in the node aggregate. An exact
/// per-element membership test up to the aggregate's false positives, so
/// it upper-bounds the containment of the query in any descendant.
fn containment_bound(node: &Node, query: &Signature) -> Result<f64> {
    if query.size() == 0 {
        return Ok(0.0);
    }
    let matched = node.data()?.matches(query.mins());
    Ok(matched as f64 / query.size() as f64)
}

/// Match every leaf whose Jaccard similarity reaches the threshold.
#[derive(Debug, Clone)]
pub struct ThresholdSimilarity {
    threshold: f64,
}

impl ThresholdSimilarity {
    /// Policy matching leaves with `similarity >= threshold`.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl SearchPolicy for ThresholdSimilarity {
    fn check_internal(&mut self, node: &Node, query: &Signature) -> Result<bool> {
        Ok(similarity_bound(node, query)? >= self.threshold)
    }

    fn check_leaf(&mut self, leaf: &Signature, query: &Signature) -> Result<bool> {
        Ok(query.similarity(leaf) >= self.threshold)
    }
}

/// Match every leaf containing at least `threshold` of the query's hashes.
#[derive(Debug, Clone)]
pub struct ThresholdContainment {
    threshold: f64,
}

impl ThresholdContainment {
    /// Policy matching leaves with `containment(query, leaf) >= threshold`.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl SearchPolicy for ThresholdContainment {
    fn check_internal(&mut self, node: &Node, query: &Signature) -> Result<bool> {
        Ok(containment_bound(node, query)? >= self.threshold)
    }

    fn check_leaf(&mut self, leaf: &Signature, query: &Signature) -> Result<bool> {
        Ok(query.containment(leaf) >= self.threshold)
    }
}

/// Branch-and-bound search for the most similar leaf: every confirmed leaf
/// match raises the effective pruning threshold to the best similarity seen
/// so far.
#[derive(Debug, Clone)]
pub struct BestMatch {
    threshold: f64,
    best: f64,
}

impl BestMatch {
    /// Running-best search with a floor of `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            best: 0.0,
        }
    }

    /// Best similarity confirmed so far.
    pub fn best(&self) -> f64 {
        self.best
    }

    fn effective_threshold(&self) -> f64 {
        self.best.max(self.threshold)
    }
}

impl SearchPolicy for BestMatch {
    fn check_internal(&mut self, node: &Node, query: &Signature) -> Result<bool> {
        Ok(similarity_bound(node, query)? >= self.effective_threshold())
    }

    fn check_leaf(&mut self, leaf: &Signature, query: &Signature) -> Result<bool> {
        let similarity = query.similarity(leaf);
        if similarity >= self.effective_threshold() {
            self.best = self.best.max(similarity);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Greedy gather: one pass for the best remaining containment match.
/// Subtrees that cannot beat the best containment seen so far are skipped,
/// supporting iterative subtract-and-search decomposition workflows.
#[derive(Debug, Clone)]
pub struct Gather {
    threshold: f64,
    best_containment: f64,
}

impl Gather {
    /// Gather policy ignoring matches below `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            best_containment: 0.0,
        }
    }

    /// Best containment confirmed so far.
    pub fn best_containment(&self) -> f64 {
        self.best_containment
    }
}

impl SearchPolicy for Gather {
    fn check_internal(&mut self, node: &Node, query: &Signature) -> Result<bool> {
        let bound = containment_bound(node, query)?;
        Ok(bound >= self.threshold && bound >= self.best_containment)
    }

    fn check_leaf(&mut self, leaf: &Signature, query: &Signature) -> Result<bool> {
        let containment = query.containment(leaf);
        if containment >= self.threshold && containment >= self.best_containment {
            self.best_containment = containment;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
