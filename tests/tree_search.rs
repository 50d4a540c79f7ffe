//! Search behavior over small hand-built trees.

use std::collections::BTreeSet;

use sbt_core::{
    BestMatch, Factory, Gather, Node, Result, Sbt, SearchPolicy, Signature, ThresholdSimilarity,
    Traversal,
};

fn factory() -> Factory {
    Factory::new(5, 8192, 3)
}

fn sig(name: &str, mins: &[u64]) -> Signature {
    Signature::new(name, 5, mins.to_vec())
}

fn names(leaves: &[&sbt_core::Leaf]) -> BTreeSet<String> {
    leaves.iter().map(|l| l.name().to_string()).collect()
}

/// Membership probe for a single hashed k-mer: nodes answer through their
/// aggregate, leaves answer exactly.
struct HasKmer {
    hash: u64,
}

impl SearchPolicy for HasKmer {
    fn check_internal(&mut self, node: &Node, _query: &Signature) -> Result<bool> {
        Ok(node.data()?.contains(self.hash))
    }

    fn check_leaf(&mut self, leaf: &Signature, _query: &Signature) -> Result<bool> {
        Ok(leaf.mins().binary_search(&self.hash).is_ok())
    }
}

#[test]
fn custom_membership_search_finds_exactly_the_holders() {
    // Five overlapping 5-mer sets; hash 42 occurs in exactly three.
    let mut tree = Sbt::new(factory());
    tree.insert(sig("s1", &[10, 42, 77])).unwrap();
    tree.insert(sig("s2", &[42, 80, 81])).unwrap();
    tree.insert(sig("s3", &[1, 2, 3])).unwrap();
    tree.insert(sig("s4", &[42, 99, 100])).unwrap();
    tree.insert(sig("s5", &[200, 201])).unwrap();

    let query = sig("probe", &[42]);
    let mut policy = HasKmer { hash: 42 };
    let matches = tree.find(&mut policy, &query).unwrap();

    assert_eq!(names(&matches), BTreeSet::from(["s1".into(), "s2".into(), "s4".into()]));
}

#[test]
fn node_bound_never_prunes_a_true_match() {
    // Many leaves, several thresholds: threshold search must agree with a
    // brute-force scan over the signatures.
    let mut tree = Sbt::new(factory());
    let mut all = Vec::new();
    for i in 0..12u64 {
        let mins: Vec<u64> = (0..8).map(|j| i * 5 + j).collect();
        let s = sig(&format!("s{}", i), &mins);
        all.push(s.clone());
        tree.insert(s).unwrap();
    }

    let query = sig("q", &[10, 11, 12, 13, 14, 15, 16, 17]);
    for threshold in [0.05, 0.1, 0.25, 0.5] {
        let mut policy = ThresholdSimilarity::new(threshold);
        let found = names(&tree.find(&mut policy, &query).unwrap());

        let expected: BTreeSet<String> = all
            .iter()
            .filter(|s| query.similarity(s) >= threshold)
            .map(|s| s.name().to_string())
            .collect();

        assert!(
            found.is_superset(&expected),
            "threshold {} pruned a true match: {:?} vs {:?}",
            threshold,
            found,
            expected
        );
        // Leaf checks are exact, so there are no spurious matches either.
        assert_eq!(found, expected);
    }
}

#[test]
fn depth_and_breadth_first_agree_for_stateless_policies() {
    let mut tree = Sbt::new(factory());
    for i in 0..9u64 {
        let mins: Vec<u64> = (0..6).map(|j| i * 4 + j).collect();
        tree.insert(sig(&format!("s{}", i), &mins)).unwrap();
    }

    let query = sig("q", &[8, 9, 10, 11, 12, 13]);
    let mut dfs_policy = ThresholdSimilarity::new(0.2);
    let dfs = names(&tree.find_with(&mut dfs_policy, &query, Traversal::DepthFirst).unwrap());
    let mut bfs_policy = ThresholdSimilarity::new(0.2);
    let bfs = names(&tree.find_with(&mut bfs_policy, &query, Traversal::BreadthFirst).unwrap());
    assert_eq!(dfs, bfs);
}

#[test]
fn best_match_finds_the_global_maximum() {
    let mut tree = Sbt::new(factory());
    tree.insert(sig("near", &[1, 2, 3, 4, 5])).unwrap();
    tree.insert(sig("mid", &[1, 2, 3, 40, 50])).unwrap();
    tree.insert(sig("far", &[100, 200, 300])).unwrap();
    tree.insert(sig("exact", &[1, 2, 3, 4, 5, 6])).unwrap();

    let query = sig("q", &[1, 2, 3, 4, 5, 6]);
    let mut policy = BestMatch::new(0.0);
    let matches = tree.find(&mut policy, &query).unwrap();

    // The running best reaches the true maximum regardless of visit order.
    assert!((policy.best() - 1.0).abs() < 1e-9);
    assert!(matches.iter().any(|l| l.name() == "exact"));
}

#[test]
fn gather_reports_the_best_containment() {
    let mut tree = Sbt::new(factory());
    tree.insert(sig("quarter", &[1, 300, 301, 302])).unwrap();
    tree.insert(sig("half", &[1, 2, 400, 401])).unwrap();
    tree.insert(sig("whole", &[1, 2, 3, 4, 500])).unwrap();

    let query = sig("q", &[1, 2, 3, 4]);
    let mut policy = Gather::new(0.1);
    let matches = tree.find(&mut policy, &query).unwrap();

    assert!((policy.best_containment() - 1.0).abs() < 1e-9);
    assert!(matches.iter().any(|l| l.name() == "whole"));
}

#[test]
fn search_on_single_leaf_tree_works() {
    let mut tree = Sbt::new(factory());
    tree.insert(sig("only", &[7, 8, 9])).unwrap();

    let query = sig("q", &[7, 8, 9]);
    let mut policy = ThresholdSimilarity::new(0.9);
    let matches = tree.find(&mut policy, &query).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].name(), "only");
}
