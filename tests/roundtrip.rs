//! Persistence round trips across save options and formats.

use std::collections::BTreeSet;

use sbt_core::{Factory, SaveOptions, Sbt, Signature, ThresholdContainment, ThresholdSimilarity};

fn factory() -> Factory {
    Factory::new(5, 8192, 3)
}

fn sig(name: &str, mins: &[u64]) -> Signature {
    Signature::new(name, 5, mins.to_vec())
}

fn names(leaves: &[&sbt_core::Leaf]) -> BTreeSet<String> {
    leaves.iter().map(|l| l.name().to_string()).collect()
}

/// Seven fixed signatures; exactly four share hashes with the query below.
fn seven_signatures() -> Vec<Signature> {
    vec![
        sig("genome1", &[1, 2, 3, 10]),
        sig("genome2", &[2, 3, 4, 20]),
        sig("genome3", &[3, 4, 5, 30]),
        sig("genome4", &[5, 6, 7, 40]),
        sig("genome5", &[100, 101, 102]),
        sig("genome6", &[200, 201, 202]),
        sig("genome7", &[300, 301, 302]),
    ]
}

fn build_seven() -> Sbt {
    let mut tree = Sbt::new(factory());
    for s in seven_signatures() {
        tree.insert(s).unwrap();
    }
    tree
}

#[test]
fn containment_search_survives_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seven.sbt.json");

    let mut tree = build_seven();
    let query = sig("q", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 11]);

    let mut policy = ThresholdContainment::new(0.1);
    let before = names(&tree.find(&mut policy, &query).unwrap());
    assert_eq!(
        before,
        BTreeSet::from([
            "genome1".into(),
            "genome2".into(),
            "genome3".into(),
            "genome4".into()
        ])
    );

    tree.save_file(&path, None, &SaveOptions::default()).unwrap();
    let mut reloaded = Sbt::from_path(&path).unwrap();

    let mut policy = ThresholdContainment::new(0.1);
    let after = names(&reloaded.find(&mut policy, &query).unwrap());
    assert_eq!(before, after);
}

#[test]
fn round_trip_preserves_the_leaf_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.sbt.json");

    let mut tree = build_seven();
    let original: BTreeSet<String> = tree
        .signatures()
        .unwrap()
        .iter()
        .map(|s| s.name().to_string())
        .collect();

    tree.save_file(&path, None, &SaveOptions::default()).unwrap();
    let reloaded = Sbt::from_path(&path).unwrap();

    let restored: BTreeSet<String> = reloaded
        .signatures()
        .unwrap()
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(original, restored);

    // Signatures round-trip by content, not only by name.
    for s in reloaded.signatures().unwrap() {
        let matching = seven_signatures()
            .into_iter()
            .find(|orig| orig.name() == s.name())
            .unwrap();
        assert_eq!(s.mins(), matching.mins());
    }
}

#[test]
fn fully_sparse_save_rebuilds_internal_nodes_lazily() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.sbt.json");

    let mut tree = build_seven();
    let query = sig("q", &[1, 2, 3, 10]);
    let mut policy = ThresholdSimilarity::new(0.4);
    let before = names(&tree.find(&mut policy, &query).unwrap());
    assert!(before.contains("genome1"));

    tree.save_file(
        &path,
        None,
        &SaveOptions {
            sparseness: 1.0,
            structure_only: false,
        },
    )
    .unwrap();

    let mut reloaded = Sbt::from_path(&path).unwrap();

    // No internal payload was persisted: every internal position must be
    // explicitly flagged missing until a traversal rebuilds it.
    assert!(reloaded.leaves().len() == 7);
    let description = std::fs::read_to_string(&path).unwrap();
    assert!(description.contains("\"filename\": null"));

    let mut policy = ThresholdSimilarity::new(0.4);
    let after = names(&reloaded.find(&mut policy, &query).unwrap());
    assert_eq!(before, after);
}

#[test]
fn structure_only_save_keeps_leaf_references() {
    let dir = tempfile::tempdir().unwrap();
    let full_path = dir.path().join("full.sbt.json");
    let skeleton_path = dir.path().join("skeleton.sbt.json");

    // First a full save so every leaf has a payload on storage, then a
    // structure-only save pointing at the same payloads.
    let mut tree = build_seven();
    tree.save_file(&full_path, None, &SaveOptions::default()).unwrap();
    let storage = tree.storage();
    tree.save_file(
        &skeleton_path,
        storage,
        &SaveOptions {
            sparseness: 0.0,
            structure_only: true,
        },
    )
    .unwrap();

    let reloaded = Sbt::from_path(&skeleton_path).unwrap();
    assert_eq!(reloaded.len(), 7);
    for leaf in reloaded.leaves() {
        assert!(leaf.data().is_ok(), "leaf {} unreadable", leaf.name());
    }
}

#[test]
fn saved_description_contains_the_contract_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contract.sbt.json");

    let mut tree = build_seven();
    tree.save_file(&path, None, &SaveOptions::default()).unwrap();

    let value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(value["version"], 5);
    assert_eq!(value["d"], 2);
    assert_eq!(value["storage"]["backend"], "FSStorage");
    assert_eq!(value["factory"]["class"], "BloomFactory");
    assert!(value["nodes"].is_object());
    assert!(value["leaves"].is_object());

    // Node records persist min_n_below so searches work without repair.
    let nodes = value["nodes"].as_object().unwrap();
    assert!(nodes
        .values()
        .all(|n| n["metadata"]["min_n_below"].as_u64().is_some()));
}
