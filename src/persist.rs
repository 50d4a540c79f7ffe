//! Multi-version persistence of the tree description file.
//!
//! A tree is saved as a JSON description (shape, factory configuration,
//! storage descriptor, one record per occupied position) plus per-entity
//! payloads written through the storage backend. Five historical layouts
//! must stay loadable:
//!
//! - **v1**: a bare JSON array, position = array index, no version field;
//!   internal nodes recognized by the `internal.` name prefix.
//! - **v2**: an object with a `version` tag and a combined `nodes` map.
//! - **v3**: v2 plus an explicit `storage: {backend, args}` descriptor.
//! - **v4**: v3 plus a persisted `missing_nodes` list.
//! - **v5**: separate `nodes` and `leaves` maps; the current write format.
//!
//! Formats older than v4 did not persist `min_n_below`, so loading them
//! runs the mandatory repair pass. Loading a tree with zero leaves fails.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::Factory;
use crate::errors::{Result, SbtError};
use crate::storage::{FsStorage, Storage, StorageInfo};
use crate::tree::{Leaf, Node, Sbt};

/// Persisted record of one internal node. `filename: null` means the
/// payload was deliberately skipped (sparse save); the position is then
/// tracked as a missing node and rebuilt lazily after load.
#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    filename: Option<String>,
    name: String,
    #[serde(default)]
    metadata: HashMap<String, u64>,
}

/// Persisted record of one leaf.
#[derive(Debug, Serialize, Deserialize)]
struct LeafRecord {
    filename: Option<String>,
    name: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Legacy combined record: v1-v4 kept nodes and leaves in one map, told
/// apart by the `internal.` name prefix. Metadata is left untyped because
/// the two kinds used different value types.
#[derive(Debug, Deserialize)]
struct CombinedRecord {
    #[serde(default)]
    filename: Option<String>,
    name: String,
    #[serde(default)]
    metadata: Value,
}

impl CombinedRecord {
    fn is_internal(&self) -> bool {
        self.name.starts_with("internal")
    }

    fn node_metadata(&self) -> HashMap<String, u64> {
        match &self.metadata {
            Value::Object(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_u64().map(|v| (k.clone(), v)))
                .collect(),
            _ => HashMap::new(),
        }
    }

    fn leaf_metadata(&self) -> HashMap<String, String> {
        match &self.metadata {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect(),
            _ => HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoV2 {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_d")]
    d: u32,
    #[serde(default)]
    factory: Factory,
    nodes: HashMap<u64, Option<CombinedRecord>>,
}

#[derive(Debug, Deserialize)]
struct InfoV3 {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_d")]
    d: u32,
    #[serde(default)]
    factory: Factory,
    storage: StorageInfo,
    nodes: HashMap<u64, Option<CombinedRecord>>,
}

#[derive(Debug, Deserialize)]
struct InfoV4 {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_d")]
    d: u32,
    #[serde(default)]
    factory: Factory,
    storage: StorageInfo,
    nodes: HashMap<u64, Option<CombinedRecord>>,
    #[serde(default)]
    missing_nodes: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InfoV5 {
    version: u32,
    d: u32,
    factory: Factory,
    storage: StorageInfo,
    nodes: HashMap<u64, NodeRecord>,
    leaves: HashMap<u64, LeafRecord>,
}

fn default_d() -> u32 {
    2
}

/// Save-time knobs.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Probability in `[0, 1]` of skipping each internal-node payload.
    /// The structural record is still written; the payload is rebuilt
    /// lazily after load.
    pub sparseness: f64,
    /// Skip every payload write, nodes and leaves alike; leaves keep
    /// whatever payload reference they already have.
    pub structure_only: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            sparseness: 0.0,
            structure_only: false,
        }
    }
}

impl Sbt {
    /// Save the tree description to `path` (conventionally
    /// `<name>.sbt.json`) and every payload through `storage`. Defaults to
    /// filesystem storage in a `.sbt.<name>` directory next to the
    /// description file.
    pub fn save_file(
        &mut self,
        path: impl AsRef<Path>,
        storage: Option<Rc<dyn Storage>>,
        options: &SaveOptions,
    ) -> Result<()> {
        let path = path.as_ref();
        let location = path.parent().unwrap_or_else(|| Path::new("."));
        let mut basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tree")
            .to_string();
        if let Some(stripped) = basename.strip_suffix(".sbt.json") {
            basename = stripped.to_string();
        }

        let storage: Rc<dyn Storage> = match storage {
            Some(s) => s,
            None => Rc::new(FsStorage::new(location, &format!(".sbt.{}", basename))),
        };
        self.set_storage(Some(Rc::clone(&storage)));

        let mut rng = rand::thread_rng();
        let mut node_records: HashMap<u64, NodeRecord> = HashMap::new();

        for (&pos, node) in self.nodes.iter_mut() {
            let skip_payload =
                options.structure_only || (options.sparseness > 0.0 && rng.gen::<f64>() < options.sparseness);

            let filename = if skip_payload {
                node.set_storage(Some(Rc::clone(&storage)));
                None
            } else {
                // Load through the old storage before switching backends.
                node.data()?;
                node.set_storage(Some(Rc::clone(&storage)));
                Some(node.save(&format!("internal.{}", pos))?)
            };

            node_records.insert(
                pos,
                NodeRecord {
                    filename,
                    name: node.name().to_string(),
                    metadata: node.metadata().clone(),
                },
            );
        }

        // Positions known to exist but never materialized keep a
        // payload-less structural record.
        for &pos in &self.missing_nodes {
            node_records.entry(pos).or_insert_with(|| NodeRecord {
                filename: None,
                name: format!("internal.{}", pos),
                metadata: HashMap::new(),
            });
        }

        let mut leaf_records: HashMap<u64, LeafRecord> = HashMap::new();
        for (&pos, leaf) in self.leaves.iter_mut() {
            let filename = if options.structure_only {
                leaf.filename().map(String::from)
            } else {
                leaf.data()?;
                leaf.set_storage(Some(Rc::clone(&storage)));
                Some(leaf.save(&format!("{}.sig", leaf.name()))?)
            };

            leaf_records.insert(
                pos,
                LeafRecord {
                    filename,
                    name: leaf.name().to_string(),
                    metadata: leaf.metadata().clone(),
                },
            );
        }

        let info = InfoV5 {
            version: 5,
            d: self.d(),
            factory: self.factory().clone(),
            storage: StorageInfo::from_storage(storage.as_ref()),
            nodes: node_records,
            leaves: leaf_records,
        };

        fs::write(path, serde_json::to_vec_pretty(&info)?)?;
        info!(path = %path.display(), leaves = self.len(), "saved tree");
        Ok(())
    }

    /// Load a tree from a description file, dispatching on its version.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Sbt> {
        Self::from_path_with_factory(path, None)
    }

    /// Load a tree, failing with a configuration error if its persisted
    /// factory disagrees with `expected`.
    pub fn from_path_with_factory(
        path: impl AsRef<Path>,
        expected: Option<&Factory>,
    ) -> Result<Sbt> {
        let path = path.as_ref();
        let location = path.parent().unwrap_or_else(|| Path::new("."));
        let value: Value = serde_json::from_slice(&fs::read(path)?)?;

        let version = if value.is_array() {
            1
        } else {
            value
                .get("version")
                .and_then(Value::as_u64)
                .ok_or(SbtError::UnrecognizedFormat)? as u32
        };

        let mut tree = match version {
            1 => load_v1(value, location),
            2 => load_v2(value, location),
            3 => load_v3(value, location),
            4 => load_v4(value, location),
            5 => load_v5(value, location),
            other => Err(SbtError::UnsupportedVersion(other)),
        }?;

        if tree.leaves.is_empty() {
            return Err(SbtError::EmptyTree);
        }

        if let Some(expected) = expected {
            if expected.args() != tree.factory().args() {
                return Err(SbtError::FactoryMismatch {
                    loaded: tree.factory().args(),
                    expected: expected.args(),
                });
            }
        }

        tree.record_structural_holes();
        if version < 4 {
            // Historical formats did not persist min_n_below.
            tree.repair_min_n_below()?;
        }

        info!(
            path = %path.display(),
            version,
            leaves = tree.len(),
            missing = tree.missing_nodes.len(),
            "loaded tree"
        );
        Ok(tree)
    }
}

fn split_combined(
    records: HashMap<u64, Option<CombinedRecord>>,
    storage: &Rc<dyn Storage>,
) -> (HashMap<u64, Node>, HashMap<u64, Leaf>, HashSet<u64>) {
    let mut nodes = HashMap::new();
    let mut leaves = HashMap::new();
    let mut missing = HashSet::new();

    for (pos, record) in records {
        let Some(record) = record else { continue };
        if record.is_internal() {
            let metadata = record.node_metadata();
            match record.filename {
                Some(filename) => {
                    nodes.insert(
                        pos,
                        Node::from_record(
                            record.name,
                            Some(filename),
                            metadata,
                            Some(Rc::clone(storage)),
                        ),
                    );
                }
                None => {
                    missing.insert(pos);
                }
            }
        } else {
            let metadata = record.leaf_metadata();
            leaves.insert(
                pos,
                Leaf::from_record(
                    record.name,
                    record.filename,
                    metadata,
                    Some(Rc::clone(storage)),
                ),
            );
        }
    }

    (nodes, leaves, missing)
}

fn load_v1(value: Value, location: &Path) -> Result<Sbt> {
    let records: Vec<Option<CombinedRecord>> = serde_json::from_value(value)?;
    let by_pos: HashMap<u64, Option<CombinedRecord>> = records
        .into_iter()
        .enumerate()
        .map(|(i, r)| (i as u64, r))
        .collect();

    let storage: Rc<dyn Storage> = Rc::new(FsStorage::new(location, ""));
    let (nodes, leaves, missing) = split_combined(by_pos, &storage);
    Ok(Sbt::from_parts(
        2,
        Factory::default(),
        Some(storage),
        nodes,
        leaves,
        missing,
    ))
}

fn load_v2(value: Value, location: &Path) -> Result<Sbt> {
    let info: InfoV2 = serde_json::from_value(value)?;
    let storage: Rc<dyn Storage> = Rc::new(FsStorage::new(location, ""));
    let (nodes, leaves, missing) = split_combined(info.nodes, &storage);
    Ok(Sbt::from_parts(
        info.d,
        info.factory,
        Some(storage),
        nodes,
        leaves,
        missing,
    ))
}

fn load_v3(value: Value, location: &Path) -> Result<Sbt> {
    let info: InfoV3 = serde_json::from_value(value)?;
    let storage = info.storage.open(location)?;
    let (nodes, leaves, missing) = split_combined(info.nodes, &storage);
    Ok(Sbt::from_parts(
        info.d,
        info.factory,
        Some(storage),
        nodes,
        leaves,
        missing,
    ))
}

fn load_v4(value: Value, location: &Path) -> Result<Sbt> {
    let info: InfoV4 = serde_json::from_value(value)?;
    let storage = info.storage.open(location)?;
    let (nodes, leaves, mut missing) = split_combined(info.nodes, &storage);
    missing.extend(info.missing_nodes);
    Ok(Sbt::from_parts(
        info.d,
        info.factory,
        Some(storage),
        nodes,
        leaves,
        missing,
    ))
}

fn load_v5(value: Value, location: &Path) -> Result<Sbt> {
    let info: InfoV5 = serde_json::from_value(value)?;
    let storage = info.storage.open(location)?;

    let mut nodes = HashMap::new();
    let mut missing = HashSet::new();
    for (pos, record) in info.nodes {
        match record.filename {
            Some(filename) => {
                nodes.insert(
                    pos,
                    Node::from_record(
                        record.name,
                        Some(filename),
                        record.metadata,
                        Some(Rc::clone(&storage)),
                    ),
                );
            }
            None => {
                missing.insert(pos);
            }
        }
    }

    let leaves = info
        .leaves
        .into_iter()
        .map(|(pos, record)| {
            (
                pos,
                Leaf::from_record(
                    record.name,
                    record.filename,
                    record.metadata,
                    Some(Rc::clone(&storage)),
                ),
            )
        })
        .collect();

    Ok(Sbt::from_parts(
        info.d,
        info.factory,
        Some(storage),
        nodes,
        leaves,
        missing,
    ))
}
