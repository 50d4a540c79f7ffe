//! Payload-bearing tree entities.
//!
//! Internal positions hold a [`Node`] (an aggregate set unioned over every
//! descendant signature plus bound metadata), terminal positions hold a
//! [`Leaf`] (exactly one signature). Both load their payload lazily from
//! storage on first access and can be evicted and reloaded.

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::OnceCell;

use crate::errors::{Result, SbtError};
use crate::sketch::{BloomFilter, Signature};
use crate::storage::Storage;

/// Metadata key for the smallest sketch size below an internal node.
pub const MIN_N_BELOW: &str = "min_n_below";

/// Internal tree node: aggregate set plus metadata.
#[derive(Clone)]
pub struct Node {
    name: String,
    filename: Option<String>,
    metadata: HashMap<String, u64>,
    storage: Option<Rc<dyn Storage>>,
    data: OnceCell<BloomFilter>,
}

impl Node {
    /// Fresh in-memory node holding an empty aggregate.
    pub fn new(name: impl Into<String>, filter: BloomFilter) -> Self {
        let data = OnceCell::new();
        let _ = data.set(filter);
        Self {
            name: name.into(),
            filename: None,
            metadata: HashMap::new(),
            storage: None,
            data,
        }
    }

    /// Node reconstructed from a persisted record; payload stays on storage
    /// until first access.
    pub fn from_record(
        name: String,
        filename: Option<String>,
        metadata: HashMap<String, u64>,
        storage: Option<Rc<dyn Storage>>,
    ) -> Self {
        Self {
            name,
            filename,
            metadata,
            storage,
            data: OnceCell::new(),
        }
    }

    /// Node name (by convention `internal.<pos>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename, used when positions shift during tree combination.
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Storage key of the persisted payload, if any.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Metadata map; carries at least [`MIN_N_BELOW`] on a healthy tree.
    pub fn metadata(&self) -> &HashMap<String, u64> {
        &self.metadata
    }

    /// Attach the storage backend used for lazy loads and saves.
    pub fn set_storage(&mut self, storage: Option<Rc<dyn Storage>>) {
        self.storage = storage;
    }

    /// Smallest sketch size among the leaves below this node.
    pub fn min_n_below(&self) -> Option<u64> {
        self.metadata.get(MIN_N_BELOW).copied()
    }

    /// Lower `min_n_below` to `value` if smaller, clamped to 1 so the
    /// placeholder value 0 is never written.
    pub fn shrink_min_n_below(&mut self, value: u64) {
        let value = value.max(1);
        let entry = self.metadata.entry(MIN_N_BELOW.to_string()).or_insert(u64::MAX);
        if value < *entry {
            *entry = value;
        }
    }

    /// Overwrite `min_n_below`, clamped to 1.
    pub fn set_min_n_below(&mut self, value: u64) {
        self.metadata.insert(MIN_N_BELOW.to_string(), value.max(1));
    }

    /// The aggregate payload, loading it from storage on first access.
    pub fn data(&self) -> Result<&BloomFilter> {
        self.data.get_or_try_init(|| {
            let filename = self
                .filename
                .as_deref()
                .ok_or_else(|| SbtError::NotFound(self.name.clone()))?;
            let storage = self
                .storage
                .as_ref()
                .ok_or_else(|| SbtError::NoStorage(self.name.clone()))?;
            BloomFilter::from_bytes(&storage.load(filename)?)
        })
    }

    /// Mutable access to the aggregate, loading it first if needed.
    pub fn data_mut(&mut self) -> Result<&mut BloomFilter> {
        self.data()?;
        Ok(self.data.get_mut().expect("payload initialized above"))
    }

    /// True if the payload is resident in memory.
    pub fn is_loaded(&self) -> bool {
        self.data.get().is_some()
    }

    /// Drop the in-memory payload; it reloads from storage on next access.
    pub fn unload(&mut self) {
        self.data.take();
    }

    /// Persist the payload under `key`, remembering the key actually used.
    pub fn save(&mut self, key: &str) -> Result<String> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| SbtError::NoStorage(self.name.clone()))?;
        let bytes = self.data()?.to_bytes()?;
        let filename = storage.save(key, &bytes)?;
        self.filename = Some(filename.clone());
        Ok(filename)
    }

    /// Propagate this node's aggregate and bound into `parent`.
    pub fn update(&self, parent: &mut Node) -> Result<()> {
        let min = self
            .min_n_below()
            .ok_or_else(|| SbtError::MissingMinNBelow(self.name.clone()))?;
        parent.data_mut()?.union_with(self.data()?);
        parent.shrink_min_n_below(min);
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("metadata", &self.metadata)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Terminal tree entity: one signature.
#[derive(Clone)]
pub struct Leaf {
    name: String,
    filename: Option<String>,
    metadata: HashMap<String, String>,
    storage: Option<Rc<dyn Storage>>,
    data: OnceCell<Signature>,
}

impl Leaf {
    /// Leaf owning an in-memory signature.
    pub fn new(signature: Signature) -> Self {
        let name = signature.name().to_string();
        let data = OnceCell::new();
        let _ = data.set(signature);
        Self {
            name,
            filename: None,
            metadata: HashMap::new(),
            storage: None,
            data,
        }
    }

    /// Leaf reconstructed from a persisted record.
    pub fn from_record(
        name: String,
        filename: Option<String>,
        metadata: HashMap<String, String>,
        storage: Option<Rc<dyn Storage>>,
    ) -> Self {
        Self {
            name,
            filename,
            metadata,
            storage,
            data: OnceCell::new(),
        }
    }

    /// Name of the signature this leaf holds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage key of the persisted signature, if any.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Leaf metadata (dataset provenance and the like).
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Attach the storage backend used for lazy loads and saves.
    pub fn set_storage(&mut self, storage: Option<Rc<dyn Storage>>) {
        self.storage = storage;
    }

    /// The signature, loading it from storage on first access.
    pub fn data(&self) -> Result<&Signature> {
        self.data.get_or_try_init(|| {
            let filename = self
                .filename
                .as_deref()
                .ok_or_else(|| SbtError::NotFound(self.name.clone()))?;
            let storage = self
                .storage
                .as_ref()
                .ok_or_else(|| SbtError::NoStorage(self.name.clone()))?;
            Signature::from_bytes(&storage.load(filename)?)
        })
    }

    /// True if the signature is resident in memory.
    pub fn is_loaded(&self) -> bool {
        self.data.get().is_some()
    }

    /// Drop the in-memory signature; it reloads from storage on next access.
    pub fn unload(&mut self) {
        self.data.take();
    }

    /// Persist the signature under `key`, remembering the key actually used.
    pub fn save(&mut self, key: &str) -> Result<String> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| SbtError::NoStorage(self.name.clone()))?;
        let bytes = self.data()?.to_bytes()?;
        let filename = storage.save(key, &bytes)?;
        self.filename = Some(filename.clone());
        Ok(filename)
    }

    /// Propagate this leaf's hashes and sketch size into `parent`.
    pub fn update(&self, parent: &mut Node) -> Result<()> {
        let sig = self.data()?;
        let filter = parent.data_mut()?;
        for &min in sig.mins() {
            filter.insert(min);
        }
        parent.shrink_min_n_below(sig.size() as u64);
        Ok(())
    }
}

impl std::fmt::Debug for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaf")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Factory;
    use crate::storage::MemStorage;

    fn sig(name: &str, mins: Vec<u64>) -> Signature {
        Signature::new(name, 5, mins)
    }

    #[test]
    fn leaf_update_unions_and_bounds() {
        let factory = Factory::new(5, 1024, 3);
        let mut parent = Node::new("internal.0", factory.create());

        let small = Leaf::new(sig("small", vec![1, 2]));
        let big = Leaf::new(sig("big", vec![3, 4, 5, 6]));
        small.update(&mut parent).unwrap();
        big.update(&mut parent).unwrap();

        assert_eq!(parent.min_n_below(), Some(2));
        let filter = parent.data().unwrap();
        for min in 1..=6 {
            assert!(filter.contains(min));
        }
    }

    #[test]
    fn min_n_below_never_zero() {
        let factory = Factory::new(5, 256, 2);
        let mut parent = Node::new("internal.0", factory.create());
        let empty = Leaf::new(sig("empty", vec![]));
        empty.update(&mut parent).unwrap();
        assert_eq!(parent.min_n_below(), Some(1));
    }

    #[test]
    fn node_update_requires_min_n_below() {
        let factory = Factory::new(5, 256, 2);
        let child = Node::new("internal.1", factory.create());
        let mut parent = Node::new("internal.0", factory.create());
        assert!(matches!(
            child.update(&mut parent),
            Err(SbtError::MissingMinNBelow(_))
        ));
    }

    #[test]
    fn leaf_payload_survives_eviction() {
        let storage: Rc<dyn Storage> = Rc::new(MemStorage::new());
        let mut leaf = Leaf::new(sig("evicted", vec![10, 20, 30]));
        leaf.set_storage(Some(Rc::clone(&storage)));
        leaf.save("evicted.sig").unwrap();

        leaf.unload();
        assert!(!leaf.is_loaded());
        assert_eq!(leaf.data().unwrap().size(), 3);
        assert!(leaf.is_loaded());
    }
}
