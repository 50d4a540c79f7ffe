//! Byte storage abstraction consumed by nodes and leaves.
//!
//! The tree only ever talks to [`Storage`]: payloads are saved under string
//! keys and loaded back by key. Two simple backends ship with the crate, a
//! directory-backed one for real persistence and an in-memory one for tests
//! and scratch trees. The description file records which backend a tree was
//! saved with so a load can reconstruct it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SbtError};

/// Byte save/load-by-key abstraction.
///
/// `save` is idempotent and returns the key actually used, which may differ
/// from the proposed one. Backends are responsible for their own retry
/// policy; errors propagate to the caller untouched.
pub trait Storage {
    /// Persist `content` under `key`, returning the key actually used.
    fn save(&self, key: &str, content: &[u8]) -> Result<String>;

    /// Load the bytes stored under `key`.
    fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Arguments sufficient to reconstruct this backend on load.
    fn args(&self) -> StorageArgs;

    /// Backend tag written to the description file.
    fn backend(&self) -> &'static str;
}

/// Initialization arguments persisted alongside the backend tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageArgs {
    /// Path relative to the description file, for path-based backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Tagged backend descriptor embedded in the description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Backend tag, e.g. `"FSStorage"`.
    pub backend: String,
    /// Backend-specific initialization arguments.
    pub args: StorageArgs,
}

impl StorageInfo {
    /// Capture the descriptor of a live backend.
    pub fn from_storage(storage: &dyn Storage) -> Self {
        Self {
            backend: storage.backend().to_string(),
            args: storage.args(),
        }
    }

    /// Reconstruct the backend, resolving relative paths against `location`.
    pub fn open(&self, location: &Path) -> Result<Rc<dyn Storage>> {
        match self.backend.as_str() {
            "FSStorage" => {
                let subdir = self.args.path.clone().unwrap_or_default();
                Ok(Rc::new(FsStorage::new(location, &subdir)))
            }
            "MemStorage" => Ok(Rc::new(MemStorage::new())),
            other => Err(SbtError::UnknownBackend(other.to_string())),
        }
    }
}

/// Directory-backed storage: every key is a file under `base/subdir`.
#[derive(Debug)]
pub struct FsStorage {
    base: PathBuf,
    subdir: String,
}

impl FsStorage {
    /// Storage rooted at `location/subdir`.
    pub fn new(location: impl AsRef<Path>, subdir: &str) -> Self {
        Self {
            base: location.as_ref().join(subdir),
            subdir: subdir.to_string(),
        }
    }
}

impl Storage for FsStorage {
    fn save(&self, key: &str, content: &[u8]) -> Result<String> {
        let path = self.base.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(key.to_string())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.base.join(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SbtError::NotFound(key.to_string())
            } else {
                SbtError::Io(e)
            }
        })
    }

    fn args(&self) -> StorageArgs {
        StorageArgs {
            path: Some(self.subdir.clone()),
        }
    }

    fn backend(&self) -> &'static str {
        "FSStorage"
    }
}

/// In-memory storage for tests and trees that are never persisted.
#[derive(Debug, Default)]
pub struct MemStorage {
    entries: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    /// Empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save(&self, key: &str, content: &[u8]) -> Result<String> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), content.to_vec());
        Ok(key.to_string())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| SbtError::NotFound(key.to_string()))
    }

    fn args(&self) -> StorageArgs {
        StorageArgs::default()
    }

    fn backend(&self) -> &'static str {
        "MemStorage"
    }
}
