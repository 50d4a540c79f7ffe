//! Factory configuration for the aggregate sets stored at internal nodes.

use serde::{Deserialize, Serialize};

use crate::sketch::BloomFilter;

/// Factory that builds empty aggregate sets with a fixed configuration.
///
/// Every internal node of one tree shares the same configuration, and the
/// configuration is persisted in the description file so a reloaded tree
/// rebuilds compatible aggregates. Serialized with a `class` tag so new
/// factory kinds can be added without breaking old files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Factory {
    /// Bloom filter aggregates: `args` is (ksize, bit length, hash count).
    BloomFactory {
        /// (ksize, m, k) for every filter this factory creates.
        args: (u32, usize, usize),
    },
}

impl Factory {
    /// Factory for `m`-bit filters with `k` hash functions over `ksize`-mers.
    pub fn new(ksize: u32, m: usize, k: usize) -> Self {
        Factory::BloomFactory { args: (ksize, m, k) }
    }

    /// Build one empty aggregate set.
    pub fn create(&self) -> BloomFilter {
        let Factory::BloomFactory { args: (ksize, m, k) } = self;
        BloomFilter::new(*ksize, *m, *k)
    }

    /// The configuration tuple, used for persistence and compatibility checks.
    pub fn args(&self) -> (u32, usize, usize) {
        let Factory::BloomFactory { args } = self;
        *args
    }
}

impl Default for Factory {
    fn default() -> Self {
        Factory::new(31, 100_000, 4)
    }
}
