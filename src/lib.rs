#![forbid(unsafe_code)]

//! # sbt-core
//!
//! A Sequence Bloom Tree (SBT) index over probabilistic signatures:
//! - internal nodes hold Bloom-filter unions of every descendant sketch
//! - leaves hold one signature each
//! - searches prune whole subtrees using a provable similarity upper bound
//!
//! Trees persist through a pluggable byte-storage backend and a JSON
//! description file; five historical description layouts stay loadable.
//!
//! ```
//! use sbt_core::{Factory, Sbt, Signature, ThresholdSimilarity};
//!
//! let mut tree = Sbt::new(Factory::new(5, 4096, 3));
//! tree.insert(Signature::new("a", 5, vec![1, 2, 3, 4])).unwrap();
//! tree.insert(Signature::new("b", 5, vec![3, 4, 5, 6])).unwrap();
//!
//! let query = Signature::new("q", 5, vec![1, 2, 3, 4]);
//! let mut policy = ThresholdSimilarity::new(0.5);
//! let matches = tree.find(&mut policy, &query).unwrap();
//! assert_eq!(matches.len(), 1);
//! ```

pub mod config;
pub mod errors;
pub mod localized;
pub mod persist;
pub mod search;
pub mod sketch;
pub mod storage;
pub mod tree;

pub use config::Factory;
pub use errors::{Result, SbtError};
pub use localized::LocalizedSbt;
pub use persist::SaveOptions;
pub use search::{BestMatch, Gather, SearchPolicy, ThresholdContainment, ThresholdSimilarity};
pub use sketch::{BloomFilter, Signature};
pub use storage::{FsStorage, MemStorage, Storage, StorageArgs, StorageInfo};
pub use tree::{Leaf, Node, NodePos, Sbt, Traversal, TreeEntry};
