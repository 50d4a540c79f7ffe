//! Sketch payloads: the probabilistic aggregate set stored at internal
//! nodes and the signature stored at leaves.
//!
//! The tree never looks inside either type beyond the operations here:
//! aggregates support add/contains/union, signatures support similarity and
//! containment over their hash sets ("mins").

use std::hash::Hasher;

use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::errors::Result;

/// Probabilistic aggregate set used as internal-node payload.
///
/// One-sided error: `contains` may report false positives but never false
/// negatives, so a node-level miss safely prunes the whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: FixedBitSet,
    m: usize,
    k: usize,
    ksize: u32,
}

impl BloomFilter {
    /// Create a new empty filter with `m` bits and `k` hash functions.
    pub fn new(ksize: u32, m: usize, k: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(m),
            m,
            k,
            ksize,
        }
    }

    /// Bit length of the filter.
    pub fn len(&self) -> usize {
        self.m
    }

    /// True if no element was ever added.
    pub fn is_empty(&self) -> bool {
        self.bits.count_ones(..) == 0
    }

    /// K-mer size this filter was configured for.
    pub fn ksize(&self) -> u32 {
        self.ksize
    }

    #[inline]
    fn hash_with_seed(x: u64, seed: u64) -> u64 {
        let mut h = XxHash64::with_seed(seed);
        h.write_u64(x);
        h.finish()
    }

    /// Add one element.
    pub fn insert(&mut self, item: u64) {
        // Double-hashing scheme, same as the fingerprint encoder.
        let base = Self::hash_with_seed(item, 0x9E37_79B1_85EB_CA87);

        for i in 0..self.k {
            let h = base.wrapping_add(i as u64).rotate_left(i as u32);
            self.bits.insert((h as usize) % self.m);
        }
    }

    /// Membership test; false positives possible, false negatives not.
    pub fn contains(&self, item: u64) -> bool {
        let base = Self::hash_with_seed(item, 0x9E37_79B1_85EB_CA87);

        for i in 0..self.k {
            let h = base.wrapping_add(i as u64).rotate_left(i as u32);
            if !self.bits.contains((h as usize) % self.m) {
                return false;
            }
        }
        true
    }

    /// Set union with another filter (bitwise OR). Idempotent, commutative.
    pub fn union_with(&mut self, other: &Self) {
        assert_eq!(self.bits.len(), other.bits.len());
        self.bits.union_with(&other.bits);
    }

    /// Count how many of `items` test positive.
    pub fn matches(&self, items: &[u64]) -> usize {
        items.iter().filter(|&&item| self.contains(item)).count()
    }

    /// Serialize to a binary payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from a binary payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A named signature: the compact sketch of one dataset, held by one leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    name: String,
    ksize: u32,
    mins: Vec<u64>,
}

impl Signature {
    /// Build a signature from arbitrary hashes; they are sorted and deduped.
    pub fn new(name: impl Into<String>, ksize: u32, mut mins: Vec<u64>) -> Self {
        mins.sort_unstable();
        mins.dedup();
        Self {
            name: name.into(),
            ksize,
            mins,
        }
    }

    /// Name of the underlying dataset.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// K-mer size the sketch was computed with.
    pub fn ksize(&self) -> u32 {
        self.ksize
    }

    /// Number of hashes in the sketch.
    pub fn size(&self) -> usize {
        self.mins.len()
    }

    /// The constituent hashes, sorted ascending.
    pub fn mins(&self) -> &[u64] {
        &self.mins
    }

    /// Number of hashes shared with `other`.
    pub fn count_common(&self, other: &Signature) -> usize {
        // Both sides sorted, so a linear merge walk suffices.
        let (mut i, mut j, mut common) = (0, 0, 0);
        while i < self.mins.len() && j < other.mins.len() {
            match self.mins[i].cmp(&other.mins[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    common += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        common
    }

    /// Jaccard similarity: |A ∩ B| / |A ∪ B|.
    pub fn similarity(&self, other: &Signature) -> f64 {
        let inter = self.count_common(other) as f64;
        let union = (self.size() + other.size()) as f64 - inter;
        if union == 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Containment of `self` in `other`: |A ∩ B| / |A|.
    pub fn containment(&self, other: &Signature) -> f64 {
        if self.mins.is_empty() {
            return 0.0;
        }
        self.count_common(other) as f64 / self.size() as f64
    }

    /// Serialize to JSON bytes, independent of any tree.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_has_no_false_negatives() {
        let mut f = BloomFilter::new(31, 1024, 4);
        for item in [3u64, 17, 99, 12345, u64::MAX] {
            f.insert(item);
        }
        for item in [3u64, 17, 99, 12345, u64::MAX] {
            assert!(f.contains(item));
        }
    }

    #[test]
    fn union_is_idempotent_and_commutative() {
        let mut a = BloomFilter::new(31, 512, 3);
        let mut b = BloomFilter::new(31, 512, 3);
        a.insert(1);
        a.insert(2);
        b.insert(2);
        b.insert(3);

        let mut ab = a.clone();
        ab.union_with(&b);
        let mut ba = b.clone();
        ba.union_with(&a);
        let mut ab_twice = ab.clone();
        ab_twice.union_with(&b);

        for item in 1..=3u64 {
            assert!(ab.contains(item));
            assert!(ba.contains(item));
            assert!(ab_twice.contains(item));
        }
        assert_eq!(ab.matches(&[1, 2, 3]), ab_twice.matches(&[1, 2, 3]));
    }

    #[test]
    fn filter_round_trips_through_bytes() {
        let mut f = BloomFilter::new(21, 256, 2);
        f.insert(42);
        let bytes = f.to_bytes().unwrap();
        let back = BloomFilter::from_bytes(&bytes).unwrap();
        assert!(back.contains(42));
        assert_eq!(back.len(), 256);
    }

    #[test]
    fn signature_similarity_and_containment() {
        let a = Signature::new("a", 5, vec![1, 2, 3, 4]);
        let b = Signature::new("b", 5, vec![3, 4, 5, 6, 7, 8]);

        assert_eq!(a.count_common(&b), 2);
        // |A ∩ B| = 2, |A ∪ B| = 8
        assert!((a.similarity(&b) - 0.25).abs() < 1e-9);
        assert!((a.containment(&b) - 0.5).abs() < 1e-9);
        assert!((b.containment(&a) - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn signature_dedups_mins() {
        let s = Signature::new("dup", 5, vec![9, 1, 9, 1, 5]);
        assert_eq!(s.mins(), &[1, 5, 9]);
        assert_eq!(s.size(), 3);
    }
}
