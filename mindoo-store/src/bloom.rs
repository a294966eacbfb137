//! Bloom summary of the id set.
//!
//! Peers fetch this instead of shipping full id lists. Sized for a false
//! positive rate of at most 1% at the stated cardinality; double hashing
//! over a single SHA-256 of the id supplies the k probe positions.

use mindoo_crypto::b64;
use mindoo_crypto::hash::sha256;
use serde::{Deserialize, Serialize};

/// Hash parameters of a serialized filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomKParams {
    /// Number of probe positions per id.
    pub hash_count: u32,
    /// Filter width in bits.
    pub bit_count: u64,
}

/// Wire form of the filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomSummary {
    pub k_params: BloomKParams,
    #[serde(with = "b64")]
    pub bits: Vec<u8>,
    /// Number of ids the filter was built over.
    pub cardinality: u64,
}

impl BloomSummary {
    /// Membership probe. False positives possible, false negatives not.
    pub fn might_contain(&self, id: &str) -> bool {
        if self.k_params.bit_count == 0 {
            return false;
        }
        let (h1, h2) = probe_seeds(id);
        (0..self.k_params.hash_count).all(|i| {
            let bit = probe_position(h1, h2, i, self.k_params.bit_count);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }
}

/// Mutable filter, rebuilt as the store grows.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    params: BloomKParams,
    count: u64,
    capacity: u64,
}

/// Bits per expected element for p = 0.01: -ln(0.01) / ln(2)^2.
const BITS_PER_ELEMENT: f64 = 9.585;
/// Probes for p = 0.01: BITS_PER_ELEMENT * ln(2), rounded up.
const HASH_COUNT: u32 = 7;
const MIN_CAPACITY: u64 = 1024;

impl BloomFilter {
    /// An empty filter sized for `capacity` ids.
    pub fn with_capacity(capacity: u64) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let bit_count = ((capacity as f64 * BITS_PER_ELEMENT).ceil() as u64).max(8);
        let bit_count = (bit_count + 7) / 8 * 8;
        Self {
            bits: vec![0u8; (bit_count / 8) as usize],
            params: BloomKParams {
                hash_count: HASH_COUNT,
                bit_count,
            },
            count: 0,
            capacity,
        }
    }

    /// Build from an id iterator.
    pub fn from_ids<'a>(ids: impl ExactSizeIterator<Item = &'a str>) -> Self {
        let mut filter = Self::with_capacity(ids.len() as u64);
        for id in ids {
            filter.insert(id);
        }
        filter
    }

    /// Whether the filter has outgrown the capacity it was sized for and
    /// should be rebuilt to hold its FPR target.
    pub fn needs_rebuild(&self) -> bool {
        self.count > self.capacity
    }

    pub fn insert(&mut self, id: &str) {
        let (h1, h2) = probe_seeds(id);
        for i in 0..self.params.hash_count {
            let bit = probe_position(h1, h2, i, self.params.bit_count);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        self.count += 1;
    }

    pub fn might_contain(&self, id: &str) -> bool {
        let (h1, h2) = probe_seeds(id);
        (0..self.params.hash_count).all(|i| {
            let bit = probe_position(h1, h2, i, self.params.bit_count);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    pub fn to_summary(&self) -> BloomSummary {
        BloomSummary {
            k_params: self.params,
            bits: self.bits.clone(),
            cardinality: self.count,
        }
    }
}

fn probe_seeds(id: &str) -> (u64, u64) {
    let digest = sha256(id.as_bytes());
    let h1 = u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
    let h2 = u64::from_be_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
    (h1, h2 | 1)
}

fn probe_position(h1: u64, h2: u64, i: u32, bit_count: u64) -> u64 {
    h1.wrapping_add(h2.wrapping_mul(i as u64)) % bit_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let ids: Vec<String> = (0..5_000).map(|i| format!("entry-{}", i)).collect();
        let filter = BloomFilter::from_ids(ids.iter().map(String::as_str));
        for id in &ids {
            assert!(filter.might_contain(id), "false negative for {}", id);
        }
    }

    #[test]
    fn test_false_positive_rate_within_target() {
        let ids: Vec<String> = (0..10_000).map(|i| format!("present-{}", i)).collect();
        let filter = BloomFilter::from_ids(ids.iter().map(String::as_str));

        let mut false_positives = 0u32;
        let probes = 10_000;
        for i in 0..probes {
            if filter.might_contain(&format!("absent-{}", i)) {
                false_positives += 1;
            }
        }
        // Target is <= 1%; allow slack for hash variance.
        assert!(
            false_positives <= probes / 50,
            "FPR too high: {}/{}",
            false_positives,
            probes
        );
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::with_capacity(0);
        assert!(!filter.might_contain("anything"));
        assert_eq!(filter.to_summary().cardinality, 0);
    }

    #[test]
    fn test_summary_json_roundtrip() {
        let filter = BloomFilter::from_ids(["a", "b", "c"].into_iter());
        let json = serde_json::to_string(&filter.to_summary()).unwrap();
        let restored: BloomSummary = serde_json::from_str(&json).unwrap();
        assert!(restored.might_contain("a"));
        assert_eq!(restored.cardinality, 3);
    }

    #[test]
    fn test_rebuild_flag() {
        let mut filter = BloomFilter::with_capacity(1024);
        for i in 0..1025 {
            filter.insert(&format!("id-{}", i));
        }
        assert!(filter.needs_rebuild());
    }
}
