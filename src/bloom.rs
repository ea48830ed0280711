//! A small, fixed-size bloom filter.
//!
//! Fronts the speed-layer memory cache (SPEC_FULL.md §4.4 tier 1): a
//! negative lookup here means "definitely not cached," letting the
//! dispatcher skip a map lookup for fingerprints it has never seen. No
//! crate in the broader dependency corpus provides one; this is a small
//! enough primitive to hand-roll rather than pulling in a crate for it.

use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// A classic k-hash-function bloom filter over a bit vector, using two
/// independent hash seeds combined via double hashing (`h1 + i * h2`) to
/// derive `k` probe positions cheaply.
pub struct BloomFilter {
    bits: Mutex<Vec<u64>>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// `expected_items` and `false_positive_rate` size the filter using the
    /// standard optimal formulas.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let num_bits =
            optimal_num_bits(expected_items, false_positive_rate).max(64);
        let num_hashes = optimal_num_hashes(num_bits, expected_items).max(1);
        let words = num_bits.div_ceil(64);

        Self {
            bits: Mutex::new(vec![0u64; words]),
            num_bits,
            num_hashes,
        }
    }

    fn hash_pair(item: &str) -> (u64, u64) {
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut h1);
        let a = h1.finish();

        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        (item, 0x9E3779B97F4A7C15u64).hash(&mut h2);
        let b = h2.finish() | 1; // ensure odd, avoids degenerate all-even cycles

        (a, b)
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = Self::hash_pair(item);
        let num_bits = self.num_bits as u64;
        (0..self.num_hashes).map(move |i| {
            (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits) as usize
        })
    }

    pub fn insert(&self, item: &str) {
        let mut bits = self.bits.lock().expect("bloom filter lock poisoned");
        for pos in self.positions(item) {
            bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// Returns `false` only if `item` is definitely not present. Returns
    /// `true` if it might be present (subject to the configured false
    /// positive rate) — callers must still confirm with the backing map.
    pub fn might_contain(&self, item: &str) -> bool {
        let bits = self.bits.lock().expect("bloom filter lock poisoned");
        self.positions(item).all(|pos| bits[pos / 64] & (1 << (pos % 64)) != 0)
    }

    pub fn clear(&self) {
        let mut bits = self.bits.lock().expect("bloom filter lock poisoned");
        bits.iter_mut().for_each(|w| *w = 0);
    }
}

fn optimal_num_bits(n: usize, p: f64) -> usize {
    let n = n as f64;
    let m = -(n * p.ln()) / (std::f64::consts::LN_2.powi(2));
    m.ceil() as usize
}

fn optimal_num_hashes(m: usize, n: usize) -> u32 {
    let m = m as f64;
    let n = n as f64;
    ((m / n) * std::f64::consts::LN_2).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let filter = BloomFilter::new(1000, 0.01);
        filter.insert("fingerprint-a");
        assert!(filter.might_contain("fingerprint-a"));
    }

    #[test]
    fn test_never_seen_usually_absent() {
        let filter = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            filter.insert(&format!("seen-{}", i));
        }
        // Bloom filters can false-positive, but must never false-negative.
        for i in 0..500 {
            assert!(filter.might_contain(&format!("seen-{}", i)));
        }
    }

    #[test]
    fn test_clear_resets_state() {
        let filter = BloomFilter::new(100, 0.01);
        filter.insert("x");
        filter.clear();
        // After clear, a previously-inserted single item is very likely
        // reported absent (all bits zeroed).
        assert!(!filter.might_contain("x"));
    }
}
