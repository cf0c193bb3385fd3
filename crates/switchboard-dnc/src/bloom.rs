// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Probabilistic negative filter over numbers confirmed absent from the DNC
//! registry.
//!
//! A fixed bit array with `k` hash positions per key, each derived from a
//! SHA-256 digest salted with the hash-function index. Lookups that hit all
//! `k` bits short-circuit the tiered lookup entirely; a false positive only
//! skips work for a number that would have resolved to "not listed" anyway,
//! never the other way around, because only confirmed negatives are added.
//!
//! Bits only accumulate until an explicit [`NegativeFilter::clear`], which
//! operators run after a registry refresh.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Fixed-size concurrent bloom filter.
pub struct NegativeFilter {
    /// Bit array packed into u64 words.
    words: Vec<AtomicU64>,
    /// Total bits (m).
    num_bits: u64,
    /// Hash functions (k).
    hashes: u32,
    /// Keys added since the last clear (n).
    inserted: AtomicU64,
}

impl NegativeFilter {
    /// Create a filter with `num_bits` bits (rounded up to a whole word,
    /// minimum 64) and `hashes` hash functions (clamped to 1..=16).
    pub fn new(num_bits: usize, hashes: u32) -> Self {
        let num_bits = num_bits.max(64) as u64;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            hashes: hashes.clamp(1, 16),
            inserted: AtomicU64::new(0),
        }
    }

    /// Bit positions for `key`: SHA-256 salted with the function index,
    /// folded to a u64 and reduced mod m.
    fn positions(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let key = key.as_bytes().to_vec();
        (0..self.hashes).map(move |i| {
            let mut hasher = Sha256::new();
            hasher.update([i as u8]);
            hasher.update(&key);
            let digest = hasher.finalize();
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(word) % self.num_bits
        })
    }

    /// Record a confirmed-negative key. Sets all `k` bits.
    pub fn add(&self, key: &str) {
        for pos in self.positions(key) {
            let word = (pos / 64) as usize;
            let bit = pos % 64;
            self.words[word].fetch_or(1u64 << bit, Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// False iff any of the `k` bit positions is unset, i.e. the key was
    /// definitely never added. True may be a false positive.
    pub fn may_contain(&self, key: &str) -> bool {
        for pos in self.positions(key) {
            let word = (pos / 64) as usize;
            let bit = pos % 64;
            if self.words[word].load(Ordering::Relaxed) & (1u64 << bit) == 0 {
                return false;
            }
        }
        true
    }

    /// Estimated false-positive rate `(1 - e^(-k*n/m))^k` for the current
    /// insertion count.
    pub fn estimated_fp_rate(&self) -> f64 {
        let n = self.inserted.load(Ordering::Relaxed) as f64;
        let m = self.num_bits as f64;
        let k = f64::from(self.hashes);
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Reset all bits and the insertion counter.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.inserted.store(0, Ordering::Relaxed);
    }

    /// Keys added since the last clear.
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Bit-array width in bits.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions.
    pub fn hashes(&self) -> u32 {
        self.hashes
    }
}

impl std::fmt::Debug for NegativeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegativeFilter")
            .field("num_bits", &self.num_bits)
            .field("hashes", &self.hashes)
            .field("inserted", &self.inserted.load(Ordering::Relaxed))
            .finish()
    }
}
