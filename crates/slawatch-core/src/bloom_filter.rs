//! Bloom filter for calculator existence checks.
//!
//! Answers "has this calculator ever been written through the cache?" with
//! either "definitely no" or "probably yes". A negative lets the run cache
//! skip its backend round trip; it never stands in for a store lookup.
//!
//! Sizing for capacity `n` and false-positive rate `fp`:
//!
//! - Bits needed: `m = -n × ln(fp) / (ln2)²`
//! - Hash functions: `k = (m / n) × ln2`

// =============================================================================
// Hash helpers (double hashing scheme)
// =============================================================================

/// FNV-1a 64-bit hash.
fn fnv1a(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// DJB2 variant, independent of FNV-1a.
fn djb2(data: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in data {
        h = h.wrapping_shl(5).wrapping_add(h).wrapping_add(u64::from(b));
    }
    h
}

/// `k` indices via double hashing: h(i) = (h1 + i*h2) mod m.
fn hash_indices(data: &[u8], k: u32, m: usize) -> impl Iterator<Item = usize> {
    let h1 = fnv1a(data);
    let h2 = djb2(data);
    (0..k).map(move |i| {
        let combined = h1.wrapping_add(u64::from(i).wrapping_mul(h2));
        (combined % m as u64) as usize
    })
}

/// A standard Bloom filter using single-bit buckets. No removal.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    count: usize,
}

impl BloomFilter {
    /// Size a filter for `capacity` items at `fp_rate` (e.g. 0.01 for 1%).
    ///
    /// A zero capacity is treated as one; `fp_rate` is clamped into (0, 1).
    #[must_use]
    pub fn with_capacity(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let fp_rate = fp_rate.clamp(1e-9, 0.5);

        let num_bits = optimal_num_bits(capacity, fp_rate).max(64);
        let num_hashes = optimal_num_hashes(num_bits, capacity);

        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
            count: 0,
        }
    }

    pub fn insert(&mut self, key: &str) {
        for idx in hash_indices(key.as_bytes(), self.num_hashes, self.num_bits) {
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
        self.count += 1;
    }

    /// `false` means `key` was definitely never inserted.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        hash_indices(key.as_bytes(), self.num_hashes, self.num_bits)
            .all(|idx| (self.bits[idx / 64] >> (idx % 64)) & 1 == 1)
    }

    /// Number of inserts since creation or the last clear.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.count = 0;
    }
}

/// Optimal bit count: m = -n × ln(fp) / (ln2)²
#[must_use]
pub fn optimal_num_bits(capacity: usize, fp_rate: f64) -> usize {
    let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
    let m = -(capacity as f64 * fp_rate.ln()) / ln2_sq;
    m.ceil() as usize
}

/// Optimal hash count: k = (m / n) × ln2, at least one.
#[must_use]
pub fn optimal_num_hashes(num_bits: usize, capacity: usize) -> u32 {
    let k = (num_bits as f64 / capacity.max(1) as f64) * std::f64::consts::LN_2;
    (k.round() as u32).max(1)
}
