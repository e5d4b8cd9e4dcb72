//! xorshift64* random number generator
//!
//! This is a fast, high-quality PRNG that is deterministic and suitable
//! for simulation purposes.
//!
//! # Determinism
//!
//! Same seed → same sequence of random numbers. Every source of
//! randomness inside the market-clearing logic draws from a stream
//! derived from `(global_seed, tick_index, purpose_tag)`, so a rerun
//! from the same world state reproduces identical outputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic random number generator using xorshift64*
///
/// # Example
/// ```
/// use econ_sim_core_rs::RngStream;
///
/// let mut rng = RngStream::new(12345);
/// let value = rng.next_u64();
/// let unit = rng.next_f64(); // [0.0, 1.0)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RngStream {
    /// Internal state (64-bit)
    state: u64,
}

impl RngStream {
    /// Create a new RNG with given seed
    pub fn new(seed: u64) -> Self {
        // xorshift state must never be zero
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Derive the stream for one purpose within one tick.
    ///
    /// The stream seed mixes `(global_seed, tick_index, tag)` through
    /// SHA-256 so distinct purposes ("labor", "goods", "shock", ...)
    /// never share a sequence even at the same tick.
    ///
    /// # Example
    /// ```
    /// use econ_sim_core_rs::RngStream;
    ///
    /// let a = RngStream::for_purpose(42, 7, "labor");
    /// let b = RngStream::for_purpose(42, 7, "labor");
    /// assert_eq!(a.state_snapshot(), b.state_snapshot());
    /// ```
    pub fn for_purpose(global_seed: u64, tick_index: u64, tag: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(global_seed.to_le_bytes());
        hasher.update(tick_index.to_le_bytes());
        hasher.update(tag.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self::new(u64::from_le_bytes(bytes))
    }

    /// Per-agent substream: extends a purpose stream with an entity id.
    ///
    /// Used where the matching rule seeds noise by
    /// `(global_seed + tick_index + agent_id)` so a candidate's draw does
    /// not depend on how many other candidates drew before it.
    pub fn for_agent(global_seed: u64, tick_index: u64, tag: &str, agent_id: &str) -> Self {
        let scoped = format!("{tag}:{agent_id}");
        Self::for_purpose(global_seed, tick_index, &scoped)
    }

    /// Generate next random u64 value
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64* algorithm
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Generate random f64 in range [0.0, 1.0)
    pub fn next_f64(&mut self) -> f64 {
        let value = self.next_u64();
        (value >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }

    /// Generate random value in range [min, max)
    ///
    /// # Panics
    /// Panics if min >= max
    pub fn range(&mut self, min: i64, max: i64) -> i64 {
        assert!(min < max, "min must be less than max");
        let value = self.next_u64();
        let range_size = (max - min) as u64;
        min + (value % range_size) as i64
    }

    /// Generate random f64 in range [min, max)
    pub fn range_f64(&mut self, min: f64, max: f64) -> f64 {
        assert!(min < max, "min must be less than max");
        min + self.next_f64() * (max - min)
    }

    /// Draw from a normal distribution via Box-Muller.
    pub fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        // avoid ln(0)
        let u1 = (1.0 - self.next_f64()).max(f64::MIN_POSITIVE);
        let u2 = self.next_f64();
        let radius = (-2.0 * u1.ln()).sqrt();
        mean + std_dev * radius * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Draw from a normal distribution truncated to [lo, hi].
    ///
    /// Rejection sampling with a clamp fallback after a bounded number of
    /// attempts keeps the draw count deterministic.
    pub fn truncated_normal(&mut self, mean: f64, std_dev: f64, lo: f64, hi: f64) -> f64 {
        for _ in 0..16 {
            let draw = self.normal(mean, std_dev);
            if draw >= lo && draw <= hi {
                return draw;
            }
        }
        self.normal(mean, std_dev).clamp(lo, hi)
    }

    /// Deterministic Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        if items.len() < 2 {
            return;
        }
        for i in (1..items.len()).rev() {
            let j = (self.next_u64() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }

    /// Get current RNG state (for checkpointing/replay)
    pub fn state_snapshot(&self) -> u64 {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_seed_converted_to_nonzero() {
        let rng = RngStream::new(0);
        assert_ne!(rng.state_snapshot(), 0, "Zero seed should be converted to 1");
    }

    #[test]
    #[should_panic(expected = "min must be less than max")]
    fn test_range_invalid_bounds() {
        let mut rng = RngStream::new(12345);
        rng.range(100, 50);
    }

    #[test]
    fn test_next_f64_in_range() {
        let mut rng = RngStream::new(12345);
        for _ in 0..1000 {
            let val = rng.next_f64();
            assert!((0.0..1.0).contains(&val), "next_f64() produced {}", val);
        }
    }

    #[test]
    fn test_purpose_streams_deterministic_and_distinct() {
        let mut a = RngStream::for_purpose(42, 3, "labor");
        let mut b = RngStream::for_purpose(42, 3, "labor");
        let mut c = RngStream::for_purpose(42, 3, "goods");
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        assert_ne!(
            RngStream::for_purpose(42, 3, "labor").state_snapshot(),
            c.state_snapshot()
        );
    }

    #[test]
    fn test_truncated_normal_respects_bounds() {
        let mut rng = RngStream::new(777);
        for _ in 0..500 {
            let v = rng.truncated_normal(0.0, 1.0, -0.5, 0.5);
            assert!((-0.5..=0.5).contains(&v), "out of bounds: {}", v);
        }
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let mut a: Vec<u32> = (0..20).collect();
        let mut b: Vec<u32> = (0..20).collect();
        RngStream::for_purpose(9, 1, "bond").shuffle(&mut a);
        RngStream::for_purpose(9, 1, "bond").shuffle(&mut b);
        assert_eq!(a, b);
    }
}
