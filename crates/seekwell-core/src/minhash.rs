//! MinHash signatures and LSH banding.
//!
//! Values are shingled into overlapping character n-grams, hashed into a
//! fixed-length MinHash signature, and the signature is partitioned into
//! bands. Each band is reduced to a single hex `band_hash`; two values
//! that agree on every position of a band produce the same band hash,
//! which is the collision the retrieval side looks up.
//!
//! All hash seeds are fixed constants so identical input yields identical
//! band hashes across processes and runs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

pub const DEFAULT_SHINGLE_SIZE: usize = 3;
pub const DEFAULT_SIGNATURE_SIZE: usize = 20;
pub const DEFAULT_BANDS: usize = 4;

// Fixed seed; changing it invalidates every stored signature.
const SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Tunables for the signature pipeline.
///
/// `signature_size` must be a positive multiple of `bands`. More bands
/// raise recall (more chances to collide), fewer bands with longer rows
/// raise precision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LshConfig {
    pub shingle_size: usize,
    pub signature_size: usize,
    pub bands: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            shingle_size: DEFAULT_SHINGLE_SIZE,
            signature_size: DEFAULT_SIGNATURE_SIZE,
            bands: DEFAULT_BANDS,
        }
    }
}

impl LshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shingle_size == 0 {
            return Err(StoreError::Configuration(
                "lsh shingle_size must be positive".into(),
            ));
        }
        if self.signature_size == 0 || self.bands == 0 {
            return Err(StoreError::Configuration(
                "lsh signature_size and bands must be positive".into(),
            ));
        }
        if self.signature_size % self.bands != 0 {
            return Err(StoreError::Configuration(format!(
                "lsh signature_size ({}) must be divisible by bands ({})",
                self.signature_size, self.bands
            )));
        }
        Ok(())
    }

    pub fn rows_per_band(&self) -> usize {
        self.signature_size / self.bands
    }
}

/// A band's lookup key: the band index plus its collapsed hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BandKey {
    pub bucket_id: u32,
    pub band_hash: String,
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Overlapping character n-grams of the lowercased value.
///
/// Values shorter than the shingle size (but non-empty) contribute the
/// whole value as a single shingle, so short names still produce a
/// usable signature. Empty or whitespace-only values produce no
/// shingles.
pub fn shingles(value: &str, size: usize) -> BTreeSet<String> {
    let normalized = value.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();
    let mut out = BTreeSet::new();
    if chars.is_empty() || normalized.trim().is_empty() {
        return out;
    }
    if chars.len() < size {
        out.insert(normalized);
        return out;
    }
    for window in chars.windows(size) {
        out.insert(window.iter().collect());
    }
    out
}

fn shingle_base_hash(shingle: &str) -> u64 {
    let digest = Sha256::digest(shingle.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// MinHash signature of `value`, or `None` when the value yields no
/// shingles.
pub fn signature(value: &str, config: &LshConfig) -> Option<Vec<u64>> {
    let shingle_set = shingles(value, config.shingle_size);
    if shingle_set.is_empty() {
        return None;
    }
    let base_hashes: Vec<u64> = shingle_set.iter().map(|s| shingle_base_hash(s)).collect();

    let mut sig = Vec::with_capacity(config.signature_size);
    for i in 0..config.signature_size {
        let seed = splitmix64(SEED.wrapping_add(i as u64 + 1));
        let min = base_hashes
            .iter()
            .map(|&h| splitmix64(h ^ seed))
            .min()
            .unwrap_or(u64::MAX);
        sig.push(min);
    }
    Some(sig)
}

/// Band keys for `value`: one per band, empty when the value has no
/// shingles. The band index is folded into the hash input, so two
/// different bands can never collide on the hash alone.
pub fn band_hashes(value: &str, config: &LshConfig) -> Vec<BandKey> {
    let Some(sig) = signature(value, config) else {
        return Vec::new();
    };
    let rows = config.rows_per_band();
    let mut keys = Vec::with_capacity(config.bands);
    for (band, chunk) in sig.chunks(rows).enumerate() {
        let bucket_id = band as u32;
        let mut hasher = Sha256::new();
        hasher.update(bucket_id.to_le_bytes());
        for v in chunk {
            hasher.update(v.to_le_bytes());
        }
        keys.push(BandKey {
            bucket_id,
            band_hash: to_hex(&hasher.finalize()),
        });
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shingles_are_overlapping_char_ngrams() {
        let s = shingles("Shuran", 3);
        let expected: BTreeSet<String> = ["shu", "hur", "ura", "ran"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(s, expected);
    }

    #[test]
    fn short_value_becomes_single_shingle() {
        let s = shingles("刘娟", 3);
        assert_eq!(s.len(), 1);
        assert!(s.contains("刘娟"));
    }

    #[test]
    fn empty_value_has_no_shingles() {
        assert!(shingles("", 3).is_empty());
        assert!(shingles("   ", 3).is_empty());
    }

    #[test]
    fn signature_is_deterministic() {
        let config = LshConfig::default();
        let a = signature("database systems", &config);
        let b = signature("database systems", &config);
        assert_eq!(a, b);
        assert_eq!(a.as_ref().map(|s| s.len()), Some(config.signature_size));
    }

    #[test]
    fn identical_values_share_every_band() {
        let config = LshConfig::default();
        let a = band_hashes("approximate retrieval", &config);
        let b = band_hashes("approximate retrieval", &config);
        assert_eq!(a.len(), config.bands);
        assert_eq!(a, b);
    }

    #[test]
    fn unrelated_values_share_no_band() {
        let config = LshConfig::default();
        let a = band_hashes("Shuran", &config);
        let b = band_hashes("刘娟", &config);
        for (ka, kb) in a.iter().zip(&b) {
            assert_ne!(ka.band_hash, kb.band_hash);
        }
    }

    #[test]
    fn band_index_is_part_of_the_hash() {
        let config = LshConfig::default();
        let keys = band_hashes("alpha beta gamma", &config);
        let hashes: BTreeSet<&str> = keys.iter().map(|k| k.band_hash.as_str()).collect();
        assert_eq!(hashes.len(), config.bands);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(key.bucket_id, i as u32);
        }
    }

    #[test]
    fn case_is_normalized() {
        let config = LshConfig::default();
        assert_eq!(
            band_hashes("Shuran", &config),
            band_hashes("shuran", &config)
        );
    }

    #[test]
    fn config_validation() {
        assert!(LshConfig::default().validate().is_ok());
        let bad = LshConfig {
            signature_size: 20,
            bands: 3,
            shingle_size: 3,
        };
        assert!(matches!(
            bad.validate(),
            Err(StoreError::Configuration(_))
        ));
        let zero = LshConfig {
            signature_size: 0,
            bands: 0,
            shingle_size: 3,
        };
        assert!(zero.validate().is_err());
    }
}
