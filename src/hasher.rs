//! Consistent hashing of identities into the unit interval.
use sha1::{Digest, Sha1};

/// Salt used when choosing a multivariate variant, so variant choice is independent from the
/// rollout decision.
pub const VARIANT_SALT: &str = "variant";

/// Scale of the 60-bit hash prefix (15 hex digits).
const LONG_SCALE: f64 = 0xfff_ffff_ffff_ffff_u64 as f64;

/// Maps an identity to a number in `[0, 1)` for a given flag.
///
/// Implementations must be deterministic: the same `(flag_key, identity, salt)` always yields the
/// same number, across processes and SDK versions.
pub trait ConsistentHasher {
    /// Hash `identity` for `flag_key`.
    fn hash(&self, flag_key: &str, identity: &str, salt: &str) -> f64;
}

/// The default (and only) hasher: first 60 bits of `SHA1("{flag_key}.{identity}{salt}")`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Hasher;

impl ConsistentHasher for Sha1Hasher {
    fn hash(&self, flag_key: &str, identity: &str, salt: &str) -> f64 {
        let digest = Sha1::new()
            .chain_update(flag_key)
            .chain_update(".")
            .chain_update(identity)
            .chain_update(salt)
            .finalize();
        let prefix = digest[..8]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
            >> 4;
        prefix as f64 / LONG_SCALE
    }
}

/// Hasher returning the same number for every input.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedHasher(pub f64);

#[cfg(test)]
impl ConsistentHasher for FixedHasher {
    fn hash(&self, _flag_key: &str, _identity: &str, _salt: &str) -> f64 {
        self.0
    }
}
