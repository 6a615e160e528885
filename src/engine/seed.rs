//! Event-level seed derivation.
//!
//! Every initial sample in a run is drawn with a seed derived from
//! `(run_seed, stable_event_key)` through a one-way hash truncated to a
//! `u64`. Same inputs give the same sample; distinct keys give independent
//! streams within one run. Nothing here depends on sampling order.

use sha2::{Digest, Sha256};

/// Derive a sampling seed for one event key within one run.
#[must_use]
pub fn event_seed(run_seed: u64, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(run_seed.to_le_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
