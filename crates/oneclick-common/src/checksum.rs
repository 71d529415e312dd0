//! Secrets checksum
//!
//! The workload's pod template carries a digest of the rollout's secret
//! entries so that changing any secret value changes the template and rolls
//! the pods, even though the values themselves are never stored here.

use sha2::{Digest, Sha256};

use crate::crd::SecretItem;

/// Hex SHA-256 over the ordered (name, value) pairs
///
/// Each name and value is NUL-terminated so `("ab", "c")` and `("a", "bc")`
/// hash differently. Order matters.
pub fn secrets_checksum(secrets: &[SecretItem]) -> String {
    let mut hasher = Sha256::new();
    for item in secrets {
        hasher.update(item.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(item.value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
