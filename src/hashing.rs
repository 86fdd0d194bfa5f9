//! Hashing System - SHA-256 Fingerprints
//!
//! Short, stable identifiers for jobs and engine asset sets, used to
//! correlate log lines across a job's pipeline.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::assets::Locator;

/// Fingerprint of an engine's asset list. Order-insensitive.
pub fn fingerprint_locators(locators: &[Locator]) -> String {
    let mut sorted: Vec<&str> = locators.iter().map(Locator::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for locator in sorted {
        hasher.update(locator.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Compute job hash for log correlation
/// job_hash = sha256(entry + each (path, len, content) of sources then auxiliary files)
pub fn compute_job_hash(
    sources: &BTreeMap<String, String>,
    entry: &str,
    auxiliary: &BTreeMap<String, Vec<u8>>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.as_bytes());
    for (path, text) in sources {
        update_entry(&mut hasher, path, text.as_bytes());
    }
    for (path, bytes) in auxiliary {
        update_entry(&mut hasher, path, bytes);
    }
    hex::encode(hasher.finalize())
}

fn update_entry(hasher: &mut Sha256, path: &str, content: &[u8]) {
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher.update((content.len() as u64).to_le_bytes());
    hasher.update(content);
}

/// First 12 hex characters, enough to tell log lines apart.
pub fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
