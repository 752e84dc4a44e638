//! Advice text normalization and fingerprinting
//!
//! Two advisories that differ only in case, whitespace or trailing
//! punctuation share a fingerprint.

use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest
const FINGERPRINT_LEN: usize = 16;

/// Lowercase, collapse whitespace, trim, strip trailing punctuation.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// Stable fingerprint of the normalized text.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}
