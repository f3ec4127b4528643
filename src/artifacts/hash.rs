// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Content hashing for artifact addresses
//!
//! Uses BLAKE3 for fast, secure content hashing.

use blake3::Hasher;

/// Hash a byte slice to a hex content address
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// First 12 hex characters, for display
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
