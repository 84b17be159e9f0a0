// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable content hashing, used both for the runbook-style cache keys and
//! for telemetry-record dedupe fingerprints.

use sha2::{Digest, Sha256};

/// Hashes a sequence of string-convertible parts into a stable hex digest.
///
/// Parts are joined with a `\0` separator before hashing so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn stable_fingerprint<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_hash_identically() {
        let a = stable_fingerprint(["otlp-log", "ses-1", "thread-1"]);
        let b = stable_fingerprint(["otlp-log", "ses-1", "thread-1"]);
        assert_eq!(a, b);
    }

    #[test]
    fn separator_prevents_part_boundary_collisions() {
        let a = stable_fingerprint(["ab", "c"]);
        let b = stable_fingerprint(["a", "bc"]);
        assert_ne!(a, b);
    }
}
