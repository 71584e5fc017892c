//! Identity and content hashing.
//!
//! Two hashes drive the cache:
//!
//! - [`ResourceHash`] is derived from the identifier string only (a path or a
//!   URL). It never changes while the identifier stays the same, so it works
//!   as the cache key and as the stem of every output filename.
//! - [`ContentHash`] is derived from the raw source bytes only. Comparing it
//!   against the stored value tells whether the bytes behind an identifier
//!   changed since the last run.
//!
//! Both use XXH3. The hashes exist for change detection, not integrity, so a
//! fast non-cryptographic function is the right tool.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

/// Hash of a resource identifier. 16 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHash(String);

impl ResourceHash {
    /// Hash an identifier string (see
    /// [`ResourceIdentifier::key`](crate::identifier::ResourceIdentifier::key)).
    pub fn of_identifier(identifier: &str) -> Self {
        Self(format!("{:016x}", xxh3_64(identifier.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of raw source bytes. 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:032x}", xxh3_128(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
