//! Content-addressed cache for incremental builds.
//!
//! AVIF encoding dominates the cost of a run. This module lets the pipeline
//! skip a source entirely when its bytes have not changed since the last run.
//!
//! # Design
//!
//! Every entry is keyed by the [`ResourceHash`] of the source identifier and
//! records the [`ContentHash`] of the bytes it was generated from:
//!
//! - **`resource_hash`** never changes while the identifier stays the same.
//!   It is the store key and the stem of every output filename, so a
//!   regeneration overwrites the previous files in place.
//! - **`content_hash`** decides validity. An exact `(resource_hash,
//!   content_hash)` match is a hit; an entry under the same resource with a
//!   different content hash is stale and gets removed before reprocessing.
//!
//! The entry also stores what the variant matrix needs (dimensions,
//! transparency, animation), so a hit rebuilds the variant list without
//! decoding a single pixel.
//!
//! ## Storage
//!
//! [`CacheStore`] is the key-value contract the pipeline depends on.
//! [`JsonCacheStore`] persists it as `<output_dir>/.asset-cache.json`, next to
//! the generated files, so it travels with the output directory when cached
//! in CI. [`MemoryCacheStore`] keeps everything in process.
//!
//! ## Bypassing the cache
//!
//! `--no-cache` opens the store with [`JsonCacheStore::fresh`], which starts
//! from an empty manifest. Every source is regenerated and the old files are
//! overwritten naturally.

use crate::hashing::{ContentHash, ResourceHash};
use crate::identifier::SourceType;
use crate::imaging::{BreakpointSet, OutputFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Name of the cache manifest file within the output directory.
const MANIFEST_FILENAME: &str = ".asset-cache.json";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("corrupt cache entry {hash}: {reason}")]
    CorruptEntry { hash: String, reason: String },
}

/// Record of one successfully processed source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_hash: ResourceHash,
    pub content_hash: ContentHash,
    /// Unix seconds.
    pub created_at: u64,
    pub source_type: SourceType,
    /// Identifier string of the source.
    pub source: String,
    pub has_transparency: bool,
    pub original_width: u32,
    pub original_height: u32,
    /// Container of an animated source, `None` for stills.
    #[serde(default)]
    pub animation: Option<OutputFormat>,
    /// Hash of the settings the variants were generated with.
    #[serde(default)]
    pub params_hash: String,
}

impl CacheEntry {
    /// Reject entries that could not have been written by a successful run.
    pub fn validate(&self) -> Result<(), CacheError> {
        let corrupt = |reason: &str| CacheError::CorruptEntry {
            hash: self.resource_hash.to_string(),
            reason: reason.to_string(),
        };
        if self.resource_hash.as_str().is_empty() {
            return Err(corrupt("empty resource hash"));
        }
        if self.content_hash.as_str().is_empty() {
            return Err(corrupt("empty content hash"));
        }
        if self.original_width == 0 || self.original_height == 0 {
            return Err(corrupt("zero dimensions"));
        }
        Ok(())
    }
}

/// Hash of the variant settings: breakpoints and quality.
///
/// Stored with every entry. An entry generated under different settings is
/// treated as a miss even when the source bytes are unchanged.
pub fn params_hash(breakpoints: &BreakpointSet, quality: u32) -> String {
    let key = format!(
        "variants\0{}:{}:{}:{}:{}:{}\0q{}",
        breakpoints.xs,
        breakpoints.sm,
        breakpoints.md,
        breakpoints.lg,
        breakpoints.xl,
        breakpoints.xxl,
        quality
    );
    ContentHash::of_bytes(key.as_bytes()).to_string()
}

/// Seconds since the Unix epoch, for [`CacheEntry::created_at`].
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Key-value persistence of cache entries, keyed uniquely by resource hash.
///
/// Implementations must be safe to call from every worker at once. The
/// pipeline never writes the same key from two workers concurrently.
pub trait CacheStore: Send + Sync {
    /// Exact match on both hashes.
    fn get(
        &self,
        resource_hash: &ResourceHash,
        content_hash: &ContentHash,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Any entry for the resource, whatever its content hash.
    fn get_by_resource(&self, resource_hash: &ResourceHash)
    -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace the entry for `entry.resource_hash`.
    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove the entry for a resource. Removing a missing entry is not an error.
    fn remove(&self, resource_hash: &ResourceHash) -> Result<(), CacheError>;
}

fn poisoned() -> CacheError {
    CacheError::StoreUnavailable("cache lock poisoned".to_string())
}

fn checked(entry: Option<&CacheEntry>) -> Result<Option<CacheEntry>, CacheError> {
    match entry {
        Some(entry) => {
            entry.validate()?;
            Ok(Some(entry.clone()))
        }
        None => Ok(None),
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<ResourceHash, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(
        &self,
        resource_hash: &ResourceHash,
        content_hash: &ContentHash,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        checked(
            entries
                .get(resource_hash)
                .filter(|e| &e.content_hash == content_hash),
        )
    }

    fn get_by_resource(
        &self,
        resource_hash: &ResourceHash,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        checked(entries.get(resource_hash))
    }

    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(entry.resource_hash.clone(), entry);
        Ok(())
    }

    fn remove(&self, resource_hash: &ResourceHash) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(resource_hash);
        Ok(())
    }
}

/// On-disk layout of the manifest.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: BTreeMap<ResourceHash, CacheEntry>,
}

/// Store persisted as a JSON manifest in the output directory.
///
/// The whole manifest is held in memory and rewritten on every change.
#[derive(Debug)]
pub struct JsonCacheStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<ResourceHash, CacheEntry>>,
}

impl JsonCacheStore {
    /// Load the manifest from `output_dir`. A missing, unparsable or
    /// other-version manifest loads as empty.
    pub fn open(output_dir: &Path) -> Self {
        let path = manifest_path(output_dir);
        let entries = load_entries(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Start from an empty manifest, ignoring what is on disk.
    pub fn fresh(output_dir: &Path) -> Self {
        Self {
            path: manifest_path(output_dir),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the manifest. Called with the entries lock held so writers
    /// never interleave.
    fn save(&self, entries: &BTreeMap<ResourceHash, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| self.unavailable(e))?;
        }
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries: entries.clone(),
        };
        let json = serde_json::to_string_pretty(&manifest).map_err(|e| self.unavailable(e))?;
        std::fs::write(&self.path, json).map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, e: impl fmt::Display) -> CacheError {
        CacheError::StoreUnavailable(format!("{}: {}", self.path.display(), e))
    }
}

fn load_entries(path: &Path) -> BTreeMap<ResourceHash, CacheEntry> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return BTreeMap::new(),
    };
    let manifest: Manifest = match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable cache manifest");
            return BTreeMap::new();
        }
    };
    if manifest.version != MANIFEST_VERSION {
        warn!(
            path = %path.display(),
            found = manifest.version,
            expected = MANIFEST_VERSION,
            "ignoring cache manifest from another version"
        );
        return BTreeMap::new();
    }
    manifest.entries
}

impl CacheStore for JsonCacheStore {
    fn get(
        &self,
        resource_hash: &ResourceHash,
        content_hash: &ContentHash,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        checked(
            entries
                .get(resource_hash)
                .filter(|e| &e.content_hash == content_hash),
        )
    }

    fn get_by_resource(
        &self,
        resource_hash: &ResourceHash,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        checked(entries.get(resource_hash))
    }

    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(entry.resource_hash.clone(), entry);
        self.save(&entries)
    }

    fn remove(&self, resource_hash: &ResourceHash) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        if entries.remove(resource_hash).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// Resolve the cache manifest path for an output directory.
pub fn manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join(MANIFEST_FILENAME)
}

/// Summary of cache behaviour for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub regenerated: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn regenerate(&mut self) {
        self.regenerated += 1;
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.regenerated + self.failed
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(f, "{} cached, {} generated", self.hits, self.regenerated)?;
        } else {
            write!(f, "{} generated", self.regenerated)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.hits > 0 || self.failed > 0 {
            write!(f, " ({} total)", self.total())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry(id: &str, bytes: &[u8]) -> CacheEntry {
        CacheEntry {
            resource_hash: ResourceHash::of_identifier(id),
            content_hash: ContentHash::of_bytes(bytes),
            created_at: 1_700_000_000,
            source_type: SourceType::Local,
            source: id.to_string(),
            has_transparency: false,
            original_width: 800,
            original_height: 600,
            animation: None,
            params_hash: params_hash(&BreakpointSet::default(), 80),
        }
    }

    // =========================================================================
    // Store contract (both implementations)
    // =========================================================================

    fn exercise_contract(store: &dyn CacheStore) {
        let e = entry("img/a.jpg", b"v1");
        let rh = e.resource_hash.clone();
        assert_eq!(store.get_by_resource(&rh).unwrap(), None);

        store.upsert(e.clone()).unwrap();
        assert_eq!(store.get(&rh, &e.content_hash).unwrap(), Some(e.clone()));
        assert_eq!(store.get_by_resource(&rh).unwrap(), Some(e.clone()));

        // Different content under the same resource: no exact hit, but the
        // stale entry is still visible by resource
        let changed = ContentHash::of_bytes(b"v2");
        assert_eq!(store.get(&rh, &changed).unwrap(), None);
        assert!(store.get_by_resource(&rh).unwrap().is_some());

        store.remove(&rh).unwrap();
        assert_eq!(store.get_by_resource(&rh).unwrap(), None);
        // Removing twice is fine
        store.remove(&rh).unwrap();
    }

    #[test]
    fn memory_store_contract() {
        exercise_contract(&MemoryCacheStore::new());
    }

    #[test]
    fn json_store_contract() {
        let tmp = TempDir::new().unwrap();
        exercise_contract(&JsonCacheStore::open(tmp.path()));
    }

    #[test]
    fn upsert_replaces_by_resource() {
        let store = MemoryCacheStore::new();
        store.upsert(entry("a.png", b"one")).unwrap();
        store.upsert(entry("a.png", b"two")).unwrap();
        assert_eq!(store.len(), 1);
        let stored = store
            .get_by_resource(&ResourceHash::of_identifier("a.png"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.content_hash, ContentHash::of_bytes(b"two"));
    }

    // =========================================================================
    // JSON persistence
    // =========================================================================

    #[test]
    fn json_store_persists_across_opens() {
        let tmp = TempDir::new().unwrap();
        let e = entry("img/a.jpg", b"bytes");
        JsonCacheStore::open(tmp.path()).upsert(e.clone()).unwrap();

        let reopened = JsonCacheStore::open(tmp.path());
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.get(&e.resource_hash, &e.content_hash).unwrap(),
            Some(e)
        );
    }

    #[test]
    fn json_store_creates_output_dir() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("nested").join("out");
        let store = JsonCacheStore::open(&out);
        store.upsert(entry("a.jpg", b"x")).unwrap();
        assert!(manifest_path(&out).exists());
    }

    #[test]
    fn fresh_ignores_existing_manifest() {
        let tmp = TempDir::new().unwrap();
        JsonCacheStore::open(tmp.path())
            .upsert(entry("a.jpg", b"x"))
            .unwrap();
        assert!(JsonCacheStore::fresh(tmp.path()).is_empty());
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(JsonCacheStore::open(tmp.path()).is_empty());
    }

    #[test]
    fn load_corrupt_json_returns_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(manifest_path(tmp.path()), "not json {{{").unwrap();
        assert!(JsonCacheStore::open(tmp.path()).is_empty());
    }

    #[test]
    fn load_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(
            r#"{{"version": {}, "entries": {{}}}}"#,
            MANIFEST_VERSION + 99
        );
        fs::write(manifest_path(tmp.path()), json).unwrap();
        assert!(JsonCacheStore::open(tmp.path()).is_empty());
    }

    #[test]
    fn entries_without_animation_flag_still_load() {
        let tmp = TempDir::new().unwrap();
        let rh = ResourceHash::of_identifier("a.jpg");
        let json = format!(
            r#"{{"version": {MANIFEST_VERSION}, "entries": {{"{rh}": {{
                "resource_hash": "{rh}", "content_hash": "abc", "created_at": 1,
                "source_type": "local", "source": "a.jpg", "has_transparency": true,
                "original_width": 10, "original_height": 5}}}}}}"#
        );
        fs::write(manifest_path(tmp.path()), json).unwrap();

        let store = JsonCacheStore::open(tmp.path());
        let loaded = store.get_by_resource(&rh).unwrap().unwrap();
        assert_eq!(loaded.animation, None);
        assert!(loaded.has_transparency);
    }

    #[test]
    fn invalid_entry_reads_as_corrupt() {
        let store = MemoryCacheStore::new();
        let mut bad = entry("a.jpg", b"x");
        bad.original_width = 0;
        store.upsert(bad.clone()).unwrap();

        let err = store.get_by_resource(&bad.resource_hash).unwrap_err();
        assert!(matches!(err, CacheError::CorruptEntry { ref reason, .. } if reason.contains("zero")));
    }

    #[test]
    fn unwritable_manifest_is_store_unavailable() {
        let tmp = TempDir::new().unwrap();
        // A directory where the manifest file should go
        fs::create_dir(manifest_path(tmp.path())).unwrap();
        let store = JsonCacheStore::open(tmp.path());
        let err = store.upsert(entry("a.jpg", b"x")).unwrap_err();
        assert!(matches!(err, CacheError::StoreUnavailable(_)));
    }

    #[test]
    fn params_hash_tracks_settings() {
        let default = params_hash(&BreakpointSet::default(), 80);
        assert_eq!(default, params_hash(&BreakpointSet::default(), 80));
        assert_ne!(default, params_hash(&BreakpointSet::default(), 81));
        let wider = BreakpointSet {
            xxl: 1920,
            ..BreakpointSet::default()
        };
        assert_ne!(default, params_hash(&wider, 80));
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_hits() {
        let stats = CacheStats {
            hits: 5,
            regenerated: 2,
            failed: 0,
        };
        assert_eq!(format!("{}", stats), "5 cached, 2 generated (7 total)");
    }

    #[test]
    fn cache_stats_display_no_hits() {
        let stats = CacheStats {
            hits: 0,
            regenerated: 3,
            failed: 0,
        };
        assert_eq!(format!("{}", stats), "3 generated");
    }

    #[test]
    fn cache_stats_display_with_failures() {
        let mut stats = CacheStats::default();
        stats.regenerate();
        stats.fail();
        assert_eq!(format!("{}", stats), "1 generated, 1 failed (2 total)");
    }
}
