//! Shared test utilities for the pipeline test suite.
//!
//! Provides source fixtures for the recording `MockBackend`, collaborator
//! stand-ins (an unreachable cache store, a scripted remote fetcher), and
//! a ready-made mock pipeline.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let img = write_mock_image(tmp.path(), "a.png", 800, 600, false, false);
//! let pipeline = mock_pipeline(&tmp.path().join("out"));
//! let report = pipeline.process(&[image_input(&img)], None);
//! assert_eq!(report.results[0].status, ResultStatus::Regenerated);
//! ```

use crate::cache::{CacheEntry, CacheError, CacheStore, MemoryCacheStore};
use crate::hashing::{ContentHash, ResourceHash};
use crate::identifier::ResourceIdentifier;
use crate::imaging::BreakpointSet;
use crate::imaging::backend::tests::{MockBackend, mock_source};
use crate::process::{Pipeline, PipelineInput, PipelineSettings, ProcessingResult};
use crate::scheduler::Scheduler;
use crate::source::{RemoteFetcher, ResourceError};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub use tempfile::TempDir;

// =========================================================================
// Fixture setup
// =========================================================================

/// Write a source the `MockBackend` decodes as `width`x`height`.
pub fn write_mock_image(
    dir: &Path,
    name: &str,
    width: u32,
    height: u32,
    alpha: bool,
    animated: bool,
) -> ResourceIdentifier {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, mock_source(width, height, alpha, animated)).unwrap();
    ResourceIdentifier::local(&path)
}

/// Write a document and return its identifier.
pub fn write_document(dir: &Path, name: &str, content: &str) -> ResourceIdentifier {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    ResourceIdentifier::local(&path)
}

pub fn image_input(id: &ResourceIdentifier) -> PipelineInput {
    PipelineInput::Image(id.clone(), BreakpointSet::default())
}

pub fn document_input(id: &ResourceIdentifier) -> PipelineInput {
    PipelineInput::Document(id.clone(), BreakpointSet::default())
}

/// File names in the output directory, excluding the cache manifest.
pub fn output_files(dir: &Path) -> BTreeSet<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect()
}

// =========================================================================
// Pipelines
// =========================================================================

pub fn mock_scheduler() -> Arc<Scheduler<ProcessingResult>> {
    Arc::new(Scheduler::new(4).unwrap())
}

/// Mock pipeline with an in-memory cache.
pub fn mock_pipeline(output_dir: &Path) -> Pipeline<MockBackend> {
    mock_pipeline_with(
        MockBackend::new(),
        Arc::new(MemoryCacheStore::new()),
        output_dir,
    )
}

pub fn mock_pipeline_with(
    backend: MockBackend,
    store: Arc<dyn CacheStore>,
    output_dir: &Path,
) -> Pipeline<MockBackend> {
    Pipeline::new(
        backend,
        store,
        mock_scheduler(),
        PipelineSettings::new(output_dir),
    )
}

// =========================================================================
// Collaborator stand-ins
// =========================================================================

/// A cache store whose backend is unreachable.
pub struct FailingStore;

fn unreachable_store() -> CacheError {
    CacheError::StoreUnavailable("connection refused".to_string())
}

impl CacheStore for FailingStore {
    fn get(&self, _: &ResourceHash, _: &ContentHash) -> Result<Option<CacheEntry>, CacheError> {
        Err(unreachable_store())
    }

    fn get_by_resource(&self, _: &ResourceHash) -> Result<Option<CacheEntry>, CacheError> {
        Err(unreachable_store())
    }

    fn upsert(&self, _: CacheEntry) -> Result<(), CacheError> {
        Err(unreachable_store())
    }

    fn remove(&self, _: &ResourceHash) -> Result<(), CacheError> {
        Err(unreachable_store())
    }
}

/// Remote fetcher serving canned responses and counting calls.
#[derive(Default)]
pub struct StaticFetcher {
    responses: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
    gate: Option<Box<dyn Fn() + Send + Sync>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.responses.insert(url.to_string(), bytes);
        self
    }

    /// Run `gate` inside every fetch, before responding.
    pub fn gated(mut self, gate: impl Fn() + Send + Sync + 'static) -> Self {
        self.gate = Some(Box::new(gate));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteFetcher for StaticFetcher {
    fn fetch(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, ResourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate();
        }
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| ResourceError::FetchFailed(format!("{url}: 404")))
    }
}

// =========================================================================
// Concurrency
// =========================================================================

/// Spin until `condition` holds. Panics after five seconds.
pub fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}
