//! Pipeline orchestration: inputs in, optimized variants and a manifest out.
//!
//! ```text
//! inputs ─► GraphBuilder (documents only) ─► ImageTask per source (deduped)
//!                                                │
//!                                     Scheduler (bounded, coalescing)
//!                                                │
//!                          per task: fetch → hash → cache → generate → upsert
//!                                                │
//!                                    ProcessReport / manifest.json
//! ```
//!
//! ## Per-source protocol
//!
//! 1. Read the bytes (local file or [`RemoteFetcher`]) and hash them.
//! 2. Exact cache lookup on `(resource_hash, content_hash)`. A hit whose
//!    settings match and whose files are all on disk skips generation.
//! 3. Otherwise any entry left under the resource is stale: it is removed
//!    before regenerating.
//! 4. Decode once, write every variant plus the blurred placeholder.
//! 5. Upsert the new entry.
//!
//! Removing and re-creating an entry is safe because the scheduler never runs
//! two tasks for the same resource hash at once.
//!
//! ## Failure handling
//!
//! A resource that cannot be read, decoded or encoded yields a `Failed`
//! result; its siblings are unaffected. A cache read error degrades to a
//! miss. A cache write error becomes a warning on an otherwise successful
//! result: the files exist and the next run simply regenerates them. A
//! [`GraphError`] aborts only the root it was raised for.

use crate::cache::{self, CacheEntry, CacheError, CacheStats, CacheStore};
use crate::config::{self, ConfigError, PipelineConfig};
use crate::graph::{ExecutionPlan, GraphBuilder, GraphError, ImageTask};
use crate::hashing::{ContentHash, ResourceHash};
use crate::identifier::{ReferenceKind, ResourceIdentifier};
use crate::imaging::variants::{self, SourceInfo};
use crate::imaging::{
    BreakpointSet, DecodeLimits, EncodeParams, ImageBackend, ImageVariant, OutputFormat,
    PlaceholderParams, Quality, RustBackend,
};
use crate::parser::{MarkdownParser, ReferenceParser};
use crate::scheduler::{Scheduler, SchedulerStats, Task};
use crate::source::{self, Metadata, MetadataExtractor, OfflineFetcher, RemoteFetcher, ResourceError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Blur strength of the placeholder, relative to its 32 px width.
const PLACEHOLDER_SIGMA: f32 = 2.5;
const PLACEHOLDER_QUALITY: u32 = 60;

/// Name of the per-run manifest written into the output directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl Task for ImageTask {
    fn resource_hash(&self) -> &ResourceHash {
        &self.resource_hash
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// A unit of work handed to [`Pipeline::process`]. Breakpoints travel with
/// each input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInput {
    /// Resolved through the dependency graph.
    Document(ResourceIdentifier, BreakpointSet),
    /// Scheduled directly.
    Image(ResourceIdentifier, BreakpointSet),
}

impl PipelineInput {
    /// Images become image inputs; everything else is treated as a document.
    pub fn from_identifier(id: ResourceIdentifier, breakpoints: BreakpointSet) -> Self {
        match id.kind() {
            ReferenceKind::Image => Self::Image(id, breakpoints),
            _ => Self::Document(id, breakpoints),
        }
    }

    pub fn identifier(&self) -> &ResourceIdentifier {
        match self {
            Self::Document(id, _) | Self::Image(id, _) => id,
        }
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        match self {
            Self::Document(_, bp) | Self::Image(_, bp) => bp,
        }
    }
}

/// Turn a command-line argument into inputs.
///
/// URLs and files become a single input. A directory is walked for
/// documents, sorted by path; images inside it are only processed when a
/// document references them.
pub fn discover_inputs(raw: &str, breakpoints: &BreakpointSet) -> Vec<PipelineInput> {
    let Some(id) = ResourceIdentifier::parse(raw) else {
        return Vec::new();
    };
    let dir = match &id {
        ResourceIdentifier::Local(path) if path.is_dir() => path.clone(),
        _ => return vec![PipelineInput::from_identifier(id, breakpoints.clone())],
    };

    WalkDir::new(&dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| ResourceIdentifier::local(entry.path()))
        .filter(|id| id.kind() == ReferenceKind::Document)
        .map(|id| PipelineInput::Document(id, breakpoints.clone()))
        .collect()
}

// ============================================================================
// Settings
// ============================================================================

/// Everything a pipeline run needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub quality: Quality,
    pub max_depth: usize,
    pub fetch_timeout: Duration,
    pub limits: DecodeLimits,
}

impl PipelineSettings {
    /// Stock settings writing into `output_dir`.
    pub fn new(output_dir: &Path) -> Self {
        Self::from_config(&PipelineConfig::default(), output_dir)
    }

    pub fn from_config(config: &PipelineConfig, output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            quality: Quality::new(config.processing.quality),
            max_depth: config.graph.max_depth,
            fetch_timeout: Duration::from_secs(config.limits.fetch_timeout_secs),
            limits: DecodeLimits {
                max_pixels: config.limits.max_image_pixels,
            },
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Valid cache entry and files on disk; nothing was generated.
    Hit,
    Regenerated,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => f.write_str("cached"),
            Self::Regenerated => f.write_str("generated"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Outcome for one source image.
///
/// Only the durable facts are serialized, so a rerun over unchanged inputs
/// writes a byte-identical manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    /// Identifier string of the source.
    pub source: String,
    pub hash: ResourceHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_height: Option<u32>,
    pub variants: Vec<ImageVariant>,
    pub blur_placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub error: Option<String>,
    #[serde(skip)]
    pub status: ResultStatus,
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl ProcessingResult {
    fn failed(source: String, hash: ResourceHash, error: impl fmt::Display) -> Self {
        Self {
            source,
            hash,
            original_width: None,
            original_height: None,
            variants: Vec::new(),
            blur_placeholder: None,
            metadata: None,
            error: Some(error.to_string()),
            status: ResultStatus::Failed,
            warnings: Vec::new(),
        }
    }

    fn succeeded(
        status: ResultStatus,
        source: String,
        hash: ResourceHash,
        info: &SourceInfo,
        variants: Vec<ImageVariant>,
        blur_placeholder: String,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            source,
            hash,
            original_width: Some(info.width),
            original_height: Some(info.height),
            variants,
            blur_placeholder: Some(blur_placeholder),
            metadata,
            error: None,
            status,
            warnings: Vec::new(),
        }
    }
}

/// Progress events, sent as work completes.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PlanResolved {
        root: String,
        images: usize,
        documents: usize,
        pdfs: usize,
    },
    GraphFailed {
        root: String,
        error: String,
    },
    ResourceProcessed(ProcessingResult),
}

/// Everything a run produced, in input order.
#[derive(Debug)]
pub struct ProcessReport {
    pub results: Vec<ProcessingResult>,
    pub documents: Vec<ResourceIdentifier>,
    pub pdfs: Vec<ResourceIdentifier>,
    pub graph_errors: Vec<(ResourceIdentifier, GraphError)>,
    pub stats: CacheStats,
    pub scheduler: SchedulerStats,
}

/// Serialized form of a [`ProcessReport`].
#[derive(Debug, Serialize)]
pub struct OutputManifest<'a> {
    pub documents: Vec<String>,
    pub pdfs: Vec<String>,
    pub resources: &'a [ProcessingResult],
}

impl ProcessReport {
    /// False when a cycle or depth error was raised, or when nothing
    /// succeeded at all.
    pub fn exit_ok(&self) -> bool {
        if self.graph_errors.iter().any(|(_, e)| e.is_structural()) {
            return false;
        }
        if self.results.is_empty() {
            return self.graph_errors.is_empty();
        }
        self.results.iter().any(|r| r.status != ResultStatus::Failed)
    }

    pub fn manifest(&self) -> OutputManifest<'_> {
        OutputManifest {
            documents: self.documents.iter().map(|d| d.key()).collect(),
            pdfs: self.pdfs.iter().map(|p| p.key()).collect(),
            resources: &self.results,
        }
    }
}

/// Write `manifest.json` into the output directory.
pub fn write_manifest(report: &ProcessReport, output_dir: &Path) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(MANIFEST_FILENAME);
    let json = serde_json::to_string_pretty(&report.manifest())?;
    std::fs::write(&path, json)?;
    Ok(path)
}

// ============================================================================
// Pipeline
// ============================================================================

/// The orchestrator. Cheap to share: wrap it in an `Arc` to call
/// [`process`](Self::process) from several threads against one scheduler.
pub struct Pipeline<B: ImageBackend> {
    backend: B,
    store: Arc<dyn CacheStore>,
    scheduler: Arc<Scheduler<ProcessingResult>>,
    fetcher: Arc<dyn RemoteFetcher>,
    metadata: Option<Arc<dyn MetadataExtractor>>,
    parser: Arc<dyn ReferenceParser>,
    settings: PipelineSettings,
}

/// Production pipeline: `RustBackend`, JSON cache in the output directory,
/// Markdown parsing and no network access.
pub fn build_pipeline(
    config: &PipelineConfig,
    output_dir: &Path,
    use_cache: bool,
) -> Result<Pipeline<RustBackend>, PipelineError> {
    let store: Arc<dyn CacheStore> = if use_cache {
        Arc::new(cache::JsonCacheStore::open(output_dir))
    } else {
        Arc::new(cache::JsonCacheStore::fresh(output_dir))
    };
    let threads = config::effective_concurrency(&config.processing);
    let scheduler = Arc::new(Scheduler::new(threads)?);
    debug!(threads, "worker pool ready");
    Ok(Pipeline::new(
        RustBackend::new(),
        store,
        scheduler,
        PipelineSettings::from_config(config, output_dir),
    ))
}

fn send(events: Option<&Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = events {
        // The receiver going away only means nobody is listening anymore
        let _ = tx.send(event);
    }
}

/// Append items not seen before, keeping first-seen order.
fn extend_unique<T: Clone + Eq + std::hash::Hash>(
    out: &mut Vec<T>,
    seen: &mut HashSet<T>,
    items: impl IntoIterator<Item = T>,
) {
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
}

impl<B: ImageBackend> Pipeline<B> {
    pub fn new(
        backend: B,
        store: Arc<dyn CacheStore>,
        scheduler: Arc<Scheduler<ProcessingResult>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            store,
            scheduler,
            fetcher: Arc::new(OfflineFetcher),
            metadata: None,
            parser: Arc::new(MarkdownParser),
            settings,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_metadata(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.metadata = Some(extractor);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ReferenceParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<ProcessingResult>> {
        &self.scheduler
    }

    /// Resolve every input into a plan without processing anything.
    pub fn plan(
        &self,
        inputs: &[PipelineInput],
    ) -> Vec<(ResourceIdentifier, Result<ExecutionPlan, GraphError>)> {
        let builder = GraphBuilder::new(self.parser.as_ref(), self.settings.max_depth);
        inputs
            .iter()
            .map(|input| {
                let id = input.identifier().clone();
                let plan = builder.resolve_root(&id, input.breakpoints());
                (id, plan)
            })
            .collect()
    }

    /// Run the pipeline over `inputs`.
    ///
    /// Never aborts the batch: every failure is reported in the returned
    /// [`ProcessReport`]. When `events` is given, progress is sent as it
    /// happens.
    pub fn process(
        &self,
        inputs: &[PipelineInput],
        events: Option<&Sender<PipelineEvent>>,
    ) -> ProcessReport {
        let builder = GraphBuilder::new(self.parser.as_ref(), self.settings.max_depth);
        let mut tasks: Vec<ImageTask> = Vec::new();
        let mut task_hashes = HashSet::new();
        let mut documents = Vec::new();
        let mut seen_documents = HashSet::new();
        let mut pdfs = Vec::new();
        let mut seen_pdfs = HashSet::new();
        let mut graph_errors = Vec::new();

        for input in inputs {
            match input {
                PipelineInput::Image(id, breakpoints) => {
                    let hash = id.resource_hash();
                    if task_hashes.insert(hash.clone()) {
                        tasks.push(ImageTask {
                            resource: id.clone(),
                            resource_hash: hash,
                            breakpoints: breakpoints.clone(),
                        });
                    }
                }
                PipelineInput::Document(id, breakpoints) => {
                    match builder.resolve_root(id, breakpoints) {
                        Ok(plan) => {
                            let images = plan.image_tasks();
                            let plan_docs = plan.documents();
                            let plan_pdfs = plan.pdfs();
                            send(
                                events,
                                PipelineEvent::PlanResolved {
                                    root: id.key(),
                                    images: images.len(),
                                    documents: plan_docs.len(),
                                    pdfs: plan_pdfs.len(),
                                },
                            );
                            extend_unique(&mut documents, &mut seen_documents, plan_docs);
                            extend_unique(&mut pdfs, &mut seen_pdfs, plan_pdfs);
                            for task in images {
                                if task_hashes.insert(task.resource_hash.clone()) {
                                    tasks.push(task);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(root = %id, error = %e, "planning failed");
                            send(
                                events,
                                PipelineEvent::GraphFailed {
                                    root: id.key(),
                                    error: e.to_string(),
                                },
                            );
                            graph_errors.push((id.clone(), e));
                        }
                    }
                }
            }
        }

        let outcomes = self.scheduler.execute(&tasks, |task| {
            let result = self.process_image(task);
            send(events, PipelineEvent::ResourceProcessed(result.clone()));
            Ok::<_, Infallible>(result)
        });

        let mut stats = CacheStats::default();
        let results: Vec<ProcessingResult> = outcomes
            .into_iter()
            .zip(&tasks)
            .map(|(outcome, task)| {
                let result = match outcome.outcome {
                    // Another caller's closure ran the task and reported to its own channel
                    Ok(output) if output.coalesced => {
                        send(events, PipelineEvent::ResourceProcessed(output.value.clone()));
                        output.value
                    }
                    Ok(output) => output.value,
                    Err(e) => {
                        let result =
                            ProcessingResult::failed(task.resource.key(), e.hash, &e.message);
                        send(events, PipelineEvent::ResourceProcessed(result.clone()));
                        result
                    }
                };
                match result.status {
                    ResultStatus::Hit => stats.hit(),
                    ResultStatus::Regenerated => stats.regenerate(),
                    ResultStatus::Failed => stats.fail(),
                }
                result
            })
            .collect();

        info!(%stats, "run complete");
        ProcessReport {
            results,
            documents,
            pdfs,
            graph_errors,
            stats,
            scheduler: self.scheduler.stats(),
        }
    }

    /// Drop the cache entry of a resource so the next run regenerates it.
    /// Returns whether an entry existed.
    pub fn invalidate(&self, id: &ResourceIdentifier) -> Result<bool, CacheError> {
        let hash = id.resource_hash();
        let existed = self.store.get_by_resource(&hash)?.is_some();
        if existed {
            self.store.remove(&hash)?;
            info!(source = %id, "cache entry invalidated");
        }
        Ok(existed)
    }

    /// One optimization pass for one source. Never panics on bad input.
    fn process_image(&self, task: &ImageTask) -> ProcessingResult {
        let source = task.resource.key();
        let hash = task.resource_hash.clone();

        let bytes = match source::load_bytes(
            &task.resource,
            self.fetcher.as_ref(),
            self.settings.fetch_timeout,
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(source = %source, error = %e, "cannot read source");
                return ProcessingResult::failed(source, hash, e);
            }
        };
        let content_hash = ContentHash::of_bytes(&bytes);
        let params_hash = cache::params_hash(&task.breakpoints, self.settings.quality.value());
        let metadata = self.metadata.as_ref().and_then(|m| m.extract(&bytes));

        let mut warnings = Vec::new();
        match self.store.get(&hash, &content_hash) {
            Ok(Some(entry)) if entry.params_hash == params_hash => {
                if let Some(result) = self.cached_result(task, &entry, metadata.clone()) {
                    debug!(source = %source, "cache hit");
                    return result;
                }
                debug!(source = %source, "cached files missing, regenerating");
            }
            Ok(_) => {}
            Err(e) => warn!(source = %source, error = %e, "cache read failed, treating as miss"),
        }

        let previous = match self.store.get_by_resource(&hash) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(source = %source, error = %e, "cache read failed, treating as miss");
                None
            }
        };
        if let Some(previous) = &previous {
            if previous.content_hash != content_hash {
                info!(source = %source, "source changed, removing stale cache entry");
            }
            if let Err(e) = self.store.remove(&hash) {
                warn!(source = %source, error = %e, "cannot remove stale cache entry");
                warnings.push(format!("cache: {e}"));
            }
        }

        let (info, has_transparency, variants, blur) = match self.generate(task, &bytes) {
            Ok(generated) => generated,
            Err(e) => {
                warn!(source = %source, error = %e, "processing failed");
                return ProcessingResult::failed(source, hash, e);
            }
        };
        if let Some(previous) = &previous {
            self.prune_stale_files(task, previous, &variants, &blur);
        }

        let entry = CacheEntry {
            resource_hash: hash.clone(),
            content_hash,
            created_at: cache::now_unix(),
            source_type: task.resource.source_type(),
            source: source.clone(),
            has_transparency,
            original_width: info.width,
            original_height: info.height,
            animation: info.animation,
            params_hash,
        };
        if let Err(e) = self.store.upsert(entry) {
            warn!(source = %source, error = %e, "cannot record cache entry");
            warnings.push(format!("cache: {e}"));
        }

        info!(source = %source, variants = variants.len(), "generated");
        let mut result = ProcessingResult::succeeded(
            ResultStatus::Regenerated,
            source,
            hash,
            &info,
            variants,
            blur,
            metadata,
        );
        result.warnings = warnings;
        result
    }

    /// Rebuild the result of a cache hit without decoding. `None` when any
    /// file has gone missing.
    fn cached_result(
        &self,
        task: &ImageTask,
        entry: &CacheEntry,
        metadata: Option<Metadata>,
    ) -> Option<ProcessingResult> {
        let info = SourceInfo {
            width: entry.original_width,
            height: entry.original_height,
            animation: entry.animation,
        };
        let variants = variants::generate(
            &info,
            &task.breakpoints,
            entry.has_transparency,
            &task.resource_hash,
        );
        let (blur, _, _) = variants::placeholder(&info, &task.resource_hash);
        let present = variants
            .iter()
            .map(|v| v.path.as_str())
            .chain(std::iter::once(blur.as_str()))
            .all(|name| self.settings.output_dir.join(name).is_file());
        present.then(|| {
            ProcessingResult::succeeded(
                ResultStatus::Hit,
                task.resource.key(),
                task.resource_hash.clone(),
                &info,
                variants,
                blur,
                metadata,
            )
        })
    }

    /// Decode once and write the full variant matrix plus placeholder.
    fn generate(
        &self,
        task: &ImageTask,
        bytes: &[u8],
    ) -> Result<(SourceInfo, bool, Vec<ImageVariant>, String), ResourceError> {
        std::fs::create_dir_all(&self.settings.output_dir).map_err(|e| {
            ResourceError::EncodeFailed(format!("{}: {}", self.settings.output_dir.display(), e))
        })?;

        let decoded = self.backend.decode(bytes, &self.settings.limits)?;
        let variants = variants::generate(
            &decoded.info,
            &task.breakpoints,
            decoded.has_transparency,
            &task.resource_hash,
        );
        self.write_variants(&decoded.image, &variants)?;

        let (blur, width, height) = variants::placeholder(&decoded.info, &task.resource_hash);
        self.backend.placeholder(
            &decoded.image,
            &PlaceholderParams {
                output: self.settings.output_dir.join(&blur),
                width,
                height,
                sigma: PLACEHOLDER_SIGMA,
                quality: Quality::new(PLACEHOLDER_QUALITY),
            },
        )?;
        Ok((decoded.info, decoded.has_transparency, variants, blur))
    }

    /// Encode each distinct `(size, format)` once; tiers that clamp to the
    /// same size get a copy.
    fn write_variants(
        &self,
        image: &B::Image,
        variants: &[ImageVariant],
    ) -> Result<(), ResourceError> {
        let mut written: HashMap<(u32, u32, OutputFormat), PathBuf> = HashMap::new();
        for variant in variants {
            let output = self.settings.output_dir.join(&variant.path);
            let key = (variant.width, variant.height, variant.format);
            if let Some(existing) = written.get(&key) {
                std::fs::copy(existing, &output).map_err(|e| {
                    ResourceError::EncodeFailed(format!("{}: {}", output.display(), e))
                })?;
                continue;
            }
            self.backend.encode(
                image,
                &EncodeParams {
                    output: output.clone(),
                    width: variant.width,
                    height: variant.height,
                    format: variant.format,
                    quality: self.settings.quality,
                },
            )?;
            written.insert(key, output);
        }
        Ok(())
    }

    /// Delete files of the previous generation that the new one does not
    /// overwrite (e.g. `.jpg` fallbacks after a source gained transparency).
    fn prune_stale_files(
        &self,
        task: &ImageTask,
        previous: &CacheEntry,
        current: &[ImageVariant],
        blur: &str,
    ) {
        let keep: HashSet<&str> = current
            .iter()
            .map(|v| v.path.as_str())
            .chain(std::iter::once(blur))
            .collect();
        let old_info = SourceInfo {
            width: previous.original_width,
            height: previous.original_height,
            animation: previous.animation,
        };
        let old = variants::generate(
            &old_info,
            &task.breakpoints,
            previous.has_transparency,
            &task.resource_hash,
        );
        for variant in old.iter().filter(|v| !keep.contains(v.path.as_str())) {
            let path = self.settings.output_dir.join(&variant.path);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale variant"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale variant"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{JsonCacheStore, MemoryCacheStore};
    use crate::imaging::SizeTag;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp, mock_source};
    use crate::test_helpers::*;
    use std::sync::Barrier;
    use std::sync::mpsc;

    fn formats(result: &ProcessingResult) -> HashSet<OutputFormat> {
        result.variants.iter().map(|v| v.format).collect()
    }

    // =========================================================================
    // Generation
    // =========================================================================

    #[test]
    fn first_run_generates_full_matrix() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let img = write_mock_image(tmp.path(), "a.png", 800, 600, false, false);
        let pipeline = mock_pipeline(&out);

        let report = pipeline.process(&[image_input(&img)], None);
        let result = &report.results[0];
        assert_eq!(result.status, ResultStatus::Regenerated);
        assert_eq!(result.variants.len(), 21);
        assert_eq!(result.hash, img.resource_hash());
        assert_eq!((result.original_width, result.original_height), (Some(800), Some(600)));
        for v in &result.variants {
            assert!(out.join(&v.path).is_file(), "{} missing", v.path);
        }
        assert!(out.join(result.blur_placeholder.as_ref().unwrap()).is_file());

        // micro, xs and one clamped 800x600 size, three formats each
        assert_eq!(pipeline.backend().encode_count(), 9);
        assert_eq!(pipeline.backend().decode_count(), 1);
        assert_eq!(report.stats.regenerated, 1);
        assert!(report.exit_ok());
    }

    #[test]
    fn large_source_clamps_top_tier() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "wide.jpg", 3000, 2000, false, false);
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let report = pipeline.process(&[image_input(&img)], None);
        let variants = &report.results[0].variants;
        for v in variants.iter().filter(|v| v.size_tag == SizeTag::Xxl) {
            assert_eq!((v.width, v.height), (3000, 2000));
        }
        let xl = variants.iter().find(|v| v.size_tag == SizeTag::Xl).unwrap();
        assert_eq!((xl.width, xl.height), (2560, 1707));
    }

    #[test]
    fn transparent_source_uses_png_fallback() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "logo.png", 400, 400, true, false);
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let report = pipeline.process(&[image_input(&img)], None);
        let found = formats(&report.results[0]);
        assert!(found.contains(&OutputFormat::Png));
        assert!(!found.contains(&OutputFormat::Jpeg));
    }

    #[test]
    fn animated_source_is_gif_only() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "spin.gif", 300, 200, false, true);
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let report = pipeline.process(&[image_input(&img)], None);
        let result = &report.results[0];
        assert_eq!(result.variants.len(), 7);
        assert_eq!(formats(result), HashSet::from([OutputFormat::Gif]));
        assert!(pipeline.backend().get_operations().iter().all(|op| match op {
            RecordedOp::Encode { format, .. } => *format == OutputFormat::Gif,
            _ => true,
        }));
    }

    #[test]
    fn animated_png_stays_png_across_runs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("loader.png");
        std::fs::write(&path, "mock:300x200:alpha:apng").unwrap();
        let img = ResourceIdentifier::local(&path);
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let first = pipeline.process(&[image_input(&img)], None);
        assert_eq!(first.results[0].status, ResultStatus::Regenerated);
        assert_eq!(first.results[0].variants.len(), 7);
        assert_eq!(formats(&first.results[0]), HashSet::from([OutputFormat::Png]));

        // The hit rebuilds the same PNG-only list from the cache entry
        let second = pipeline.process(&[image_input(&img)], None);
        assert_eq!(second.results[0].status, ResultStatus::Hit);
        assert_eq!(second.results[0].variants, first.results[0].variants);
        assert_eq!(pipeline.backend().encode_count(), 7);
    }

    #[test]
    fn quality_reaches_the_encoder() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "a.jpg", 100, 100, false, false);
        let mut config = PipelineConfig::default();
        config.processing.quality = 55;
        let pipeline = Pipeline::new(
            MockBackend::new(),
            Arc::new(MemoryCacheStore::new()),
            mock_scheduler(),
            PipelineSettings::from_config(&config, &tmp.path().join("out")),
        );

        pipeline.process(&[image_input(&img)], None);
        assert!(pipeline.backend().get_operations().iter().any(|op| matches!(
            op,
            RecordedOp::Encode { quality: 55, .. }
        )));
    }

    // =========================================================================
    // Caching
    // =========================================================================

    #[test]
    fn second_run_is_all_hits_with_identical_manifest() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let a = write_mock_image(tmp.path(), "a.jpg", 800, 600, false, false);
        let b = write_mock_image(tmp.path(), "b.png", 640, 480, true, false);
        let inputs = [image_input(&a), image_input(&b)];

        let first = mock_pipeline_with(MockBackend::new(), Arc::new(JsonCacheStore::open(&out)), &out)
            .process(&inputs, None);
        write_manifest(&first, &out).unwrap();
        let first_manifest = std::fs::read_to_string(out.join(MANIFEST_FILENAME)).unwrap();
        let files_before = output_files(&out);

        // Fresh process: new backend, store reloaded from disk
        let pipeline =
            mock_pipeline_with(MockBackend::new(), Arc::new(JsonCacheStore::open(&out)), &out);
        let second = pipeline.process(&inputs, None);
        write_manifest(&second, &out).unwrap();

        assert!(second.results.iter().all(|r| r.status == ResultStatus::Hit));
        assert_eq!(second.stats.hits, 2);
        assert_eq!(pipeline.backend().decode_count(), 0);
        assert_eq!(pipeline.backend().encode_count(), 0);
        assert_eq!(output_files(&out), files_before);
        assert_eq!(
            std::fs::read_to_string(out.join(MANIFEST_FILENAME)).unwrap(),
            first_manifest
        );
    }

    #[test]
    fn changed_bytes_regenerate_and_replace_stale_entry() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let img = write_mock_image(tmp.path(), "a.png", 800, 600, false, false);
        let store = Arc::new(MemoryCacheStore::new());
        let pipeline = mock_pipeline_with(MockBackend::new(), store.clone(), &out);

        let first = pipeline.process(&[image_input(&img)], None);
        let first_entry = store.get_by_resource(&img.resource_hash()).unwrap().unwrap();
        let jpeg_path = out.join(format!("{}-xs.jpg", img.resource_hash()));
        assert!(jpeg_path.is_file());

        // Same identifier, new bytes: now transparent and smaller
        write_mock_image(tmp.path(), "a.png", 500, 500, true, false);
        let second = pipeline.process(&[image_input(&img)], None);
        let result = &second.results[0];

        assert_eq!(result.status, ResultStatus::Regenerated);
        assert_eq!(result.hash, first.results[0].hash);
        let entry = store.get_by_resource(&img.resource_hash()).unwrap().unwrap();
        assert_ne!(entry.content_hash, first_entry.content_hash);
        assert!(entry.has_transparency);
        assert_eq!(store.len(), 1);
        // JPEG fallbacks of the previous generation are gone
        assert!(!jpeg_path.exists());
        assert!(out.join(format!("{}-xs.png", img.resource_hash())).is_file());
    }

    #[test]
    fn missing_files_turn_a_hit_into_a_regeneration() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let img = write_mock_image(tmp.path(), "a.jpg", 800, 600, false, false);
        let pipeline = mock_pipeline(&out);

        let first = pipeline.process(&[image_input(&img)], None);
        std::fs::remove_file(out.join(&first.results[0].variants[4].path)).unwrap();

        let second = pipeline.process(&[image_input(&img)], None);
        assert_eq!(second.results[0].status, ResultStatus::Regenerated);
        assert!(out.join(&first.results[0].variants[4].path).is_file());
    }

    #[test]
    fn changed_breakpoints_regenerate() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let img = write_mock_image(tmp.path(), "a.jpg", 4000, 3000, false, false);
        let pipeline = mock_pipeline(&out);
        pipeline.process(&[image_input(&img)], None);

        let narrower = BreakpointSet {
            xxl: 1400,
            ..BreakpointSet::default()
        };
        let report = pipeline.process(&[PipelineInput::Image(img.clone(), narrower)], None);
        let result = &report.results[0];
        assert_eq!(result.status, ResultStatus::Regenerated);
        let xxl = result.variants.iter().find(|v| v.size_tag == SizeTag::Xxl).unwrap();
        assert_eq!(xxl.width, 2800);
    }

    #[test]
    fn invalidate_forces_regeneration() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "a.jpg", 100, 80, false, false);
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        pipeline.process(&[image_input(&img)], None);
        assert!(pipeline.invalidate(&img).unwrap());
        assert!(!pipeline.invalidate(&img).unwrap());

        let report = pipeline.process(&[image_input(&img)], None);
        assert_eq!(report.results[0].status, ResultStatus::Regenerated);
    }

    #[test]
    fn unreachable_store_degrades_to_miss() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let img = write_mock_image(tmp.path(), "a.jpg", 640, 480, false, false);
        let pipeline = mock_pipeline_with(MockBackend::new(), Arc::new(FailingStore), &out);

        let report = pipeline.process(&[image_input(&img)], None);
        let result = &report.results[0];
        assert_eq!(result.status, ResultStatus::Regenerated);
        assert!(result.error.is_none());
        assert!(result.warnings.iter().any(|w| w.contains("connection refused")));
        assert!(result.variants.iter().all(|v| out.join(&v.path).is_file()));
        assert!(report.exit_ok());
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn failures_are_scoped_to_their_resource() {
        let tmp = TempDir::new().unwrap();
        let good = write_mock_image(tmp.path(), "good.jpg", 100, 100, false, false);
        let missing = ResourceIdentifier::local(tmp.path().join("missing.jpg"));
        let garbage = write_document(tmp.path(), "garbage.png", "not an image");
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let report = pipeline.process(
            &[image_input(&missing), image_input(&good), image_input(&garbage)],
            None,
        );
        let statuses: Vec<ResultStatus> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ResultStatus::Failed, ResultStatus::Regenerated, ResultStatus::Failed]
        );
        assert!(report.results[0].error.as_ref().unwrap().contains("cannot open"));
        assert!(report.results[2].error.as_ref().unwrap().contains("unsupported"));
        assert_eq!(report.stats.failed, 2);
        assert!(report.exit_ok());
    }

    #[test]
    fn all_failed_is_not_ok() {
        let tmp = TempDir::new().unwrap();
        let missing = ResourceIdentifier::local(tmp.path().join("missing.jpg"));
        let pipeline = mock_pipeline(&tmp.path().join("out"));
        let report = pipeline.process(&[image_input(&missing)], None);
        assert!(!report.exit_ok());
    }

    #[test]
    fn encode_failure_leaves_no_cache_entry() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "a.jpg", 100, 100, false, false);
        let store = Arc::new(MemoryCacheStore::new());
        let pipeline = mock_pipeline_with(
            MockBackend::failing_on(OutputFormat::Webp),
            store.clone(),
            &tmp.path().join("out"),
        );

        let report = pipeline.process(&[image_input(&img)], None);
        assert_eq!(report.results[0].status, ResultStatus::Failed);
        assert!(report.results[0].error.as_ref().unwrap().contains("webp"));
        assert!(store.is_empty());
    }

    #[test]
    fn oversized_source_fails() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "huge.jpg", 20_000, 20_000, false, false);
        let pipeline = mock_pipeline(&tmp.path().join("out"));
        let report = pipeline.process(&[image_input(&img)], None);
        assert_eq!(report.results[0].status, ResultStatus::Failed);
        assert_eq!(pipeline.backend().decode_count(), 0);
    }

    // =========================================================================
    // Documents
    // =========================================================================

    #[test]
    fn document_inputs_are_resolved_and_deduplicated() {
        let tmp = TempDir::new().unwrap();
        write_mock_image(tmp.path(), "img/a.jpg", 200, 100, false, false);
        write_mock_image(tmp.path(), "img/b.png", 200, 100, true, false);
        let one = write_document(
            tmp.path(),
            "one.md",
            "![a](img/a.jpg) ![b](img/b.png) [paper](paper.pdf) [two](two.md)",
        );
        let two = write_document(tmp.path(), "two.md", "![a again](img/a.jpg)");
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let report = pipeline.process(&[document_input(&one), document_input(&two)], None);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.documents, vec![one, two]);
        assert_eq!(report.pdfs.len(), 1);
        assert_eq!(pipeline.backend().decode_count(), 2);

        let manifest = serde_json::to_value(report.manifest()).unwrap();
        assert_eq!(manifest["resources"].as_array().unwrap().len(), 2);
        assert!(manifest["resources"][0].get("status").is_none());
    }

    #[test]
    fn cycle_aborts_root_without_writing_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        write_mock_image(tmp.path(), "x.jpg", 200, 100, false, false);
        let a = write_document(tmp.path(), "a.md", "![x](x.jpg) [b](b.md)");
        write_document(tmp.path(), "b.md", "[a](a.md)");
        let pipeline = mock_pipeline(&out);

        let report = pipeline.process(&[document_input(&a)], None);
        assert!(report.results.is_empty());
        assert!(matches!(report.graph_errors[0].1, GraphError::Cycle { .. }));
        assert!(output_files(&out).is_empty());
        assert!(!report.exit_ok());
    }

    #[test]
    fn events_follow_progress() {
        let tmp = TempDir::new().unwrap();
        write_mock_image(tmp.path(), "a.jpg", 200, 100, false, false);
        let doc = write_document(tmp.path(), "doc.md", "![a](a.jpg)");
        let bad = write_document(tmp.path(), "bad.md", "[gone](gone.md)");
        let pipeline = mock_pipeline(&tmp.path().join("out"));

        let (tx, rx) = mpsc::channel();
        pipeline.process(&[document_input(&doc), document_input(&bad)], Some(&tx));
        drop(tx);
        let events: Vec<PipelineEvent> = rx.into_iter().collect();

        assert!(matches!(
            &events[0],
            PipelineEvent::PlanResolved { images: 1, documents: 1, pdfs: 0, .. }
        ));
        assert!(matches!(&events[1], PipelineEvent::GraphFailed { .. }));
        assert!(matches!(
            &events[2],
            PipelineEvent::ResourceProcessed(r) if r.status == ResultStatus::Regenerated
        ));
        assert_eq!(events.len(), 3);
    }

    // =========================================================================
    // Remote sources and concurrency
    // =========================================================================

    #[test]
    fn remote_sources_use_the_fetcher() {
        let tmp = TempDir::new().unwrap();
        let url = "https://cdn.example.com/hero.jpg";
        let fetcher = Arc::new(StaticFetcher::new().with(url, mock_source(1200, 800, false, false)));
        let pipeline = mock_pipeline(&tmp.path().join("out")).with_fetcher(fetcher.clone());

        let remote = ResourceIdentifier::Remote(url.to_string());
        let missing = ResourceIdentifier::Remote("https://cdn.example.com/nope.jpg".into());
        let report = pipeline.process(&[image_input(&remote), image_input(&missing)], None);

        assert_eq!(report.results[0].status, ResultStatus::Regenerated);
        assert_eq!(report.results[1].status, ResultStatus::Failed);
        assert!(report.results[1].error.as_ref().unwrap().contains("fetch failed"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn offline_by_default() {
        let tmp = TempDir::new().unwrap();
        let pipeline = mock_pipeline(&tmp.path().join("out"));
        let remote = ResourceIdentifier::Remote("https://cdn.example.com/a.jpg".into());
        let report = pipeline.process(&[image_input(&remote)], None);
        assert_eq!(report.results[0].status, ResultStatus::Failed);
    }

    #[test]
    fn concurrent_requests_for_one_resource_run_once() {
        let tmp = TempDir::new().unwrap();
        let url = "https://cdn.example.com/shared.png";
        let scheduler = mock_scheduler();
        let gate_scheduler = Arc::clone(&scheduler);
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with(url, mock_source(900, 600, false, false))
                // Keep the first run in flight until the second caller attaches
                .gated(move || wait_until(|| gate_scheduler.stats().coalesced >= 1)),
        );
        let pipeline = Arc::new(
            Pipeline::new(
                MockBackend::new(),
                Arc::new(MemoryCacheStore::new()),
                scheduler,
                PipelineSettings::new(&tmp.path().join("out")),
            )
            .with_fetcher(fetcher.clone()),
        );
        let input = image_input(&ResourceIdentifier::Remote(url.to_string()));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let input = input.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let (tx, rx) = mpsc::channel();
                    barrier.wait();
                    let report = pipeline.process(&[input], Some(&tx));
                    drop(tx);
                    (report, rx.into_iter().collect::<Vec<_>>())
                })
            })
            .collect();
        let runs: Vec<(ProcessReport, Vec<PipelineEvent>)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(pipeline.backend().decode_count(), 1);
        assert_eq!(runs[0].0.results[0], runs[1].0.results[0]);
        assert_eq!(runs[0].0.results[0].status, ResultStatus::Regenerated);
        assert_eq!(pipeline.scheduler().stats().executed, 1);

        // Both callers hear about the resource on their own channel
        for (report, events) in &runs {
            let processed: Vec<&ProcessingResult> = events
                .iter()
                .filter_map(|e| match e {
                    PipelineEvent::ResourceProcessed(r) => Some(r),
                    _ => None,
                })
                .collect();
            assert_eq!(processed, vec![&report.results[0]]);
        }
    }

    // =========================================================================
    // Metadata and inputs
    // =========================================================================

    struct CaptionExtractor;

    impl MetadataExtractor for CaptionExtractor {
        fn extract(&self, bytes: &[u8]) -> Option<Metadata> {
            let mut m = Metadata::new();
            m.insert("bytes".into(), serde_json::json!(bytes.len()));
            Some(m)
        }
    }

    #[test]
    fn metadata_is_attached_on_miss_and_hit() {
        let tmp = TempDir::new().unwrap();
        let img = write_mock_image(tmp.path(), "a.jpg", 100, 100, false, false);
        let pipeline =
            mock_pipeline(&tmp.path().join("out")).with_metadata(Arc::new(CaptionExtractor));

        let first = pipeline.process(&[image_input(&img)], None);
        let second = pipeline.process(&[image_input(&img)], None);
        assert_eq!(second.results[0].status, ResultStatus::Hit);
        assert_eq!(first.results[0].metadata, second.results[0].metadata);
        assert!(first.results[0].metadata.as_ref().unwrap().contains_key("bytes"));
    }

    #[test]
    fn from_identifier_routes_by_kind() {
        let bp = BreakpointSet::default();
        assert!(matches!(
            PipelineInput::from_identifier(ResourceIdentifier::local("a.webp"), bp.clone()),
            PipelineInput::Image(..)
        ));
        assert!(matches!(
            PipelineInput::from_identifier(ResourceIdentifier::local("notes.md"), bp),
            PipelineInput::Document(..)
        ));
    }

    #[test]
    fn discover_walks_directories_for_documents() {
        let tmp = TempDir::new().unwrap();
        write_document(tmp.path(), "b.md", "b");
        write_document(tmp.path(), "nested/a.md", "a");
        write_mock_image(tmp.path(), "pic.jpg", 10, 10, false, false);

        let inputs = discover_inputs(&tmp.path().to_string_lossy(), &BreakpointSet::default());
        let names: Vec<String> = inputs.iter().map(|i| i.identifier().key()).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("b.md"));
        assert!(names[1].ends_with("nested/a.md"));

        let single = discover_inputs(
            &tmp.path().join("pic.jpg").to_string_lossy(),
            &BreakpointSet::default(),
        );
        assert!(matches!(single[0], PipelineInput::Image(..)));
        assert!(discover_inputs("  ", &BreakpointSet::default()).is_empty());
    }
}
