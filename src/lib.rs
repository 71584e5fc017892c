//! # Simple Assets
//!
//! A build-time asset pipeline for documentation sites. Point it at Markdown
//! documents (or images directly) and it produces responsive, multi-format
//! image variants plus a blurred placeholder per image, skipping work whose
//! inputs have not changed.
//!
//! # Architecture
//!
//! ```text
//! inputs ──► graph ──► ExecutionPlan (documents, pdfs, per-tier image jobs)
//!                          │
//!                          ▼
//!            scheduler (bounded pool, in-flight dedup)
//!                          │
//!                          ▼
//!            process: hash → cache lookup → decode once → encode variants
//!                          │
//!                          ▼
//!            output dir: {hash}-{tier}.{ext}, {hash}-blur.jpg, manifest.json
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`identifier`] | Resource identity (local path or URL), reference resolution |
//! | [`hashing`] | Identity hash and content hash |
//! | [`parser`] | Reference extraction from document text |
//! | [`graph`] | Dependency graph with cycle and depth detection |
//! | [`imaging`] | Breakpoint tiers, variant matrix, decode/encode backends |
//! | [`source`] | Reading local and remote bytes, metadata enrichment |
//! | [`cache`] | Cache entry contract, in-memory and JSON stores |
//! | [`scheduler`] | Worker pool with coalescing of concurrent duplicate work |
//! | [`process`] | The orchestrator tying the above together |
//! | [`config`] | `config.toml` loading, validation and stock defaults |
//! | [`output`] | CLI output formatting |
//! | [`logging`] | Diagnostic logging setup |
//!
//! # Design Decisions
//!
//! ## Two Hashes
//!
//! A resource's *identity* hash names its output files and never changes for
//! the same path or URL. Its *content* hash decides whether those files are
//! still valid. Editing an image therefore overwrites files in place instead
//! of accumulating orphans under new names.
//!
//! ## Decode Once
//!
//! Each source is decoded a single time per run; every tier and format is
//! encoded from that one decoded image. Tiers that clamp to the same size
//! (small sources) are encoded once and copied.
//!
//! ## Pure-Rust Imaging
//!
//! The production backend uses the `image` crate only. No ImageMagick, no
//! system libraries: the binary is self-contained.

pub mod cache;
pub mod config;
pub mod graph;
pub mod hashing;
pub mod identifier;
pub mod imaging;
pub mod logging;
pub mod output;
pub mod parser;
pub mod process;
pub mod scheduler;
pub mod source;

#[cfg(test)]
pub(crate) mod test_helpers;
