//! Pipeline configuration.
//!
//! Handles loading, validating, and merging `config.toml`. User values are
//! layered over the stock defaults, so a config file only names what it
//! changes.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [breakpoints]
//! xs = 320                  # Layout widths in CSS pixels
//! sm = 640
//! md = 768
//! lg = 1024
//! xl = 1280
//! xxl = 1536
//!
//! [processing]
//! quality = 80              # Lossy encoding quality (1-100)
//! max_concurrency = 4       # Parallel workers (omit for auto)
//!
//! [graph]
//! max_depth = 32            # Maximum document nesting
//!
//! [limits]
//! fetch_timeout_secs = 30   # Remote fetch timeout per resource
//! max_image_pixels = 100000000
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::graph::DEFAULT_MAX_DEPTH;
use crate::imaging::BreakpointSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Hard upper bound on the default worker count. Each worker holds a fully
/// decoded source in memory.
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Configuration loaded from `config.toml`.
///
/// All fields have sensible defaults. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Layout breakpoints the size tiers derive from.
    pub breakpoints: BreakpointSet,
    /// Encoding and parallelism settings.
    pub processing: ProcessingConfig,
    /// Dependency graph settings.
    pub graph: GraphConfig,
    /// Per-resource bounds.
    pub limits: LimitsConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breakpoints.validate().map_err(ConfigError::Validation)?;
        if !(1..=100).contains(&self.processing.quality) {
            return Err(ConfigError::Validation(
                "processing.quality must be 1-100".into(),
            ));
        }
        if self.processing.max_concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_concurrency must be at least 1".into(),
            ));
        }
        if self.graph.max_depth == 0 {
            return Err(ConfigError::Validation(
                "graph.max_depth must be at least 1".into(),
            ));
        }
        if self.limits.fetch_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "limits.fetch_timeout_secs must be at least 1".into(),
            ));
        }
        if self.limits.max_image_pixels == 0 {
            return Err(ConfigError::Validation(
                "limits.max_image_pixels must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Encoding and parallel processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Quality for lossy formats (AVIF, JPEG).
    pub quality: u32,
    /// Maximum number of parallel workers.
    /// When absent, defaults to the number of CPU cores capped at
    /// [`DEFAULT_MAX_WORKERS`]. Values larger than the core count are
    /// clamped down.
    pub max_concurrency: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            max_concurrency: None,
        }
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → `min(cores, DEFAULT_MAX_WORKERS)`
/// - `Some(n)` → `n` clamped to `[1, cores]` (user can constrain down, not up)
pub fn effective_concurrency(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match config.max_concurrency {
        Some(n) => n.clamp(1, cores),
        None => cores.min(DEFAULT_MAX_WORKERS),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub max_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Seconds before a remote fetch is abandoned.
    pub fetch_timeout_secs: u64,
    /// Sources with more pixels than this fail instead of being decoded.
    pub max_image_pixels: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            max_image_pixels: 100_000_000,
        }
    }
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PipelineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a `config.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if no `config.toml` exists in the directory.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = dir.join("config.toml");
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<PipelineConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `config.toml` in the given directory.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result.
pub fn load_config(dir: &Path) -> Result<PipelineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(dir)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Simple Assets Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Breakpoints
# ---------------------------------------------------------------------------
# Layout widths in CSS pixels. Each must be at least as large as the one
# before it. Generated tiers:
#   micro = xs / 2, xs = xs, sm..xxl = 2x the breakpoint (high-density screens)
# No variant is ever wider than its source.
[breakpoints]
xs = 320
sm = 640
md = 768
lg = 1024
xl = 1280
xxl = 1536

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Encoding quality for lossy formats (1 = worst, 100 = best).
quality = 80

# Maximum parallel workers. Each holds one decoded image in memory.
# Omit or comment out to auto-detect (= CPU cores, at most 8).
# max_concurrency = 4

# ---------------------------------------------------------------------------
# Dependency graph
# ---------------------------------------------------------------------------
[graph]
# Documents nested deeper than this abort their root with an error.
max_depth = 32

# ---------------------------------------------------------------------------
# Limits
# ---------------------------------------------------------------------------
[limits]
# Seconds before fetching a remote source is abandoned.
fetch_timeout_secs = 30

# Sources with more pixels than this fail instead of being decoded.
max_image_pixels = 100000000
"##
}
