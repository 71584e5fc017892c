//! The variant matrix: which files a source image produces.
//!
//! [`generate`] is a pure function of the source dimensions, the breakpoint
//! configuration and the transparency flag. It never looks at pixels, which
//! is what lets a cache hit rebuild the exact variant list from a stored
//! [`CacheEntry`](crate::cache::CacheEntry) without decoding anything.
//!
//! For each tier (smallest first) the formats are, in order:
//!
//! | Source | Formats |
//! |---|---|
//! | opaque still | AVIF, WebP, JPEG |
//! | transparent still | AVIF, WebP, PNG |
//! | animated GIF | GIF only (resized, never converted) |
//! | animated PNG | PNG only (resized, never converted) |
//!
//! File names are content-addressed and flat: `{hash}-{tier}.{ext}`, plus one
//! `{hash}-blur.jpg` placeholder per source.

use super::calculations::{effective_dimensions, placeholder_dimensions};
use super::params::OutputFormat;
use super::tiers::{BreakpointSet, SizeTag};
use crate::hashing::ResourceHash;
use serde::{Deserialize, Serialize};

/// Source facts the matrix depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Container of a multi-frame source. Animations keep their format.
    pub animation: Option<OutputFormat>,
}

impl SourceInfo {
    pub fn still(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            animation: None,
        }
    }

    pub fn is_animated(&self) -> bool {
        self.animation.is_some()
    }
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVariant {
    pub size_tag: SizeTag,
    pub format: OutputFormat,
    /// File name inside the output directory.
    pub path: String,
    pub width: u32,
    pub height: u32,
}

/// Formats for one tier.
pub fn formats_for(has_transparency: bool, animation: Option<OutputFormat>) -> Vec<OutputFormat> {
    if let Some(format) = animation {
        return vec![format];
    }
    let fallback = if has_transparency {
        OutputFormat::Png
    } else {
        OutputFormat::Jpeg
    };
    vec![OutputFormat::Avif, OutputFormat::Webp, fallback]
}

pub fn variant_filename(hash: &ResourceHash, tag: SizeTag, format: OutputFormat) -> String {
    format!("{}-{}.{}", hash, tag, format.extension())
}

pub fn placeholder_filename(hash: &ResourceHash) -> String {
    format!("{}-blur.jpg", hash)
}

/// Build the ordered variant list for a source.
pub fn generate(
    image: &SourceInfo,
    breakpoints: &BreakpointSet,
    has_transparency: bool,
    hash: &ResourceHash,
) -> Vec<ImageVariant> {
    let formats = formats_for(has_transparency, image.animation);
    breakpoints
        .tiers()
        .into_iter()
        .flat_map(|tier| {
            let (width, height) =
                effective_dimensions((image.width, image.height), tier.target_width);
            formats.iter().map(move |&format| ImageVariant {
                size_tag: tier.tag,
                format,
                path: variant_filename(hash, tier.tag, format),
                width,
                height,
            })
        })
        .collect()
}

/// The placeholder's file name and dimensions.
pub fn placeholder(image: &SourceInfo, hash: &ResourceHash) -> (String, u32, u32) {
    let (width, height) = placeholder_dimensions((image.width, image.height));
    (placeholder_filename(hash), width, height)
}
