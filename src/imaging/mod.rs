//! Image processing: the variant matrix and the pixel backend.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image::ImageReader`, `GifDecoder` / `PngDecoder::apng` for animations |
//! | **Resize → AVIF/WebP/PNG/JPEG** | Lanczos3 + `image::codecs` |
//! | **Resize animated GIF / APNG** | per-frame resize + `GifEncoder` / `png::Encoder` |
//! | **Placeholder** | `imageops::blur` + JPEG |
//!
//! The module is split into:
//! - **Tiers**: breakpoints → named target widths
//! - **Calculations**: pure dimension math (unit testable)
//! - **Variants**: the pure (source, breakpoints, transparency) → files matrix
//! - **Parameters**: data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]

pub mod backend;
pub mod calculations;
mod params;
pub mod rust_backend;
pub mod tiers;
pub mod variants;

pub use backend::{Decoded, ImageBackend};
pub use params::{DecodeLimits, EncodeParams, OutputFormat, PlaceholderParams, Quality};
pub use rust_backend::RustBackend;
pub use tiers::{BreakpointSet, SizeTag};
pub use variants::{ImageVariant, SourceInfo, generate};
