//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the three operations the pipeline needs:
//! decode a source once, encode any number of variants from the decoded
//! image, and write the blurred placeholder.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate. Tests use the recording `MockBackend` below, which never touches
//! pixels.

use super::params::{DecodeLimits, EncodeParams, PlaceholderParams};
use super::variants::SourceInfo;
use crate::source::ResourceError;

/// A decoded source plus the facts the variant matrix needs.
#[derive(Debug)]
pub struct Decoded<I> {
    pub info: SourceInfo,
    /// True when any pixel is not fully opaque.
    pub has_transparency: bool,
    pub image: I,
}

/// Trait for image processing backends.
///
/// The decoded representation is backend-specific, so every variant of a
/// source is produced from a single decode.
pub trait ImageBackend: Sync {
    type Image: Send;

    /// Decode raw source bytes, rejecting sources over `limits`.
    fn decode(
        &self,
        bytes: &[u8],
        limits: &DecodeLimits,
    ) -> Result<Decoded<Self::Image>, ResourceError>;

    /// Resize to the exact dimensions in `params` and write one variant file.
    fn encode(&self, image: &Self::Image, params: &EncodeParams) -> Result<(), ResourceError>;

    /// Write the blurred placeholder.
    fn placeholder(
        &self,
        image: &Self::Image,
        params: &PlaceholderParams,
    ) -> Result<(), ResourceError>;
}
