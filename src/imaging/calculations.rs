//! Pure calculation functions for variant dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Width of the blurred placeholder before clamping to the source width.
pub const PLACEHOLDER_WIDTH: u32 = 32;

/// Scale `original_height` to `width`, keeping the aspect ratio.
///
/// Rounds half up, in integer arithmetic so the result never depends on
/// float representation: `floor((h * w' * 2 + w) / (2 * w))`. Never returns 0.
///
/// # Examples
/// ```
/// # use simple_assets::imaging::calculations::scaled_height;
/// assert_eq!(scaled_height(3000, 2000, 1500), 1000);
/// // 3 * 1 / 2 = 1.5 rounds up
/// assert_eq!(scaled_height(2, 3, 1), 2);
/// ```
pub fn scaled_height(original_width: u32, original_height: u32, width: u32) -> u32 {
    if original_width == 0 {
        return 1;
    }
    let w = u64::from(original_width);
    let scaled = (u64::from(original_height) * u64::from(width) * 2 + w) / (2 * w);
    (scaled as u32).max(1)
}

/// Dimensions for a tier target: the width is clamped to the original (no
/// upsampling) and the height follows the aspect ratio.
///
/// # Arguments
/// * `original` - Original image dimensions (width, height)
/// * `target_width` - Tier target width
///
/// # Returns
/// * `(width, height)` - Effective output dimensions
pub fn effective_dimensions(original: (u32, u32), target_width: u32) -> (u32, u32) {
    let (orig_w, orig_h) = original;
    let width = target_width.min(orig_w).max(1);
    (width, scaled_height(orig_w, orig_h, width))
}

/// Dimensions of the blurred placeholder for a source of `original` size.
pub fn placeholder_dimensions(original: (u32, u32)) -> (u32, u32) {
    effective_dimensions(original, PLACEHOLDER_WIDTH)
}
