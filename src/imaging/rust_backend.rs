//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP, GIF) | `image::ImageReader` with a guessed format |
//! | Decode animated GIF / APNG | `GifDecoder::into_frames`, `PngDecoder::apng` |
//! | Resize | `image::imageops` with `Lanczos3` (stills) or `Triangle` (frames) |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Encode → WebP | `image::codecs::webp::WebPEncoder` (lossless) |
//! | Encode → PNG / JPEG / GIF | `image::codecs::{png, jpeg, gif}` |
//! | Encode → APNG | `png::Encoder` with `set_animated` |
//! | Placeholder | `imageops::blur` + JPEG |

use super::backend::{Decoded, ImageBackend};
use super::params::{DecodeLimits, EncodeParams, OutputFormat, PlaceholderParams};
use super::variants::SourceInfo;
use crate::source::ResourceError;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngDecoder, PngEncoder};
use image::codecs::webp::WebPDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frame, ImageDecoder, ImageFormat, ImageReader};
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

/// A decoded source: a still image or the composited frames of an animation.
pub enum SourceImage {
    Still(DynamicImage),
    Animated(Vec<Frame>),
}

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(e: impl std::fmt::Display) -> ResourceError {
    ResourceError::UnsupportedFormat(e.to_string())
}

fn check_limits(width: u32, height: u32, limits: &DecodeLimits) -> Result<(), ResourceError> {
    if width == 0 || height == 0 {
        return Err(unsupported(format!("degenerate dimensions {width}x{height}")));
    }
    if !limits.allows(width, height) {
        return Err(unsupported(format!(
            "{width}x{height} exceeds the limit of {} pixels",
            limits.max_pixels
        )));
    }
    Ok(())
}

/// True when any pixel is not fully opaque.
fn has_transparency(img: &DynamicImage) -> bool {
    if !img.color().has_alpha() {
        return false;
    }
    match img {
        DynamicImage::ImageRgba8(buf) => buf.pixels().any(|p| p[3] < u8::MAX),
        DynamicImage::ImageLumaA8(buf) => buf.pixels().any(|p| p[1] < u8::MAX),
        other => other.to_rgba16().pixels().any(|p| p[3] < u16::MAX),
    }
}

/// Build a decoded source from composited frames. A single frame is an
/// ordinary still and gets converted like any other.
fn from_frames(
    mut frames: Vec<Frame>,
    width: u32,
    height: u32,
    container: OutputFormat,
) -> Result<Decoded<SourceImage>, ResourceError> {
    if frames.len() > 1 {
        let transparent = frames
            .iter()
            .any(|f| f.buffer().pixels().any(|p| p[3] < u8::MAX));
        return Ok(Decoded {
            info: SourceInfo {
                width,
                height,
                animation: Some(container),
            },
            has_transparency: transparent,
            image: SourceImage::Animated(frames),
        });
    }

    let frame = frames
        .pop()
        .ok_or_else(|| unsupported(format!("{container} without frames")))?;
    let img = DynamicImage::ImageRgba8(frame.into_buffer());
    Ok(Decoded {
        info: SourceInfo::still(img.width(), img.height()),
        has_transparency: has_transparency(&img),
        image: SourceImage::Still(img),
    })
}

fn decode_gif(bytes: &[u8], limits: &DecodeLimits) -> Result<Decoded<SourceImage>, ResourceError> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(unsupported)?;
    let (width, height) = decoder.dimensions();
    check_limits(width, height, limits)?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(unsupported)?;
    from_frames(frames, width, height, OutputFormat::Gif)
}

/// PNG, following the `acTL` chunk into APNG frames when present.
fn decode_png(bytes: &[u8], limits: &DecodeLimits) -> Result<Decoded<SourceImage>, ResourceError> {
    let decoder = PngDecoder::new(Cursor::new(bytes)).map_err(unsupported)?;
    let (width, height) = decoder.dimensions();
    check_limits(width, height, limits)?;
    if !decoder.is_apng().map_err(unsupported)? {
        return decode_still(bytes, ImageFormat::Png, limits);
    }
    let frames = decoder
        .apng()
        .map_err(unsupported)?
        .into_frames()
        .collect_frames()
        .map_err(unsupported)?;
    from_frames(frames, width, height, OutputFormat::Png)
}

/// WebP stills only. Animated WebP has no encoder here, so it is refused
/// rather than flattened to its first frame.
fn decode_webp(bytes: &[u8], limits: &DecodeLimits) -> Result<Decoded<SourceImage>, ResourceError> {
    let decoder = WebPDecoder::new(Cursor::new(bytes)).map_err(unsupported)?;
    if decoder.has_animation() {
        return Err(unsupported("animated WebP cannot be resized as WebP"));
    }
    decode_still(bytes, ImageFormat::WebP, limits)
}

fn decode_still(
    bytes: &[u8],
    format: ImageFormat,
    limits: &DecodeLimits,
) -> Result<Decoded<SourceImage>, ResourceError> {
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(unsupported)?;
    check_limits(width, height, limits)?;

    let img = ImageReader::with_format(Cursor::new(bytes), format)
        .decode()
        .map_err(unsupported)?;
    Ok(Decoded {
        info: SourceInfo::still(img.width(), img.height()),
        has_transparency: has_transparency(&img),
        image: SourceImage::Still(img),
    })
}

fn create_output(path: &Path) -> Result<BufWriter<File>, ResourceError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| ResourceError::EncodeFailed(format!("{}: {}", path.display(), e)))
}

fn encode_failed(path: &Path, e: impl std::fmt::Display) -> ResourceError {
    ResourceError::EncodeFailed(format!("{}: {}", path.display(), e))
}

/// Reduce to 8-bit RGB or RGBA, the layouts every encoder here accepts.
fn to_8bit(img: DynamicImage, keep_alpha: bool) -> DynamicImage {
    if keep_alpha && img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.into_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.into_rgb8())
    }
}

/// Encode a still image into `format` at `path`.
fn save_still(
    img: DynamicImage,
    path: &Path,
    format: OutputFormat,
    quality: u32,
) -> Result<(), ResourceError> {
    let writer = create_output(path)?;
    let result = match format {
        OutputFormat::Avif => to_8bit(img, true).write_with_encoder(
            image::codecs::avif::AvifEncoder::new_with_speed_quality(writer, 6, quality as u8),
        ),
        OutputFormat::Webp => to_8bit(img, true)
            .write_with_encoder(image::codecs::webp::WebPEncoder::new_lossless(writer)),
        OutputFormat::Png => to_8bit(img, true).write_with_encoder(PngEncoder::new_with_quality(
            writer,
            CompressionType::Best,
            PngFilter::Adaptive,
        )),
        OutputFormat::Jpeg => to_8bit(img, false).write_with_encoder(
            image::codecs::jpeg::JpegEncoder::new_with_quality(writer, quality as u8),
        ),
        OutputFormat::Gif => {
            let frame = Frame::new(img.into_rgba8());
            let mut encoder = GifEncoder::new(writer);
            encoder.encode_frame(frame)
        }
    };
    result.map_err(|e| encode_failed(path, e))
}

fn resize_frames(frames: &[Frame], width: u32, height: u32) -> impl Iterator<Item = Frame> + '_ {
    frames.iter().map(move |frame| {
        let buffer = image::imageops::resize(frame.buffer(), width, height, FilterType::Triangle);
        Frame::from_parts(buffer, 0, 0, frame.delay())
    })
}

/// Resize every frame of an animation and write it as GIF.
fn save_gif_animation(
    frames: &[Frame],
    width: u32,
    height: u32,
    path: &Path,
) -> Result<(), ResourceError> {
    let mut encoder = GifEncoder::new(create_output(path)?);
    encoder
        .set_repeat(Repeat::Infinite)
        .map_err(|e| encode_failed(path, e))?;
    encoder
        .encode_frames(resize_frames(frames, width, height))
        .map_err(|e| encode_failed(path, e))
}

/// Frame delay as the `fcTL` fraction of a second, in whole milliseconds.
fn apng_delay(frame: &Frame) -> (u16, u16) {
    let (numer, denom) = frame.delay().numer_denom_ms();
    let ms = if denom == 0 { 0 } else { numer / denom };
    (ms.min(u32::from(u16::MAX)) as u16, 1000)
}

/// Resize every frame of an animation and write it as APNG.
///
/// `image` only decodes APNG, so the frames go straight to the `png` encoder.
/// Every frame covers the full canvas because decoding composited them.
fn save_png_animation(
    frames: &[Frame],
    width: u32,
    height: u32,
    path: &Path,
) -> Result<(), ResourceError> {
    let mut encoder = png::Encoder::new(create_output(path)?, width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder
        .set_animated(frames.len() as u32, 0)
        .map_err(|e| encode_failed(path, e))?;
    let mut writer = encoder
        .write_header()
        .map_err(|e| encode_failed(path, e))?;
    for frame in resize_frames(frames, width, height) {
        let (numer, denom) = apng_delay(&frame);
        writer
            .set_frame_delay(numer, denom)
            .map_err(|e| encode_failed(path, e))?;
        writer
            .write_image_data(frame.buffer().as_raw())
            .map_err(|e| encode_failed(path, e))?;
    }
    writer.finish().map_err(|e| encode_failed(path, e))
}

impl ImageBackend for RustBackend {
    type Image = SourceImage;

    fn decode(
        &self,
        bytes: &[u8],
        limits: &DecodeLimits,
    ) -> Result<Decoded<SourceImage>, ResourceError> {
        let format = image::guess_format(bytes).map_err(unsupported)?;
        match format {
            ImageFormat::Gif => decode_gif(bytes, limits),
            ImageFormat::Png => decode_png(bytes, limits),
            ImageFormat::WebP => decode_webp(bytes, limits),
            // `reading_enabled` reports AVIF even though only its encoder is built
            ImageFormat::Avif => Err(unsupported("no AVIF decoder compiled in")),
            other if other.reading_enabled() => decode_still(bytes, other, limits),
            other => Err(unsupported(format!("no decoder for {other:?}"))),
        }
    }

    fn encode(&self, image: &SourceImage, params: &EncodeParams) -> Result<(), ResourceError> {
        match (image, params.format) {
            (SourceImage::Animated(frames), OutputFormat::Gif) => {
                save_gif_animation(frames, params.width, params.height, &params.output)
            }
            (SourceImage::Animated(frames), OutputFormat::Png) => {
                save_png_animation(frames, params.width, params.height, &params.output)
            }
            (SourceImage::Animated(_), other) => Err(ResourceError::EncodeFailed(format!(
                "animated sources are not converted to {other}"
            ))),
            (SourceImage::Still(img), format) => {
                let resized = img.resize_exact(params.width, params.height, FilterType::Lanczos3);
                save_still(resized, &params.output, format, params.quality.value())
            }
        }
    }

    fn placeholder(
        &self,
        image: &SourceImage,
        params: &PlaceholderParams,
    ) -> Result<(), ResourceError> {
        let small = match image {
            SourceImage::Still(img) => {
                img.resize_exact(params.width, params.height, FilterType::Triangle)
            }
            SourceImage::Animated(frames) => {
                let first = frames
                    .first()
                    .ok_or_else(|| ResourceError::EncodeFailed("animation without frames".into()))?;
                DynamicImage::ImageRgba8(image::imageops::resize(
                    first.buffer(),
                    params.width,
                    params.height,
                    FilterType::Triangle,
                ))
            }
        };
        let blurred = image::imageops::blur(&small.to_rgb8(), params.sigma);
        save_still(
            DynamicImage::ImageRgb8(blurred),
            &params.output,
            OutputFormat::Jpeg,
            params.quality.value(),
        )
    }
}
