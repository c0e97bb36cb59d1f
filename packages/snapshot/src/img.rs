//! Image pipeline.
//!
//! Decodes an image, runs an ordered list of filters over it and re-encodes
//! it. Re-encoding never copies source metadata (EXIF, ICC, comments), so
//! every transformed image comes out stripped.
//!
//! Transforms are CPU bound and memory hungry: callers hold a permit from
//! [`acquire`] for the whole decode/encode cycle, which caps concurrent
//! transforms process-wide.

use std::io::Cursor;
use std::sync::OnceLock;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use crate::error::ImageError;

/// Concurrent image transforms allowed in the whole process.
pub const MAX_TRANSFORMS: usize = 2;

static TRANSFORMS: OnceLock<Semaphore> = OnceLock::new();

/// Waits for one of the process-wide transform permits.
pub async fn acquire() -> Result<SemaphorePermit<'static>, AcquireError> {
    TRANSFORMS
        .get_or_init(|| Semaphore::new(MAX_TRANSFORMS))
        .acquire()
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Fast,
    Default,
    Best,
}

/// A decoded image and its encoding settings.
pub struct Image {
    img: DynamicImage,
    format: ImageFormat,
    quality: u8,
    compression: Compression,
}

impl Image {
    /// Decodes `data` as `content_type` (e.g. `image/png`).
    pub fn decode(content_type: &str, data: &[u8]) -> Result<Self, ImageError> {
        let format = ImageFormat::from_mime_type(content_type)
            .ok_or_else(|| ImageError::Unsupported(content_type.to_string()))?;
        let img = image::load_from_memory_with_format(data, format)?;

        Ok(Self {
            img,
            format: output_format(format),
            quality: 90,
            compression: Compression::Default,
        })
    }

    pub fn width(&self) -> u32 {
        self.img.width()
    }

    pub fn height(&self) -> u32 {
        self.img.height()
    }

    /// Output content type.
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// Output format name, as used in file extensions.
    pub fn format_name(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::WebP => "webp",
            _ => "png",
        }
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(1, 100);
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    /// Changes the output format. Unknown names keep the current one.
    pub fn set_format(&mut self, name: &str) {
        match name {
            "jpeg" | "jpg" => self.format = ImageFormat::Jpeg,
            "png" => self.format = ImageFormat::Png,
            "webp" => self.format = ImageFormat::WebP,
            _ => {}
        }
    }

    /// Shrinks the image to fit `width` x `height`, keeping its ratio.
    /// A zero bound is unconstrained; images are never enlarged.
    pub fn fit(&mut self, width: u32, height: u32) {
        let (w, h) = self.img.dimensions();
        let mut ratio = 1.0_f64;
        if width > 0 && w > width {
            ratio = ratio.min(f64::from(width) / f64::from(w));
        }
        if height > 0 && h > height {
            ratio = ratio.min(f64::from(height) / f64::from(h));
        }
        if ratio >= 1.0 {
            return;
        }

        let nw = ((f64::from(w) * ratio).round() as u32).max(1);
        let nh = ((f64::from(h) * ratio).round() as u32).max(1);
        self.img = self.img.resize_exact(nw, nh, FilterType::Lanczos3);
    }

    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        let mut buf = Cursor::new(Vec::new());
        match self.format {
            ImageFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgb8(self.img.to_rgb8());
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, self.quality))?;
            }
            ImageFormat::WebP => {
                let rgba = DynamicImage::ImageRgba8(self.img.to_rgba8());
                rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
            }
            _ => {
                let compression = match self.compression {
                    Compression::Fast => CompressionType::Fast,
                    Compression::Default => CompressionType::Default,
                    Compression::Best => CompressionType::Best,
                };
                self.img.write_with_encoder(PngEncoder::new_with_quality(
                    &mut buf,
                    compression,
                    PngFilter::Adaptive,
                ))?;
            }
        }
        Ok(buf.into_inner())
    }
}

/// Formats the pipeline cannot write are converted to PNG.
fn output_format(source: ImageFormat) -> ImageFormat {
    match source {
        ImageFormat::Jpeg | ImageFormat::WebP => source,
        _ => ImageFormat::Png,
    }
}

/// One step of an image pipeline.
pub type Filter<'a> = &'a dyn Fn(&mut Image) -> Result<(), ImageError>;

/// Applies `filters` in order, stopping at the first failure.
pub fn pipeline(im: &mut Image, filters: &[Filter<'_>]) -> Result<(), ImageError> {
    for filter in filters {
        filter(im)?;
    }
    Ok(())
}

/// Sniffs the content type of image bytes from their magic numbers.
///
/// SVG has no magic number; a `<svg` tag near the start is enough.
pub fn sniff(data: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(data) {
        return Some(format.to_mime_type());
    }

    let head = String::from_utf8_lossy(&data[..data.len().min(512)]).to_ascii_lowercase();
    if head.contains("<svg") {
        return Some("image/svg+xml");
    }
    None
}
