//! Best-effort cover art normalization.
//!
//! Covers are scaled to fit a bounding box and re-encoded in place. The original
//! file is only replaced once the new encoding has been fully written.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use thiserror::Error;

/// Result of a successful normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalized {
    pub width: u32,
    pub height: u32,
}

/// Why normalization was skipped. The original file is untouched in every case.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("unsupported image type {0}")]
    Unsupported(String),

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("normalization task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct CoverNormalizer {
    max_width: u32,
    max_height: u32,
    jpeg_quality: u8,
}

impl CoverNormalizer {
    pub fn new(max_width: u32, max_height: u32, jpeg_quality: u8) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
            jpeg_quality,
        }
    }

    pub async fn normalize(&self, path: &Path, mime_type: &str) -> Result<Normalized, SkipReason> {
        let format = match mime_type {
            "image/jpeg" => ImageFormat::Jpeg,
            "image/png" => ImageFormat::Png,
            "image/gif" => ImageFormat::Gif,
            other => return Err(SkipReason::Unsupported(other.to_string())),
        };

        let normalizer = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || normalizer.normalize_blocking(&path, format)).await?
    }

    fn normalize_blocking(&self, path: &Path, format: ImageFormat) -> Result<Normalized, SkipReason> {
        let source = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(SkipReason::Decode)?;

        let (width, height) = fit_within(
            source.width(),
            source.height(),
            self.max_width,
            self.max_height,
        );

        let resized = imageops::resize(&source.to_rgba8(), width, height, FilterType::Triangle);

        let canvas = if format == ImageFormat::Png {
            let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 0]));
            imageops::replace(&mut canvas, &resized, 0, 0);
            canvas
        } else {
            resized
        };

        let staging = staging_path(path);
        if let Err(e) = self.encode(DynamicImage::ImageRgba8(canvas), format, &staging) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }

        tracing::debug!("Normalized cover {} to {}x{}", path.display(), width, height);
        Ok(Normalized { width, height })
    }

    fn encode(&self, image: DynamicImage, format: ImageFormat, dest: &Path) -> Result<(), SkipReason> {
        let mut writer = BufWriter::new(File::create(dest)?);

        match format {
            ImageFormat::Jpeg => {
                let rgb = image.to_rgb8();
                JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality)
                    .encode_image(&rgb)
                    .map_err(SkipReason::Encode)?;
            }
            ImageFormat::Png => {
                // Default compression is zlib level 6.
                let encoder = PngEncoder::new_with_quality(
                    &mut writer,
                    CompressionType::Default,
                    PngFilter::Adaptive,
                );
                image.write_with_encoder(encoder).map_err(SkipReason::Encode)?;
            }
            _ => {
                image
                    .write_to(&mut writer, format)
                    .map_err(SkipReason::Encode)?;
            }
        }

        std::io::Write::flush(&mut writer)?;
        Ok(())
    }
}

/// Scale `(width, height)` uniformly to fit the box, rounding and flooring at 1px.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let scale = f64::min(
        max_width as f64 / width.max(1) as f64,
        max_height as f64 / height.max(1) as f64,
    );

    let scaled = |value: u32| ((value as f64 * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        ".{}.normalizing",
        path.file_name().unwrap_or_default().to_string_lossy()
    ))
}
