//! Pure artifact transformations used by pipeline stages.
//!
//! All functions here are CPU bound and synchronous; callers run them on the
//! blocking pool.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// Longest edge of a normalised working image.
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

/// Longest edge of a preview thumbnail.
pub const THUMBNAIL_SIZE: u32 = 256;

const REFINE_CONTRAST: f32 = 8.0;
const REFINE_SHARPEN_SIGMA: f32 = 1.0;
const REFINE_SHARPEN_THRESHOLD: i32 = 2;

/// Broad artifact kind detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image(ImageFormat),
    Video,
    Json,
    Other,
}

impl ArtifactKind {
    pub fn detect(data: &[u8]) -> Self {
        if let Ok(format) = image::guess_format(data) {
            return ArtifactKind::Image(format);
        }
        if data.len() >= 12 && &data[4..8] == b"ftyp" {
            return ArtifactKind::Video;
        }
        if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return ArtifactKind::Video;
        }
        match data.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => ArtifactKind::Json,
            _ => ArtifactKind::Other,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ArtifactKind::Image(_))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Image(ImageFormat::Png) => "image/png",
            ArtifactKind::Image(ImageFormat::Jpeg) => "image/jpeg",
            ArtifactKind::Image(ImageFormat::Gif) => "image/gif",
            ArtifactKind::Image(ImageFormat::WebP) => "image/webp",
            ArtifactKind::Image(_) => "application/octet-stream",
            ArtifactKind::Video => "video/mp4",
            ArtifactKind::Json => "application/json",
            ArtifactKind::Other => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Image(ImageFormat::Png) => "png",
            ArtifactKind::Image(ImageFormat::Jpeg) => "jpg",
            ArtifactKind::Image(ImageFormat::Gif) => "gif",
            ArtifactKind::Image(ImageFormat::WebP) => "webp",
            ArtifactKind::Image(_) => "img",
            ArtifactKind::Video => "mp4",
            ArtifactKind::Json => "json",
            ArtifactKind::Other => "bin",
        }
    }
}

fn encode(img: &DynamicImage, format: ImageFormat) -> MediaResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    match format {
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut cursor, format)?,
        _ => img.write_to(&mut cursor, format)?,
    }
    Ok(cursor.into_inner())
}

/// Decode any supported image and re-encode it as PNG, downscaling so the
/// longest edge is at most `max_dimension`.
pub fn normalize_image(data: &[u8], max_dimension: u32) -> MediaResult<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let (width, height) = img.dimensions();
    let img = if width.max(height) > max_dimension {
        debug!(width, height, max_dimension, "Downscaling input image");
        img.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        img
    };
    encode(&img, ImageFormat::Png)
}

/// Contrast boost plus unsharp mask, PNG out.
pub fn refine_image(data: &[u8]) -> MediaResult<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let refined = img
        .adjust_contrast(REFINE_CONTRAST)
        .unsharpen(REFINE_SHARPEN_SIGMA, REFINE_SHARPEN_THRESHOLD);
    encode(&refined, ImageFormat::Png)
}

/// JPEG preview whose longest edge is at most `size`.
pub fn thumbnail_jpeg(data: &[u8], size: u32) -> MediaResult<Vec<u8>> {
    if !ArtifactKind::detect(data).is_image() {
        return Err(MediaError::unsupported("thumbnail source is not an image"));
    }
    let img = image::load_from_memory(data)?;
    encode(&img.thumbnail(size, size), ImageFormat::Jpeg)
}

/// Pixel dimensions of an encoded image.
pub fn dimensions(data: &[u8]) -> MediaResult<(u32, u32)> {
    Ok(image::load_from_memory(data)?.dimensions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, 128, 255])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_detect() {
        assert_eq!(ArtifactKind::detect(&png(2, 2)), ArtifactKind::Image(ImageFormat::Png));
        assert_eq!(ArtifactKind::detect(b"\x00\x00\x00\x18ftypmp42...."), ArtifactKind::Video);
        assert_eq!(ArtifactKind::detect(b"  {\"prompt\":1}"), ArtifactKind::Json);
        assert_eq!(ArtifactKind::detect(b"plain"), ArtifactKind::Other);
    }

    #[test]
    fn test_normalize_downscales_and_keeps_aspect() {
        let out = normalize_image(&png(400, 200), 100).unwrap();
        assert_eq!(ArtifactKind::detect(&out), ArtifactKind::Image(ImageFormat::Png));
        assert_eq!(dimensions(&out).unwrap(), (100, 50));
    }

    #[test]
    fn test_normalize_keeps_small_images() {
        let out = normalize_image(&png(40, 30), 100).unwrap();
        assert_eq!(dimensions(&out).unwrap(), (40, 30));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(matches!(normalize_image(b"not an image", 100), Err(MediaError::Decode(_))));
    }

    #[test]
    fn test_refine_preserves_dimensions() {
        let out = refine_image(&png(32, 16)).unwrap();
        assert_eq!(dimensions(&out).unwrap(), (32, 16));
    }

    #[test]
    fn test_thumbnail_is_jpeg_within_bounds() {
        let out = thumbnail_jpeg(&png(1024, 512), THUMBNAIL_SIZE).unwrap();
        assert_eq!(ArtifactKind::detect(&out), ArtifactKind::Image(ImageFormat::Jpeg));
        let (w, h) = dimensions(&out).unwrap();
        assert!(w <= THUMBNAIL_SIZE && h <= THUMBNAIL_SIZE);
        assert_eq!(w, THUMBNAIL_SIZE);
    }

    #[test]
    fn test_thumbnail_of_non_image_fails() {
        assert!(matches!(
            thumbnail_jpeg(b"\x00\x00\x00\x18ftypmp42....", THUMBNAIL_SIZE),
            Err(MediaError::UnsupportedFormat(_))
        ));
    }
}
