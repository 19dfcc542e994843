//! Thumbnail derivation and upload normalisation.

use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Long-side bound for derived thumbnails.
const THUMB_MAX_SIDE: u32 = 384;

/// Derive a thumbnail next to the stored image.
///
/// Prefers WEBP; falls back to JPEG when the WEBP encode fails. Returns
/// the written path, or `None` when the source cannot be decoded or
/// nothing could be written — thumbnails are always best-effort.
pub(crate) fn write_thumbnail(
    image_bytes: &[u8],
    thumb_dir: &Path,
    base_name: &str,
) -> Option<PathBuf> {
    let decoded = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(err) => {
            tracing::debug!(error = %err, "thumbnail source undecodable");
            return None;
        }
    };
    let thumb = decoded.thumbnail(THUMB_MAX_SIDE, THUMB_MAX_SIDE).to_rgb8();

    let webp_path = thumb_dir.join(format!("{base_name}.webp"));
    let mut webp_buf = Cursor::new(Vec::new());
    if image::DynamicImage::ImageRgb8(thumb.clone())
        .write_to(&mut webp_buf, ImageFormat::WebP)
        .is_ok()
        && std::fs::write(&webp_path, webp_buf.into_inner()).is_ok()
    {
        return Some(webp_path);
    }

    let jpg_path = thumb_dir.join(format!("{base_name}.jpg"));
    let mut jpg_buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpg_buf, 80);
    if thumb.write_with_encoder(encoder).is_ok() && std::fs::write(&jpg_path, jpg_buf).is_ok() {
        return Some(jpg_path);
    }
    tracing::debug!(base_name = %base_name, "thumbnail encode failed");
    None
}

/// Re-encode an uploaded image as PNG.
///
/// PNG input is passed through untouched; JPEG/WEBP are decoded and
/// re-encoded. Errors mean the upload is not a decodable image.
pub fn normalize_to_png(bytes: &[u8], original_name: &str) -> Result<Vec<u8>, String> {
    if original_name.to_ascii_lowercase().ends_with(".png") {
        return Ok(bytes.to_vec());
    }
    let decoded = image::load_from_memory(bytes).map_err(|err| err.to_string())?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .to_rgb8()
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| err.to_string())?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([120, 40, 200]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .expect("encode fixture");
        buf.into_inner()
    }

    #[test]
    fn test_thumbnail_written_and_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bytes = png_fixture(800, 400);
        let path = write_thumbnail(&bytes, dir.path(), "abc").expect("thumbnail");
        assert!(path.exists());
        let thumb = image::open(&path).expect("decodable thumb");
        assert!(thumb.width() <= THUMB_MAX_SIDE);
        assert!(thumb.height() <= THUMB_MAX_SIDE);
    }

    #[test]
    fn test_thumbnail_garbage_input_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(write_thumbnail(b"not an image", dir.path(), "abc").is_none());
    }

    #[test]
    fn test_normalize_png_passthrough() {
        let bytes = png_fixture(10, 10);
        let out = normalize_to_png(&bytes, "a.png").expect("passthrough");
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_normalize_jpeg_to_png() {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([5, 5, 5]));
        let mut jpg = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut jpg, 90);
        img.write_with_encoder(encoder).expect("jpeg fixture");
        let out = normalize_to_png(&jpg, "photo.jpg").expect("converted");
        assert!(image::guess_format(&out).is_ok_and(|f| f == ImageFormat::Png));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_to_png(b"nope", "x.jpg").is_err());
    }
}
