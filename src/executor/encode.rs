//! Image preparation: `DynamicImage` → resized, compressed, base64 `ImageData`.
//!
//! ## Why two formats?
//! PNG is lossless and keeps small glyphs crisp, so it is used when the
//! settings disable compression. JPEG at `compression_quality` shrinks
//! requests several-fold for photos and scans where the source is already
//! lossy; large files get it by default.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Downscale so the longest edge is at most `max_edge`. Never upscales.
pub fn fit_to(img: DynamicImage, max_edge: u32) -> DynamicImage {
    if max_edge == 0 || img.width().max(img.height()) <= max_edge {
        return img;
    }
    img.resize(max_edge, max_edge, FilterType::Lanczos3)
}

/// Encode as base64 for a vision request. `jpeg_quality: None` means PNG.
pub fn encode_image(
    img: &DynamicImage,
    jpeg_quality: Option<u8>,
) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    let mime = match jpeg_quality {
        Some(q) => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, q.clamp(1, 100)))?;
            "image/jpeg"
        }
        None => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
            "image/png"
        }
    };

    let b64 = STANDARD.encode(&buf);
    debug!(mime, bytes = b64.len(), "Encoded image");
    Ok(ImageData::new(b64, mime).with_detail("high"))
}
