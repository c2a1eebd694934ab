//! Page sources: rasterise PDFs via pdfium, decode image files.
//!
//! ## Why spawn_blocking?
//! pdfium is a C++ library with thread-local state, and both rasterising and
//! image decoding are CPU-bound. Running them on the blocking pool keeps the
//! Tokio workers free to drive other tasks' network calls.
//!
//! ## Binding
//! The library is located through `PDFIUM_LIB_PATH` (a file, or a directory
//! holding the platform library) or else the system loader path. A missing
//! library is reported as `Unavailable`: no retry can make it appear.

use crate::error::ExecutorError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// PDF user space is 72 points per inch.
const POINTS_PER_SQ_IN: f64 = 72.0 * 72.0;

/// One page ready for encoding.
pub struct PageImage {
    /// 0-based page index.
    pub index: usize,
    pub image: DynamicImage,
    /// Embedded text layer, when requested and present.
    pub text_layer: Option<String>,
}

/// All pages of a document plus their combined physical area.
pub struct RenderedDocument {
    pub pages: Vec<PageImage>,
    pub page_area_sq_in: Option<f64>,
}

fn bind_pdfium() -> Result<Pdfium, ExecutorError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if Path::new(&p).is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&p))
        }
        Ok(p) => Pdfium::bind_to_library(&p),
        Err(_) => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| ExecutorError::Unavailable(format!("pdfium library could not be loaded: {e:?}")))?;
    Ok(Pdfium::new(bindings))
}

/// Rasterise every page so its longest edge is at most `max_pixels`.
pub async fn render_pdf(
    bytes: std::sync::Arc<[u8]>,
    max_pixels: u32,
    with_text_layer: bool,
) -> Result<RenderedDocument, ExecutorError> {
    tokio::task::spawn_blocking(move || render_pdf_blocking(&bytes, max_pixels, with_text_layer))
        .await
        .map_err(|e| ExecutorError::Transport(format!("render task panicked: {e}")))?
}

fn render_pdf_blocking(
    bytes: &[u8],
    max_pixels: u32,
    with_text_layer: bool,
) -> Result<RenderedDocument, ExecutorError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| ExecutorError::Unsupported(format!("unreadable or encrypted PDF: {e:?}")))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let pages = document.pages();
    let total = pages.len() as usize;
    info!(pages = total, "PDF loaded");

    let mut out = Vec::with_capacity(total);
    let mut area = 0.0;
    for (index, page) in pages.iter().enumerate() {
        area += page.width().value as f64 * page.height().value as f64 / POINTS_PER_SQ_IN;

        let text_layer = if with_text_layer {
            page.text().ok().map(|t| t.all()).filter(|t| !t.trim().is_empty())
        } else {
            None
        };

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExecutorError::Unsupported(format!("page {} could not be rasterised: {e:?}", index + 1))
        })?;
        let image = bitmap.as_image();
        debug!(page = index + 1, width = image.width(), height = image.height(), "Rendered page");

        out.push(PageImage {
            index,
            image,
            text_layer,
        });
    }

    Ok(RenderedDocument {
        pages: out,
        page_area_sq_in: (area > 0.0).then_some(area),
    })
}

/// Pages sampled when deciding whether a PDF carries a usable text layer.
const TEXT_SAMPLE_PAGES: usize = 3;
/// Non-whitespace characters the sampled pages must hold together.
const MIN_TEXT_LAYER_CHARS: usize = 100;

/// A PDF's embedded text, one entry per page.
pub struct TextLayer {
    pub pages: Vec<String>,
    pub page_area_sq_in: Option<f64>,
}

/// Whether the leading pages hold enough embedded text to skip the model.
pub fn is_text_based(pages: &[String]) -> bool {
    pages
        .iter()
        .take(TEXT_SAMPLE_PAGES)
        .map(|p| p.chars().filter(|c| !c.is_whitespace()).count())
        .sum::<usize>()
        > MIN_TEXT_LAYER_CHARS
}

/// The text layer of a text-based PDF, or `None` for scanned documents.
pub async fn extract_text_layer(bytes: std::sync::Arc<[u8]>) -> Result<Option<TextLayer>, ExecutorError> {
    tokio::task::spawn_blocking(move || extract_text_layer_blocking(&bytes))
        .await
        .map_err(|e| ExecutorError::Transport(format!("text extraction task panicked: {e}")))?
}

fn extract_text_layer_blocking(bytes: &[u8]) -> Result<Option<TextLayer>, ExecutorError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| ExecutorError::Unsupported(format!("unreadable or encrypted PDF: {e:?}")))?;

    let mut pages = Vec::new();
    let mut area = 0.0;
    for page in document.pages().iter() {
        area += page.width().value as f64 * page.height().value as f64 / POINTS_PER_SQ_IN;
        pages.push(page.text().map(|t| t.all()).unwrap_or_default());
        if pages.len() == TEXT_SAMPLE_PAGES && !is_text_based(&pages) {
            return Ok(None);
        }
    }
    if !is_text_based(&pages) {
        return Ok(None);
    }
    debug!(pages = pages.len(), "PDF has a usable text layer");
    Ok(Some(TextLayer {
        pages,
        page_area_sq_in: (area > 0.0).then_some(area),
    }))
}

/// Decode an image file into a single page.
pub async fn decode_image(bytes: std::sync::Arc<[u8]>) -> Result<RenderedDocument, ExecutorError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|image| RenderedDocument {
                pages: vec![PageImage {
                    index: 0,
                    image,
                    text_layer: None,
                }],
                page_area_sq_in: None,
            })
            .map_err(|e| ExecutorError::Unsupported(format!("image could not be decoded: {e}")))
    })
    .await
    .map_err(|e| ExecutorError::Transport(format!("decode task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_layer_needs_substance_in_leading_pages() {
        let sentence = "Attention is all you need for sequence transduction. ".repeat(3);
        assert!(is_text_based(&[sentence.clone()]));
        assert!(!is_text_based(&["   \n".to_string(), "Page 2".to_string()]));

        // Text that only appears after the sampled pages does not count.
        let late = vec![String::new(), String::new(), String::new(), sentence];
        assert!(!is_text_based(&late));
    }

    #[tokio::test]
    async fn undecodable_image_is_unsupported() {
        let err = decode_image(std::sync::Arc::from(&b"not an image"[..]))
            .await
            .err()
            .expect("decode must fail");
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn decodes_png() {
        let img = DynamicImage::new_rgb8(8, 4);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let doc = decode_image(buf.into()).await.unwrap();
        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].image.width(), 8);
    }
}
