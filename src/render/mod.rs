//! PDF page rasterization
//!
//! Pages are rendered by pdfium when the shared library can be bound. A
//! deployment without it falls back to the built-in compositor, which paints
//! scanned content but no glyphs. The embedded text layer from `pdf-extract`
//! travels alongside each page in both cases.

mod compositor;
mod pdfium;

use image::DynamicImage;
use serde::Serialize;
use std::path::Path;

use crate::config::RenderOptions;
use crate::error::PipelineError;

/// Upper bound for either side of a rendered page, in pixels
const MAX_CANVAS_EDGE: f32 = 8192.0;

/// Which renderer PDF pages go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rasterizer {
    Pdfium,
    Builtin,
}

impl Rasterizer {
    /// Find out whether pdfium can be bound
    pub fn detect(library: Option<&Path>) -> Self {
        match pdfium::check(library) {
            Ok(()) => Self::Pdfium,
            Err(reason) => {
                tracing::warn!(
                    "pdfium unavailable ({}); PDF pages will be composited without text glyphs",
                    reason
                );
                Self::Builtin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdfium => "pdfium",
            Self::Builtin => "builtin",
        }
    }
}

/// Render every page of a PDF, in page order
pub fn render_pages(
    bytes: &[u8],
    doc: &lopdf::Document,
    options: &RenderOptions,
) -> Result<Vec<DynamicImage>, PipelineError> {
    match pdfium::render_pages(options.pdfium_library.as_deref(), bytes, options.dpi) {
        Some(rendered) => rendered,
        None => compositor::render_pages(doc, options.dpi),
    }
}

/// Per-page embedded text, when the PDF carries a text layer.
///
/// Returns an empty vector when extraction fails. `pdf-extract` can panic on
/// malformed font programs, so the call is isolated.
pub fn extract_text_layers(bytes: &[u8]) -> Vec<Option<String>> {
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes));
    match result {
        Ok(Ok(pages)) => pages
            .into_iter()
            .map(|text| {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .collect(),
        Ok(Err(e)) => {
            tracing::debug!("No text layer: {}", e);
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("Text layer extraction panicked; continuing without it");
            Vec::new()
        }
    }
}
