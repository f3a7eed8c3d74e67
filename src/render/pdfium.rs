//! pdfium-backed page rendering.
//!
//! The library is bound for the duration of one document and released
//! afterwards. pdfium keeps process-wide state between init and destroy, so
//! documents are rendered one at a time.

use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::MAX_CANVAS_EDGE;
use crate::error::PipelineError;

static PDFIUM: Mutex<()> = Mutex::new(());

/// Resolve a configured location to a library file
fn library_file(location: &Path) -> PathBuf {
    if location.is_dir() {
        location.join(format!(
            "{}pdfium{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        ))
    } else {
        location.to_path_buf()
    }
}

fn bind(library: Option<&Path>) -> Result<Pdfium, PdfiumError> {
    let bindings = match library {
        Some(location) => Pdfium::bind_to_library(library_file(location))?,
        None => Pdfium::bind_to_system_library()?,
    };
    Ok(Pdfium::new(bindings))
}

/// Check that the library can be bound
pub(super) fn check(library: Option<&Path>) -> Result<(), String> {
    let _guard = PDFIUM.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    bind(library).map(drop).map_err(|e| e.to_string())
}

/// Render all pages at `dpi`.
///
/// Returns `None` when pdfium cannot be bound, leaving the choice of another
/// renderer to the caller.
pub(super) fn render_pages(
    library: Option<&Path>,
    bytes: &[u8],
    dpi: u32,
) -> Option<Result<Vec<DynamicImage>, PipelineError>> {
    let _guard = PDFIUM.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let pdfium = match bind(library) {
        Ok(pdfium) => pdfium,
        Err(e) => {
            tracing::debug!("pdfium not bound: {}", e);
            return None;
        }
    };
    Some(render_with(&pdfium, bytes, dpi))
}

fn render_with(
    pdfium: &Pdfium,
    bytes: &[u8],
    dpi: u32,
) -> Result<Vec<DynamicImage>, PipelineError> {
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| PipelineError::CorruptDocument(format!("Failed to open PDF: {}", e)))?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi.max(1) as f32 / 72.0)
        .set_maximum_width(MAX_CANVAS_EDGE as i32)
        .set_maximum_height(MAX_CANVAS_EDGE as i32);

    let mut images = Vec::new();
    for (index, page) in document.pages().iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            PipelineError::CorruptDocument(format!("Failed to render page {}: {}", index + 1, e))
        })?;
        let image = bitmap.as_image();
        tracing::debug!(
            "Rendered page {} -> {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    if images.is_empty() {
        return Err(PipelineError::CorruptDocument(
            "PDF contains no pages".to_string(),
        ));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_resolves_to_platform_library_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = library_file(dir.path());
        assert_eq!(file.parent(), Some(dir.path()));
        assert!(file
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("pdfium")));
    }

    #[test]
    fn missing_library_is_not_bound() {
        assert!(check(Some(Path::new("/nonexistent/libpdfium.so"))).is_err());
        assert!(render_pages(Some(Path::new("/nonexistent/libpdfium.so")), b"%PDF-1.4", 72).is_none());
    }
}
