//! Document loading: media type detection and page image normalization.

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

use crate::config::RenderOptions;
use crate::error::PipelineError;
use crate::render;

/// Media types the loader accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Pdf,
    Png,
    Jpeg,
    Gif,
    Bmp,
    Webp,
    Tiff,
}

impl MediaType {
    pub const ALL: [MediaType; 7] = [
        Self::Pdf,
        Self::Png,
        Self::Jpeg,
        Self::Gif,
        Self::Bmp,
        Self::Webp,
        Self::Tiff,
    ];

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Webp => "image/webp",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        // Drop parameters such as "; charset=binary"
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" | "application/x-pdf" => Some(Self::Pdf),
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/bmp" | "image/x-bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/webp" => Some(Self::Webp),
            "image/tiff" | "image/tif" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            "webp" => Some(Self::Webp),
            "tif" | "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Gif => Some(Self::Gif),
            ImageFormat::Bmp => Some(Self::Bmp),
            ImageFormat::WebP => Some(Self::Webp),
            ImageFormat::Tiff => Some(Self::Tiff),
            _ => None,
        }
    }

    fn image_format(&self) -> Option<ImageFormat> {
        match self {
            Self::Pdf => None,
            Self::Png => Some(ImageFormat::Png),
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Gif => Some(ImageFormat::Gif),
            Self::Bmp => Some(ImageFormat::Bmp),
            Self::Webp => Some(ImageFormat::WebP),
            Self::Tiff => Some(ImageFormat::Tiff),
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, Self::Pdf)
    }

    /// Detect the media type of an upload.
    ///
    /// Magic bytes decide first. A recognisable but unsupported signature
    /// (video, audio, archives, other image formats) is rejected even if the
    /// declared type claims otherwise. Only when the bytes are inconclusive do
    /// the declared content type and then the file extension count.
    pub fn detect(
        bytes: &[u8],
        declared: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<Self, PipelineError> {
        match sniff(bytes) {
            Sniffed::Supported(media_type) => return Ok(media_type),
            Sniffed::Unsupported(what) => {
                return Err(PipelineError::UnsupportedMediaType(format!(
                    "file content looks like {}",
                    what
                )))
            }
            Sniffed::Unknown => {}
        }

        if let Some(media_type) = declared.and_then(Self::from_mime) {
            return Ok(media_type);
        }
        if let Some(media_type) = file_name.and_then(Self::from_file_name) {
            return Ok(media_type);
        }

        Err(PipelineError::UnsupportedMediaType(format!(
            "cannot determine a supported type (declared: {})",
            declared.unwrap_or("none")
        )))
    }
}

enum Sniffed {
    Supported(MediaType),
    Unsupported(&'static str),
    Unknown,
}

fn sniff(bytes: &[u8]) -> Sniffed {
    // Some producers put junk before the header; readers tolerate up to 1KB
    let head = &bytes[..bytes.len().min(1024)];
    if head.windows(5).any(|w| w == b"%PDF-") {
        return Sniffed::Supported(MediaType::Pdf);
    }

    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"avif" | b"avis" => Sniffed::Unsupported("an AVIF image"),
            b"heic" | b"heix" | b"mif1" => Sniffed::Unsupported("a HEIF image"),
            b"M4A " => Sniffed::Unsupported("audio (audio/mp4)"),
            b"qt  " => Sniffed::Unsupported("video (video/quicktime)"),
            _ => Sniffed::Unsupported("video (video/mp4)"),
        };
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Sniffed::Unsupported("video (video/webm or matroska)");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        match &bytes[8..12] {
            b"AVI " => return Sniffed::Unsupported("video (video/x-msvideo)"),
            b"WAVE" => return Sniffed::Unsupported("audio (audio/wav)"),
            _ => {}
        }
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(b"OggS") || bytes.starts_with(b"fLaC") {
        return Sniffed::Unsupported("audio");
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Sniffed::Unsupported("a zip archive");
    }

    match image::guess_format(bytes) {
        Ok(format) => match MediaType::from_image_format(format) {
            Some(media_type) => Sniffed::Supported(media_type),
            None => Sniffed::Unsupported("an unsupported image format"),
        },
        Err(_) => Sniffed::Unknown,
    }
}

/// One uploaded file, alive for a single request
pub struct Document {
    bytes: Vec<u8>,
    media_type: MediaType,
    pdf: Option<lopdf::Document>,
}

impl Document {
    pub fn new(
        bytes: Vec<u8>,
        declared: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::CorruptDocument("file is empty".to_string()));
        }

        let media_type = MediaType::detect(&bytes, declared, file_name)?;

        let pdf = if media_type.is_pdf() {
            let doc = lopdf::Document::load_mem(&bytes).map_err(|e| {
                PipelineError::CorruptDocument(format!("Failed to parse PDF: {}", e))
            })?;
            if doc.get_pages().is_empty() {
                return Err(PipelineError::CorruptDocument(
                    "PDF contains no pages".to_string(),
                ));
            }
            Some(doc)
        } else {
            None
        };

        Ok(Self {
            bytes,
            media_type,
            pdf,
        })
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn page_count(&self) -> usize {
        self.pdf.as_ref().map_or(1, |doc| doc.get_pages().len())
    }
}

/// A single rendered page, PNG encoded
#[derive(Debug, Clone)]
pub struct PageImage {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
    pub text_layer: Option<String>,
}

/// Turns documents into ordered page images
#[derive(Debug, Clone, Default)]
pub struct DocumentLoader {
    options: RenderOptions,
}

impl DocumentLoader {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Produce one page image per page, in page order
    pub fn load(&self, document: &Document) -> Result<Vec<PageImage>, PipelineError> {
        match (&document.pdf, document.media_type.image_format()) {
            (Some(pdf), _) => self.load_pdf(document, pdf),
            (None, Some(format)) => Ok(vec![self.load_image(&document.bytes, format)?]),
            (None, None) => Err(PipelineError::CorruptDocument(
                "PDF was not parsed".to_string(),
            )),
        }
    }

    fn load_image(&self, bytes: &[u8], format: ImageFormat) -> Result<PageImage, PipelineError> {
        let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
            PipelineError::CorruptDocument(format!("Failed to decode image: {}", e))
        })?;
        self.finish_page(0, image, None)
    }

    fn load_pdf(
        &self,
        document: &Document,
        pdf: &lopdf::Document,
    ) -> Result<Vec<PageImage>, PipelineError> {
        let rendered = render::render_pages(&document.bytes, pdf, &self.options)?;
        let mut text_layers = render::extract_text_layers(&document.bytes);
        if text_layers.len() != rendered.len() {
            if !text_layers.is_empty() {
                tracing::warn!(
                    "Text layer has {} pages but document has {}; ignoring it",
                    text_layers.len(),
                    rendered.len()
                );
            }
            text_layers = vec![None; rendered.len()];
        }

        rendered
            .into_iter()
            .zip(text_layers)
            .enumerate()
            .map(|(index, (image, text))| self.finish_page(index, image, text))
            .collect()
    }

    fn finish_page(
        &self,
        index: usize,
        image: DynamicImage,
        text_layer: Option<String>,
    ) -> Result<PageImage, PipelineError> {
        let image = constrain(image, self.options.max_image_edge);
        let (width, height) = image.dimensions();

        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| {
                PipelineError::CorruptDocument(format!("Failed to encode page {}: {}", index + 1, e))
            })?;

        tracing::debug!(
            "Page {} normalized to {}x{} ({} bytes PNG)",
            index + 1,
            width,
            height,
            png.len()
        );

        Ok(PageImage {
            index,
            width,
            height,
            png,
            text_layer,
        })
    }
}

/// Downscale so the longest edge fits `max_edge`, preserving aspect ratio
fn constrain(image: DynamicImage, max_edge: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= max_edge {
        return image;
    }

    let scale = max_edge as f32 / longest as f32;
    let new_width = ((width as f32 * scale).round() as u32).max(1);
    let new_height = ((height as f32 * scale).round() as u32).max(1);
    tracing::debug!(
        "Resizing {}x{} -> {}x{}",
        width,
        height,
        new_width,
        new_height
    );
    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn sample(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 10, 10])))
    }

    #[test]
    fn detects_by_magic_bytes_over_declared_type() {
        let png = encode(&sample(4, 4), ImageFormat::Png);
        let detected = MediaType::detect(&png, Some("image/jpeg"), Some("a.jpg")).unwrap();
        assert_eq!(detected, MediaType::Png);
    }

    #[test]
    fn detects_pdf_header() {
        assert_eq!(
            MediaType::detect(b"%PDF-1.7\n...", None, None).unwrap(),
            MediaType::Pdf
        );
    }

    #[test]
    fn rejects_video_even_when_declared_as_image() {
        let mut mp4 = vec![0, 0, 0, 0x18];
        mp4.extend_from_slice(b"ftypisom\0\0\x02\0");
        let err = MediaType::detect(&mp4, Some("image/png"), Some("clip.png")).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedMediaType(ref m) if m.contains("video")));
    }

    #[test]
    fn unknown_bytes_fall_back_to_declared_type() {
        assert_eq!(
            MediaType::detect(b"????", Some("image/png; q=1"), None).unwrap(),
            MediaType::Png
        );
        assert_eq!(
            MediaType::detect(b"????", None, Some("scan.TIFF")).unwrap(),
            MediaType::Tiff
        );
    }

    #[test]
    fn undeterminable_type_is_unsupported() {
        let err = MediaType::detect(b"hello", Some("text/plain"), Some("notes.txt")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedMediaType);
    }

    #[test]
    fn empty_upload_is_corrupt() {
        let err = Document::new(Vec::new(), Some("image/png"), None).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptDocument);
    }

    #[test]
    fn malformed_pdf_is_corrupt() {
        let err = Document::new(b"%PDF-1.4\nnot really".to_vec(), None, None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptDocument);
    }

    #[test]
    fn undecodable_image_is_corrupt() {
        let doc = Document::new(b"not an image".to_vec(), Some("image/png"), None).unwrap();
        let err = DocumentLoader::default().load(&doc).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptDocument);
    }

    #[test]
    fn each_image_format_yields_one_page() {
        for format in [
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Gif,
            ImageFormat::Bmp,
            ImageFormat::Tiff,
        ] {
            let bytes = encode(&sample(30, 20), format);
            let doc = Document::new(bytes, None, None).unwrap();
            assert_eq!(doc.page_count(), 1);
            let pages = DocumentLoader::default().load(&doc).unwrap();
            assert_eq!(pages.len(), 1, "format {:?}", format);
            assert_eq!(pages[0].index, 0);
            assert_eq!((pages[0].width, pages[0].height), (30, 20));
            assert!(pages[0].png.starts_with(&[0x89, b'P', b'N', b'G']));
            assert!(pages[0].text_layer.is_none());
        }
    }

    #[test]
    fn oversized_images_are_downscaled() {
        let bytes = encode(&sample(400, 100), ImageFormat::Png);
        let doc = Document::new(bytes, None, None).unwrap();
        let loader = DocumentLoader::new(RenderOptions {
            dpi: 150,
            max_image_edge: 200,
            ..RenderOptions::default()
        });
        let pages = loader.load(&doc).unwrap();
        assert_eq!((pages[0].width, pages[0].height), (200, 50));
    }

    #[test]
    fn pdf_pages_come_back_in_order() {
        let bytes = crate::render::fixtures::solid_color_pdf(&[[255, 0, 0], [0, 0, 255]]);
        let doc = Document::new(bytes, Some("application/octet-stream"), None).unwrap();
        assert_eq!(doc.media_type(), MediaType::Pdf);
        assert_eq!(doc.page_count(), 2);

        let pages = DocumentLoader::default().load(&doc).unwrap();
        assert_eq!(pages.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1]);
        let first = image::load_from_memory(&pages[0].png).unwrap().to_rgb8();
        let second = image::load_from_memory(&pages[1].png).unwrap().to_rgb8();
        assert_eq!(first.get_pixel(first.width() / 2, first.height() / 2).0, [255, 0, 0]);
        assert_eq!(second.get_pixel(second.width() / 2, second.height() / 2).0, [0, 0, 255]);
    }

    #[test]
    fn pdf_text_layer_is_kept_per_page() {
        let bytes = crate::render::fixtures::text_pdf(&["TOTAL 42.50", "Thank you"]);
        let doc = Document::new(bytes, Some("application/pdf"), Some("receipt.pdf")).unwrap();
        assert_eq!(doc.page_count(), 2);

        let pages = DocumentLoader::default().load(&doc).unwrap();
        assert_eq!(pages.len(), 2);
        let first = pages[0].text_layer.as_deref().unwrap_or("");
        let second = pages[1].text_layer.as_deref().unwrap_or("");
        assert!(first.contains("TOTAL 42.50"), "{:?}", first);
        assert!(second.contains("Thank you"), "{:?}", second);
        assert!(pages[0].png.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn mime_parsing() {
        assert_eq!(MediaType::from_mime("IMAGE/JPG"), Some(MediaType::Jpeg));
        assert_eq!(MediaType::from_mime("video/mp4"), None);
        assert_eq!(MediaType::from_file_name("noext"), None);
    }
}
