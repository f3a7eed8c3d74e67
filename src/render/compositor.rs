//! Built-in page compositor, used when pdfium cannot be loaded.
//!
//! Walks each page's content stream and paints image XObjects through the
//! current transformation matrix, follows form XObjects and fills
//! axis-aligned rectangles. Glyphs are not rasterized.

use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use super::MAX_CANVAS_EDGE;
use crate::error::PipelineError;

/// Letter size in points, used when a page has no usable MediaBox
const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

/// Nesting limit for form XObjects and reference chains
const MAX_DEPTH: usize = 8;

/// Affine transform `[a b c d e f]` as used by the `cm` operator
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    /// `self` applied first, then `outer`
    fn then(&self, outer: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [oa, ob, oc, od, oe, of] = outer.0;
        Matrix([
            a * oa + b * oc,
            a * ob + b * od,
            c * oa + d * oc,
            c * ob + d * od,
            e * oa + f * oc + oe,
            e * ob + f * od + of,
        ])
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }
}

#[derive(Debug, Clone, Copy)]
struct GraphicsState {
    ctm: Matrix,
    fill: Rgb<u8>,
}

/// Maps PDF user space onto canvas pixels (y axis flipped)
struct Canvas {
    image: RgbImage,
    origin_x: f32,
    top_y: f32,
    scale: f32,
}

impl Canvas {
    fn new(media_box: [f32; 4], dpi: u32) -> Self {
        let width_pt = (media_box[2] - media_box[0]).abs().max(1.0);
        let height_pt = (media_box[3] - media_box[1]).abs().max(1.0);

        let mut scale = dpi.max(1) as f32 / 72.0;
        let longest = width_pt.max(height_pt) * scale;
        if longest > MAX_CANVAS_EDGE {
            scale *= MAX_CANVAS_EDGE / longest;
        }

        let width = ((width_pt * scale).round() as u32).max(1);
        let height = ((height_pt * scale).round() as u32).max(1);

        Self {
            image: RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
            origin_x: media_box[0].min(media_box[2]),
            top_y: media_box[1].max(media_box[3]),
            scale,
        }
    }

    fn to_pixel(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.origin_x) * self.scale, (self.top_y - y) * self.scale)
    }

    /// Pixel bounding box of the unit square under `ctm`, clipped to the canvas
    fn unit_square_bounds(&self, ctm: &Matrix) -> Option<(i64, i64, u32, u32)> {
        let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
            .map(|(x, y)| self.to_pixel(ctm.apply(x, y)));
        self.bounds(&corners)
    }

    fn bounds(&self, points: &[(f32, f32)]) -> Option<(i64, i64, u32, u32)> {
        let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
        let max_x = points.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
        let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
        let max_y = points.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
        if !(min_x.is_finite() && max_x.is_finite() && min_y.is_finite() && max_y.is_finite()) {
            return None;
        }

        let width = (max_x - min_x).round();
        let height = (max_y - min_y).round();
        if width < 1.0 || height < 1.0 || width > MAX_CANVAS_EDGE * 2.0 || height > MAX_CANVAS_EDGE * 2.0 {
            return None;
        }
        Some((min_x.round() as i64, min_y.round() as i64, width as u32, height as u32))
    }

    fn draw_image(&mut self, image: &DynamicImage, ctm: &Matrix) {
        let Some((x, y, width, height)) = self.unit_square_bounds(ctm) else {
            return;
        };

        // Only the part of the placement that lands on the canvas gets scaled
        let left = x.max(0);
        let top = y.max(0);
        let right = (x + width as i64).min(self.image.width() as i64);
        let bottom = (y + height as i64).min(self.image.height() as i64);
        if right <= left || bottom <= top {
            return;
        }

        let mut source = image.to_rgb8();
        // Negative scale factors mirror the image in device space
        let [a, _, _, d, _, _] = ctm.0;
        if a < 0.0 {
            imageops::flip_horizontal_in_place(&mut source);
        }
        if d < 0.0 {
            imageops::flip_vertical_in_place(&mut source);
        }

        let (source_width, source_height) = source.dimensions();
        let (crop_x, crop_width) = visible_span(left - x, right - x, width, source_width);
        let (crop_y, crop_height) = visible_span(top - y, bottom - y, height, source_height);
        let visible = imageops::crop_imm(&source, crop_x, crop_y, crop_width, crop_height).to_image();
        let placed = imageops::resize(
            &visible,
            (right - left) as u32,
            (bottom - top) as u32,
            FilterType::Triangle,
        );
        imageops::overlay(&mut self.image, &placed, left, top);
    }

    fn fill_rect(&mut self, rect: [f32; 4], ctm: &Matrix, color: Rgb<u8>) {
        let [x, y, w, h] = rect;
        let corners = [(x, y), (x + w, y), (x, y + h), (x + w, y + h)]
            .map(|(px, py)| self.to_pixel(ctm.apply(px, py)));
        let Some((left, top, width, height)) = self.bounds(&corners) else {
            return;
        };

        let x0 = left.clamp(0, self.image.width() as i64) as u32;
        let y0 = top.clamp(0, self.image.height() as i64) as u32;
        let x1 = (left + width as i64).clamp(0, self.image.width() as i64) as u32;
        let y1 = (top + height as i64).clamp(0, self.image.height() as i64) as u32;
        for py in y0..y1 {
            for px in x0..x1 {
                self.image.put_pixel(px, py, color);
            }
        }
    }
}

/// Source pixels behind placed pixels `start..end` of a `placed`-wide placement
fn visible_span(start: i64, end: i64, placed: u32, source: u32) -> (u32, u32) {
    let scale = source as f64 / placed.max(1) as f64;
    let first = ((start as f64 * scale).floor() as u32).min(source.saturating_sub(1));
    let last = ((end as f64 * scale).ceil() as u32).clamp(first + 1, source.max(first + 1));
    (first, last - first)
}

/// Render every page of `doc`, in page order
pub(super) fn render_pages(doc: &Document, dpi: u32) -> Result<Vec<DynamicImage>, PipelineError> {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err(PipelineError::CorruptDocument(
            "PDF contains no pages".to_string(),
        ));
    }

    pages
        .into_iter()
        .map(|(number, page_id)| {
            render_page(doc, page_id, dpi).map_err(|e| {
                PipelineError::CorruptDocument(format!("Failed to render page {}: {}", number, e))
            })
        })
        .collect()
}

fn render_page(doc: &Document, page_id: ObjectId, dpi: u32) -> Result<DynamicImage, String> {
    let page = doc
        .get_dictionary(page_id)
        .map_err(|e| format!("page object: {}", e))?;
    let media_box = inherited(doc, page, b"MediaBox")
        .and_then(|obj| rect_of(doc, obj))
        .unwrap_or(DEFAULT_MEDIA_BOX);

    let mut canvas = Canvas::new(media_box, dpi);

    let content = doc
        .get_page_content(page_id)
        .map_err(|e| format!("content stream: {}", e))?;
    let resources = inherited(doc, page, b"Resources").and_then(|obj| as_dict(doc, obj));

    paint(doc, &content, resources, Matrix::IDENTITY, &mut canvas, 0)?;

    tracing::debug!(
        "Rendered page {:?} at {}x{}",
        page_id,
        canvas.image.width(),
        canvas.image.height()
    );
    Ok(DynamicImage::ImageRgb8(canvas.image))
}

fn paint(
    doc: &Document,
    content: &[u8],
    resources: Option<&Dictionary>,
    base: Matrix,
    canvas: &mut Canvas,
    depth: usize,
) -> Result<(), String> {
    let content = Content::decode(content).map_err(|e| format!("cannot decode operators: {}", e))?;

    let mut state = GraphicsState {
        ctm: base,
        fill: Rgb([0, 0, 0]),
    };
    let mut stack = Vec::new();
    let mut pending_rects: Vec<[f32; 4]> = Vec::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "q" => stack.push(state),
            "Q" => {
                if let Some(saved) = stack.pop() {
                    state = saved;
                }
            }
            "cm" => {
                if let Some(m) = numbers::<6>(&op.operands) {
                    state.ctm = Matrix(m).then(&state.ctm);
                }
            }
            "g" => {
                if let Some([gray]) = numbers::<1>(&op.operands) {
                    state.fill = Rgb([channel(gray); 3]);
                }
            }
            "rg" => {
                if let Some([r, g, b]) = numbers::<3>(&op.operands) {
                    state.fill = Rgb([channel(r), channel(g), channel(b)]);
                }
            }
            "k" => {
                if let Some([c, m, y, k]) = numbers::<4>(&op.operands) {
                    state.fill = Rgb([
                        channel((1.0 - c) * (1.0 - k)),
                        channel((1.0 - m) * (1.0 - k)),
                        channel((1.0 - y) * (1.0 - k)),
                    ]);
                }
            }
            "re" => {
                if let Some(rect) = numbers::<4>(&op.operands) {
                    pending_rects.push(rect);
                }
            }
            "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => {
                for rect in pending_rects.drain(..) {
                    canvas.fill_rect(rect, &state.ctm, state.fill);
                }
            }
            // Strokes and clipping-only paths end the path without a fill
            "n" | "S" | "s" => pending_rects.clear(),
            "Do" => {
                let Some(name) = op.operands.first().and_then(|o| o.as_name().ok()) else {
                    continue;
                };
                draw_xobject(doc, resources, name, &state, canvas, depth);
            }
            _ => {}
        }
    }

    Ok(())
}

fn draw_xobject(
    doc: &Document,
    resources: Option<&Dictionary>,
    name: &[u8],
    state: &GraphicsState,
    canvas: &mut Canvas,
    depth: usize,
) {
    let label = String::from_utf8_lossy(name);
    let Some(stream) = resources
        .and_then(|res| res.get(b"XObject").ok())
        .and_then(|obj| as_dict(doc, obj))
        .and_then(|xobjects| xobjects.get(name).ok())
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_stream().ok())
    else {
        tracing::warn!("XObject /{} not found in page resources", label);
        return;
    };

    let subtype = stream.dict.get(b"Subtype").and_then(|s| s.as_name()).unwrap_or(b"");
    match subtype {
        b"Image" => match decode_image(doc, stream) {
            Ok(image) => canvas.draw_image(&image, &state.ctm),
            Err(e) => tracing::warn!("Skipping image /{}: {}", label, e),
        },
        b"Form" => {
            if depth >= MAX_DEPTH {
                tracing::warn!("Form XObject /{} nested too deeply", label);
                return;
            }
            let matrix = stream
                .dict
                .get(b"Matrix")
                .ok()
                .and_then(|m| resolve(doc, m))
                .and_then(|m| m.as_array().ok())
                .and_then(|m| numbers::<6>(m))
                .map(Matrix)
                .unwrap_or(Matrix::IDENTITY);
            let form_resources = stream
                .dict
                .get(b"Resources")
                .ok()
                .and_then(|obj| as_dict(doc, obj))
                .or(resources);
            let body = match stream_bytes(stream) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("Skipping form /{}: {}", label, e);
                    return;
                }
            };
            if let Err(e) = paint(
                doc,
                &body,
                form_resources,
                matrix.then(&state.ctm),
                canvas,
                depth + 1,
            ) {
                tracing::warn!("Skipping form /{}: {}", label, e);
            }
        }
        other => tracing::debug!(
            "Ignoring XObject /{} with subtype {}",
            label,
            String::from_utf8_lossy(other)
        ),
    }
}

/// Decode an image XObject into pixels
fn decode_image(doc: &Document, stream: &Stream) -> Result<DynamicImage, String> {
    if matches!(stream.dict.get(b"ImageMask").and_then(|o| o.as_bool()), Ok(true)) {
        return Err("stencil masks are not painted".to_string());
    }

    let filters = filter_names(stream);
    if filters.iter().any(|f| f == b"DCTDecode") {
        return image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg)
            .map_err(|e| format!("JPEG data: {}", e));
    }
    if filters.iter().any(|f| f == b"JPXDecode" || f == b"JBIG2Decode") {
        return Err("JPEG 2000 and JBIG2 images are not supported".to_string());
    }

    let width = dimension(doc, &stream.dict, b"Width")?;
    let height = dimension(doc, &stream.dict, b"Height")?;
    let bits = integer(doc, &stream.dict, b"BitsPerComponent").unwrap_or(8);
    let data = stream_bytes(stream)?;
    let components = color_components(doc, stream);

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| format!("image of {}x{} is too large", width, height))?;
    let rgb_len = pixels.checked_mul(3).unwrap_or(usize::MAX);
    let cmyk_len = pixels.checked_mul(4).unwrap_or(usize::MAX);
    match (components, bits) {
        (1, 8) if data.len() >= pixels => image::GrayImage::from_raw(width, height, data[..pixels].to_vec())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| "invalid grayscale image data".to_string()),
        (1, 1) => {
            let row_bytes = (width as usize).div_ceil(8);
            let needed = row_bytes.checked_mul(height as usize).unwrap_or(usize::MAX);
            if data.len() < needed {
                return Err(format!("1-bit image too short: {} bytes", data.len()));
            }
            let gray = image::GrayImage::from_fn(width, height, |x, y| {
                let byte = data[y as usize * row_bytes + x as usize / 8];
                let bit = (byte >> (7 - (x % 8))) & 1;
                image::Luma([if bit == 1 { 255 } else { 0 }])
            });
            Ok(DynamicImage::ImageLuma8(gray))
        }
        (3, 8) if data.len() >= rgb_len => {
            image::RgbImage::from_raw(width, height, data[..rgb_len].to_vec())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| "invalid RGB image data".to_string())
        }
        (4, 8) if data.len() >= cmyk_len => {
            let rgb: Vec<u8> = data[..cmyk_len]
                .chunks_exact(4)
                .flat_map(|px| {
                    let k = px[3] as f32 / 255.0;
                    [0, 1, 2].map(|i| channel((1.0 - px[i] as f32 / 255.0) * (1.0 - k)))
                })
                .collect();
            image::RgbImage::from_raw(width, height, rgb)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| "invalid CMYK image data".to_string())
        }
        (n, b) => Err(format!(
            "unsupported layout: {} components at {} bits, {} bytes for {}x{}",
            n,
            b,
            data.len(),
            width,
            height
        )),
    }
}

/// Number of color components, resolving ICCBased profiles through their /N
fn color_components(doc: &Document, stream: &Stream) -> usize {
    let Some(space) = stream.dict.get(b"ColorSpace").ok().and_then(|cs| resolve(doc, cs)) else {
        return 3;
    };

    if let Ok(name) = space.as_name() {
        return components_for_name(name);
    }

    if let Ok(array) = space.as_array() {
        let family = array.first().and_then(|f| f.as_name().ok()).unwrap_or(b"");
        if family == b"ICCBased" {
            return array
                .get(1)
                .and_then(|profile| resolve(doc, profile))
                .and_then(|profile| profile.as_stream().ok())
                .and_then(|profile| integer(doc, &profile.dict, b"N"))
                .map(|n| n as usize)
                .unwrap_or(3);
        }
        // Indexed and friends carry a lookup table we do not expand
        if family == b"Indexed" || family == b"I" {
            return 0;
        }
        return components_for_name(family);
    }

    3
}

fn components_for_name(name: &[u8]) -> usize {
    match name {
        b"DeviceGray" | b"G" | b"CalGray" => 1,
        b"DeviceCMYK" | b"CMYK" => 4,
        _ => 3,
    }
}

fn filter_names(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(|n| n.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

fn stream_bytes(stream: &Stream) -> Result<Vec<u8>, String> {
    if filter_names(stream).is_empty() {
        return Ok(stream.content.clone());
    }
    stream
        .decompressed_content()
        .map_err(|e| format!("cannot decompress stream: {}", e))
}

/// Follow indirect references to the underlying object
fn resolve<'a>(doc: &'a Document, mut object: &'a Object) -> Option<&'a Object> {
    for _ in 0..MAX_DEPTH {
        match object {
            Object::Reference(id) => object = doc.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

fn as_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    resolve(doc, object)?.as_dict().ok()
}

/// Look up a page attribute, walking the page tree for inherited values
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut node = page;
    for _ in 0..MAX_DEPTH * 4 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        node = node.get(b"Parent").ok().and_then(|p| as_dict(doc, p))?;
    }
    None
}

fn rect_of(doc: &Document, object: &Object) -> Option<[f32; 4]> {
    let array = resolve(doc, object)?.as_array().ok()?;
    let items: Vec<Object> = array
        .iter()
        .filter_map(|o| resolve(doc, o).cloned())
        .collect();
    numbers::<4>(&items)
}

/// Image width or height; must be a positive integer
fn dimension(doc: &Document, dict: &Dictionary, key: &[u8]) -> Result<u32, String> {
    let label = String::from_utf8_lossy(key);
    let value = integer(doc, dict, key).ok_or_else(|| format!("missing image {}", label))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("invalid image {} {}", label, value))
}

fn integer(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<i64> {
    let value = resolve(doc, dict.get(key).ok()?)?;
    match value {
        Object::Integer(i) => Some(*i),
        Object::Real(r) => Some(*r as i64),
        _ => None,
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn numbers<const N: usize>(operands: &[Object]) -> Option<[f32; N]> {
    if operands.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, operand) in out.iter_mut().zip(operands) {
        *slot = number(operand)?;
    }
    Some(out)
}

fn channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
