//! Container decoding for text, image, and PDF documents.
//!
//! Extraction sits between validation and chunking: it turns raw bytes into
//! the text and encoded images the chunker windows and wraps. Whole-container
//! failures are [`ValidationError::CorruptDocument`]; per-page and per-image
//! failures inside a PDF become [`ExtractionWarning`]s collected next to the
//! pages that did decode, so one bad image never costs a page its text.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Object, ObjectId, Stream};

use mmrag_core::error::{ExtractionWarning, ValidationError, WarningStage};

pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";

/// Parent links followed when looking for inherited page resources.
const MAX_RESOURCE_DEPTH: usize = 32;

/// An image ready to be stored and embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
    /// Images that decoded, with their 1-based index on the page.
    pub images: Vec<(u32, PreparedImage)>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedPdf {
    pub page_count: u32,
    pub pages: Vec<ExtractedPage>,
    pub warnings: Vec<ExtractionWarning>,
}

/// Decode a text document. A leading UTF-8 BOM is dropped.
///
/// Byte sequences that are not valid UTF-8 are skipped; when any were, the
/// returned warning says how many bytes were lost.
pub fn decode_text(bytes: &[u8]) -> (String, Option<ExtractionWarning>) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut text = String::with_capacity(bytes.len());
    let mut skipped = 0usize;
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
        skipped += chunk.invalid().len();
    }
    let warning = (skipped > 0).then(|| {
        ExtractionWarning::new(
            WarningStage::TextExtraction,
            format!("skipped {} bytes that are not valid UTF-8", skipped),
        )
    });
    (text, warning)
}

/// Validate an image and put it in a transportable encoding.
///
/// PNG and JPEG pass through unchanged; every other decodable format is
/// re-encoded as PNG.
pub fn prepare_image(bytes: &[u8]) -> Result<PreparedImage, ValidationError> {
    let format = image::guess_format(bytes)
        .map_err(|e| ValidationError::CorruptDocument(format!("unrecognized image: {}", e)))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ValidationError::CorruptDocument(format!("image does not decode: {}", e)))?;

    match format {
        ImageFormat::Png => Ok(PreparedImage {
            bytes: bytes.to_vec(),
            mime: MIME_PNG,
        }),
        ImageFormat::Jpeg => Ok(PreparedImage {
            bytes: bytes.to_vec(),
            mime: MIME_JPEG,
        }),
        _ => encode_png(&decoded).map_err(ValidationError::CorruptDocument),
    }
}

fn encode_png(image: &DynamicImage) -> Result<PreparedImage, String> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| format!("PNG encoding failed: {}", e))?;
    Ok(PreparedImage {
        bytes: out.into_inner(),
        mime: MIME_PNG,
    })
}

/// Extract text and images page by page.
///
/// Only an unparseable container is an error. Text and image extraction on
/// each page are attempted independently and every failure is recorded as a
/// warning.
pub fn extract_pdf(bytes: &[u8]) -> Result<ExtractedPdf, ValidationError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ValidationError::CorruptDocument(format!("PDF does not parse: {}", e)))?;

    let pages = doc.get_pages();
    let mut out = ExtractedPdf {
        page_count: pages.len() as u32,
        ..ExtractedPdf::default()
    };

    for (&number, &page_id) in &pages {
        let mut page = ExtractedPage {
            number,
            ..ExtractedPage::default()
        };

        match doc.extract_text(&[number]) {
            Ok(text) => page.text = text,
            Err(e) => out.warnings.push(
                ExtractionWarning::new(WarningStage::TextExtraction, e.to_string()).on_page(number),
            ),
        }

        match page_image_streams(&doc, page_id) {
            Ok(streams) => {
                for (i, stream) in streams.into_iter().enumerate() {
                    let index = i as u32 + 1;
                    match decode_pdf_image(stream) {
                        Ok(image) => page.images.push((index, image)),
                        Err(message) => out.warnings.push(
                            ExtractionWarning::new(WarningStage::ImageExtraction, message)
                                .on_page(number)
                                .item(index),
                        ),
                    }
                }
            }
            Err(message) => out.warnings.push(
                ExtractionWarning::new(WarningStage::ImageExtraction, message).on_page(number),
            ),
        }

        out.pages.push(page);
    }

    Ok(out)
}

/// Image XObjects reachable from a page, in resource dictionary order.
/// Resources are inherited from ancestor page-tree nodes when the page has
/// none of its own.
fn page_image_streams(doc: &lopdf::Document, page_id: ObjectId) -> Result<Vec<&Stream>, String> {
    let mut node = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(|e| format!("page object unreadable: {}", e))?;

    for _ in 0..MAX_RESOURCE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            let resources = resolve(doc, resources)?
                .as_dict()
                .map_err(|e| format!("resources are not a dictionary: {}", e))?;
            let Ok(xobjects) = resources.get(b"XObject") else {
                return Ok(Vec::new());
            };
            let xobjects = resolve(doc, xobjects)?
                .as_dict()
                .map_err(|e| format!("XObject entry is not a dictionary: {}", e))?;

            let mut images = Vec::new();
            for (_, obj) in xobjects.iter() {
                let Ok(stream) = resolve(doc, obj)?.as_stream() else {
                    continue;
                };
                let is_image = stream
                    .dict
                    .get(b"Subtype")
                    .and_then(Object::as_name)
                    .is_ok_and(|name| name == b"Image");
                if is_image {
                    images.push(stream);
                }
            }
            return Ok(images);
        }

        let Ok(parent) = node.get(b"Parent").and_then(Object::as_reference) else {
            return Ok(Vec::new());
        };
        node = doc
            .get_object(parent)
            .and_then(Object::as_dict)
            .map_err(|e| format!("page tree node unreadable: {}", e))?;
    }
    Ok(Vec::new())
}

fn resolve<'a>(doc: &'a lopdf::Document, obj: &'a Object) -> Result<&'a Object, String> {
    doc.dereference(obj)
        .map(|(_, o)| o)
        .map_err(|e| format!("broken object reference: {}", e))
}

/// Names of the stream's filters, outermost first.
fn filter_names(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_pdf_image(stream: &Stream) -> Result<PreparedImage, String> {
    let filters = filter_names(stream);

    if filters.last().is_some_and(|f| f == b"DCTDecode") {
        if filters.len() > 1 {
            return Err("chained filters before DCTDecode are not supported".to_string());
        }
        image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map_err(|e| format!("embedded JPEG does not decode: {}", e))?;
        return Ok(PreparedImage {
            bytes: stream.content.clone(),
            mime: MIME_JPEG,
        });
    }

    let raw = match filters.as_slice() {
        [] => stream.content.clone(),
        [f] if f == b"FlateDecode" => stream
            .decompressed_content()
            .map_err(|e| format!("image stream does not inflate: {}", e))?,
        other => {
            let names: Vec<String> = other
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect();
            return Err(format!("unsupported image filter {}", names.join(", ")));
        }
    };

    let dim = |key: &[u8]| -> Result<u32, String> {
        stream
            .dict
            .get(key)
            .and_then(Object::as_i64)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("image has no valid {}", String::from_utf8_lossy(key)))
    };
    let width = dim(b"Width")?;
    let height = dim(b"Height")?;
    let bpc = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bpc != 8 {
        return Err(format!("{} bits per component is not supported", bpc));
    }

    let color_space = stream
        .dict
        .get(b"ColorSpace")
        .and_then(Object::as_name)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let image = match color_space.as_slice() {
        b"DeviceRGB" => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        b"DeviceGray" => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        other => {
            return Err(format!(
                "unsupported color space '{}'",
                String::from_utf8_lossy(other)
            ))
        }
    }
    .ok_or_else(|| "image data is shorter than its declared size".to_string())?;

    encode_png(&image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(3, 2, image::Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_text_strips_bom() {
        let (text, warning) = decode_text(b"\xEF\xBB\xBFhello");
        assert_eq!(text, "hello");
        assert!(warning.is_none());
    }

    #[test]
    fn test_decode_text_skips_invalid_bytes() {
        // "café au lait" in Latin-1
        let (text, warning) = decode_text(b"caf\xE9 au lait");
        assert_eq!(text, "caf au lait");
        let warning = warning.unwrap();
        assert_eq!(warning.stage, WarningStage::TextExtraction);
        assert!(warning.message.contains("1 bytes"));

        let (text, warning) = decode_text(&[0xC3, 0x28]);
        assert_eq!(text, "(");
        assert!(warning.is_some());
    }

    #[test]
    fn test_png_passes_through() {
        let png = png_bytes();
        let prepared = prepare_image(&png).unwrap();
        assert_eq!(prepared.mime, MIME_PNG);
        assert_eq!(prepared.bytes, png);
    }

    #[test]
    fn test_bmp_transcoded_to_png() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 255]));
        let mut bmp = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut bmp, ImageFormat::Bmp)
            .unwrap();
        let prepared = prepare_image(bmp.get_ref()).unwrap();
        assert_eq!(prepared.mime, MIME_PNG);
        assert!(prepared.bytes.starts_with(b"\x89PNG"));
    }

    #[test]
    fn test_truncated_image_is_corrupt() {
        let png = png_bytes();
        let err = prepare_image(&png[..20]).unwrap_err();
        assert!(matches!(err, ValidationError::CorruptDocument(_)));
    }

    #[test]
    fn test_garbage_pdf_is_corrupt() {
        let err = extract_pdf(b"%PDF-1.4 this is not really a pdf").unwrap_err();
        assert!(matches!(err, ValidationError::CorruptDocument(_)));
    }

    #[test]
    fn test_raw_rgb_stream_decodes() {
        let stream = Stream::new(
            lopdf::dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 1,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![255, 0, 0, 0, 255, 0],
        );
        let prepared = decode_pdf_image(&stream).unwrap();
        assert_eq!(prepared.mime, MIME_PNG);
        let round = image::load_from_memory(&prepared.bytes).unwrap();
        assert_eq!((round.width(), round.height()), (2, 1));
    }

    #[test]
    fn test_bad_jpeg_stream_is_an_error() {
        let stream = Stream::new(
            lopdf::dictionary! {
                "Subtype" => "Image",
                "Width" => 4,
                "Height" => 4,
                "Filter" => "DCTDecode",
            },
            b"definitely not a jpeg".to_vec(),
        );
        assert!(decode_pdf_image(&stream).is_err());
    }
}
