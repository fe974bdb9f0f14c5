//! PDF container for page rasters, built and parsed with `lopdf`.
//!
//! Every page carries exactly one image XObject `/Im0`: 8-bit DeviceGray,
//! FlateDecode, painted over the whole MediaBox.  The MediaBox is the image
//! size at the render resolution, so [`resolution`] can recover that
//! resolution from the document alone.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::GrayImage;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use crate::error::{PaperError, Result};

const IMAGE_NAME: &str = "Im0";

/// Serialize `pages` as a PDF, each page sized so one pixel is `1/dpi` inch.
pub fn write_pages(pages: &[GrayImage], dpi: u32) -> Result<Vec<u8>> {
    if pages.is_empty() {
        return Err(PaperError::Render("document has no pages".into()));
    }
    if dpi == 0 {
        return Err(PaperError::Render("resolution must be positive".into()));
    }

    let mut doc = Document::with_version("1.4");
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for page in pages {
        let (w, h) = page.dimensions();
        let (w_pt, h_pt) = (points(w, dpi), points(h, dpi));

        let mut z = ZlibEncoder::new(Vec::new(), Compression::best());
        z.write_all(page.as_raw())?;
        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(w),
                "Height" => i64::from(h),
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8_i64,
                "Filter" => "FlateDecode",
            },
            z.finish()?,
        );
        let image_id = doc.add_object(image);

        let content = format!("q {w_pt:.2} 0 0 {h_pt:.2} 0 0 cm /{IMAGE_NAME} Do Q\n");
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(w_pt),
                Object::Real(h_pt),
            ],
            "Resources" => dictionary! {
                "XObject" => dictionary! { IMAGE_NAME => image_id },
            },
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| PaperError::Render(format!("write document: {e}")))?;
    Ok(out)
}

/// Page size in PDF points, rounded to two decimals.
fn points(px: u32, dpi: u32) -> f32 {
    let pt = f64::from(px) * 72.0 / f64::from(dpi);
    ((pt * 100.0).round() / 100.0) as f32
}

/// Extract the page images of a document produced by [`write_pages`], in
/// page order.
pub fn read_pages(bytes: &[u8]) -> Result<Vec<GrayImage>> {
    let doc = load(bytes)?;
    let pages = doc.get_pages();
    let images = pages
        .values()
        .map(|&page_id| page_image(&doc, page_id).map(|(image, _)| image))
        .collect::<Result<Vec<_>>>()?;
    Ok(images)
}

/// Resolution the document was rendered at, from its first page.
pub fn resolution(bytes: &[u8]) -> Result<u32> {
    let doc = load(bytes)?;
    let page_id = *doc
        .get_pages()
        .values()
        .next()
        .ok_or_else(|| unreadable("no pages"))?;
    let (image, page) = page_image(&doc, page_id)?;
    let media_box = page
        .get(b"MediaBox")
        .and_then(Object::as_array)
        .map_err(|_| unreadable("page has no MediaBox"))?;
    let width_pt = media_box
        .get(2)
        .and_then(number)
        .filter(|w| *w > 0.0)
        .ok_or_else(|| unreadable("MediaBox width is not a positive number"))?;
    Ok((f64::from(image.width()) * 72.0 / width_pt).round() as u32)
}

fn load(bytes: &[u8]) -> Result<Document> {
    let doc = Document::load_mem(bytes).map_err(|e| unreadable(&e.to_string()))?;
    if doc.get_pages().is_empty() {
        return Err(unreadable("no pages"));
    }
    Ok(doc)
}

/// The `/Im0` raster of a page, with the page dictionary.
fn page_image(doc: &Document, page_id: ObjectId) -> Result<(GrayImage, &Dictionary)> {
    let page = doc
        .get_dictionary(page_id)
        .map_err(|_| unreadable("page is not a dictionary"))?;
    let resources = resolve(doc, page.get(b"Resources"))
        .and_then(Object::as_dict)
        .map_err(|_| unreadable("page has no resources"))?;
    let xobjects = resolve(doc, resources.get(b"XObject"))
        .and_then(Object::as_dict)
        .map_err(|_| unreadable("page has no images"))?;
    let stream = resolve(doc, xobjects.get(IMAGE_NAME.as_bytes()))
        .and_then(Object::as_stream)
        .map_err(|_| unreadable("page image missing"))?;

    let dict = &stream.dict;
    let width = dict_u32(doc, dict, b"Width")?;
    let height = dict_u32(doc, dict, b"Height")?;
    let gray = matches!(dict.get(b"ColorSpace"), Ok(Object::Name(n)) if n == b"DeviceGray");
    if dict_u32(doc, dict, b"BitsPerComponent")? != 8 || !gray {
        return Err(unreadable("only 8-bit gray images are supported"));
    }

    let raw = match dict.get(b"Filter") {
        Ok(Object::Name(n)) if n == b"FlateDecode" => {
            let mut raw = Vec::with_capacity(width as usize * height as usize);
            ZlibDecoder::new(stream.content.as_slice())
                .read_to_end(&mut raw)
                .map_err(|e| unreadable(&format!("image stream: {e}")))?;
            raw
        }
        Err(_) => stream.content.clone(),
        Ok(_) => return Err(unreadable("unsupported image filter")),
    };
    let image = GrayImage::from_raw(width, height, raw)
        .ok_or_else(|| unreadable("image size does not match its data"))?;
    Ok((image, page))
}

fn resolve<'a>(
    doc: &'a Document,
    obj: lopdf::Result<&'a Object>,
) -> lopdf::Result<&'a Object> {
    doc.dereference(obj?).map(|(_, obj)| obj)
}

fn dict_u32(doc: &Document, dict: &Dictionary, key: &[u8]) -> Result<u32> {
    let name = String::from_utf8_lossy(key);
    resolve(doc, dict.get(key))
        .and_then(Object::as_i64)
        .ok()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| unreadable(&format!("/{name} is not a number")))
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(n) => Some(*n as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn unreadable(what: &str) -> PaperError {
    PaperError::Render(format!("unreadable document: {what}"))
}
