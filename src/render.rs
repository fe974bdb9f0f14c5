//! Page renderer: draws a [`PageLayout`] as gray page rasters and writes
//! them as a PDF.
//!
//! Output is pure pixel data.  Text (header and decode recipe) is drawn with
//! 8×8 bitmap glyphs, so the document holds no extractable text objects
//! naming the key material.

use std::path::Path;

use font8x8::UnicodeFonts;
use image::{GrayImage, Luma};
use tracing::debug;

use crate::error::{PaperError, Result};
use crate::layout::{PageLayout, FOOTER_MM, MARGIN_MM, PAGE_HEIGHT_MM, PAGE_WIDTH_MM};
use crate::pdf;
use crate::scratch;
use crate::transport::{EncodedSymbolSequence, Symbol};

/// QR quiet zone in modules (the standard requires ≥ 4).
const QUIET_MODULES: usize = 4;

/// Smallest module edge in pixels that the scan-back decoder reads reliably.
pub const MIN_MODULE_PX: u32 = 6;

/// Ceiling for the raised page resolution.
pub const MAX_DPI: u32 = 600;

/// Horizontal rule thickness in pixels.
const HR_THICK: u32 = 2;

/// Turns a page layout into a printable document at `out`.
pub trait Renderer {
    fn render(&self, layout: &PageLayout, symbols: &EncodedSymbolSequence, out: &Path)
        -> Result<()>;
}

/// In-process renderer producing one full-page raster per PDF page.
///
/// `dpi` is a floor: dense symbols raise the page resolution until every
/// module is at least [`MIN_MODULE_PX`] pixels wide.
#[derive(Debug, Clone, Copy)]
pub struct RasterRenderer {
    pub dpi: u32,
}

impl RasterRenderer {
    fn px(&self, mm: u32) -> u32 {
        (f64::from(mm) * f64::from(self.dpi) / 25.4).round() as u32
    }

    /// Font scale: 8 px glyphs at 75 dpi, growing with resolution.
    fn text_scale(&self) -> u32 {
        (self.dpi / 75).max(1)
    }

    /// Resolution the pages of `layout` are drawn at.
    pub fn resolution(&self, layout: &PageLayout, symbols: &EncodedSymbolSequence) -> Result<u32> {
        let size_mm = layout.placements().map(|p| p.size_mm).min();
        let modules = symbols
            .symbols
            .iter()
            .map(|s| (s.width + 2 * QUIET_MODULES) as u32)
            .max();
        match (size_mm, modules) {
            (Some(size_mm), Some(modules)) => scan_dpi(self.dpi, size_mm, modules),
            _ => Ok(self.dpi),
        }
    }

    /// Draw every page at [`Self::resolution`]; returns that resolution too.
    pub fn render_pages(
        &self,
        layout: &PageLayout,
        symbols: &EncodedSymbolSequence,
    ) -> Result<(u32, Vec<GrayImage>)> {
        let dpi = self.resolution(layout, symbols)?;
        if dpi != self.dpi {
            debug!(
                configured = self.dpi,
                dpi,
                version = %symbols.version,
                "raised page resolution for module size"
            );
        }
        let pages = RasterRenderer { dpi }.draw_pages(layout, symbols)?;
        Ok((dpi, pages))
    }

    fn draw_pages(
        &self,
        layout: &PageLayout,
        symbols: &EncodedSymbolSequence,
    ) -> Result<Vec<GrayImage>> {
        let (w, h) = (self.px(PAGE_WIDTH_MM), self.px(PAGE_HEIGHT_MM));
        let scale = self.text_scale();
        let line_h = text_h(scale) + scale * 2;
        let left = self.px(MARGIN_MM);
        let text_width = w - 2 * left;

        let mut pages = Vec::with_capacity(layout.pages.len());
        for (n, page) in layout.pages.iter().enumerate() {
            let mut img = GrayImage::from_pixel(w, h, Luma([255u8]));

            // Header
            let mut y = left;
            for line in layout.header(n) {
                for part in wrap(&line, chars_per_line(text_width, scale)) {
                    draw_text(&mut img, left, y, &part, scale);
                    y += line_h;
                }
            }
            draw_hr(&mut img, left, y, text_width);

            // Symbols
            for p in &page.placements {
                let symbol = symbols.symbols.get(p.index).ok_or_else(|| {
                    PaperError::Render(format!("layout references missing symbol {}", p.index))
                })?;
                let size = self.px(p.size_mm);
                let modules = symbol.width + 2 * QUIET_MODULES;
                let module_px = size / modules as u32;
                if module_px < MIN_MODULE_PX {
                    return Err(PaperError::Render(format!(
                        "QR version {} too dense for {} dpi",
                        symbols.version, self.dpi
                    )));
                }
                let block = module_px * modules as u32;
                let x = self.px(p.x_mm) + (size - block) / 2;
                let y = self.px(p.top_mm(layout.pitch_mm)) + (size - block) / 2;
                let quiet = module_px * QUIET_MODULES as u32;
                draw_qr(&mut img, x + quiet, y + quiet, symbol, module_px);
            }

            // Footer: decode recipe
            let footer_top = self.px(PAGE_HEIGHT_MM - MARGIN_MM - FOOTER_MM);
            draw_hr(&mut img, left, footer_top, text_width);
            let mut y = footer_top + HR_THICK + scale * 2;
            for line in &layout.recipe {
                for part in wrap(line, chars_per_line(text_width, scale)) {
                    draw_text(&mut img, left, y, &part, scale);
                    y += line_h;
                }
            }

            pages.push(img);
        }
        Ok(pages)
    }
}

impl Renderer for RasterRenderer {
    fn render(
        &self,
        layout: &PageLayout,
        symbols: &EncodedSymbolSequence,
        out: &Path,
    ) -> Result<()> {
        let (dpi, pages) = self.render_pages(layout, symbols)?;
        let bytes = pdf::write_pages(&pages, dpi)?;
        scratch::write_private(out, &bytes)?;
        debug!(pages = pages.len(), dpi, bytes = bytes.len(), path = %out.display(), "rendered document");
        Ok(())
    }
}

/// Lowest resolution from `floor` up that gives a symbol of `modules` modules
/// (quiet zone included) in `size_mm` at least [`MIN_MODULE_PX`] per module.
fn scan_dpi(floor: u32, size_mm: u32, modules: u32) -> Result<u32> {
    (floor..=MAX_DPI.max(floor))
        .find(|&dpi| RasterRenderer { dpi }.px(size_mm) / modules >= MIN_MODULE_PX)
        .ok_or_else(|| {
            PaperError::Render(format!(
                "{modules} modules in {size_mm} mm need more than {MAX_DPI} dpi; \
                 use fewer columns or a lower QR version"
            ))
        })
}

// ---------------------------------------------------------------------------
// Drawing primitives
// ---------------------------------------------------------------------------

/// Draw a single character at `(x, y)` with the given pixel scale.
///
/// font8x8 convention: each glyph is `[u8; 8]`, one byte per row,
/// bit 0 (LSB) = leftmost pixel.
fn draw_char(img: &mut GrayImage, x: u32, y: u32, ch: char, scale: u32) {
    let glyph = font8x8::BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
    for (row, &bits) in glyph.iter().enumerate() {
        for col in 0u32..8 {
            if bits & (1 << col) == 0 {
                continue;
            }
            for sy in 0..scale {
                for sx in 0..scale {
                    let px = x + col * scale + sx;
                    let py = y + row as u32 * scale + sy;
                    if px < img.width() && py < img.height() {
                        img.put_pixel(px, py, Luma([0u8]));
                    }
                }
            }
        }
    }
}

fn draw_text(img: &mut GrayImage, x: u32, y: u32, text: &str, scale: u32) {
    let cw = 8 * scale;
    for (i, ch) in text.chars().enumerate() {
        draw_char(img, x + i as u32 * cw, y, ch, scale);
    }
}

const fn text_h(scale: u32) -> u32 {
    8 * scale
}

fn chars_per_line(width: u32, scale: u32) -> usize {
    (width / (8 * scale)).max(1) as usize
}

/// Break `text` into pieces of at most `max` characters, preferring spaces.
fn wrap(text: &str, max: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split(' ') {
        let needed = if line.is_empty() {
            word.chars().count()
        } else {
            line.chars().count() + 1 + word.chars().count()
        };
        if needed > max && !line.is_empty() {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
        while line.chars().count() > max {
            let head: String = line.chars().take(max).collect();
            let tail: String = line.chars().skip(max).collect();
            lines.push(head);
            line = tail;
        }
    }
    if !line.is_empty() || lines.is_empty() {
        lines.push(line);
    }
    lines
}

fn draw_hr(img: &mut GrayImage, x: u32, y: u32, width: u32) {
    for dy in 0..HR_THICK {
        for dx in 0..width {
            let (px, py) = (x + dx, y + dy);
            if px < img.width() && py < img.height() {
                img.put_pixel(px, py, Luma([0u8]));
            }
        }
    }
}

/// Draw a symbol's module matrix at `(x, y)`, `module_px` pixels per module.
fn draw_qr(img: &mut GrayImage, x: u32, y: u32, symbol: &Symbol, module_px: u32) {
    let w = symbol.width;
    for qy in 0..w {
        for qx in 0..w {
            let shade = if symbol.is_dark(qx, qy) { 0u8 } else { 255u8 };
            for py in 0..module_px {
                for px in 0..module_px {
                    let ix = x + qx as u32 * module_px + px;
                    let iy = y + qy as u32 * module_px + py;
                    if ix < img.width() && iy < img.height() {
                        img.put_pixel(ix, iy, Luma([shade]));
                    }
                }
            }
        }
    }
}
