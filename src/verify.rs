//! Round-trip verifier: rasterize the rendered document, stack the pages
//! into one scan image, decode it and compare checksums with the archive.
//!
//! A pass is only ever reported when the decoded bytes hash to exactly the
//! checksum computed when the archive was built.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use image::{imageops, GrayImage, ImageFormat, Luma};
use tracing::{debug, warn};

use crate::archive::ChecksumFn;
use crate::error::{PaperError, Result};
use crate::pdf;
use crate::scratch::write_private;
use crate::transport::{from_transport, SymbolCodec};

/// File name of the composite scan image inside the work directory.
pub const COMPOSITE_FILE: &str = "composite.png";

/// Turns the pages of a rendered document into images.
pub trait Rasterizer {
    fn rasterize(&self, document: &Path, work_dir: &Path) -> Result<Vec<GrayImage>>;
}

/// Combines page images into one scan image.
pub trait Compositor {
    fn composite(&self, pages: &[GrayImage]) -> Result<GrayImage>;
}

// ---------------------------------------------------------------------------
// Rasterizers
// ---------------------------------------------------------------------------

/// Reads the page images straight out of a document written by the
/// in-process renderer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfRasterizer;

impl Rasterizer for PdfRasterizer {
    fn rasterize(&self, document: &Path, _work_dir: &Path) -> Result<Vec<GrayImage>> {
        let bytes = fs::read(document)?;
        pdf::read_pages(&bytes)
    }
}

/// Runs poppler's `pdftoppm` and loads the PNG pages it writes.
///
/// Pages are rasterized at the resolution the document was rendered at, so
/// every module keeps its pixel size.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pub program: String,
}

impl PdftoppmRasterizer {
    pub const PROGRAM: &'static str = "pdftoppm";
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            program: Self::PROGRAM.into(),
        }
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn rasterize(&self, document: &Path, work_dir: &Path) -> Result<Vec<GrayImage>> {
        let dpi = pdf::resolution(&fs::read(document)?)?;
        let pages_dir = work_dir.join("pages");
        fs::create_dir_all(&pages_dir)?;
        debug!(program = %self.program, dpi, "rasterizing document");
        let status = Command::new(&self.program)
            .arg("-r")
            .arg(dpi.to_string())
            .args(["-gray", "-png"])
            .arg(document)
            .arg(pages_dir.join("page"))
            .status()
            .map_err(|e| PaperError::Render(format!("{}: {e}", self.program)))?;
        if !status.success() {
            return Err(PaperError::Render(format!("{} exited with {status}", self.program)));
        }

        let mut files: Vec<(u32, PathBuf)> = fs::read_dir(&pages_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter_map(|p| page_number(&p).map(|n| (n, p)))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(PaperError::Render(format!("{} produced no pages", self.program)));
        }

        files
            .iter()
            .map(|(_, path)| {
                image::open(path)
                    .map(|img| img.into_luma8())
                    .map_err(|e| PaperError::Render(format!("load {}: {e}", path.display())))
            })
            .collect()
    }
}

/// `page-3.png` / `page-03.png` → 3.
fn page_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("page-")?.strip_suffix(".png")?.parse().ok()
}

// ---------------------------------------------------------------------------
// Compositor
// ---------------------------------------------------------------------------

/// Stacks pages top to bottom, no padding between them (`+0` geometry).
#[derive(Debug, Default, Clone, Copy)]
pub struct StackCompositor;

impl Compositor for StackCompositor {
    fn composite(&self, pages: &[GrayImage]) -> Result<GrayImage> {
        if pages.is_empty() {
            return Err(PaperError::Render("nothing to composite".into()));
        }
        let width = pages.iter().map(|p| p.width()).max().unwrap_or(0);
        let height: u32 = pages.iter().map(|p| p.height()).sum();
        let mut out = GrayImage::from_pixel(width, height, Luma([255u8]));
        let mut y = 0i64;
        for page in pages {
            imageops::replace(&mut out, page, 0, y);
            y += i64::from(page.height());
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub passed: bool,
    /// Checksum of the archive as built.
    pub expected: String,
    /// Checksum of what came back from the scan, if anything decoded.
    pub actual: Option<String>,
    /// Why nothing could be decoded.
    pub failure: Option<String>,
    /// The composite scan image in the work directory.
    pub composite: PathBuf,
}

pub struct Verifier<'a> {
    pub rasterizer: &'a dyn Rasterizer,
    pub compositor: &'a dyn Compositor,
    pub codec: &'a dyn SymbolCodec,
    pub checksum: ChecksumFn,
}

impl Verifier<'_> {
    /// Scan `document` back and compare against `expected`.
    ///
    /// Rasterizing and compositing failures are errors; anything that goes
    /// wrong from decoding on is a failed [`VerificationResult`].
    pub fn verify(
        &self,
        document: &Path,
        expected: &str,
        work_dir: &Path,
    ) -> Result<VerificationResult> {
        let pages = self.rasterizer.rasterize(document, work_dir)?;
        let composite = self.compositor.composite(&pages)?;
        debug!(
            pages = pages.len(),
            width = composite.width(),
            height = composite.height(),
            "composited scan image"
        );

        let composite_path = work_dir.join(COMPOSITE_FILE);
        let mut png = Vec::new();
        composite
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| PaperError::Render(format!("encode composite: {e}")))?;
        write_private(&composite_path, &png)?;

        let decoded = self
            .codec
            .decode(&composite)
            .and_then(|text| from_transport(&text));
        let result = match decoded {
            Ok(bytes) => {
                let actual = (self.checksum)(&bytes);
                VerificationResult {
                    passed: actual == expected,
                    expected: expected.to_string(),
                    actual: Some(actual),
                    failure: None,
                    composite: composite_path,
                }
            }
            Err(e) => {
                warn!("scan round trip decoded nothing: {e}");
                VerificationResult {
                    passed: false,
                    expected: expected.to_string(),
                    actual: None,
                    failure: Some(e.to_string()),
                    composite: composite_path,
                }
            }
        };
        Ok(result)
    }
}
