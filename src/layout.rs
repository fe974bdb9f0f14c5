//! Page layout: place the symbol sequence on A4 pages in reading order.
//!
//! Symbols fill a visual row left to right, rows run top to bottom, pages
//! follow each other.  Positions come from a single vertical cursor:
//!
//! - every placement naturally lands one row pitch below the previous one
//! - the second and third column are raised by one pitch, back onto the
//!   row of the first column, and shifted right by one column width
//!
//! so a reader scanning row by row meets the symbols in sequence order.
//!
//! All coordinates are millimetres from the top-left page corner.

use std::fmt;

use crate::config::Columns;
use crate::transport::EncodedSymbolSequence;

pub const PAGE_WIDTH_MM: u32 = 210;
pub const PAGE_HEIGHT_MM: u32 = 297;
pub const MARGIN_MM: u32 = 15;
pub const HEADER_MM: u32 = 12;
pub const FOOTER_MM: u32 = 40;
/// White space between neighbouring symbols.
pub const SYMBOL_GAP_MM: u32 = 4;

/// Vertical pitch of one symbol row for a column count.
pub fn row_pitch_mm(columns: Columns) -> u32 {
    match columns.get() {
        1 => 105,
        2 => 86,
        _ => 60,
    }
}

fn grid_top_mm() -> u32 {
    MARGIN_MM + HEADER_MM
}

fn grid_height_mm() -> u32 {
    PAGE_HEIGHT_MM - 2 * MARGIN_MM - HEADER_MM - FOOTER_MM
}

/// Where one symbol goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Position in the symbol sequence (0-based).
    pub index: usize,
    /// 0-based page, row on that page, and column.
    pub page: usize,
    pub row: usize,
    pub column: usize,
    pub x_mm: u32,
    /// Bottom of the row cell holding the symbol.
    pub baseline_mm: u32,
    pub size_mm: u32,
}

impl Placement {
    pub fn top_mm(&self, pitch_mm: u32) -> u32 {
        self.baseline_mm - pitch_mm + SYMBOL_GAP_MM / 2
    }
}

#[derive(Debug, Clone)]
pub struct LayoutPage {
    pub placements: Vec<Placement>,
}

/// What the decoding party needs to know, printed on every page.
#[derive(Debug, Clone)]
pub struct RecipeInfo {
    pub profile: String,
    pub compressed: bool,
    pub checksum: String,
    pub created: String,
}

#[derive(Debug, Clone)]
pub struct PageLayout {
    pub columns: Columns,
    pub pitch_mm: u32,
    pub pages: Vec<LayoutPage>,
    pub info: RecipeInfo,
    /// Footer lines: how to scan, join, decode and extract.
    pub recipe: Vec<String>,
    symbol_version: u8,
    symbol_count: usize,
}

impl PageLayout {
    pub fn placements(&self) -> impl Iterator<Item = &Placement> {
        self.pages.iter().flat_map(|p| p.placements.iter())
    }

    /// Header lines of page `page` (0-based).
    pub fn header(&self, page: usize) -> Vec<String> {
        vec![
            format!(
                "duply profile '{}' paper backup - page {}/{} - {}",
                self.info.profile,
                page + 1,
                self.pages.len(),
                self.info.created
            ),
            format!("archive sha256 {}", self.info.checksum),
        ]
    }

    /// Symbols in reading order: page, then visual row (top edge), then x.
    #[cfg(test)]
    pub fn reading_order(&self) -> Vec<usize> {
        let mut placed: Vec<&Placement> = self.placements().collect();
        placed.sort_by_key(|p| (p.page, p.top_mm(self.pitch_mm), p.x_mm));
        placed.iter().map(|p| p.index).collect()
    }
}

/// Lay out `symbols` with `columns` symbols per row.
pub fn layout(symbols: &EncodedSymbolSequence, columns: Columns, info: RecipeInfo) -> PageLayout {
    let cols = usize::from(columns.get());
    let pitch = row_pitch_mm(columns);
    let rows_per_page = (grid_height_mm() / pitch) as usize;
    let col_width = (PAGE_WIDTH_MM - 2 * MARGIN_MM) / u32::from(columns.get());
    let size = (pitch - SYMBOL_GAP_MM).min(col_width - SYMBOL_GAP_MM);

    let mut pages = Vec::new();
    let mut current = Vec::new();
    let mut cursor = grid_top_mm();
    let mut rows_on_page = 0usize;

    for index in 0..symbols.len() {
        let column = index % cols;
        if column == 0 {
            if rows_on_page == rows_per_page {
                pages.push(LayoutPage {
                    placements: std::mem::take(&mut current),
                });
                cursor = grid_top_mm();
                rows_on_page = 0;
            }
            rows_on_page += 1;
        }

        let natural = cursor + pitch;
        let baseline = if column == 0 { natural } else { natural - pitch };
        cursor = baseline;

        let x = MARGIN_MM + column as u32 * col_width + (col_width - size) / 2;
        current.push(Placement {
            index,
            page: pages.len(),
            row: rows_on_page - 1,
            column,
            x_mm: x,
            baseline_mm: baseline,
            size_mm: size,
        });
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(LayoutPage {
            placements: current,
        });
    }

    let recipe = recipe_lines(&info, symbols);
    PageLayout {
        columns,
        pitch_mm: pitch,
        pages,
        info,
        recipe,
        symbol_version: symbols.version.get(),
        symbol_count: symbols.len(),
    }
}

fn recipe_lines(info: &RecipeInfo, symbols: &EncodedSymbolSequence) -> Vec<String> {
    let archive = if info.compressed {
        format!("{}.tar.gz", info.profile)
    } else {
        format!("{}.tar", info.profile)
    };
    let compression = if info.compressed {
        format!("Compression: gzip. Extract: tar -xzf {archive} -C ~/.duply")
    } else {
        format!("Compression: none (no compression). Extract: tar -xf {archive} -C ~/.duply")
    };
    vec![
        format!(
            "{} QR codes, version {}, error correction {}, frame DP1:<i>/<n>:",
            symbols.len(),
            symbols.version,
            symbols.ec_level
        ),
        "Scan every page (300 dpi) in order to page-01.png, page-02.png, ...".into(),
        "Join without padding: montage page-*.png -tile 1x -mode concatenate -geometry +0+0 scan.png"
            .into(),
        format!(
            "Decode: zbarimg --raw -q scan.png | sort -t: -k2,2n | cut -d: -f3- | tr -d '\\n' | base64 -d > {archive}"
        ),
        format!("Check: sha256sum {archive} must match the sha256 above."),
        compression,
    ]
}

impl fmt::Display for PageLayout {
    /// Textual page description; one instruction per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "% duply-paper page description")?;
        writeln!(
            f,
            "paper {PAGE_WIDTH_MM}x{PAGE_HEIGHT_MM}mm margin {MARGIN_MM}mm"
        )?;
        writeln!(
            f,
            "symbols {} version {} columns {} pitch {}mm",
            self.symbol_count,
            self.symbol_version,
            self.columns.get(),
            self.pitch_mm
        )?;
        for (n, page) in self.pages.iter().enumerate() {
            writeln!(f, "page {}", n + 1)?;
            for line in self.header(n) {
                writeln!(f, "  header {line:?}")?;
            }
            for p in &page.placements {
                writeln!(
                    f,
                    "  symbol {} x={} top={} size={} row={} col={}",
                    p.index + 1,
                    p.x_mm,
                    p.top_mm(self.pitch_mm),
                    p.size_mm,
                    p.row + 1,
                    p.column + 1
                )?;
            }
            for line in &self.recipe {
                writeln!(f, "  footer {line:?}")?;
            }
        }
        Ok(())
    }
}
