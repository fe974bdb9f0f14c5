//! Binary-to-text transport and the ordered symbol sequence.
//!
//! QR scanners hand back text, so the archive travels as standard base64.
//! The codec splits that text over one or more symbols using its own
//! multi-symbol framing; this layer treats payloads as opaque and only
//! guarantees their order.

use std::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::GrayImage;
use zeroize::Zeroizing;

use crate::config::SymbolVersion;
use crate::error::{PaperError, Result};

/// Binary → transport text.
pub fn to_transport(data: &[u8]) -> Zeroizing<String> {
    Zeroizing::new(B64.encode(data))
}

/// Transport text → binary.  Whitespace (line breaks from scanners) is ignored.
pub fn from_transport(text: &str) -> Result<Zeroizing<Vec<u8>>> {
    let compact: Zeroizing<String> =
        Zeroizing::new(text.chars().filter(|c| !c.is_ascii_whitespace()).collect());
    B64.decode(compact.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| PaperError::Render(format!("transport decode: {e}")))
}

/// Error-correction level of a sequence.  Symbols are always written at the
/// highest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCorrection {
    High,
}

impl fmt::Display for ErrorCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCorrection::High => f.write_str("H"),
        }
    }
}

/// One encoded symbol: its framed payload and the module matrix to print.
#[derive(Clone)]
pub struct Symbol {
    pub payload: Zeroizing<Vec<u8>>,
    /// Modules per side (without quiet zone).
    pub width: usize,
    /// Row-major, `true` = dark.
    pub modules: Vec<bool>,
}

impl Symbol {
    pub fn is_dark(&self, x: usize, y: usize) -> bool {
        self.modules[y * self.width + x]
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("payload_len", &self.payload.len())
            .field("width", &self.width)
            .finish()
    }
}

/// Symbols in reading order.  Position in `symbols` is the only ordering.
#[derive(Debug, Clone)]
pub struct EncodedSymbolSequence {
    pub symbols: Vec<Symbol>,
    pub version: SymbolVersion,
    pub ec_level: ErrorCorrection,
}

impl EncodedSymbolSequence {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }
}

/// A multi-symbol optical code.
pub trait SymbolCodec {
    /// Split `text` over as many symbols as needed.
    ///
    /// Fails with [`PaperError::CapacityExceeded`] when the text does not fit.
    fn encode(&self, text: &str, version: SymbolVersion) -> Result<EncodedSymbolSequence>;

    /// Find every symbol in `image` and reassemble the transport text.
    fn decode(&self, image: &GrayImage) -> Result<Zeroizing<String>>;
}

/// Encode archive bytes into a symbol sequence.
pub fn encode_archive(
    codec: &dyn SymbolCodec,
    data: &[u8],
    version: SymbolVersion,
) -> Result<EncodedSymbolSequence> {
    let text = to_transport(data);
    codec.encode(&text, version)
}
