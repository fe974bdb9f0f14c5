//! QR symbol codec.
//!
//! ## Framing
//!
//! Every symbol carries one slice of the transport text behind a fixed-width
//! frame so a scanner returning symbols in any order can be reassembled:
//!
//! ```text
//! DP1:<index>/<total>:<chunk>
//! ```
//!
//! - `index`, `total`: two decimal digits, 1-based (`DP1:03/05:...`)
//! - `chunk`: consecutive slice of the transport text
//!
//! At most [`MAX_SYMBOLS`] symbols make up one sequence, matching the
//! structured-append limit of the QR standard.  Symbols are encoded in byte
//! mode at error-correction level H.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use image::GrayImage;
use qrcode::bits::Bits;
use qrcode::types::QrError;
use qrcode::{EcLevel, QrCode, Version};
use rqrr::PreparedImage;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::SymbolVersion;
use crate::error::{PaperError, Result};
use crate::transport::{EncodedSymbolSequence, ErrorCorrection, Symbol, SymbolCodec};

/// Frame prefix identifying our payloads among other codes on a page.
const FRAME_PREFIX: &str = "DP1:";

/// Frame length: `DP1:` + `ii/nn:`.
pub const FRAME_LEN: usize = 10;

/// Most symbols in one sequence.
pub const MAX_SYMBOLS: usize = 16;

/// Upper bound for the capacity search (largest byte capacity of any version).
const SEARCH_LIMIT: usize = 3000;

/// QR codec built on `qrcode` (encode) and `rqrr` (decode).
#[derive(Debug, Default, Clone, Copy)]
pub struct QrCodec;

impl QrCodec {
    /// Bytes one symbol of `version` holds in byte mode at EC level H.
    pub fn symbol_capacity(version: SymbolVersion) -> usize {
        let v = qr_version(version);
        let (mut lo, mut hi) = (0usize, SEARCH_LIMIT);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if fits(mid, v) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }

    /// Transport bytes per symbol after the frame.
    pub fn chunk_capacity(version: SymbolVersion) -> usize {
        Self::symbol_capacity(version).saturating_sub(FRAME_LEN)
    }

    /// Shortest transport text that no longer fits a sequence of `version`
    /// symbols.  Anything shorter encodes.
    pub fn limit(version: SymbolVersion) -> usize {
        Self::chunk_capacity(version) * MAX_SYMBOLS + 1
    }
}

impl SymbolCodec for QrCodec {
    fn encode(&self, text: &str, version: SymbolVersion) -> Result<EncodedSymbolSequence> {
        let chunk = Self::chunk_capacity(version);
        let limit = Self::limit(version);
        let data = text.as_bytes();
        if chunk == 0 || data.len() >= limit {
            return Err(PaperError::CapacityExceeded {
                version: version.get(),
                needed: data.len(),
                limit,
            });
        }

        let total = data.len().div_ceil(chunk).max(1);
        let mut symbols = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * chunk;
            let end = (start + chunk).min(data.len());
            let payload = frame(index + 1, total, &data[start..end]);
            symbols.push(encode_symbol(payload, version)?);
        }
        debug!(
            symbols = symbols.len(),
            bytes = data.len(),
            version = version.get(),
            "encoded transport text"
        );

        Ok(EncodedSymbolSequence {
            symbols,
            version,
            ec_level: ErrorCorrection::High,
        })
    }

    fn decode(&self, image: &GrayImage) -> Result<Zeroizing<String>> {
        // rqrr asserts on some degenerate grids instead of returning an error.
        let scanned = panic::catch_unwind(AssertUnwindSafe(|| scan(image)))
            .map_err(|_| PaperError::Render("QR decoder gave up on the image".into()))?;
        let payloads = scanned?;
        reassemble(&payloads)
    }
}

/// Payloads of every readable QR code in `image`.
fn scan(image: &GrayImage) -> Result<Vec<Zeroizing<Vec<u8>>>> {
    let mut prepared = PreparedImage::prepare_from_greyscale(
        image.width() as usize,
        image.height() as usize,
        |x, y| image.get_pixel(x as u32, y as u32).0[0],
    );
    let grids = prepared.detect_grids();
    if grids.is_empty() {
        return Err(PaperError::Render("no QR code detected in image".into()));
    }

    let mut payloads = Vec::with_capacity(grids.len());
    for grid in &grids {
        let mut data = Vec::new();
        match grid.decode_to(&mut data) {
            Ok(_meta) => payloads.push(Zeroizing::new(data)),
            Err(e) => debug!("skipping undecodable QR grid: {e:?}"),
        }
    }
    Ok(payloads)
}

fn qr_version(version: SymbolVersion) -> Version {
    Version::Normal(i16::from(version.get()))
}

fn fits(len: usize, version: Version) -> bool {
    let sample = vec![b'a'; len];
    let mut bits = Bits::new(version);
    bits.push_byte_data(&sample).is_ok() && bits.push_terminator(EcLevel::H).is_ok()
}

fn frame(index: usize, total: usize, chunk: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(FRAME_LEN + chunk.len()));
    out.extend_from_slice(format!("{FRAME_PREFIX}{index:02}/{total:02}:").as_bytes());
    out.extend_from_slice(chunk);
    out
}

fn encode_symbol(payload: Zeroizing<Vec<u8>>, version: SymbolVersion) -> Result<Symbol> {
    let mut bits = Bits::new(qr_version(version));
    bits.push_byte_data(&payload)
        .and_then(|()| bits.push_terminator(EcLevel::H))
        .map_err(|e| qr_error(e, version, payload.len()))?;
    let qr = QrCode::with_bits(bits, EcLevel::H).map_err(|e| qr_error(e, version, payload.len()))?;

    let modules = qr
        .to_colors()
        .into_iter()
        .map(|c| c == qrcode::Color::Dark)
        .collect();
    Ok(Symbol {
        payload,
        width: qr.width(),
        modules,
    })
}

fn qr_error(e: QrError, version: SymbolVersion, len: usize) -> PaperError {
    match e {
        QrError::DataTooLong => PaperError::CapacityExceeded {
            version: version.get(),
            needed: len,
            limit: QrCodec::symbol_capacity(version) + 1,
        },
        other => PaperError::Render(format!("QR encode: {other:?}")),
    }
}

/// Split a framed payload into `(index, total, chunk)`.
fn parse_frame(data: &[u8]) -> Result<(usize, usize, &[u8])> {
    let bad = || PaperError::Render("QR payload has no valid frame".into());
    if data.len() < FRAME_LEN || !data.starts_with(FRAME_PREFIX.as_bytes()) {
        return Err(bad());
    }
    let head = std::str::from_utf8(&data[FRAME_PREFIX.len()..FRAME_LEN]).map_err(|_| bad())?;
    let (index, total) = head
        .strip_suffix(':')
        .and_then(|h| h.split_once('/'))
        .ok_or_else(bad)?;
    let index: usize = index.parse().map_err(|_| bad())?;
    let total: usize = total.parse().map_err(|_| bad())?;
    if index == 0 || total == 0 || index > total || total > MAX_SYMBOLS {
        return Err(bad());
    }
    Ok((index, total, &data[FRAME_LEN..]))
}

/// Reassemble framed payloads (in any order) into the transport text.
///
/// The same symbol scanned twice is tolerated; conflicting duplicates,
/// mixed totals and gaps are errors.
pub fn reassemble(payloads: &[Zeroizing<Vec<u8>>]) -> Result<Zeroizing<String>> {
    let mut total = None;
    let mut parts: BTreeMap<usize, &[u8]> = BTreeMap::new();

    for payload in payloads {
        let (index, n, chunk) = match parse_frame(payload) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!("ignoring QR code without frame");
                continue;
            }
        };
        match total {
            None => total = Some(n),
            Some(t) if t != n => {
                return Err(PaperError::Render(format!(
                    "symbols disagree on sequence length ({t} vs {n})"
                )))
            }
            Some(_) => {}
        }
        if let Some(prev) = parts.insert(index, chunk) {
            if prev != chunk {
                return Err(PaperError::Render(format!(
                    "conflicting content for symbol {index}"
                )));
            }
        }
    }

    let total = total.ok_or_else(|| PaperError::Render("no framed QR payload found".into()))?;
    if let Some(missing) = (1..=total).find(|i| !parts.contains_key(i)) {
        return Err(PaperError::Render(format!(
            "symbol {missing} of {total} missing"
        )));
    }

    let mut out = Zeroizing::new(Vec::new());
    for chunk in parts.values() {
        out.extend_from_slice(chunk);
    }
    let text = String::from_utf8(std::mem::take(&mut *out))
        .map_err(|_| PaperError::Render("decoded payload is not text".into()))?;
    Ok(Zeroizing::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(n: u8) -> SymbolVersion {
        SymbolVersion::new(n).unwrap()
    }

    fn payloads(seq: &EncodedSymbolSequence) -> Vec<Zeroizing<Vec<u8>>> {
        seq.symbols.iter().map(|s| s.payload.clone()).collect()
    }

    #[test]
    fn symbol_capacity_matches_byte_mode_table() {
        // ISO/IEC 18004 byte-mode capacities at level H.
        assert_eq!(QrCodec::symbol_capacity(v(1)), 7);
        assert_eq!(QrCodec::symbol_capacity(v(5)), 44);
        assert_eq!(QrCodec::symbol_capacity(v(10)), 119);
        assert_eq!(QrCodec::symbol_capacity(v(20)), 382);
        assert_eq!(QrCodec::symbol_capacity(v(40)), 1273);
    }

    #[test]
    fn version_one_holds_no_frame() {
        assert_eq!(QrCodec::chunk_capacity(v(1)), 0);
        assert!(matches!(
            QrCodec.encode("QQ==", v(1)),
            Err(PaperError::CapacityExceeded { version: 1, .. })
        ));
    }

    #[test]
    fn capacity_boundary() {
        let version = v(5);
        let limit = QrCodec::limit(version);
        assert_eq!(limit, (44 - FRAME_LEN) * MAX_SYMBOLS + 1);

        let below = "A".repeat(limit - 1);
        let seq = QrCodec.encode(&below, version).unwrap();
        assert_eq!(seq.len(), MAX_SYMBOLS);

        for len in [limit, limit + 1] {
            match QrCodec.encode(&"A".repeat(len), version) {
                Err(PaperError::CapacityExceeded {
                    version: 5,
                    needed,
                    limit: reported,
                }) => {
                    assert_eq!(needed, len);
                    assert_eq!(reported, limit);
                }
                other => panic!("expected CapacityExceeded for {len}, got {other:?}"),
            }
        }
    }

    #[test]
    fn frames_are_numbered_in_order() {
        let seq = QrCodec.encode(&"b".repeat(100), v(5)).unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.ec_level, ErrorCorrection::High);
        for (i, s) in seq.symbols.iter().enumerate() {
            let expected = format!("DP1:{:02}/03:", i + 1);
            assert!(s.payload.starts_with(expected.as_bytes()));
            assert_eq!(s.width, 37); // version 5: 17 + 4*5
        }
    }

    #[test]
    fn empty_text_is_one_symbol() {
        let seq = QrCodec.encode("", v(2)).unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(reassemble(&payloads(&seq)).unwrap().as_str(), "");
    }

    #[test]
    fn reassemble_reorders_and_tolerates_duplicates() {
        let text = "c".repeat(150);
        let seq = QrCodec.encode(&text, v(5)).unwrap();
        let mut p = payloads(&seq);
        p.reverse();
        p.push(p[0].clone());
        assert_eq!(reassemble(&p).unwrap().as_str(), text);
    }

    #[test]
    fn reassemble_rejects_gaps_and_conflicts() {
        let seq = QrCodec.encode(&"d".repeat(150), v(5)).unwrap();
        let mut gap = payloads(&seq);
        gap.remove(1);
        assert!(reassemble(&gap).is_err());

        let mut conflict = payloads(&seq);
        let mut altered = conflict[0].clone();
        let last = altered.len() - 1;
        altered[last] = b'X';
        conflict.push(altered);
        assert!(reassemble(&conflict).is_err());

        assert!(reassemble(&[]).is_err());
    }

    #[test]
    fn parse_frame_validates_header() {
        assert!(parse_frame(b"DP1:01/02:abc").is_ok());
        assert!(parse_frame(b"DP1:00/02:abc").is_err());
        assert!(parse_frame(b"DP1:03/02:abc").is_err());
        assert!(parse_frame(b"DP1:01/17:abc").is_err());
        assert!(parse_frame(b"XX1:01/02:abc").is_err());
        assert!(parse_frame(b"DP1:1/2:").is_err());
    }

    #[test]
    fn decode_blank_image_fails() {
        let blank = GrayImage::from_pixel(200, 200, image::Luma([255u8]));
        assert!(QrCodec.decode(&blank).is_err());
    }

    /// Draw `seq` side by side, one pixel per module, 4-module quiet zone.
    fn one_pixel_strip(seq: &EncodedSymbolSequence) -> GrayImage {
        let cell = seq.symbols[0].width as u32 + 8;
        let mut img = GrayImage::from_pixel(cell * seq.len() as u32, cell, image::Luma([255u8]));
        for (n, s) in seq.symbols.iter().enumerate() {
            for y in 0..s.width {
                for x in 0..s.width {
                    if s.is_dark(x, y) {
                        let px = n as u32 * cell + 4 + x as u32;
                        img.put_pixel(px, 4 + y as u32, image::Luma([0u8]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn one_pixel_modules_never_panic() {
        let text = "e".repeat(3000);
        let seq = QrCodec.encode(&text, v(40)).unwrap();
        assert_eq!(seq.len(), 3);
        match QrCodec.decode(&one_pixel_strip(&seq)) {
            Ok(back) => assert_eq!(back.as_str(), text),
            Err(e) => assert!(matches!(e, PaperError::Render(_)), "{e}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn payload_round_trip(data in proptest::collection::vec(any::<u8>(), 0..600), version in 8u8..=20) {
            let version = v(version);
            let text = crate::transport::to_transport(&data);
            match QrCodec.encode(&text, version) {
                Ok(seq) => {
                    let back = reassemble(&payloads(&seq)).unwrap();
                    let bytes = crate::transport::from_transport(&back).unwrap();
                    prop_assert_eq!(bytes.as_slice(), data.as_slice());
                }
                Err(PaperError::CapacityExceeded { .. }) => {
                    prop_assert!(text.len() >= QrCodec::limit(version));
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
