//! Deterministic restore archive.
//!
//! Entries are rooted at the profile's parent directory:
//!
//! ```text
//! work                  (dir, 0700)
//! work/conf             (minimal config, 0600)
//! work/exclude
//! work/gpgkey.AB12CD34.sec.asc
//! ```
//!
//! Headers carry no timestamps or owners and entries are sorted, so the same
//! file set and compression flag always produce the same bytes.

use std::fs;
use std::io::Write;

use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header, HeaderMode};
use zeroize::Zeroizing;

use crate::error::{PaperError, Result};
use crate::profile::{ProfileBundle, CONF_FILE};

/// Checksum function used for the archive and the verification round trip.
pub type ChecksumFn = fn(&[u8]) -> String;

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Archive bytes and their checksum, computed once at build time.
pub struct Archive {
    bytes: Zeroizing<Vec<u8>>,
    checksum: String,
    compressed: bool,
}

impl Archive {
    fn new(bytes: Vec<u8>, compressed: bool, checksum: ChecksumFn) -> Self {
        let checksum = checksum(&bytes);
        Self {
            bytes: Zeroizing::new(bytes),
            checksum,
            compressed,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Suggested file name for the restored archive.
    pub fn file_name(&self, profile: &str) -> String {
        if self.compressed {
            format!("{profile}.tar.gz")
        } else {
            format!("{profile}.tar")
        }
    }
}

/// Package `bundle` as tar (optionally gzip) and checksum it.
pub fn build(bundle: &ProfileBundle, compress: bool, checksum: ChecksumFn) -> Result<Archive> {
    let mut entries: Vec<(String, Zeroizing<Vec<u8>>)> = Vec::with_capacity(bundle.files.len() + 1);
    entries.push((
        format!("{}/{CONF_FILE}", bundle.profile),
        Zeroizing::new(bundle.minimal_config.as_bytes().to_vec()),
    ));
    for file in &bundle.files {
        let data = fs::read(&file.path).map_err(|e| {
            PaperError::ArchiveBuild(format!("read {}: {e}", file.path.display()))
        })?;
        entries.push((
            format!("{}/{}", bundle.profile, file.file_name()),
            Zeroizing::new(data),
        ));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let bytes = if compress {
        let encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(255)
            .write(Vec::new(), Compression::best());
        let mut tar = write_tar(encoder, &bundle.profile, &entries)?;
        tar.finish().map_err(build_err)?;
        tar.into_inner()
            .and_then(|gz| gz.finish())
            .map_err(build_err)?
    } else {
        let mut tar = write_tar(Vec::new(), &bundle.profile, &entries)?;
        tar.finish().map_err(build_err)?;
        tar.into_inner().map_err(build_err)?
    };

    Ok(Archive::new(bytes, compress, checksum))
}

fn write_tar<W: Write>(
    writer: W,
    root: &str,
    entries: &[(String, Zeroizing<Vec<u8>>)],
) -> Result<Builder<W>> {
    let mut tar = Builder::new(writer);
    tar.mode(HeaderMode::Deterministic);

    let mut dir = Header::new_gnu();
    dir.set_entry_type(EntryType::Directory);
    dir.set_path(root).map_err(build_err)?;
    dir.set_size(0);
    dir.set_mode(0o700);
    dir.set_mtime(0);
    dir.set_uid(0);
    dir.set_gid(0);
    dir.set_cksum();
    tar.append(&dir, std::io::empty()).map_err(build_err)?;

    for (path, data) in entries {
        let mut header = Header::new_gnu();
        header.set_path(path).map_err(build_err)?;
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        tar.append(&header, data.as_slice()).map_err(build_err)?;
    }
    Ok(tar)
}

fn build_err(e: std::io::Error) -> PaperError {
    PaperError::ArchiveBuild(e.to_string())
}
