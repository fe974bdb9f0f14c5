//! Private scratch space for one run.
//!
//! Everything sensitive the pipeline writes (layout description, document,
//! scan composite) lives in one owner-only temporary directory.  Dropping the
//! [`Scratch`] removes it on every exit path, including errors and panics
//! that unwind.  Only files explicitly [`Scratch::preserve`]d outlive it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::Result;

const PREFIX: &str = "duply-paper-";

pub struct Scratch {
    dir: Option<TempDir>,
}

impl Scratch {
    /// Create the scratch directory under `root` (system temp dir if `None`).
    pub fn new(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        restrict_dir(dir.path())?;
        debug!(path = %dir.path().display(), "created scratch directory");
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Path of a file inside the scratch directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Move `src` out of the scratch directory to `dst` (mode 0600).
    ///
    /// A partially written `dst` is removed if the move fails.
    pub fn preserve(&self, src: &Path, dst: &Path) -> Result<PathBuf> {
        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(src, dst).is_err() {
            // Different filesystem: copy, then drop the scratch copy.
            if let Err(e) = fs::copy(src, dst) {
                let _ = fs::remove_file(dst);
                return Err(e.into());
            }
            fs::remove_file(src)?;
        }
        restrict_file(dst)?;
        debug!(from = %src.display(), to = %dst.display(), "preserved scratch file");
        Ok(dst.to_path_buf())
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "removed scratch directory"),
                Err(e) => warn!(path = %path.display(), "could not remove scratch directory: {e}"),
            }
        }
    }
}

/// Write `data` to a new file readable by the owner only.
pub fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> io::Result<()> {
    Ok(())
}
