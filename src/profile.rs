//! Profile resolution and restore file-set selection.
//!
//! A profile is a directory (by default `~/.duply/<name>`) holding a `conf`
//! file and the exported GPG key files.  Only files directly inside that
//! directory are ever considered; subdirectories are not walked.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use zeroize::Zeroizing;

use crate::config::FileRules;
use crate::error::{PaperError, Result};

/// Name of the profile configuration file.
pub const CONF_FILE: &str = "conf";

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub dir: PathBuf,
}

impl Profile {
    /// Resolve a profile argument.
    ///
    /// An argument containing `/` is a path to the profile directory; anything
    /// else names a directory under `profiles_dir`.  The directory must exist
    /// and contain a `conf` file.
    pub fn resolve(profiles_dir: &Path, arg: &str) -> Result<Self> {
        let dir = if arg.contains('/') {
            PathBuf::from(arg)
        } else {
            profiles_dir.join(arg)
        };
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .map(str::to_string);

        match name {
            Some(name) if dir.join(CONF_FILE).is_file() => Ok(Self { name, dir }),
            _ => Err(PaperError::ProfileNotFound {
                name: arg.to_string(),
                path: dir,
            }),
        }
    }

    pub fn conf_path(&self) -> PathBuf {
        self.dir.join(CONF_FILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileRole {
    MinimalConfig,
    SecretKey,
    PublicKey,
    Metadata,
}

/// Assigns top-level profile files to roles by file name.
#[derive(Debug, Clone)]
pub struct RoleMatcher {
    secret: GlobSet,
    public: GlobSet,
    metadata: GlobSet,
}

impl RoleMatcher {
    pub fn new(rules: &FileRules) -> Result<Self> {
        Ok(Self {
            secret: glob_set(&rules.secret_key)?,
            public: glob_set(&rules.public_key)?,
            metadata: glob_set(&rules.metadata)?,
        })
    }

    /// Secret wins over public, so `gpgkey.X.sec.asc` is never a public key.
    /// `conf` is never classified: the minimal config replaces it.
    pub fn classify(&self, file_name: &str) -> Option<FileRole> {
        if file_name == CONF_FILE {
            None
        } else if self.secret.is_match(file_name) {
            Some(FileRole::SecretKey)
        } else if self.public.is_match(file_name) {
            Some(FileRole::PublicKey)
        } else if self.metadata.is_match(file_name) {
            Some(FileRole::Metadata)
        } else {
            None
        }
    }

    pub fn is_key_file(&self, file_name: &str) -> bool {
        matches!(
            self.classify(file_name),
            Some(FileRole::SecretKey | FileRole::PublicKey)
        )
    }
}

fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob =
            Glob::new(p).map_err(|e| PaperError::Config(format!("bad file pattern {p:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PaperError::Config(format!("file patterns: {e}")))
}

/// One file on disk selected for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub path: PathBuf,
    pub role: FileRole,
}

impl BundleFile {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// The minimal restore set of one profile.
#[derive(Debug)]
pub struct ProfileBundle {
    pub profile: String,
    /// Generated `conf` replacement (role: minimal config).
    pub minimal_config: Zeroizing<String>,
    /// Files on disk, sorted by file name.
    pub files: Vec<BundleFile>,
}

impl ProfileBundle {
    pub fn count(&self, role: FileRole) -> usize {
        if role == FileRole::MinimalConfig {
            return 1;
        }
        self.files.iter().filter(|f| f.role == role).count()
    }
}

/// List regular files directly inside `dir`, sorted by name.
pub fn top_level_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Select the restore file set of `profile`.
///
/// Fails with [`PaperError::Export`] when no secret key file is present:
/// a paper backup without the secret key cannot restore anything.
pub fn select_bundle(
    profile: &Profile,
    matcher: &RoleMatcher,
    include_public_keys: bool,
    minimal_config: Zeroizing<String>,
) -> Result<ProfileBundle> {
    let mut files = Vec::new();
    for path in top_level_files(&profile.dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match matcher.classify(name) {
            Some(FileRole::PublicKey) if !include_public_keys => {}
            Some(role) => files.push(BundleFile { path, role }),
            None => {}
        }
    }

    let bundle = ProfileBundle {
        profile: profile.name.clone(),
        minimal_config,
        files,
    };
    if bundle.count(FileRole::SecretKey) == 0 {
        return Err(PaperError::Export(format!(
            "no secret key file found in {} after export",
            profile.dir.display()
        )));
    }
    Ok(bundle)
}
