//! Key export: force the backup tool to write fresh key files into the profile.

use std::fs;
use std::io;
use std::process::Command;

use tracing::debug;

use crate::config::{ExportConfig, PROFILE_PLACEHOLDER};
use crate::error::{PaperError, Result};
use crate::profile::{top_level_files, Profile, RoleMatcher};

/// Re-materialises the key files of a profile.
pub trait Exporter {
    fn export(&self, profile: &Profile) -> Result<()>;
}

/// Runs an external program (by default `duply <profile-dir> status`), which
/// exports any missing key files as a side effect.
pub struct CommandExporter {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandExporter {
    pub fn from_config(cfg: &ExportConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
        }
    }

    fn expanded_args(&self, profile: &Profile) -> Vec<String> {
        let dir = profile.dir.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(PROFILE_PLACEHOLDER, &dir))
            .collect()
    }
}

impl Exporter for CommandExporter {
    fn export(&self, profile: &Profile) -> Result<()> {
        let args = self.expanded_args(profile);
        debug!(program = %self.program, ?args, "running key export");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| PaperError::Export(format!("cannot run {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(PaperError::Export(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Delete previously exported key files so the exporter must recreate them.
///
/// Returns the number of files removed.  A file vanishing between listing
/// and removal is not an error.
pub fn remove_stale_keys(profile: &Profile, matcher: &RoleMatcher) -> Result<usize> {
    let mut removed = 0;
    for path in top_level_files(&profile.dir)? {
        let is_key = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| matcher.is_key_file(n));
        if !is_key {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PaperError::Export(format!(
                    "cannot remove stale key file {}: {e}",
                    path.display()
                )))
            }
        }
    }
    debug!(removed, profile = %profile.name, "removed stale key files");
    Ok(removed)
}

/// Stale-key removal followed by export.
pub fn refresh_keys(
    exporter: &dyn Exporter,
    profile: &Profile,
    matcher: &RoleMatcher,
) -> Result<()> {
    remove_stale_keys(profile, matcher)?;
    exporter.export(profile)
}
