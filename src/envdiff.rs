//! Minimal profile configuration derived from an environment diff.
//!
//! The profile `conf` is a shell fragment.  Instead of copying it (it may
//! reference files and commands that do not exist at restore time), the
//! shell sources it and the variables it newly defines are captured:
//!
//! 1. snapshot the exported environment
//! 2. source `conf` with `set -a`
//! 3. snapshot again
//!
//! [`diff`] is pure: it sees two snapshots and an [`EnvPolicy`], nothing else.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use globset::{Glob, GlobSet, GlobSetBuilder};
use zeroize::Zeroizing;

use crate::error::{PaperError, Result};

/// Variables the shell itself defines while sourcing, never profile settings.
const SHELL_INCIDENTAL: &[&str] = &[
    "_",
    "PWD",
    "OLDPWD",
    "SHLVL",
    "BASH*",
    "SHELLOPTS",
    "COLUMNS",
    "LINES",
];

/// Dumps the exported environment as NUL-terminated `KEY=VALUE` records.
/// The two dumps are separated by one empty record.
const SNAPSHOT_SCRIPT: &str = r#"
dump() { local n; for n in $(compgen -e); do printf '%s=%s\0' "$n" "${!n}"; done; }
dump
printf '\0'
set -a
. "$1" >/dev/null
dump
"#;

/// One exported-environment snapshot.
pub type EnvSnapshot = BTreeMap<String, String>;

/// Which newly defined variables count as profile configuration.
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    ignore: GlobSet,
}

impl EnvPolicy {
    /// Built-in shell incidentals plus `extra` globs.
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for p in SHELL_INCIDENTAL
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
        {
            let glob = Glob::new(p)
                .map_err(|e| PaperError::Config(format!("bad env pattern {p:?}: {e}")))?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| PaperError::Config(format!("env patterns: {e}")))?;
        Ok(Self { ignore })
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.ignore.is_match(key)
    }
}

/// Keys present in `after` but not in `before`, minus ignored names.
///
/// Variables that already existed and merely changed value are not returned.
pub fn diff(before: &EnvSnapshot, after: &EnvSnapshot, policy: &EnvPolicy) -> EnvSnapshot {
    after
        .iter()
        .filter(|(k, _)| !before.contains_key(*k) && !policy.is_ignored(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Render the diff as a sourceable `conf` replacement.
pub fn render_minimal_config(profile: &str, vars: &EnvSnapshot) -> Zeroizing<String> {
    let mut out = Zeroizing::new(format!(
        "# duply profile '{profile}': minimal configuration restored from paper backup\n"
    ));
    for (k, v) in vars {
        out.push_str(k);
        out.push('=');
        out.push_str(&shell_quote(v));
        out.push('\n');
    }
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Produces before/after snapshots around sourcing a profile configuration.
pub trait ConfigLoader {
    fn snapshots(&self, conf: &Path) -> Result<(EnvSnapshot, EnvSnapshot)>;
}

/// Sources `conf` in a real shell with a scrubbed environment.
pub struct ShellConfigLoader {
    pub shell: String,
}

impl ConfigLoader for ShellConfigLoader {
    fn snapshots(&self, conf: &Path) -> Result<(EnvSnapshot, EnvSnapshot)> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(SNAPSHOT_SCRIPT)
            .arg("duply-paper")
            .arg(conf)
            .env_clear();
        for key in ["PATH", "HOME"] {
            if let Some(v) = std::env::var_os(key) {
                cmd.env(key, v);
            }
        }
        if let Some(dir) = conf.parent() {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|e| {
            PaperError::ArchiveBuild(format!("cannot run {}: {e}", self.shell))
        })?;
        if !output.status.success() {
            return Err(PaperError::ArchiveBuild(format!(
                "sourcing {} failed ({}): {}",
                conf.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = Zeroizing::new(output.stdout);
        parse_snapshots(&stdout)
    }
}

/// Split the NUL-separated output of [`SNAPSHOT_SCRIPT`].
fn parse_snapshots(raw: &[u8]) -> Result<(EnvSnapshot, EnvSnapshot)> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| PaperError::ArchiveBuild("environment is not valid UTF-8".into()))?;
    let mut records = text.split('\0');

    let mut before = EnvSnapshot::new();
    let mut found_separator = false;
    for rec in records.by_ref() {
        if rec.is_empty() {
            found_separator = true;
            break;
        }
        insert_record(&mut before, rec);
    }
    if !found_separator {
        return Err(PaperError::ArchiveBuild(
            "truncated environment snapshot".into(),
        ));
    }

    let mut after = EnvSnapshot::new();
    for rec in records.filter(|r| !r.is_empty()) {
        insert_record(&mut after, rec);
    }
    Ok((before, after))
}

fn insert_record(snapshot: &mut EnvSnapshot, rec: &str) {
    if let Some((k, v)) = rec.split_once('=') {
        snapshot.insert(k.to_string(), v.to_string());
    }
}
