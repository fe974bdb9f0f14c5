//! Settings: optional TOML file merged under the command line.
//!
//! ```toml
//! profiles_dir = "/home/me/.duply"
//! output_dir = "/home/me/paper"
//! dpi = 150
//! viewer = false
//! rasterizer = "pdftoppm"
//!
//! [export]
//! program = "duply"
//! args = ["{profile}", "status"]
//!
//! [shell]
//! program = "bash"
//!
//! [env]
//! ignore = ["TMPDIR", "DUPL_*"]
//!
//! [files]
//! secret_key = ["gpgkey.*.sec.asc"]
//! public_key = ["gpgkey.*.asc"]
//! metadata = ["exclude"]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PaperError, Result};

/// Placeholder in `[export].args` replaced by the profile directory.
pub const PROFILE_PLACEHOLDER: &str = "{profile}";

/// Number of symbol columns per page row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns(u8);

impl Columns {
    pub fn new(n: u8) -> Result<Self> {
        if (1..=3).contains(&n) {
            Ok(Self(n))
        } else {
            Err(PaperError::Usage(format!("column count must be 1, 2 or 3 (got {n})")))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Columns {
    fn default() -> Self {
        Self(2)
    }
}

/// QR symbol version (1..=40); fixes the module grid and per-symbol capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolVersion(u8);

impl SymbolVersion {
    pub fn new(v: u8) -> Result<Self> {
        if (1..=40).contains(&v) {
            Ok(Self(v))
        } else {
            Err(PaperError::Usage(format!("symbol version must be 1..40 (got {v})")))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for SymbolVersion {
    fn default() -> Self {
        Self(20)
    }
}

impl fmt::Display for SymbolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterizerKind {
    /// Read the page rasters back out of the PDF in-process.
    #[default]
    Builtin,
    /// Rasterize with poppler's `pdftoppm`.
    Pdftoppm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            program: "duply".into(),
            args: vec![PROFILE_PLACEHOLDER.into(), "status".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub program: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "bash".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Extra variable-name globs dropped from the minimal config.
    pub ignore: Vec<String>,
}

/// Glob patterns (matched against file names) assigning profile files to roles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileRules {
    pub secret_key: Vec<String>,
    pub public_key: Vec<String>,
    pub metadata: Vec<String>,
}

impl Default for FileRules {
    fn default() -> Self {
        Self {
            secret_key: vec!["gpgkey.*.sec.asc".into()],
            public_key: vec!["gpgkey.*.asc".into()],
            metadata: vec!["exclude".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub profiles_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Lowest page resolution; dense symbols raise it.
    pub dpi: u32,
    pub viewer: bool,
    pub rasterizer: RasterizerKind,
    pub export: ExportConfig,
    pub shell: ShellConfig,
    pub env: EnvConfig,
    pub files: FileRules,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profiles_dir: None,
            output_dir: PathBuf::from("."),
            dpi: 150,
            viewer: true,
            rasterizer: RasterizerKind::default(),
            export: ExportConfig::default(),
            shell: ShellConfig::default(),
            env: EnvConfig::default(),
            files: FileRules::default(),
        }
    }
}

impl Settings {
    /// Load settings from `explicit` (must exist) or the default location
    /// (used only if present).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PaperError::Config(format!("read {}: {e}", path.display())))?;
        let settings: Settings = toml::from_str(&text)
            .map_err(|e| PaperError::Config(format!("parse {}: {e}", path.display())))?;
        if !(72..=600).contains(&settings.dpi) {
            return Err(PaperError::Config(format!(
                "dpi must be within 72..600 (got {})",
                settings.dpi
            )));
        }
        Ok(settings)
    }

    /// Directory holding named profiles: configured value, else `~/.duply`.
    pub fn resolved_profiles_dir(&self) -> PathBuf {
        self.profiles_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".duply")
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("duply-paper").join("config.toml"))
}
