//! Error taxonomy for the paper backup pipeline.
//!
//! Every variant is fatal: the pipeline never retries.  All of them end the
//! process with exit status 1; the variant only decides the message and, for
//! [`PaperError::VerificationMismatch`], which diagnostic artifact survives.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaperError {
    /// Bad flags or arguments.
    #[error("usage: {0}")]
    Usage(String),

    /// The named profile has no directory (or no `conf` inside it).
    #[error("profile {name:?} not found at {}", path.display())]
    ProfileNotFound { name: String, path: PathBuf },

    /// A required external program is not installed.
    #[error("required tool {tool:?} not found in PATH ({purpose})")]
    MissingCollaborator { tool: String, purpose: &'static str },

    /// The key export step failed or produced no secret key material.
    #[error("key export failed: {0}")]
    Export(String),

    /// Selecting or packaging the profile files failed.
    #[error("archive build failed: {0}")]
    ArchiveBuild(String),

    /// The transport text does not fit the chosen QR version at EC level H.
    #[error(
        "{needed} bytes of encoded data do not fit QR version {version}, which takes under {limit} \
         (raise the version with -v)"
    )]
    CapacityExceeded {
        version: u8,
        needed: usize,
        limit: usize,
    },

    /// Page rendering, rasterizing or document I/O failed.
    #[error("render failed: {0}")]
    Render(String),

    /// The scan round trip did not reproduce the archive.
    #[error(
        "verification failed: archive sha256 {expected}, decoded {}; failing scan image kept at {}",
        actual.as_deref().unwrap_or("nothing"),
        preserved.display()
    )]
    VerificationMismatch {
        expected: String,
        actual: Option<String>,
        preserved: PathBuf,
    },

    /// The configuration file could not be read or parsed.
    #[error("config: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PaperError>;
