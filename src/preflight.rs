//! External tool checks, run before anything touches the filesystem.

use std::path::PathBuf;

use tracing::debug;

use crate::config::{RasterizerKind, Settings};
use crate::error::{PaperError, Result};
use crate::verify::PdftoppmRasterizer;

/// One program the run cannot do without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub tool: String,
    pub purpose: &'static str,
}

/// Programs needed by a run with `settings`.
pub fn requirements(settings: &Settings) -> Vec<Requirement> {
    let mut req = vec![
        Requirement {
            tool: settings.export.program.clone(),
            purpose: "exports the profile's key files",
        },
        Requirement {
            tool: settings.shell.program.clone(),
            purpose: "sources the profile configuration",
        },
    ];
    if settings.rasterizer == RasterizerKind::Pdftoppm {
        req.push(Requirement {
            tool: PdftoppmRasterizer::PROGRAM.into(),
            purpose: "rasterizes the document for verification",
        });
    }
    req
}

/// Resolve every requirement in `PATH` (or as given, if it is a path).
pub fn check(requirements: &[Requirement]) -> Result<Vec<PathBuf>> {
    requirements
        .iter()
        .map(|r| match which::which(&r.tool) {
            Ok(path) => {
                debug!(tool = %r.tool, path = %path.display(), "found required tool");
                Ok(path)
            }
            Err(_) => Err(PaperError::MissingCollaborator {
                tool: r.tool.clone(),
                purpose: r.purpose,
            }),
        })
        .collect()
}
