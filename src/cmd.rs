use crate::archive::sha256_hex;
use crate::config::{Columns, RasterizerKind, Settings, SymbolVersion};
use crate::envdiff::{EnvPolicy, ShellConfigLoader};
use crate::export::CommandExporter;
use crate::pipeline::{self, Collaborators, Outcome, Request};
use crate::preflight;
use crate::profile::RoleMatcher;
use crate::qr::QrCodec;
use crate::render::RasterRenderer;
use crate::verify::{PdfRasterizer, PdftoppmRasterizer, Rasterizer, StackCompositor};
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Do not compress the archive
    #[arg(short = 'C')]
    pub no_compression: bool,

    /// Do not open the finished PDF in a viewer
    #[arg(short = 'V')]
    pub no_viewer: bool,

    /// QR codes per row (1, 2 or 3)
    #[arg(
        short = 'c',
        value_name = "N",
        default_value_t = 2,
        value_parser = clap::value_parser!(u8).range(1..=3)
    )]
    pub columns: u8,

    /// Include public key files in the archive
    #[arg(short = 'p')]
    pub public_keys: bool,

    /// QR symbol version (1..40); raise it when the data does not fit
    #[arg(
        short = 'v',
        value_name = "N",
        default_value_t = 20,
        value_parser = clap::value_parser!(u8).range(1..=40)
    )]
    pub version: u8,

    /// Profile name (under the profiles directory) or path to a profile directory
    pub profile: String,

    /// Directory holding duply profiles [default: ~/.duply]
    #[arg(long, value_name = "DIR")]
    pub profiles_dir: Option<PathBuf>,

    /// Where the PDF (or failing scan image) is written [default: .]
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Settings file [default: <config dir>/duply-paper/config.toml]
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

pub fn run(args: BackupArgs) -> Result<()> {
    let columns = Columns::new(args.columns)?;
    let version = SymbolVersion::new(args.version)?;
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    let settings = apply_overrides(settings, &args);

    preflight::check(&preflight::requirements(&settings))?;

    let request = Request {
        profile: args.profile.clone(),
        profiles_dir: settings.resolved_profiles_dir(),
        output_dir: settings.output_dir.clone(),
        scratch_root: None,
        include_public_keys: args.public_keys,
        compress: !args.no_compression,
        columns,
        version,
        created: today()?,
        matcher: RoleMatcher::new(&settings.files)?,
        env_policy: EnvPolicy::new(&settings.env.ignore)?,
    };

    let exporter = CommandExporter::from_config(&settings.export);
    let loader = ShellConfigLoader {
        shell: settings.shell.program.clone(),
    };
    let renderer = RasterRenderer { dpi: settings.dpi };
    let pdftoppm = PdftoppmRasterizer::default();
    let rasterizer: &dyn Rasterizer = match settings.rasterizer {
        RasterizerKind::Builtin => &PdfRasterizer,
        RasterizerKind::Pdftoppm => &pdftoppm,
    };

    let outcome = pipeline::run(
        &request,
        &Collaborators {
            exporter: &exporter,
            config_loader: &loader,
            codec: &QrCodec,
            renderer: &renderer,
            rasterizer,
            compositor: &StackCompositor,
            checksum: sha256_hex,
        },
    )
    .with_context(|| format!("paper backup of profile '{}'", args.profile))?;

    report(&outcome);
    if settings.viewer {
        open_viewer(&outcome.document);
    }
    Ok(())
}

/// Command-line values win over the settings file.
fn apply_overrides(mut settings: Settings, args: &BackupArgs) -> Settings {
    if let Some(dir) = &args.profiles_dir {
        settings.profiles_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.output_dir {
        settings.output_dir = dir.clone();
    }
    if args.no_viewer {
        settings.viewer = false;
    }
    settings
}

fn today() -> Result<String> {
    let fmt = format_description!("[year]-[month]-[day]");
    OffsetDateTime::now_utc()
        .format(fmt)
        .context("formatting date")
}

fn report(outcome: &Outcome) {
    eprintln!();
    eprintln!("  profile:  {}", outcome.profile);
    eprintln!(
        "  archive:  {} bytes, {}",
        outcome.archive_bytes,
        if outcome.compressed { "gzip" } else { "no compression" }
    );
    eprintln!("  config:   {} variables", outcome.config_vars);
    eprintln!("  sha256:   {}", outcome.checksum);
    eprintln!("  symbols:  {} on {} page(s)", outcome.symbols, outcome.pages);
    eprintln!("  document: {}", outcome.document.display());
    eprintln!();
    eprintln!("Print it, then check the printout scans back before filing it away.");
}

fn open_viewer(document: &Path) {
    if let Err(e) = open::that(document) {
        warn!("could not open {} in a viewer: {e}", document.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::{CommandFactory, Parser};

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: BackupArgs,
    }

    fn parse(argv: &[&str]) -> std::result::Result<BackupArgs, clap::Error> {
        let mut full = vec!["duply-paper"];
        full.extend_from_slice(argv);
        TestCli::try_parse_from(full).map(|c| c.args)
    }

    #[test]
    fn command_definition_is_consistent() {
        TestCli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let a = parse(&["work"]).unwrap();
        assert_eq!(a.profile, "work");
        assert_eq!(a.columns, 2);
        assert_eq!(a.version, 20);
        assert!(!a.no_compression && !a.no_viewer && !a.public_keys);
    }

    #[test]
    fn all_short_flags() {
        let a = parse(&["-C", "-V", "-p", "-c", "3", "-v", "40", "work"]).unwrap();
        assert!(a.no_compression && a.no_viewer && a.public_keys);
        assert_eq!((a.columns, a.version), (3, 40));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for argv in [
            &["-c", "0", "work"][..],
            &["-c", "4", "work"],
            &["-c", "x", "work"],
            &["-v", "0", "work"],
            &["-v", "41", "work"],
        ] {
            let err = parse(argv).unwrap_err();
            assert!(err.use_stderr(), "{argv:?}");
        }
    }

    #[test]
    fn exactly_one_profile() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["work", "home"]).is_err());
    }

    #[test]
    fn help_is_not_an_error_exit() {
        let err = parse(&["-h"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(!err.use_stderr());
    }

    #[test]
    fn command_line_overrides_settings() {
        let a = parse(&["-V", "--output-dir", "/tmp/paper", "--profiles-dir", "/p", "work"]).unwrap();
        let s = apply_overrides(Settings::default(), &a);
        assert!(!s.viewer);
        assert_eq!(s.output_dir, PathBuf::from("/tmp/paper"));
        assert_eq!(s.resolved_profiles_dir(), PathBuf::from("/p"));

        let a = parse(&["work"]).unwrap();
        let s = apply_overrides(Settings::default(), &a);
        assert!(s.viewer);
        assert_eq!(s.output_dir, PathBuf::from("."));
    }

    #[test]
    fn date_is_iso() {
        let d = today().unwrap();
        assert_eq!(d.len(), 10);
        assert_eq!(&d[4..5], "-");
    }
}
