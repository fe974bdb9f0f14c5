mod archive;
mod cmd;
mod config;
mod envdiff;
mod error;
mod export;
mod layout;
mod pdf;
mod pipeline;
mod preflight;
mod profile;
mod qr;
mod render;
mod scratch;
mod transport;
mod verify;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// duply-paper — Print a duply profile as verified QR codes on paper.
///
/// Exports the profile's GPG keys, packs them with a minimal config into a
/// deterministic tar archive and lays it out as QR codes on A4 pages.  The
/// PDF is scanned back in-process and only kept when the decoded archive
/// matches the original checksum.
///
/// Restore: scan the pages, decode as printed in the footer, then
/// `tar -x -C ~/.duply`.
#[derive(Parser, Debug)]
#[command(author, about, long_about = None, disable_version_flag = true)]
struct Cli {
    #[command(flatten)]
    args: cmd::BackupArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Usage errors exit 1 like every other failure; help exits 0.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let code = if e.use_stderr() { 1 } else { 0 };
        let _ = e.print();
        std::process::exit(code);
    });
    cmd::run(cli.args)
}
