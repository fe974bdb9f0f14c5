//! The paper backup pipeline.
//!
//! ```text
//! resolve profile ─▶ scratch ─▶ export keys ─▶ env diff ─▶ select files
//!   ─▶ archive (+checksum) ─▶ symbols ─▶ layout ─▶ render ─▶ verify
//!   ─▶ pass: move PDF to output dir / fail: keep composite scan image
//! ```
//!
//! Every outside effect goes through an injected collaborator, so tests run
//! the whole chain with fakes for the export tool and the shell.  Nothing is
//! created on disk before the profile has been found.

use std::path::PathBuf;

use tracing::debug;

use crate::archive::{self, ChecksumFn};
use crate::config::{Columns, SymbolVersion};
use crate::envdiff::{self, ConfigLoader, EnvPolicy};
use crate::error::{PaperError, Result};
use crate::export::{refresh_keys, Exporter};
use crate::layout::{layout, RecipeInfo};
use crate::profile::{select_bundle, FileRole, Profile, RoleMatcher};
use crate::render::Renderer;
use crate::scratch::{write_private, Scratch};
use crate::transport::{encode_archive, SymbolCodec};
use crate::verify::{Compositor, Rasterizer, Verifier};

/// What to back up and how.
#[derive(Debug, Clone)]
pub struct Request {
    /// Profile name, or a path to the profile directory.
    pub profile: String,
    pub profiles_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Parent of the scratch directory (system temp dir if `None`).
    pub scratch_root: Option<PathBuf>,
    pub include_public_keys: bool,
    pub compress: bool,
    pub columns: Columns,
    pub version: SymbolVersion,
    /// Date printed in the page header.
    pub created: String,
    pub matcher: RoleMatcher,
    pub env_policy: EnvPolicy,
}

/// The outside world, one capability per stage.
pub struct Collaborators<'a> {
    pub exporter: &'a dyn Exporter,
    pub config_loader: &'a dyn ConfigLoader,
    pub codec: &'a dyn SymbolCodec,
    pub renderer: &'a dyn Renderer,
    pub rasterizer: &'a dyn Rasterizer,
    pub compositor: &'a dyn Compositor,
    pub checksum: ChecksumFn,
}

/// A verified paper backup.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub profile: String,
    /// Final document in the output directory.
    pub document: PathBuf,
    pub checksum: String,
    pub archive_bytes: usize,
    pub compressed: bool,
    pub config_vars: usize,
    pub symbols: usize,
    pub pages: usize,
}

pub fn document_name(profile: &str) -> String {
    format!("{profile}-duply-profile.pdf")
}

pub fn failed_scan_name(profile: &str) -> String {
    format!("{profile}-duply-profile-failed.png")
}

/// Run the pipeline once.  Scratch storage is gone when this returns,
/// whatever the result.
pub fn run(req: &Request, with: &Collaborators<'_>) -> Result<Outcome> {
    let profile = Profile::resolve(&req.profiles_dir, &req.profile)?;
    let scratch = Scratch::new(req.scratch_root.as_deref())?;
    eprintln!("paper: profile '{}' at {}", profile.name, profile.dir.display());

    // Keys
    refresh_keys(with.exporter, &profile, &req.matcher)?;
    eprintln!("paper: exported keys");

    // Minimal config
    let (before, after) = with.config_loader.snapshots(&profile.conf_path())?;
    let vars = envdiff::diff(&before, &after, &req.env_policy);
    debug!(vars = ?vars.keys().collect::<Vec<_>>(), "minimal config variables");
    let minimal = envdiff::render_minimal_config(&profile.name, &vars);

    // Archive
    let bundle = select_bundle(&profile, &req.matcher, req.include_public_keys, minimal)?;
    let archive = archive::build(&bundle, req.compress, with.checksum)?;
    eprintln!(
        "paper: archive {} ({} bytes, {} secret / {} public key files, {} config variables), sha256 {}",
        archive.file_name(&profile.name),
        archive.len(),
        bundle.count(FileRole::SecretKey),
        bundle.count(FileRole::PublicKey),
        vars.len(),
        archive.checksum()
    );

    // Symbols and layout
    let symbols = encode_archive(with.codec, archive.bytes(), req.version)?;
    let info = RecipeInfo {
        profile: profile.name.clone(),
        compressed: archive.compressed(),
        checksum: archive.checksum().to_string(),
        created: req.created.clone(),
    };
    let page_layout = layout(&symbols, req.columns, info);
    let description = scratch.file("layout.txt");
    write_private(&description, page_layout.to_string().as_bytes())?;
    debug!(path = %description.display(), "wrote page description");
    eprintln!(
        "paper: {} QR codes (version {}, EC {}) on {} page(s), {} per row",
        symbols.len(),
        symbols.version,
        symbols.ec_level,
        page_layout.pages.len(),
        req.columns.get()
    );

    // Render
    let rendered = scratch.file("document.pdf");
    with.renderer.render(&page_layout, &symbols, &rendered)?;

    // Verify
    let verifier = Verifier {
        rasterizer: with.rasterizer,
        compositor: with.compositor,
        codec: with.codec,
        checksum: with.checksum,
    };
    let result = verifier.verify(&rendered, archive.checksum(), scratch.path())?;
    if !result.passed {
        let kept = scratch.preserve(
            &result.composite,
            &req.output_dir.join(failed_scan_name(&profile.name)),
        )?;
        if let Some(reason) = &result.failure {
            eprintln!("paper: scan decoded nothing: {reason}");
        }
        eprintln!("paper: verification FAILED, scan image kept at {}", kept.display());
        return Err(PaperError::VerificationMismatch {
            expected: result.expected,
            actual: result.actual,
            preserved: kept,
        });
    }
    eprintln!("paper: verified scan round trip (sha256 {})", archive.checksum());

    let document = scratch.preserve(&rendered, &req.output_dir.join(document_name(&profile.name)))?;
    eprintln!("paper: wrote {}", document.display());

    Ok(Outcome {
        profile: profile.name,
        document,
        checksum: archive.checksum().to_string(),
        archive_bytes: archive.len(),
        compressed: archive.compressed(),
        config_vars: vars.len(),
        symbols: symbols.len(),
        pages: page_layout.pages.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::sha256_hex;
    use crate::config::FileRules;
    use crate::envdiff::EnvSnapshot;
    use crate::pdf;
    use crate::qr::QrCodec;
    use crate::render::{RasterRenderer, MAX_DPI};
    use crate::verify::{PdfRasterizer, StackCompositor};
    use image::{GrayImage, Luma};
    use std::cell::Cell;
    use std::fs;
    use std::path::Path;

    const KEY_ID: &str = "AB12CD34";

    /// Stands in for `duply <profile> status`: writes the key files.
    struct FakeExporter {
        secret: Vec<u8>,
        public: Vec<u8>,
        calls: Cell<usize>,
    }

    impl FakeExporter {
        fn new(secret: Vec<u8>) -> Self {
            Self {
                secret,
                public: armored("PUBLIC", 512),
                calls: Cell::new(0),
            }
        }
    }

    impl Exporter for FakeExporter {
        fn export(&self, profile: &Profile) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if !self.secret.is_empty() {
                fs::write(profile.dir.join(format!("gpgkey.{KEY_ID}.sec.asc")), &self.secret)?;
            }
            fs::write(profile.dir.join(format!("gpgkey.{KEY_ID}.asc")), &self.public)?;
            Ok(())
        }
    }

    struct FailingExporter;

    impl Exporter for FailingExporter {
        fn export(&self, _profile: &Profile) -> Result<()> {
            Err(PaperError::Export("duply exited with status 1".into()))
        }
    }

    /// Sourcing `conf` defines the profile settings plus some shell noise.
    struct FakeLoader;

    impl ConfigLoader for FakeLoader {
        fn snapshots(&self, _conf: &Path) -> Result<(EnvSnapshot, EnvSnapshot)> {
            let before: EnvSnapshot = [("PATH", "/usr/bin"), ("HOME", "/home/me")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let mut after = before.clone();
            after.insert("GPG_KEY".into(), KEY_ID.into());
            after.insert("TARGET".into(), "sftp://backup@host/work".into());
            after.insert("PWD".into(), "/home/me/.duply/work".into());
            Ok((before, after))
        }
    }

    /// Drops every mark on the way through the scanner.
    struct BlankScanner;

    impl Rasterizer for BlankScanner {
        fn rasterize(&self, document: &Path, work_dir: &Path) -> Result<Vec<GrayImage>> {
            let mut pages = PdfRasterizer.rasterize(document, work_dir)?;
            for page in &mut pages {
                for px in page.pixels_mut() {
                    *px = Luma([255u8]);
                }
            }
            Ok(pages)
        }
    }

    /// ASCII-armored looking block of about `len` bytes.
    fn armored(kind: &str, len: usize) -> Vec<u8> {
        let mut s = format!("-----BEGIN PGP {kind} KEY BLOCK-----\n\n");
        while s.len() < len {
            s.push_str("mQINBGVx2Q0BEADQ7pJ1nT0a3cS4kq8y9Xg2HvWl5aPq1ZzYw3uB6fD0tRr8LmKs\n");
        }
        s.push_str(&format!("-----END PGP {kind} KEY BLOCK-----\n"));
        s.into_bytes()
    }

    /// Incompressible bytes of length `len`.
    fn noise(len: usize) -> Vec<u8> {
        let mut x: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 24) as u8
            })
            .collect()
    }

    struct Fixture {
        _root: tempfile::TempDir,
        profiles: PathBuf,
        output: PathBuf,
        scratch: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let profiles = root.path().join("profiles");
            let work = profiles.join("work");
            fs::create_dir_all(&work).unwrap();
            fs::write(work.join("conf"), "GPG_KEY='AB12CD34'\nTARGET='sftp://backup@host/work'\n")
                .unwrap();
            fs::write(work.join("exclude"), "- **/.cache\n").unwrap();
            fs::write(work.join("pre"), "#!/bin/sh\n").unwrap();
            let output = root.path().join("out");
            let scratch = root.path().join("tmp");
            fs::create_dir_all(&scratch).unwrap();
            Self {
                profiles,
                output,
                scratch,
                _root: root,
            }
        }

        fn request(&self, profile: &str) -> Request {
            Request {
                profile: profile.into(),
                profiles_dir: self.profiles.clone(),
                output_dir: self.output.clone(),
                scratch_root: Some(self.scratch.clone()),
                include_public_keys: false,
                compress: true,
                columns: Columns::default(),
                version: SymbolVersion::default(),
                created: "2026-10-19".into(),
                matcher: RoleMatcher::new(&FileRules::default()).unwrap(),
                env_policy: EnvPolicy::new(&[]).unwrap(),
            }
        }

        fn scratch_is_empty(&self) -> bool {
            fs::read_dir(&self.scratch).unwrap().next().is_none()
        }

        fn output_files(&self) -> Vec<String> {
            match fs::read_dir(&self.output) {
                Ok(rd) => {
                    let mut names: Vec<String> = rd
                        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                        .collect();
                    names.sort();
                    names
                }
                Err(_) => Vec::new(),
            }
        }
    }

    fn collaborators<'a>(
        exporter: &'a dyn Exporter,
        rasterizer: &'a dyn Rasterizer,
    ) -> Collaborators<'a> {
        Collaborators {
            exporter,
            config_loader: &FakeLoader,
            codec: &QrCodec,
            renderer: &RasterRenderer { dpi: 150 },
            rasterizer,
            compositor: &StackCompositor,
            checksum: sha256_hex,
        }
    }

    #[test]
    fn default_run_produces_verified_single_page() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        let out = run(&fx.request("work"), &collaborators(&exporter, &PdfRasterizer)).unwrap();

        assert!(out.compressed);
        assert!((1..=2).contains(&out.symbols), "{} symbols", out.symbols);
        assert_eq!(out.pages, 1);
        assert_eq!(out.config_vars, 2);
        assert_eq!(out.document, fx.output.join("work-duply-profile.pdf"));
        assert!(fs::read(&out.document).unwrap().starts_with(b"%PDF-1.4"));
        assert_eq!(fx.output_files(), vec!["work-duply-profile.pdf"]);
        assert!(fx.scratch_is_empty());
        assert_eq!(exporter.calls.get(), 1);
    }

    #[test]
    fn incompressible_keys_verify_at_default_settings() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(noise(2048));
        let out = run(&fx.request("work"), &collaborators(&exporter, &PdfRasterizer)).unwrap();

        assert!(out.symbols >= 8, "{} symbols", out.symbols);
        assert!(out.pages > 1);
        let dpi = pdf::resolution(&fs::read(&out.document).unwrap()).unwrap();
        assert!(dpi > 150, "{dpi} dpi");
        assert_eq!(fx.output_files(), vec!["work-duply-profile.pdf"]);
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn densest_grid_verifies() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(noise(2048));
        let mut req = fx.request("work");
        req.columns = Columns::new(3).unwrap();
        req.version = SymbolVersion::new(40).unwrap();
        let out = run(&req, &collaborators(&exporter, &PdfRasterizer)).unwrap();

        assert_eq!(out.pages, 1);
        let dpi = pdf::resolution(&fs::read(&out.document).unwrap()).unwrap();
        assert!(dpi <= MAX_DPI, "{dpi} dpi");
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn uncompressed_run_with_public_keys_is_larger() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        let small = run(&fx.request("work"), &collaborators(&exporter, &PdfRasterizer)).unwrap();

        let mut req = fx.request("work");
        req.compress = false;
        req.include_public_keys = true;
        req.version = SymbolVersion::new(30).unwrap();
        let big = run(&req, &collaborators(&exporter, &PdfRasterizer)).unwrap();

        assert!(!big.compressed);
        assert!(big.archive_bytes > small.archive_bytes);
        assert!(big.symbols > small.symbols);
        assert_ne!(big.checksum, small.checksum);
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn uncompressed_recipe_says_so() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        let profile = Profile::resolve(&fx.profiles, "work").unwrap();
        exporter.export(&profile).unwrap();

        let mut req = fx.request("work");
        req.compress = false;
        req.include_public_keys = true;
        let bundle = select_bundle(
            &profile,
            &req.matcher,
            req.include_public_keys,
            zeroize::Zeroizing::new(String::new()),
        )
        .unwrap();
        assert_eq!(bundle.count(FileRole::PublicKey), 1);
        let a = archive::build(&bundle, req.compress, sha256_hex).unwrap();
        let seq = encode_archive(&QrCodec, a.bytes(), SymbolVersion::new(30).unwrap()).unwrap();
        let info = RecipeInfo {
            profile: "work".into(),
            compressed: a.compressed(),
            checksum: a.checksum().into(),
            created: req.created.clone(),
        };
        let l = layout(&seq, req.columns, info);
        assert!(l.recipe.iter().any(|line| line.contains("no compression")));
        assert!(l.recipe.iter().any(|line| line.contains("+0+0")));
    }

    #[test]
    fn oversized_key_fails_without_output() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(noise(8192));
        let err = run(&fx.request("work"), &collaborators(&exporter, &PdfRasterizer)).unwrap_err();
        match err {
            PaperError::CapacityExceeded {
                version,
                needed,
                limit,
            } => {
                assert_eq!(version, 20);
                assert!(needed >= limit);
            }
            other => panic!("expected CapacityExceeded, got {other}"),
        }
        assert!(fx.output_files().is_empty());
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn unknown_profile_touches_nothing() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        let err = run(&fx.request("nope"), &collaborators(&exporter, &PdfRasterizer)).unwrap_err();
        assert!(matches!(err, PaperError::ProfileNotFound { .. }));
        assert_eq!(exporter.calls.get(), 0);
        assert!(fx.scratch_is_empty());
        assert!(!fx.output.exists());
    }

    #[test]
    fn failed_scan_is_a_mismatch_and_keeps_the_image() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        let err = run(&fx.request("work"), &collaborators(&exporter, &BlankScanner)).unwrap_err();
        match err {
            PaperError::VerificationMismatch {
                expected,
                actual,
                preserved,
            } => {
                assert_eq!(expected.len(), 64);
                assert!(actual.is_none());
                assert_eq!(preserved, fx.output.join("work-duply-profile-failed.png"));
                assert!(preserved.is_file());
            }
            other => panic!("expected VerificationMismatch, got {other}"),
        }
        assert_eq!(fx.output_files(), vec!["work-duply-profile-failed.png"]);
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn export_failure_stops_before_archive() {
        let fx = Fixture::new();
        let err = run(&fx.request("work"), &collaborators(&FailingExporter, &PdfRasterizer))
            .unwrap_err();
        assert!(matches!(err, PaperError::Export(_)));
        assert!(fx.output_files().is_empty());
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn export_without_secret_key_fails() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(Vec::new());
        let err = run(&fx.request("work"), &collaborators(&exporter, &PdfRasterizer)).unwrap_err();
        assert!(matches!(err, PaperError::Export(_)));
        assert!(fx.scratch_is_empty());
    }

    #[test]
    fn every_column_count_verifies() {
        let fx = Fixture::new();
        let exporter = FakeExporter::new(armored("PRIVATE", 2048));
        for c in 1..=3 {
            let mut req = fx.request("work");
            req.columns = Columns::new(c).unwrap();
            req.version = SymbolVersion::new(8).unwrap();
            let out = run(&req, &collaborators(&exporter, &PdfRasterizer)).unwrap();
            assert!(out.symbols > 1);
        }
    }
}
