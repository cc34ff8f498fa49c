//! `selfie setup`: downloads the landmark model files listed in a manifest.

use anyhow::{Context, Result};
use selfie_capture::Config;
use selfie_models::{verify_file_sha256, ModelFile, ModelIntegrityError, ModelManifest};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Determine the model directory.
///
/// `SELFIE_MODEL_DIR` wins. Otherwise root gets `/var/lib/selfie/models`
/// (system-wide) and everyone else the per-user data directory.
pub fn model_dir_for(config: &Config) -> PathBuf {
    if std::env::var_os("SELFIE_MODEL_DIR").is_none() && is_root() {
        PathBuf::from("/var/lib/selfie/models")
    } else {
        config.model_dir.clone()
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Counts bytes on their way to disk and prints progress in 10% steps.
struct Progress<W> {
    inner: W,
    total: Option<u64>,
    written: u64,
    shown: u64,
}

impl<W: Write> Write for Progress<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if let Some(total) = self.total.filter(|t| *t > 0) {
            let step = self.written * 10 / total;
            if step > self.shown {
                self.shown = step;
                print!("  {}%\r", step * 10);
                io::stdout().flush().ok();
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream one model into its staging file, then verify and install it.
fn fetch(model: &ModelFile, dir: &Path) -> Result<PathBuf> {
    match &model.size {
        Some(size) => println!("  fetching {} ({size})", model.name),
        None => println!("  fetching {}", model.name),
    }

    let response = ureq::get(model.url.as_str())
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;
    let total = response.body().content_length();

    let staged = model.staging_path(dir);
    let file = fs::File::create(&staged)
        .with_context(|| format!("failed to create {}", staged.display()))?;
    let mut out = Progress {
        inner: io::BufWriter::new(file),
        total,
        written: 0,
        shown: 0,
    };
    io::copy(&mut response.into_body().into_reader(), &mut out)
        .with_context(|| format!("download of {} interrupted", model.name))?;
    out.flush()?;
    drop(out);

    let installed = model
        .install_staged(dir)
        .with_context(|| format!("{} failed verification", model.name))?;
    println!("  installed {}", installed.display());
    Ok(installed)
}

/// Download every model in `manifest_path` that is missing or stale.
pub fn run(manifest_path: &Path, dir: &Path) -> Result<()> {
    let manifest = ModelManifest::load(manifest_path)?;

    println!("Model directory: {}", dir.display());
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut fetched = 0;
    for model in &manifest.models {
        match verify_file_sha256(&model.name, &model.path_in(dir), &model.sha256) {
            Ok(()) => {
                println!("  {} up to date", model.name);
                continue;
            }
            Err(ModelIntegrityError::MissingModel { .. }) => {}
            Err(ModelIntegrityError::ChecksumMismatch { .. }) => {
                println!("  {} is stale, replacing", model.name);
            }
            Err(e) => println!("  {} unreadable ({e}), replacing", model.name),
        }
        fetch(model, dir)?;
        fetched += 1;
    }

    let present = manifest.models.len() - fetched;
    println!();
    println!("Setup complete: {fetched} fetched, {present} already present.");
    Ok(())
}

/// Check every manifest entry without downloading.
pub fn verify(manifest_path: &Path, dir: &Path) -> Result<usize> {
    let manifest = ModelManifest::load(manifest_path)?;
    selfie_models::verify_models_dir(dir, &manifest)?;
    Ok(manifest.models.len())
}
