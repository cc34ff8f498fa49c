//! Landmark detector contract.
//!
//! The concrete model runtime lives outside this crate. The controller only
//! needs to load it once and ask for the eye and nose landmarks of the most
//! prominent face in a frame.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use selfie_core::FaceLandmarks;
use selfie_hw::Frame;
use selfie_models::{ManifestError, ModelIntegrityError, ModelManifest};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("model integrity: {0}")]
    Integrity(#[from] ModelIntegrityError),
    #[error("landmark model failed to load: {0}")]
    Load(String),
    #[error("landmark model not loaded")]
    NotLoaded,
    #[error("landmark inference failed: {0}")]
    Inference(String),
}

#[async_trait]
pub trait LandmarkDetector: Send + Sync {
    /// Load the landmark model. Called once per session, concurrently with
    /// camera acquisition.
    async fn load(&self) -> Result<(), DetectorError>;

    /// Landmarks of the single most prominent face, or `None`.
    async fn detect(&self, frame: &Frame) -> Result<Option<FaceLandmarks>, DetectorError>;
}

/// Check every file listed in `manifest_path` against `model_dir`.
///
/// Runs on the blocking pool; model files can be large.
pub async fn verify_model_files(
    model_dir: &Path,
    manifest_path: &Path,
) -> Result<(), DetectorError> {
    let model_dir: PathBuf = model_dir.to_path_buf();
    let manifest_path: PathBuf = manifest_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let manifest = ModelManifest::load(&manifest_path)?;
        selfie_models::verify_models_dir(&model_dir, &manifest)?;
        tracing::debug!(
            models = manifest.models.len(),
            dir = %model_dir.display(),
            "model files verified"
        );
        Ok(())
    })
    .await
    .map_err(|e| DetectorError::Load(format!("model verification task failed: {e}")))?
}
