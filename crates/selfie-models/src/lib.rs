use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One landmark-model file: where to fetch it and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelFile {
    pub name: String,
    pub url: String,
    pub sha256: String,
    /// Human-readable size shown while downloading.
    #[serde(default)]
    pub size: Option<String>,
}

/// Set of model files the landmark detector needs.
///
/// ```toml
/// [[model]]
/// name = "face_landmark_68.bin"
/// url = "https://example.org/models/face_landmark_68.bin"
/// sha256 = "…64 hex chars…"
/// size = "350 KB"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    #[serde(rename = "model", default)]
    pub models: Vec<ModelFile>,
}

impl ModelFile {
    /// Installed location under `model_dir`.
    pub fn path_in(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.name)
    }

    /// Where a download is staged until its digest checks out.
    pub fn staging_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("{}.part", self.name))
    }

    /// Verify the staged download and move it into place. A staged file
    /// with the wrong digest is removed.
    pub fn install_staged(&self, model_dir: &Path) -> Result<PathBuf, ModelIntegrityError> {
        let staged = self.staging_path(model_dir);
        if let Err(e) = verify_file_sha256(&self.name, &staged, &self.sha256) {
            fs::remove_file(&staged).ok();
            return Err(e);
        }
        let dest = self.path_in(model_dir);
        fs::rename(&staged, &dest).map_err(|source| ModelIntegrityError::Install {
            path: dest.clone(),
            source,
        })?;
        Ok(dest)
    }
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("manifest lists no models")]
    Empty,

    #[error("invalid model name {0:?}: must be a plain file name")]
    InvalidName(String),

    #[error("invalid sha256 for {name}: {value:?}")]
    InvalidChecksum { name: String, value: String },
}

impl ModelManifest {
    pub fn from_toml_str(s: &str) -> Result<Self, ManifestError> {
        let manifest: ModelManifest = toml::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.models.is_empty() {
            return Err(ManifestError::Empty);
        }
        for model in &self.models {
            let plain = Path::new(&model.name)
                .file_name()
                .and_then(|f| f.to_str())
                .map(|f| f == model.name)
                .unwrap_or(false);
            if !plain {
                return Err(ManifestError::InvalidName(model.name.clone()));
            }
            let hex = model.sha256.len() == 64
                && model.sha256.chars().all(|c| c.is_ascii_hexdigit());
            if !hex {
                return Err(ManifestError::InvalidChecksum {
                    name: model.name.clone(),
                    value: model.sha256.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install model file: {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 hex digest of an in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Verify every manifest entry exists under `model_dir` with the listed digest.
pub fn verify_models_dir(
    model_dir: &Path,
    manifest: &ModelManifest,
) -> Result<(), ModelIntegrityError> {
    for model in &manifest.models {
        let path = model_dir.join(&model.name);
        verify_file_sha256(&model.name, &path, &model.sha256)?;
    }

    Ok(())
}
