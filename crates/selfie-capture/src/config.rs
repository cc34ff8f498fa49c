use std::path::PathBuf;
use std::time::Duration;

use selfie_core::{CalibrationConfig, ChallengeConfig, PoseConfig, PreviewOrientation};
use selfie_hw::{FormFactor, PlaybackConfig, WatchdogConfig};

/// Capture configuration, loaded from environment variables.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    /// Device class; handheld requests the front camera at 1280x720.
    pub form_factor: FormFactor,
    /// Pose sampling period.
    pub pose_interval: Duration,
    /// Consecutive face-present ticks before calibration starts.
    pub face_gate_ticks: u32,
    pub pose: PoseConfig,
    pub calibration: CalibrationConfig,
    pub challenge: ChallengeConfig,
    pub playback: PlaybackConfig,
    pub watchdog: WatchdogConfig,
    /// Delay between verification and the still being grabbed.
    pub capture_grace: Duration,
    /// JPEG quality for committed stills (1-100).
    pub jpeg_quality: u8,
    /// Directory holding the landmark model files.
    pub model_dir: PathBuf,
    /// Manifest checked against `model_dir` before the detector loads.
    /// `None` skips the check.
    pub model_manifest: Option<PathBuf>,
    /// SQLite database backing the avatar store.
    pub db_path: PathBuf,
    /// Prefix for public avatar references.
    pub public_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            form_factor: FormFactor::Desktop,
            pose_interval: Duration::from_millis(300),
            face_gate_ticks: 6,
            pose: PoseConfig::default(),
            calibration: CalibrationConfig::default(),
            challenge: ChallengeConfig::default(),
            playback: PlaybackConfig::default(),
            watchdog: WatchdogConfig::default(),
            capture_grace: Duration::from_secs(1),
            jpeg_quality: 90,
            model_dir: data_dir.join("models"),
            model_manifest: None,
            db_path: data_dir.join("avatars.db"),
            public_base_url: "selfie://avatars".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `SELFIE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let form_factor = match std::env::var("SELFIE_FORM_FACTOR").as_deref() {
            Ok("handheld") => FormFactor::Handheld,
            Ok("desktop") => FormFactor::Desktop,
            Ok(other) => {
                tracing::warn!(value = other, "unknown SELFIE_FORM_FACTOR, using desktop");
                FormFactor::Desktop
            }
            Err(_) => defaults.form_factor,
        };

        let preview = if env_bool("SELFIE_MIRRORED_PREVIEW", true) {
            PreviewOrientation::Mirrored
        } else {
            PreviewOrientation::Raw
        };

        let model_dir = std::env::var("SELFIE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let model_manifest = std::env::var("SELFIE_MODEL_MANIFEST")
            .map(PathBuf::from)
            .ok();

        let db_path = std::env::var("SELFIE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        Self {
            form_factor,
            pose_interval: Duration::from_millis(env_u64("SELFIE_POSE_INTERVAL_MS", 300)),
            face_gate_ticks: defaults.face_gate_ticks,
            pose: PoseConfig {
                yaw_scale: env_f32("SELFIE_YAW_SCALE", defaults.pose.yaw_scale),
            },
            calibration: CalibrationConfig {
                threshold_deg: env_f32(
                    "SELFIE_CALIBRATION_THRESHOLD_DEG",
                    defaults.calibration.threshold_deg,
                ),
                preview,
                ..defaults.calibration
            },
            challenge: ChallengeConfig {
                nod_threshold: env_f32("SELFIE_NOD_THRESHOLD", defaults.challenge.nod_threshold),
                stall_timeout: Duration::from_secs(env_u64("SELFIE_CHALLENGE_TIMEOUT_SECS", 30)),
                ..defaults.challenge
            },
            playback: PlaybackConfig {
                frame_timeout: Duration::from_millis(env_u64("SELFIE_FRAME_TIMEOUT_MS", 4500)),
                ..defaults.playback
            },
            watchdog: WatchdogConfig {
                max_restarts: env_u32("SELFIE_MAX_RESTARTS", defaults.watchdog.max_restarts),
                ..defaults.watchdog
            },
            capture_grace: defaults.capture_grace,
            jpeg_quality: env_u64("SELFIE_JPEG_QUALITY", 90).clamp(1, 100) as u8,
            model_dir,
            model_manifest,
            db_path,
            public_base_url: std::env::var("SELFIE_PUBLIC_BASE_URL")
                .unwrap_or(defaults.public_base_url),
        }
    }

    pub fn preview(&self) -> PreviewOrientation {
        self.calibration.preview
    }
}

/// `$XDG_DATA_HOME/selfie`, falling back to `~/.local/share/selfie`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("selfie")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
