use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::{
    VerifyConfig, DEFAULT_DISTANCE_TOLERANCE, DEFAULT_EAR_THRESHOLD, DEFAULT_REQUIRED_BLINKS,
};

use crate::rate_limiter::RateLimits;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum embedding distance accepted as a match.
    pub distance_tolerance: f32,
    /// EAR threshold below which an eye counts as closed.
    pub ear_threshold: f32,
    /// Blinks required for multi-frame liveness.
    pub required_blinks: u32,
    /// Deliberate failures tolerated per identity before lockout.
    pub max_failures: u32,
    /// Sliding window (seconds) over which failures are counted.
    pub failure_window_secs: u64,
    /// Lockout duration (seconds) after too many failures.
    pub lockout_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            model_dir,
            db_path,
            distance_tolerance: env_f32("ROLLCALL_DISTANCE_TOLERANCE", DEFAULT_DISTANCE_TOLERANCE),
            ear_threshold: env_f32("ROLLCALL_EAR_THRESHOLD", DEFAULT_EAR_THRESHOLD),
            required_blinks: env_u32("ROLLCALL_REQUIRED_BLINKS", DEFAULT_REQUIRED_BLINKS),
            max_failures: env_u32("ROLLCALL_MAX_FAILURES", 5),
            failure_window_secs: env_u64("ROLLCALL_FAILURE_WINDOW_SECS", 60),
            lockout_secs: env_u64("ROLLCALL_LOCKOUT_SECS", 300),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS").is_ok(),
        }
    }

    /// The throttling parameters handed to the rate limiter.
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            max_failures: self.max_failures,
            window: Duration::from_secs(self.failure_window_secs),
            lockout: Duration::from_secs(self.lockout_secs),
        }
    }

    /// The verification thresholds handed to the pipeline per attempt.
    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            distance_tolerance: self.distance_tolerance,
            ear_threshold: self.ear_threshold,
            required_blinks: self.required_blinks,
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_models::DETECTOR_MODEL)
    }

    /// Path to the face mesh landmark model.
    pub fn mesh_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_models::MESH_MODEL)
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_models::EMBEDDER_MODEL)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
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

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
