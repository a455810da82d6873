use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use rollcall_core::{Decision, Denial, LivenessMode, VerifyConfig};

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::rate_limiter::RateLimiter;
use crate::store::RollcallStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: RollcallStore,
    pub rate_limiter: RateLimiter,
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
pub struct RollcallService {
    pub state: Arc<Mutex<AppState>>,
}

/// Round to two decimals for display; raw distances stay internal.
fn round2(v: f32) -> f64 {
    (f64::from(v) * 100.0).round() / 100.0
}

/// Serialize a pipeline decision into the JSON payload handed to clients.
/// Every payload carries `recorded` plus a human-readable `message`.
fn decision_payload(decision: &Decision, config: &VerifyConfig) -> serde_json::Value {
    let threshold = round2(config.distance_tolerance * 100.0);
    match decision {
        Decision::Recorded {
            record,
            blinks_detected,
        } => serde_json::json!({
            "recorded": true,
            "message": "Attendance marked successfully!",
            "confidence": round2(record.confidence),
            "threshold": threshold,
            "blinks_detected": blinks_detected,
            "date": record.date.to_string(),
            "time": record.time.format("%H:%M:%S").to_string(),
        }),
        Decision::Denied(denial) => match denial {
            Denial::AlreadyMarked => serde_json::json!({
                "recorded": false,
                "message": "Attendance already marked today",
            }),
            Denial::NotEnrolled => serde_json::json!({
                "recorded": false,
                "message": "Identity not enrolled",
            }),
            Denial::LivenessFailed {
                blinks_observed,
                blinks_required,
            } => serde_json::json!({
                "recorded": false,
                "message": format!(
                    "Insufficient blinks detected ({blinks_observed}/{blinks_required})"
                ),
                "blinks_detected": blinks_observed,
                "blinks_required": blinks_required,
            }),
            Denial::NoFaceDetected => serde_json::json!({
                "recorded": false,
                "message": "No face detected in image",
            }),
            Denial::FaceMismatch {
                confidence_percent, ..
            } => serde_json::json!({
                "recorded": false,
                "message": "Face verification failed",
                "confidence": round2(*confidence_percent),
                "threshold": threshold,
            }),
        },
    }
}

/// The status reply, built from already-fetched counters so the handler can
/// propagate store errors instead of defaulting them away.
fn status_payload(enrolled: u64, attended_today: u64, config: &Config) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "identities_enrolled": enrolled,
        "attended_today": attended_today,
        "distance_tolerance": config.distance_tolerance,
        "ear_threshold": config.ear_threshold,
        "required_blinks": config.required_blinks,
    })
}

impl RollcallService {
    /// Shared body of the two attendance methods: rate-limit check, engine
    /// attempt, rate-limit bookkeeping, payload serialization.
    async fn run_mark(
        &self,
        reference: &str,
        frames: Vec<Vec<u8>>,
        mode: LivenessMode,
    ) -> zbus::fdo::Result<String> {
        // Rate limit check
        {
            let mut state = self.state.lock().await;
            state.rate_limiter.check(reference).map_err(|remaining| {
                tracing::warn!(reference, remaining_secs = remaining.as_secs(), "attempt rate limited");
                zbus::fdo::Error::Failed(format!(
                    "too many failed attempts; try again in {}s",
                    remaining.as_secs()
                ))
            })?;
        }

        // Copy what the engine needs, then release the lock for the attempt
        let (engine, config) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.config.verify_config())
        };

        let decision = engine
            .mark(reference.to_string(), frames, mode, config)
            .await
            .map_err(|e| {
                tracing::error!(reference, error = %e, "attendance attempt failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        // Rate-limit bookkeeping: infrastructure errors returned above never
        // reach this point, so the limiter only ever sees verdicts.
        {
            let mut state = self.state.lock().await;
            state.rate_limiter.observe(reference, &decision);
        }

        tracing::info!(
            reference,
            recorded = matches!(decision, Decision::Recorded { .. }),
            "attendance attempt complete"
        );

        Ok(decision_payload(&decision, &config).to_string())
    }
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity from a single face image.
    ///
    /// Returns the UUID of the newly enrolled identity.
    async fn enroll(
        &self,
        name: &str,
        reference: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, reference, "enroll requested");

        let engine = {
            let state = self.state.lock().await;
            state.engine.clone()
        };

        // Extract on the engine thread (no lock held)
        let embedding = engine.enroll(image).await.map_err(|e| {
            tracing::error!(reference, error = %e, "enroll failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        let state = self.state.lock().await;
        let id = state
            .store
            .enroll(name, reference, &embedding)
            .await
            .map_err(|e| {
                tracing::error!(reference, error = %e, "enroll: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        tracing::info!(id = %id, name, reference, "enrolled successfully");
        Ok(id)
    }

    /// Run a single-frame attendance attempt (eyes-closed liveness only).
    ///
    /// Returns a JSON decision payload.
    async fn mark_attendance(&self, reference: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(reference, "single-frame attendance requested");
        self.run_mark(reference, vec![image], LivenessMode::SingleFrame)
            .await
    }

    /// Run a multi-frame attendance attempt with blink-count liveness.
    ///
    /// `frames` must be in capture order; the last frame is the one matched.
    /// Returns a JSON decision payload.
    async fn mark_attendance_sequence(
        &self,
        reference: &str,
        frames: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(reference, frames = frames.len(), "sequence attendance requested");
        self.run_mark(reference, frames, LivenessMode::FrameSequence)
            .await
    }

    /// Attendance history for an identity as JSON, most recent first.
    async fn history(&self, reference: &str, limit: u32) -> zbus::fdo::Result<String> {
        tracing::info!(reference, limit, "history requested");
        let state = self.state.lock().await;
        let entries = state
            .store
            .history(reference, limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&entries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Everyone who attended on a date (`YYYY-MM-DD`, empty = today) as JSON.
    async fn daily_report(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            chrono::Local::now().date_naive().to_string()
        } else {
            date.parse::<chrono::NaiveDate>()
                .map_err(|_| {
                    zbus::fdo::Error::InvalidArgs(format!("invalid date '{date}' (want YYYY-MM-DD)"))
                })?
                .to_string()
        };
        tracing::info!(%date, "daily report requested");

        let state = self.state.lock().await;
        let rows = state
            .store
            .daily_report(&date)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&rows).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// List enrolled identities as JSON (metadata only).
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let identities = state
            .store
            .list_identities()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove an enrolled identity and its attendance history.
    async fn remove_identity(&self, reference: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(reference, "remove_identity requested");
        let state = self.state.lock().await;
        let removed = state
            .store
            .remove_identity(reference)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(reference, "identity removed");
        } else {
            tracing::warn!(reference, "identity not found");
        }
        Ok(removed)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let enrolled = state
            .store
            .count_identities()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let today = chrono::Local::now().date_naive().to_string();
        let attended_today = state
            .store
            .count_attendance_on(&today)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(status_payload(enrolled, attended_today, &state.config).to_string())
    }
}
