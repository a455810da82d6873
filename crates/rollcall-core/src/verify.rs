//! The verification orchestrator: one attendance attempt end to end.
//!
//! Per attempt the gates run in a fixed, fail-fast order:
//!
//! ```text
//! Start → DuplicateCheck → LivenessGate → MatchGate → Recorded | Denied
//! ```
//!
//! Liveness runs before the match because it is cheaper (landmarks only, no
//! embedding). Every denial is terminal for the attempt and carries enough
//! diagnostics for the caller to explain it; nothing is retried internally —
//! a retry is a fresh attempt with fresh images.

use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

use crate::extractor::{ExtractError, FaceExtractor};
use crate::liveness::{self, BlinkReport, MIN_SEQUENCE_FRAMES};
use crate::matcher::{self, FaceEmbedding};

/// Thresholds for one verification attempt. All derive from the external
/// configuration surface; the multi-frame minimum is fixed at
/// [`MIN_SEQUENCE_FRAMES`] and intentionally not configurable.
#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    /// Maximum embedding distance accepted as a match.
    pub distance_tolerance: f32,
    /// EAR below this means "eye closed".
    pub ear_threshold: f32,
    /// Blinks required for multi-frame liveness.
    pub required_blinks: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            distance_tolerance: matcher::DEFAULT_DISTANCE_TOLERANCE,
            ear_threshold: liveness::DEFAULT_EAR_THRESHOLD,
            required_blinks: liveness::DEFAULT_REQUIRED_BLINKS,
        }
    }
}

/// How the caller wants liveness judged for this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessMode {
    /// One frame, eyes-closed check only. Weak evidence.
    SingleFrame,
    /// Ordered frame sequence with blink counting. Requires at least
    /// [`MIN_SEQUENCE_FRAMES`] frames.
    FrameSequence,
}

/// The attendance event produced by a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub confidence: f32,
}

/// Result of the store's attendance write. The store enforces uniqueness on
/// (identity, date); a constraint hit must come back as `Duplicate` rather
/// than an error so a lost check-then-act race still yields a clean denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
}

/// External store failure, propagated as-is — the pipeline never retries.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct StorageError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl StorageError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

/// The identity/attendance store the orchestrator consults. Implementations
/// live outside the pipeline (SQLite in the daemon, mocks in tests).
pub trait AttendanceStore {
    /// The enrolled embedding for an identity, if any.
    fn stored_embedding(&self, identity: &str) -> Result<Option<FaceEmbedding>, StorageError>;

    /// Whether an attendance event already exists for (identity, date).
    fn has_attendance_on(&self, identity: &str, date: NaiveDate) -> Result<bool, StorageError>;

    /// Persist one attendance event. Must report a uniqueness-constraint hit
    /// as [`RecordOutcome::Duplicate`].
    fn record_attendance(&self, record: &AttendanceRecord) -> Result<RecordOutcome, StorageError>;
}

/// Why an attempt was denied. Terminal; carries the diagnostics the caller
/// surfaces to the end user.
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    /// An attendance event already exists for this identity today.
    AlreadyMarked,
    /// The identity has no stored embedding to verify against.
    NotEnrolled,
    /// Blink requirement not met.
    LivenessFailed {
        blinks_observed: u32,
        blinks_required: u32,
    },
    /// No usable face in the image the match gate ran on.
    NoFaceDetected,
    /// Embedding distance/confidence outside the acceptance policy.
    FaceMismatch {
        confidence_percent: f32,
        distance: f32,
    },
}

/// Final outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Recorded {
        record: AttendanceRecord,
        blinks_detected: u32,
    },
    Denied(Denial),
}

/// Failures that are *not* verdicts: caller/configuration errors and
/// infrastructure problems. Distinct from [`Denial`] so callers can tell
/// "the face did not pass" from "the attempt could not run".
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("multi-frame liveness requires at least {required} frames (got {got})")]
    InsufficientFrames { got: usize, required: usize },
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Run one verification attempt.
///
/// `frames` are ordered capture frames; in [`LivenessMode::SingleFrame`] only
/// the first is used, in [`LivenessMode::FrameSequence`] all frames feed the
/// liveness gate and the *last* frame feeds the match gate (earlier frames
/// exist only to witness blinking).
pub fn run_attempt<E, S>(
    extractor: &mut E,
    store: &S,
    config: &VerifyConfig,
    identity: &str,
    frames: &[Vec<u8>],
    mode: LivenessMode,
) -> Result<Decision, AttemptError>
where
    E: FaceExtractor,
    S: AttendanceStore,
{
    let now = chrono::Local::now();
    let today = now.date_naive();

    // DuplicateCheck — before any image work, so an already-marked identity
    // costs one store read and nothing else.
    if store.has_attendance_on(identity, today)? {
        tracing::debug!(identity, %today, "attempt denied: already marked");
        return Ok(Decision::Denied(Denial::AlreadyMarked));
    }

    // The stored embedding is also fetched before the pipeline runs: an
    // unenrolled identity can never pass the match gate, so fail fast.
    let Some(stored) = store.stored_embedding(identity)? else {
        tracing::debug!(identity, "attempt denied: not enrolled");
        return Ok(Decision::Denied(Denial::NotEnrolled));
    };

    // LivenessGate.
    let (liveness, match_frame) = match mode {
        LivenessMode::SingleFrame => {
            let frame = frames.first().ok_or(AttemptError::InsufficientFrames {
                got: 0,
                required: 1,
            })?;
            match single_frame_liveness(extractor, frame, config)? {
                Some(report) => (report, frame),
                None => return Ok(Decision::Denied(Denial::NoFaceDetected)),
            }
        }
        LivenessMode::FrameSequence => {
            if frames.len() < MIN_SEQUENCE_FRAMES {
                return Err(AttemptError::InsufficientFrames {
                    got: frames.len(),
                    required: MIN_SEQUENCE_FRAMES,
                });
            }
            let report = sequence_liveness(extractor, frames, config)?;
            // Extraction for the match gate runs against the last frame;
            // earlier frames were only used for liveness.
            (report, frames.last().unwrap())
        }
    };

    if !liveness.passes(required_blinks(mode, config)) {
        tracing::debug!(
            identity,
            blinks = liveness.blink_count,
            required = required_blinks(mode, config),
            "attempt denied: liveness failed"
        );
        return Ok(Decision::Denied(Denial::LivenessFailed {
            blinks_observed: liveness.blink_count,
            blinks_required: required_blinks(mode, config),
        }));
    }

    // MatchGate.
    let extraction = match extractor.extract(match_frame) {
        Ok(extraction) => extraction,
        Err(e) if e.is_detection_miss() => {
            tracing::debug!(identity, "attempt denied: no face in match frame");
            return Ok(Decision::Denied(Denial::NoFaceDetected));
        }
        Err(e) => return Err(e.into()),
    };

    let result = matcher::compare(&stored, &extraction.embedding, config.distance_tolerance);
    if !result.accepted(config.distance_tolerance) {
        tracing::debug!(
            identity,
            confidence = result.confidence_percent,
            distance = result.distance,
            "attempt denied: face mismatch"
        );
        return Ok(Decision::Denied(Denial::FaceMismatch {
            confidence_percent: result.confidence_percent,
            distance: result.distance,
        }));
    }

    // Recorded — the single external write of the pipeline. The store's
    // uniqueness constraint is authoritative for the one-per-day invariant;
    // losing the race to a concurrent attempt is just another AlreadyMarked.
    let record = AttendanceRecord {
        identity: identity.to_string(),
        date: today,
        time: now.time(),
        confidence: result.confidence_percent,
    };
    match store.record_attendance(&record)? {
        RecordOutcome::Inserted => {
            tracing::info!(
                identity,
                confidence = record.confidence,
                blinks = liveness.blink_count,
                "attendance recorded"
            );
            Ok(Decision::Recorded {
                record,
                blinks_detected: liveness.blink_count,
            })
        }
        RecordOutcome::Duplicate => {
            tracing::debug!(identity, "attempt denied: lost duplicate race");
            Ok(Decision::Denied(Denial::AlreadyMarked))
        }
    }
}

fn required_blinks(mode: LivenessMode, config: &VerifyConfig) -> u32 {
    match mode {
        // A single frame can only ever witness one closure.
        LivenessMode::SingleFrame => 1,
        LivenessMode::FrameSequence => config.required_blinks,
    }
}

/// Single-frame liveness: eyes closed right now. `None` means no usable face
/// in the frame, which the caller reports as its own denial.
fn single_frame_liveness<E: FaceExtractor>(
    extractor: &mut E,
    frame: &[u8],
    config: &VerifyConfig,
) -> Result<Option<BlinkReport>, AttemptError> {
    let landmarks = match extractor.landmarks(frame) {
        Ok(landmarks) => landmarks,
        Err(e) if e.is_detection_miss() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let ear = match landmarks.combined_ear() {
        Ok(ear) => ear,
        // Degenerate geometry on the only frame: no usable face.
        Err(_) => return Ok(None),
    };
    let blink_count = u32::from(liveness::is_blinking(ear, config.ear_threshold));
    Ok(Some(BlinkReport {
        blink_count,
        frames_analyzed: 1,
        frames_skipped: 0,
    }))
}

/// Multi-frame liveness: per-frame EARs with detection misses skipped, then
/// edge counting.
fn sequence_liveness<E: FaceExtractor>(
    extractor: &mut E,
    frames: &[Vec<u8>],
    config: &VerifyConfig,
) -> Result<BlinkReport, AttemptError> {
    let mut ears: Vec<Option<f32>> = Vec::with_capacity(frames.len());
    for frame in frames {
        let ear = match extractor.landmarks(frame) {
            Ok(landmarks) => match landmarks.combined_ear() {
                Ok(ear) => Some(ear),
                // Collapsed geometry is treated like a missed detection.
                Err(_) => None,
            },
            Err(e) if e.is_detection_miss() => None,
            Err(e) => return Err(e.into()),
        };
        ears.push(ear);
    }
    Ok(liveness::count_blinks(ears, config.ear_threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{Extraction, FaceLandmarks};
    use crate::geometry::{EyeLandmarks, Point};
    use crate::matcher::EMBEDDING_DIM;
    use std::cell::RefCell;

    // ── Fixtures ─────────────────────────────────────────────────────────────

    /// An eye whose EAR is exactly `ear` (width 10, gap 10 * ear).
    fn eye_with_ear(ear: f32) -> EyeLandmarks {
        let gap = 10.0 * ear;
        EyeLandmarks::new([
            Point::new(0.0, 0.0),
            Point::new(3.0, gap / 2.0),
            Point::new(7.0, gap / 2.0),
            Point::new(10.0, 0.0),
            Point::new(7.0, -gap / 2.0),
            Point::new(3.0, -gap / 2.0),
        ])
    }

    fn landmarks_with_ear(ear: f32) -> FaceLandmarks {
        FaceLandmarks {
            left_eye: eye_with_ear(ear),
            right_eye: eye_with_ear(ear),
        }
    }

    fn embedding(first: f32) -> FaceEmbedding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = first;
        FaceEmbedding::new(v).unwrap()
    }

    /// Scripted extractor: each frame's bytes hold a one-byte script code.
    /// `b'm'` = detection miss; any other byte is an EAR index into `ears`.
    /// The embedding returned by `extract` is keyed by the frame byte so
    /// tests can confirm which frame fed the match gate.
    struct ScriptedExtractor {
        ears: Vec<f32>,
        landmark_calls: RefCell<usize>,
        extract_calls: RefCell<usize>,
    }

    impl ScriptedExtractor {
        fn new(ears: Vec<f32>) -> Self {
            Self {
                ears,
                landmark_calls: RefCell::new(0),
                extract_calls: RefCell::new(0),
            }
        }

        fn ear_for(&self, frame: &[u8]) -> Option<f32> {
            match frame.first() {
                Some(b'm') | None => None,
                Some(&idx) => Some(self.ears[idx as usize]),
            }
        }
    }

    impl FaceExtractor for ScriptedExtractor {
        fn landmarks(&mut self, frame: &[u8]) -> Result<FaceLandmarks, ExtractError> {
            *self.landmark_calls.borrow_mut() += 1;
            match self.ear_for(frame) {
                Some(ear) => Ok(landmarks_with_ear(ear)),
                None => Err(ExtractError::NoFaceDetected),
            }
        }

        fn extract(&mut self, frame: &[u8]) -> Result<Extraction, ExtractError> {
            *self.extract_calls.borrow_mut() += 1;
            let ear = self.ear_for(frame).ok_or(ExtractError::NoFaceDetected)?;
            let code = frame.first().copied().unwrap_or(0);
            Ok(Extraction {
                landmarks: landmarks_with_ear(ear),
                embedding: embedding(f32::from(code) / 100.0),
            })
        }
    }

    /// In-memory store with scripted contents.
    struct MemStore {
        embedding: Option<FaceEmbedding>,
        marked_today: bool,
        duplicate_on_insert: bool,
        recorded: RefCell<Vec<AttendanceRecord>>,
    }

    impl MemStore {
        fn enrolled(embedding: FaceEmbedding) -> Self {
            Self {
                embedding: Some(embedding),
                marked_today: false,
                duplicate_on_insert: false,
                recorded: RefCell::new(Vec::new()),
            }
        }
    }

    impl AttendanceStore for MemStore {
        fn stored_embedding(&self, _identity: &str) -> Result<Option<FaceEmbedding>, StorageError> {
            Ok(self.embedding.clone())
        }

        fn has_attendance_on(
            &self,
            _identity: &str,
            _date: NaiveDate,
        ) -> Result<bool, StorageError> {
            Ok(self.marked_today)
        }

        fn record_attendance(
            &self,
            record: &AttendanceRecord,
        ) -> Result<RecordOutcome, StorageError> {
            if self.duplicate_on_insert {
                return Ok(RecordOutcome::Duplicate);
            }
            self.recorded.borrow_mut().push(record.clone());
            Ok(RecordOutcome::Inserted)
        }
    }

    /// Frame encoding: index into the extractor's EAR script.
    fn frame(idx: u8) -> Vec<u8> {
        vec![idx]
    }

    fn miss_frame() -> Vec<u8> {
        vec![b'm']
    }

    // ── End-to-end scenarios ─────────────────────────────────────────────────

    #[test]
    fn sequence_with_two_blinks_and_matching_face_is_recorded() {
        // EARs 0.30, 0.10, 0.10, 0.30, 0.15, 0.35 → 2 blinks.
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.10, 0.30, 0.15, 0.35]);
        // Last frame is index 5 → probe embedding first component 0.05.
        let store = MemStore::enrolled(embedding(0.05));
        let frames: Vec<_> = (0..6).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        match decision {
            Decision::Recorded {
                record,
                blinks_detected,
            } => {
                assert_eq!(blinks_detected, 2);
                assert_eq!(record.identity, "alice");
                // Identical embeddings → distance 0 → confidence 100.
                assert_eq!(record.confidence, 100.0);
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert_eq!(store.recorded.borrow().len(), 1);
    }

    #[test]
    fn never_closing_eyes_denies_liveness_with_zero_count() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.30, 0.30]);
        let store = MemStore::enrolled(embedding(0.0));
        let frames: Vec<_> = (0..3).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert_eq!(
            decision,
            Decision::Denied(Denial::LivenessFailed {
                blinks_observed: 0,
                blinks_required: 2,
            })
        );
        // Match gate never ran.
        assert_eq!(*ext.extract_calls.borrow(), 0);
        assert!(store.recorded.borrow().is_empty());
    }

    #[test]
    fn already_marked_short_circuits_before_any_extraction() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.30]);
        let mut store = MemStore::enrolled(embedding(0.0));
        store.marked_today = true;
        let frames: Vec<_> = (0..3).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert_eq!(decision, Decision::Denied(Denial::AlreadyMarked));
        // The point of the pre-check: no pipeline work at all.
        assert_eq!(*ext.landmark_calls.borrow(), 0);
        assert_eq!(*ext.extract_calls.borrow(), 0);
    }

    // ── Gate behavior ────────────────────────────────────────────────────────

    #[test]
    fn unenrolled_identity_is_denied_without_extraction() {
        let mut ext = ScriptedExtractor::new(vec![0.30]);
        let store = MemStore {
            embedding: None,
            marked_today: false,
            duplicate_on_insert: false,
            recorded: RefCell::new(Vec::new()),
        };

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "ghost",
            &[frame(0)],
            LivenessMode::SingleFrame,
        )
        .unwrap();

        assert_eq!(decision, Decision::Denied(Denial::NotEnrolled));
        assert_eq!(*ext.landmark_calls.borrow(), 0);
    }

    #[test]
    fn too_few_frames_is_a_caller_error_not_a_denial() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10]);
        let store = MemStore::enrolled(embedding(0.0));
        let frames: Vec<_> = (0..2).map(frame).collect();

        let err = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            AttemptError::InsufficientFrames {
                got: 2,
                required: 3
            }
        ));
    }

    #[test]
    fn detection_misses_are_skipped_not_fatal() {
        // miss, closed, open, closed → leading miss then closed counts, as
        // does the later reclosure: 2 blinks.
        let mut ext = ScriptedExtractor::new(vec![0.10, 0.30, 0.12]);
        let store = MemStore::enrolled(embedding(0.02));
        let frames = vec![miss_frame(), frame(0), frame(1), frame(2)];

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert!(matches!(decision, Decision::Recorded { blinks_detected: 2, .. }));
    }

    #[test]
    fn no_face_in_match_frame_is_denied() {
        // Blinks happen, but the final frame has no detectable face.
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.30, 0.10]);
        let store = MemStore::enrolled(embedding(0.0));
        let frames = vec![frame(0), frame(1), frame(2), frame(3), miss_frame()];

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert_eq!(decision, Decision::Denied(Denial::NoFaceDetected));
    }

    #[test]
    fn mismatched_face_reports_confidence() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.30, 0.10, 0.30]);
        // Stored embedding far from anything the extractor produces.
        let store = MemStore::enrolled(embedding(0.9));
        let frames: Vec<_> = (0..5).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        match decision {
            Decision::Denied(Denial::FaceMismatch {
                confidence_percent,
                distance,
            }) => {
                assert!(distance > 0.6);
                assert!(confidence_percent < 40.0);
            }
            other => panic!("expected FaceMismatch, got {other:?}"),
        }
        assert!(store.recorded.borrow().is_empty());
    }

    #[test]
    fn match_gate_uses_the_last_frame() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.30, 0.10, 0.30]);
        // Enrolled embedding equals the probe derived from frame code 4 —
        // only matching if extraction ran on the last frame.
        let store = MemStore::enrolled(embedding(0.04));
        let frames: Vec<_> = (0..5).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert!(matches!(decision, Decision::Recorded { .. }));
        assert_eq!(*ext.extract_calls.borrow(), 1);
    }

    #[test]
    fn lost_duplicate_race_is_already_marked() {
        let mut ext = ScriptedExtractor::new(vec![0.30, 0.10, 0.30, 0.10, 0.30]);
        let mut store = MemStore::enrolled(embedding(0.04));
        store.duplicate_on_insert = true;
        let frames: Vec<_> = (0..5).map(frame).collect();

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &frames,
            LivenessMode::FrameSequence,
        )
        .unwrap();

        assert_eq!(decision, Decision::Denied(Denial::AlreadyMarked));
    }

    // ── Single-frame mode ────────────────────────────────────────────────────

    #[test]
    fn single_frame_closed_eyes_pass_and_record() {
        let mut ext = ScriptedExtractor::new(vec![0.10]);
        let store = MemStore::enrolled(embedding(0.0));

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &[frame(0)],
            LivenessMode::SingleFrame,
        )
        .unwrap();

        assert!(matches!(
            decision,
            Decision::Recorded {
                blinks_detected: 1,
                ..
            }
        ));
    }

    #[test]
    fn single_frame_open_eyes_fail_liveness() {
        let mut ext = ScriptedExtractor::new(vec![0.32]);
        let store = MemStore::enrolled(embedding(0.0));

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &[frame(0)],
            LivenessMode::SingleFrame,
        )
        .unwrap();

        assert_eq!(
            decision,
            Decision::Denied(Denial::LivenessFailed {
                blinks_observed: 0,
                blinks_required: 1,
            })
        );
    }

    #[test]
    fn single_frame_without_face_is_no_face_detected() {
        let mut ext = ScriptedExtractor::new(vec![]);
        let store = MemStore::enrolled(embedding(0.0));

        let decision = run_attempt(
            &mut ext,
            &store,
            &VerifyConfig::default(),
            "alice",
            &[miss_frame()],
            LivenessMode::SingleFrame,
        )
        .unwrap();

        assert_eq!(decision, Decision::Denied(Denial::NoFaceDetected));
    }
}
