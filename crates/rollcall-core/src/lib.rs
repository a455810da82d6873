//! Core biometric verification pipeline for rollcall.
//!
//! This crate is the synchronous, IO-free heart of the system: eye geometry
//! and EAR computation ([`geometry`]), blink-based liveness ([`liveness`]),
//! embedding comparison ([`matcher`]), the extraction seam ([`extractor`]),
//! the ONNX-backed extractor ([`onnx`]), and the orchestrator that runs one
//! attendance attempt end to end ([`verify`]).
//!
//! The daemon and CLI live in their own crates and drive this one through
//! [`verify::run_attempt`] plus the [`extractor::FaceExtractor`] and
//! [`verify::AttendanceStore`] traits.

pub mod extractor;
pub mod geometry;
pub mod liveness;
pub mod matcher;
pub mod onnx;
pub mod verify;

pub use extractor::{ExtractError, Extraction, FaceExtractor, FaceLandmarks};
pub use geometry::{combined_ear, EyeLandmarks, GeometryError, Point};
pub use liveness::{
    count_blinks, is_blinking, BlinkCounter, BlinkReport, DEFAULT_EAR_THRESHOLD,
    DEFAULT_REQUIRED_BLINKS, MIN_SEQUENCE_FRAMES,
};
pub use matcher::{
    compare, euclidean_distance, EmbeddingError, FaceEmbedding, MatchResult,
    DEFAULT_DISTANCE_TOLERANCE, EMBEDDING_DIM,
};
pub use onnx::OnnxExtractor;
pub use verify::{
    run_attempt, AttemptError, AttendanceRecord, AttendanceStore, Decision, Denial, LivenessMode,
    RecordOutcome, StorageError, VerifyConfig,
};
