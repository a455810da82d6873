//! The extraction seam: landmarks and embeddings from raw image bytes.

use thiserror::Error;

use crate::geometry::{combined_ear, EyeLandmarks, GeometryError};
use crate::matcher::{EmbeddingError, FaceEmbedding};

#[derive(Error, Debug)]
pub enum ExtractError {
    /// Zero candidate faces in the image. Terminal for the calling step,
    /// never retried automatically.
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),
    /// Collapsed eye geometry. Callers treat this like a missed detection.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("model produced a malformed embedding: {0}")]
    BadEmbedding(#[from] EmbeddingError),
}

impl ExtractError {
    /// Whether this failure means "this frame has no usable face" as opposed
    /// to an infrastructure problem. The liveness gate skips such frames;
    /// the match gate turns them into a denial.
    pub fn is_detection_miss(&self) -> bool {
        matches!(
            self,
            ExtractError::NoFaceDetected | ExtractError::Geometry(_)
        )
    }
}

/// Eye landmark sets for the selected face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceLandmarks {
    pub left_eye: EyeLandmarks,
    pub right_eye: EyeLandmarks,
}

impl FaceLandmarks {
    /// Combined EAR for the frame: mean of both eyes.
    pub fn combined_ear(&self) -> Result<f32, GeometryError> {
        combined_ear(&self.left_eye, &self.right_eye)
    }
}

/// Everything extracted from one image for the selected face.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub landmarks: FaceLandmarks,
    pub embedding: FaceEmbedding,
}

/// The landmark/embedding extractor consumed by the verification pipeline.
///
/// If the underlying detector reports multiple candidate faces, exactly one
/// is selected deterministically (this implementation's tie-break: highest
/// detection score, then larger box area) — multi-face disambiguation is out
/// of scope. Methods take `&mut self` because inference sessions are stateful.
pub trait FaceExtractor {
    /// Eye landmarks only — the cheap path used per frame by the liveness
    /// gate, which never needs an embedding.
    fn landmarks(&mut self, image: &[u8]) -> Result<FaceLandmarks, ExtractError>;

    /// Landmarks plus the embedding of the selected face.
    fn extract(&mut self, image: &[u8]) -> Result<Extraction, ExtractError>;
}
