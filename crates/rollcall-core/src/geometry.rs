//! Eye landmark geometry and the eye-aspect-ratio (EAR) measure.
//!
//! EAR is the scalar openness measure from Soukupová & Čech: the mean of the
//! two vertical lid distances over twice the horizontal corner distance. A low
//! value indicates a closed eye. The measure is invariant under uniform
//! scaling of the landmarks, so it works at any capture resolution.

use thiserror::Error;

/// Number of boundary landmarks describing one eye.
///
/// Index convention (fixed by the extractor): 0 = outer corner, 1–2 = upper
/// lid, 3 = inner corner, 4–5 = lower lid. A point set of any other length
/// means the eye was not detected.
pub const EYE_POINT_COUNT: usize = 6;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// The horizontal corner distance collapsed to zero. EAR is undefined for
    /// such a landmark set; callers treat this the same as a missed detection
    /// rather than propagating a non-finite ratio.
    #[error("degenerate eye landmarks: zero horizontal extent")]
    DegenerateLandmarks,
}

/// A 2-D landmark point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// The six boundary landmarks of one eye, in the fixed index convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeLandmarks {
    points: [Point; EYE_POINT_COUNT],
}

impl EyeLandmarks {
    pub fn new(points: [Point; EYE_POINT_COUNT]) -> Self {
        Self { points }
    }

    /// Build from a slice; anything but exactly six points counts as an
    /// undetected eye.
    pub fn from_slice(points: &[Point]) -> Option<Self> {
        let points: [Point; EYE_POINT_COUNT] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn points(&self) -> &[Point; EYE_POINT_COUNT] {
        &self.points
    }

    /// Eye aspect ratio: `(|p1-p5| + |p2-p4|) / (2 * |p0-p3|)`.
    ///
    /// Rejects landmark sets whose horizontal extent is zero instead of
    /// returning an infinite or NaN ratio.
    pub fn aspect_ratio(&self) -> Result<f32, GeometryError> {
        let p = &self.points;
        let a = p[1].distance(&p[5]);
        let b = p[2].distance(&p[4]);
        let c = p[0].distance(&p[3]);

        if c <= f32::EPSILON {
            return Err(GeometryError::DegenerateLandmarks);
        }

        Ok((a + b) / (2.0 * c))
    }
}

/// Combined EAR for one frame: arithmetic mean of the two per-eye ratios.
pub fn combined_ear(left: &EyeLandmarks, right: &EyeLandmarks) -> Result<f32, GeometryError> {
    Ok((left.aspect_ratio()? + right.aspect_ratio()?) / 2.0)
}
