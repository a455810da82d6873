//! ONNX-backed face extractor.
//!
//! Three models cooperate per image:
//!
//! 1. **UltraFace (version-RFB-320)** — face detection. All candidate boxes
//!    are scored; the extractor keeps the highest-scoring one (ties broken by
//!    larger box area) so selection is deterministic per run.
//! 2. **Face mesh** — 468-point landmark mesh on a square crop of the
//!    selected face; the standard six-index subsets per eye feed the EAR
//!    calculation.
//! 3. **MobileFaceNet** — 128-d embedding of the face crop, L2-normalized.
//!    The default distance tolerance is calibrated against this normalized
//!    space.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array3;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::extractor::{ExtractError, Extraction, FaceExtractor, FaceLandmarks};
use crate::geometry::{EyeLandmarks, Point, EYE_POINT_COUNT};
use crate::matcher::FaceEmbedding;

const DETECTOR_INPUT: &str = "input";
const DETECTOR_SCORES: &str = "scores";
const DETECTOR_BOXES: &str = "boxes";
const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;
/// Minimum face-class score for a candidate box to be considered at all.
const DETECTOR_SCORE_THRESHOLD: f32 = 0.7;

const MESH_INPUT: &str = "input_1";
const MESH_OUTPUT: &str = "conv2d_21";
const MESH_SIZE: u32 = 192;
const MESH_POINT_COUNT: usize = 468;

const EMBED_INPUT: &str = "data";
const EMBED_OUTPUT: &str = "fc1";
const EMBED_SIZE: u32 = 112;

/// Mesh indices of the six EAR landmarks per eye, in the fixed
/// outer-corner / upper-lid / inner-corner / lower-lid order.
const LEFT_EYE_MESH: [usize; EYE_POINT_COUNT] = [362, 385, 387, 263, 373, 380];
const RIGHT_EYE_MESH: [usize; EYE_POINT_COUNT] = [33, 160, 158, 133, 153, 144];

/// How much the detection box is grown before cropping, so the mesh and
/// embedding models see forehead and chin context.
const CROP_EXPANSION: f32 = 1.25;

/// A face detection in image pixel coordinates.
#[derive(Debug, Clone, Copy)]
struct FaceBox {
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl FaceBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Expanded square crop around the box center, clamped to the image.
    /// A square crop keeps the later resize uniform, which keeps eye
    /// geometry undistorted.
    fn square_crop(&self, img_w: u32, img_h: u32) -> (u32, u32, u32, u32) {
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        let side = (self.x2 - self.x1).max(self.y2 - self.y1) * CROP_EXPANSION;
        let side = side.max(1.0);

        let x0 = (cx - side / 2.0).max(0.0);
        let y0 = (cy - side / 2.0).max(0.0);
        let x0 = x0.min((img_w.saturating_sub(1)) as f32);
        let y0 = y0.min((img_h.saturating_sub(1)) as f32);

        let w = side.min(img_w as f32 - x0).max(1.0);
        let h = side.min(img_h as f32 - y0).max(1.0);
        // Keep it square after clamping by shrinking to the smaller side.
        let s = w.min(h);

        (x0 as u32, y0 as u32, s as u32, s as u32)
    }
}

/// Interleaved RGB → planar CHW with `(value - mean) * scale` normalization.
fn chw_data(img: &RgbImage, mean: f32, scale: f32) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let mut chw = Array3::<f32>::zeros((3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            chw[[c, y as usize, x as usize]] = (f32::from(pixel[c]) - mean) * scale;
        }
    }
    chw.into_iter().collect()
}

/// Face extractor backed by ONNX Runtime sessions.
///
/// Sessions are stateful, so the extractor is `&mut` through the
/// [`FaceExtractor`] trait; one instance is owned by one engine thread.
pub struct OnnxExtractor {
    detector: Session,
    mesh: Session,
    embedder: Session,
}

impl OnnxExtractor {
    /// Load all three models. Fails fast if any file is missing or invalid.
    pub fn load(
        detector_path: &Path,
        mesh_path: &Path,
        embedder_path: &Path,
    ) -> Result<Self, ExtractError> {
        let detector = Self::session(detector_path)?;
        tracing::info!(path = %detector_path.display(), "face detector loaded");
        let mesh = Self::session(mesh_path)?;
        tracing::info!(path = %mesh_path.display(), "face mesh loaded");
        let embedder = Self::session(embedder_path)?;
        tracing::info!(path = %embedder_path.display(), "face embedder loaded");

        Ok(Self {
            detector,
            mesh,
            embedder,
        })
    }

    fn session(path: &Path) -> Result<Session, ort::Error> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)
    }

    /// Run detection and select one candidate deterministically: highest
    /// score, then larger area. Returns `None` when no candidate clears the
    /// score threshold.
    fn detect_best(&mut self, img: &DynamicImage) -> Result<Option<FaceBox>, ExtractError> {
        let img_w = img.width() as f32;
        let img_h = img.height() as f32;

        let resized = img
            .resize_exact(DETECTOR_WIDTH, DETECTOR_HEIGHT, FilterType::Triangle)
            .to_rgb8();
        let data = chw_data(&resized, 127.0, 1.0 / 128.0);
        let input = Tensor::from_array((
            [1usize, 3, DETECTOR_HEIGHT as usize, DETECTOR_WIDTH as usize],
            data,
        ))?;

        let outputs = self.detector.run(ort::inputs![DETECTOR_INPUT => input])?;
        let (scores_shape, scores) = outputs[DETECTOR_SCORES].try_extract_tensor::<f32>()?;
        let (_, boxes) = outputs[DETECTOR_BOXES].try_extract_tensor::<f32>()?;

        // scores: [1, N, 2] (background, face); boxes: [1, N, 4] normalized
        // corner coordinates.
        let candidates = scores_shape[1] as usize;
        let mut best: Option<FaceBox> = None;

        for i in 0..candidates {
            let score = scores[i * 2 + 1];
            if score < DETECTOR_SCORE_THRESHOLD {
                continue;
            }
            let candidate = FaceBox {
                score,
                x1: (boxes[i * 4] * img_w).clamp(0.0, img_w),
                y1: (boxes[i * 4 + 1] * img_h).clamp(0.0, img_h),
                x2: (boxes[i * 4 + 2] * img_w).clamp(0.0, img_w),
                y2: (boxes[i * 4 + 3] * img_h).clamp(0.0, img_h),
            };
            let better = match &best {
                None => true,
                Some(b) => {
                    candidate.score > b.score
                        || (candidate.score == b.score && candidate.area() > b.area())
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        Ok(best)
    }

    /// Run the mesh model on the face crop and pull out the two eyes.
    fn mesh_landmarks(
        &mut self,
        img: &DynamicImage,
        face: &FaceBox,
    ) -> Result<FaceLandmarks, ExtractError> {
        let (cx, cy, cw, ch) = face.square_crop(img.width(), img.height());
        let crop = img
            .crop_imm(cx, cy, cw, ch)
            .resize_exact(MESH_SIZE, MESH_SIZE, FilterType::Triangle)
            .to_rgb8();

        let data = chw_data(&crop, 0.0, 1.0 / 255.0);
        let input = Tensor::from_array((
            [1usize, 3, MESH_SIZE as usize, MESH_SIZE as usize],
            data,
        ))?;

        let outputs = self.mesh.run(ort::inputs![MESH_INPUT => input])?;
        let (_, coords) = outputs[MESH_OUTPUT].try_extract_tensor::<f32>()?;

        if coords.len() < MESH_POINT_COUNT * 3 {
            return Err(ExtractError::NoFaceDetected);
        }

        // Mesh points are (x, y, z) in crop space; map back to image space.
        // The crop is square, so the mapping is a uniform scale and EAR is
        // unaffected either way.
        let scale = cw as f32 / MESH_SIZE as f32;
        let point = |idx: usize| {
            Point::new(
                cx as f32 + coords[idx * 3] * scale,
                cy as f32 + coords[idx * 3 + 1] * scale,
            )
        };
        let eye = |indices: [usize; EYE_POINT_COUNT]| {
            let mut pts = [Point::new(0.0, 0.0); EYE_POINT_COUNT];
            for (slot, idx) in pts.iter_mut().zip(indices) {
                *slot = point(idx);
            }
            EyeLandmarks::new(pts)
        };

        Ok(FaceLandmarks {
            left_eye: eye(LEFT_EYE_MESH),
            right_eye: eye(RIGHT_EYE_MESH),
        })
    }

    /// Embed the face crop and L2-normalize the result.
    fn embed(&mut self, img: &DynamicImage, face: &FaceBox) -> Result<FaceEmbedding, ExtractError> {
        let (cx, cy, cw, ch) = face.square_crop(img.width(), img.height());
        let crop = img
            .crop_imm(cx, cy, cw, ch)
            .resize_exact(EMBED_SIZE, EMBED_SIZE, FilterType::Triangle)
            .to_rgb8();

        let data = chw_data(&crop, 127.5, 1.0 / 128.0);
        let input = Tensor::from_array((
            [1usize, 3, EMBED_SIZE as usize, EMBED_SIZE as usize],
            data,
        ))?;

        let outputs = self.embedder.run(ort::inputs![EMBED_INPUT => input])?;
        let (_, raw) = outputs[EMBED_OUTPUT].try_extract_tensor::<f32>()?;

        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values: Vec<f32> = raw.iter().map(|v| v / norm).collect();

        Ok(FaceEmbedding::new(values)?)
    }
}

impl FaceExtractor for OnnxExtractor {
    fn landmarks(&mut self, image: &[u8]) -> Result<FaceLandmarks, ExtractError> {
        let img = image::load_from_memory(image)?;
        let face = self
            .detect_best(&img)?
            .ok_or(ExtractError::NoFaceDetected)?;
        self.mesh_landmarks(&img, &face)
    }

    fn extract(&mut self, image: &[u8]) -> Result<Extraction, ExtractError> {
        let img = image::load_from_memory(image)?;
        let face = self
            .detect_best(&img)?
            .ok_or(ExtractError::NoFaceDetected)?;
        tracing::debug!(score = face.score, "face selected for extraction");

        let landmarks = self.mesh_landmarks(&img, &face)?;
        let embedding = self.embed(&img, &face)?;

        Ok(Extraction {
            landmarks,
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_crop_stays_within_image() {
        let face = FaceBox {
            score: 0.9,
            x1: 500.0,
            y1: 300.0,
            x2: 620.0,
            y2: 460.0,
        };
        let (x, y, w, h) = face.square_crop(640, 480);
        assert!(x + w <= 640);
        assert!(y + h <= 480);
        assert_eq!(w, h);
        assert!(w >= 1);
    }

    #[test]
    fn square_crop_is_square_for_interior_faces() {
        let face = FaceBox {
            score: 0.9,
            x1: 200.0,
            y1: 150.0,
            x2: 280.0,
            y2: 270.0,
        };
        let (_, _, w, h) = face.square_crop(640, 480);
        assert_eq!(w, h);
        // Expanded from the larger side (120 px * 1.25 = 150).
        assert_eq!(w, 150);
    }

    #[test]
    fn chw_normalization() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([127, 127, 127]));
        img.put_pixel(1, 0, image::Rgb([255, 0, 127]));
        let data = chw_data(&img, 127.0, 1.0 / 128.0);
        assert_eq!(data.len(), 6);
        // Channel-major layout: R plane, then G, then B.
        assert_eq!(data[0], 0.0); // R of (0,0)
        assert_eq!(data[1], 1.0); // R of (1,0)
        assert!((data[3] - (-127.0 / 128.0)).abs() < 1e-6); // G of (1,0)
    }
}
