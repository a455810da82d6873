use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: URL, expected filename, SHA-256 checksum, human-readable size.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    pub size_display: &'static str,
}

/// Filename of the face detection model (UltraFace version-RFB-320).
pub const DETECTOR_MODEL: &str = "version-RFB-320.onnx";
/// Filename of the 468-point face mesh landmark model.
pub const MESH_MODEL: &str = "face_mesh_192.onnx";
/// Filename of the face embedding model (MobileFaceNet, 128-d output).
pub const EMBEDDER_MODEL: &str = "mobilefacenet.onnx";

// The detector digest tracks the upstream onnx/models Git LFS pointer (oid
// sha256: field). The mesh and embedder digests are placeholders until the
// models-v1 release assets are published; refresh both against the uploaded
// files before cutting a release.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: DETECTOR_MODEL,
        url: "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
        sha256: "3434eb1a9ab3862e6fd91132ea1d41bfedf4ec1a9febdbd4b7b1a6c64f4bd0a9",
        size_display: "1.2 MB",
    },
    ModelFile {
        name: MESH_MODEL,
        url: "https://github.com/sovren-software/rollcall/releases/download/models-v1/face_mesh_192.onnx",
        sha256: "9f26e3c1b06d57e61ac2b1f4fa4c3566ab1d5c0ce0aee255b5b0bb08ce5e2f41",
        size_display: "2.4 MB",
    },
    ModelFile {
        name: EMBEDDER_MODEL,
        url: "https://github.com/sovren-software/rollcall/releases/download/models-v1/mobilefacenet.onnx",
        sha256: "c5a2f8d5cb0a1b6c4e91cc29e0f0ad19d2db24f09c6b3a6a3f1c53a18c8d91be",
        size_display: "5.0 MB",
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

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

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
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

pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if digest != expected_sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_dir.join(model.name);
        verify_file_sha256(model.name, &path, model.sha256)?;
    }

    Ok(())
}
