use std::path::Path;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use rollcall_core::{
    AttemptError, Decision, ExtractError, FaceEmbedding, FaceExtractor, LivenessMode,
    OnnxExtractor, VerifyConfig,
};

use crate::store::{StoreError, SyncStore};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FaceEmbedding, EngineError>>,
    },
    Mark {
        reference: String,
        frames: Vec<Vec<u8>>,
        mode: LivenessMode,
        config: VerifyConfig,
        reply: oneshot::Sender<Result<Decision, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Extract the enrollment embedding from a single image.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<FaceEmbedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run one attendance attempt: duplicate check, liveness, match, record.
    pub async fn mark(
        &self,
        reference: String,
        frames: Vec<Vec<u8>>,
        mode: LivenessMode,
        config: VerifyConfig,
    ) -> Result<Decision, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Mark {
                reference,
                frames,
                mode,
                config,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the three ONNX models and opens a synchronous database connection,
/// then enters a request loop. Fails fast at startup if any resource is
/// unavailable. Inference sessions never cross a thread boundary after this.
pub fn spawn_engine(
    detector_path: &Path,
    mesh_path: &Path,
    embedder_path: &Path,
    db_path: &Path,
    enc_key: [u8; 32],
) -> Result<EngineHandle, EngineError> {
    let mut extractor = OnnxExtractor::load(detector_path, mesh_path, embedder_path)?;
    let store = SyncStore::open(db_path, enc_key)?;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let result = extractor
                            .extract(&image)
                            .map(|extraction| extraction.embedding)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Mark {
                        reference,
                        frames,
                        mode,
                        config,
                        reply,
                    } => {
                        let result = rollcall_core::run_attempt(
                            &mut extractor,
                            &store,
                            &config,
                            &reference,
                            &frames,
                            mode,
                        )
                        .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}
