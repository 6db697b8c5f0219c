use async_trait::async_trait;
use bounty_core::LandmarkFrame;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::camera::{CameraDevice, CameraError, DetectorError, FaceDetector, VideoStream};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("camera not armed")]
    NotArmed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the scan controller gets its detections from.
///
/// [`EngineHandle`] is the production implementation; tests substitute
/// scripted sources.
#[async_trait]
pub trait DetectionSource: Send + Sync {
    /// Load models and acquire the camera. Idempotent once armed.
    async fn arm(&self) -> Result<(), EngineError>;
    /// Capture one frame and run detection on it.
    async fn detect(&self, with_descriptors: bool) -> Result<Vec<LandmarkFrame>, EngineError>;
    /// Release the camera stream. Models stay loaded.
    async fn release(&self);
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Arm {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Detect {
        with_descriptors: bool,
        reply: oneshot::Sender<Result<Vec<LandmarkFrame>, EngineError>>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

#[async_trait]
impl DetectionSource for EngineHandle {
    async fn arm(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Arm { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn detect(&self, with_descriptors: bool) -> Result<Vec<LandmarkFrame>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                with_descriptors,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn release(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineRequest::Release { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// State owned by the engine thread.
struct Engine {
    camera: Box<dyn CameraDevice>,
    detector: Box<dyn FaceDetector>,
    models_loaded: bool,
    stream: Option<Box<dyn VideoStream>>,
}

impl Engine {
    fn arm(&mut self) -> Result<(), EngineError> {
        if !self.models_loaded {
            self.detector.load_models()?;
            self.models_loaded = true;
            tracing::info!("face detection models loaded");
        }
        if self.stream.is_none() {
            self.stream = Some(self.camera.open()?);
            tracing::info!("camera stream opened");
        }
        Ok(())
    }

    fn detect(&mut self, with_descriptors: bool) -> Result<Vec<LandmarkFrame>, EngineError> {
        let stream = self.stream.as_mut().ok_or(EngineError::NotArmed)?;
        let frame = stream.grab()?;
        let faces = self.detector.detect(&frame, with_descriptors)?;
        tracing::trace!(
            sequence = frame.sequence,
            faces = faces.len(),
            with_descriptors,
            "frame processed"
        );
        Ok(faces)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("camera stream released");
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera and detector are only touched from that thread. Models load
/// and the camera opens lazily on the first `arm`, so acquisition failures
/// surface to the scan session instead of at startup. The thread exits,
/// releasing the stream, once every handle is dropped.
pub fn spawn_engine(
    camera: Box<dyn CameraDevice>,
    detector: Box<dyn FaceDetector>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let mut engine = Engine {
        camera,
        detector,
        models_loaded: false,
        stream: None,
    };

    std::thread::Builder::new()
        .name("bountyscan-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Arm { reply } => {
                        let _ = reply.send(engine.arm());
                    }
                    EngineRequest::Detect {
                        with_descriptors,
                        reply,
                    } => {
                        let _ = reply.send(engine.detect(with_descriptors));
                    }
                    EngineRequest::Release { reply } => {
                        engine.release();
                        let _ = reply.send(());
                    }
                }
            }
            engine.release();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
