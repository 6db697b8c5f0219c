//! Camera and face detector collaborators.
//!
//! Both are external capabilities. The scan pipeline only relies on the
//! traits here; concrete devices and models live outside this crate (see
//! [`crate::replay`] for a recorded-stream implementation).

use bounty_core::LandmarkFrame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load face detection models: {0}")]
    ModelLoad(String),
    #[error("face detection models not loaded")]
    NotLoaded,
    #[error("face detection failed: {0}")]
    Inference(String),
}

/// A single captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture order within the stream, starting at 0.
    pub sequence: u64,
}

/// An open media stream. Dropping it releases the device.
pub trait VideoStream: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

pub trait CameraDevice: Send {
    /// Acquire the device. Permission denial is fatal to the scan session.
    fn open(&mut self) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// Landmark and descriptor model.
pub trait FaceDetector: Send {
    /// Load model weights. Called once before the first detection.
    fn load_models(&mut self) -> Result<(), DetectorError>;

    /// Detect faces in `frame`. Descriptors are only computed when
    /// `with_descriptors` is set; liveness ticks leave it off.
    fn detect(
        &mut self,
        frame: &Frame,
        with_descriptors: bool,
    ) -> Result<Vec<LandmarkFrame>, DetectorError>;
}
