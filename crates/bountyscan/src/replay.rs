//! Camera and detector backed by a recorded landmark stream.
//!
//! A recording is JSON Lines: one line per captured frame, each line the
//! array of detections for that frame.

use std::path::Path;
use std::sync::Arc;

use bounty_core::LandmarkFrame;
use thiserror::Error;

use crate::camera::{CameraDevice, CameraError, DetectorError, FaceDetector, Frame, VideoStream};

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read recording: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Recording {
    frames: Vec<Vec<LandmarkFrame>>,
}

impl Recording {
    pub fn new(frames: Vec<Vec<LandmarkFrame>>) -> Self {
        Self { frames }
    }

    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let mut frames = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let detections = serde_json::from_str(line).map_err(|source| ReplayError::Parse {
                line: index + 1,
                source,
            })?;
            frames.push(detections);
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn detections(&self, sequence: u64) -> Option<&[LandmarkFrame]> {
        usize::try_from(sequence)
            .ok()
            .and_then(|i| self.frames.get(i))
            .map(Vec::as_slice)
    }

    /// Most recent detections at or before `sequence` that carry a descriptor.
    fn latest_with_descriptor(&self, sequence: u64) -> Option<&[LandmarkFrame]> {
        let end = usize::try_from(sequence)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
            .min(self.frames.len());
        self.frames[..end]
            .iter()
            .rev()
            .find(|faces| faces.iter().any(|f| f.descriptor.is_some()))
            .map(Vec::as_slice)
    }
}

pub fn load_recording(path: &Path) -> Result<Recording, ReplayError> {
    let text = std::fs::read_to_string(path)?;
    let recording = Recording::parse(&text)?;
    tracing::info!(path = %path.display(), frames = recording.len(), "recording loaded");
    Ok(recording)
}

/// Plays the recording back one frame per grab. Past the end it keeps
/// returning the final frame, like a subject holding still.
pub struct ReplayCamera {
    recording: Arc<Recording>,
    deny: bool,
}

impl ReplayCamera {
    pub fn new(recording: Arc<Recording>) -> Self {
        Self {
            recording,
            deny: false,
        }
    }

    /// A camera whose permission prompt is always refused.
    pub fn denied(recording: Arc<Recording>) -> Self {
        Self {
            recording,
            deny: true,
        }
    }
}

impl CameraDevice for ReplayCamera {
    fn open(&mut self) -> Result<Box<dyn VideoStream>, CameraError> {
        if self.deny {
            return Err(CameraError::PermissionDenied);
        }
        if self.recording.is_empty() {
            return Err(CameraError::Unavailable("recording has no frames".into()));
        }
        Ok(Box::new(ReplayStream {
            next: 0,
            last: self.recording.len() as u64 - 1,
        }))
    }
}

struct ReplayStream {
    next: u64,
    last: u64,
}

impl VideoStream for ReplayStream {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let sequence = self.next.min(self.last);
        self.next = self.next.saturating_add(1);
        Ok(Frame {
            data: Vec::new(),
            width: 0,
            height: 0,
            sequence,
        })
    }
}

pub struct ReplayDetector {
    recording: Arc<Recording>,
    fail_models: bool,
    loaded: bool,
}

impl ReplayDetector {
    pub fn new(recording: Arc<Recording>) -> Self {
        Self {
            recording,
            fail_models: false,
            loaded: false,
        }
    }

    /// A detector whose model weights cannot be loaded.
    pub fn broken(recording: Arc<Recording>) -> Self {
        Self {
            fail_models: true,
            ..Self::new(recording)
        }
    }
}

impl FaceDetector for ReplayDetector {
    fn load_models(&mut self) -> Result<(), DetectorError> {
        if self.fail_models {
            return Err(DetectorError::ModelLoad("replay detector has no weights".into()));
        }
        self.loaded = true;
        Ok(())
    }

    fn detect(
        &mut self,
        frame: &Frame,
        with_descriptors: bool,
    ) -> Result<Vec<LandmarkFrame>, DetectorError> {
        if !self.loaded {
            return Err(DetectorError::NotLoaded);
        }
        let detections = self.recording.detections(frame.sequence).ok_or_else(|| {
            DetectorError::Inference(format!("frame {} is not in the recording", frame.sequence))
        })?;
        if with_descriptors {
            let faces = self
                .recording
                .latest_with_descriptor(frame.sequence)
                .unwrap_or(detections);
            return Ok(faces.to_vec());
        }
        Ok(detections
            .iter()
            .map(|face| LandmarkFrame {
                descriptor: None,
                ..face.clone()
            })
            .collect())
    }
}
