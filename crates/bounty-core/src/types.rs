use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a face descriptor produced by the recognition network.
pub const DESCRIPTOR_DIM: usize = 128;

/// Number of contour landmarks per eye (p1..p6).
pub const EYE_POINTS: usize = 6;

/// Six eye-contour landmarks, ordered p1..p6 (corner, upper lid, upper lid,
/// corner, lower lid, lower lid).
pub type EyeContour = [Point; EYE_POINTS];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandmarkError {
    #[error("{eye} eye has {got} landmarks (expected 6)")]
    EyePointCount { eye: &'static str, got: usize },
    #[error("{eye} eye contains a non-finite coordinate")]
    NonFiniteCoordinate { eye: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("invalid descriptor dimension: {0} (expected 128)")]
    InvalidDimension(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
}

/// One detector output for a single video frame.
///
/// The descriptor is only present when the detector was asked for it;
/// liveness ticks skip descriptor extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LandmarkFrame {
    pub left_eye: Vec<Point>,
    pub right_eye: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<f32>>,
}

impl LandmarkFrame {
    /// Both eye contours, checked for point count and finite coordinates.
    pub fn eyes(&self) -> Result<(EyeContour, EyeContour), LandmarkError> {
        Ok((
            to_contour("left", &self.left_eye)?,
            to_contour("right", &self.right_eye)?,
        ))
    }

    /// The validated descriptor, if this detection carries one.
    pub fn face_descriptor(&self) -> Result<Option<FaceDescriptor>, DescriptorError> {
        self.descriptor
            .as_ref()
            .map(|values| FaceDescriptor::new(values.clone()))
            .transpose()
    }
}

fn to_contour(eye: &'static str, points: &[Point]) -> Result<EyeContour, LandmarkError> {
    let contour: EyeContour = points
        .try_into()
        .map_err(|_| LandmarkError::EyePointCount {
            eye,
            got: points.len(),
        })?;
    if contour.iter().any(|p| !p.is_finite()) {
        return Err(LandmarkError::NonFiniteCoordinate { eye });
    }
    Ok(contour)
}

/// A 128-dimensional face embedding. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor(Vec<f32>);

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::InvalidDimension(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::InvalidValue);
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }
}

impl AsRef<[f32]> for FaceDescriptor {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<Vec<f32>> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.0
    }
}
