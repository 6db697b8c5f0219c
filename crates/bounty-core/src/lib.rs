//! Core computations for the face scan: landmark geometry, descriptor
//! similarity and the blink/head-turn liveness challenge. No I/O.

pub mod geometry;
pub mod liveness;
pub mod similarity;
pub mod types;

pub use liveness::{
    GestureDetector, GestureEvent, GestureState, Observation, Stage, REQUIRED_BLINKS,
};
pub use similarity::{cosine_similarity, CosineMatcher, MatchResult, Matcher, MATCH_THRESHOLD};
pub use types::{
    DescriptorError, EyeContour, FaceDescriptor, LandmarkError, LandmarkFrame, Point,
    DESCRIPTOR_DIM,
};
