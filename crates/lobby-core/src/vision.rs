//! Seam to the face vision model.

use crate::types::Detection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("vision thread exited")]
    ChannelClosed,
}

/// Image in, faces out: box, confidence and a fixed-size embedding per face.
///
/// Implementations may keep mutable inference state, so the daemon owns a
/// single instance on a dedicated thread and serialises requests to it.
pub trait VisionModel: Send {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<Detection>, VisionError>;
}
