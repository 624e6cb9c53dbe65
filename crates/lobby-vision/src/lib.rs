//! lobby-vision — ONNX Runtime implementation of [`lobby_core::VisionModel`].
//!
//! SCRFD finds faces, ArcFace turns each face crop into a 512-d embedding.

pub mod detector;
pub mod recognizer;

use detector::FaceDetector;
use image::RgbImage;
use lobby_core::{Detection, VisionError, VisionModel};
use recognizer::FaceRecognizer;
use std::path::Path;

pub use detector::DetectorError;
pub use recognizer::RecognizerError;

/// Detector + recognizer pair, loaded once and reused for every frame.
pub struct OnnxVision {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxVision {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, VisionError> {
        let scrfd = model_dir.join("det_10g.onnx");
        let arcface = model_dir.join("w600k_r50.onnx");

        let detector = FaceDetector::load(&scrfd.to_string_lossy())
            .map_err(|e| VisionError::ModelNotLoaded(e.to_string()))?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())
            .map_err(|e| VisionError::ModelNotLoaded(e.to_string()))?;

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl VisionModel for OnnxVision {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<Detection>, VisionError> {
        let faces = self
            .detector
            .detect(image)
            .map_err(|e| VisionError::InferenceFailed(e.to_string()))?;

        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self
                .recognizer
                .extract(image, &bbox)
                .map_err(|e| VisionError::InferenceFailed(e.to_string()))?;
            detections.push(Detection { bbox, embedding });
        }
        Ok(detections)
    }
}
