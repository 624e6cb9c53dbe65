//! The per-frame path shared by every transport:
//! canonical resize, detect, match, rescale, overlay, encode.
//!
//! Matched identities are reported as [`Sighting`]s on a bounded channel; the
//! announcer on the control loop decides which ones become events. A
//! [`silent`](Pipeline::silent) pipeline reports nothing.

use crate::settings::Settings;
use crate::streams::TransportKind;
use crate::vision::VisionHandle;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use lobby_core::overlay::{self, OverlayStyle};
use lobby_core::{DetectionResult, Gallery, Identity, SimilarityMatcher, VisionError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("vision: {0}")]
    Vision(#[from] VisionError),
    #[error("invalid image: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// A matched face, on its way to the deduplicator.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub identity: Identity,
    pub kind: TransportKind,
}

#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// Boxes are in the submitted frame's own coordinates.
    pub detections: Vec<DetectionResult>,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub struct Pipeline {
    kind: TransportKind,
    vision: VisionHandle,
    gallery: Gallery,
    matcher: SimilarityMatcher,
    canonical: (u32, u32),
    jpeg_quality: u8,
    draw_boxes: bool,
    style: Arc<OverlayStyle>,
    sightings: Option<mpsc::Sender<Sighting>>,
}

impl Pipeline {
    /// Snapshot the relevant settings for one transport instance.
    pub fn new(
        kind: TransportKind,
        settings: &Settings,
        vision: VisionHandle,
        gallery: Gallery,
        style: Arc<OverlayStyle>,
        sightings: mpsc::Sender<Sighting>,
    ) -> Self {
        let r = &settings.recognition;
        Self {
            kind,
            vision,
            gallery,
            matcher: SimilarityMatcher::new(r.threshold).with_tie_break(r.tie_break),
            canonical: (r.canonical_width, r.canonical_height),
            jpeg_quality: settings.stream.jpeg_quality,
            draw_boxes: r.draw_boxes,
            style,
            sightings: Some(sightings),
        }
    }

    /// Same processing, but matches are never reported as sightings.
    pub fn silent(mut self) -> Self {
        self.sightings = None;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Run one frame through the whole path. Blocks on the vision thread.
    pub fn process_blocking(&self, mut frame: RgbImage) -> Result<ProcessedFrame, PipelineError> {
        let (width, height) = frame.dimensions();
        let (cw, ch) = self.canonical;

        let canonical = if (width, height) == (cw, ch) {
            frame.clone()
        } else {
            imageops::resize(&frame, cw, ch, FilterType::Triangle)
        };
        let detections = self.vision.detect_blocking(canonical)?;

        let scale_x = width as f32 / cw as f32;
        let scale_y = height as f32 / ch as f32;
        let snapshot = self.gallery.snapshot();

        let results: Vec<DetectionResult> = detections
            .into_iter()
            .map(|detection| {
                let bbox = detection.bbox.rescaled(scale_x, scale_y);
                match self.matcher.best_match(&detection.embedding, &snapshot).identity() {
                    Some(identity) => {
                        self.report(identity.clone());
                        DetectionResult::recognized(bbox, identity)
                    }
                    None => DetectionResult::unrecognized(bbox),
                }
            })
            .collect();

        if self.draw_boxes {
            overlay::render(&mut frame, &results, &self.style);
        }
        let jpeg = encode_jpeg(&frame, self.jpeg_quality)?;

        tracing::trace!(kind = %self.kind, faces = results.len(), bytes = jpeg.len(), "frame processed");
        Ok(ProcessedFrame {
            detections: results,
            jpeg,
            width,
            height,
        })
    }

    /// [`process_blocking`](Self::process_blocking) from async context.
    pub async fn process(&self, frame: RgbImage) -> Result<ProcessedFrame, PipelineError> {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || pipeline.process_blocking(frame))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    fn report(&self, identity: Identity) {
        let Some(sightings) = &self.sightings else {
            return;
        };
        let sighting = Sighting {
            identity,
            kind: self.kind,
        };
        if let Err(e) = sightings.try_send(sighting) {
            tracing::debug!(kind = %self.kind, error = %e, "sighting dropped");
        }
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::Decode(e.to_string()))
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(frame)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::spawn_vision;
    use crate::vision::testing::{embedding_for, face_frame, ScriptedVision};
    use lobby_core::{GalleryBuilder, GalleryEntry};

    fn gallery_with(entries: &[(&str, &str, u8)]) -> Gallery {
        let mut builder = GalleryBuilder::new();
        for (id, name, identity) in entries {
            builder.insert(GalleryEntry {
                person_id: id.to_string(),
                name: name.to_string(),
                title: String::new(),
                embedding: embedding_for(*identity),
            });
        }
        let gallery = Gallery::new();
        gallery.publish(builder.build());
        gallery
    }

    fn pipeline(gallery: Gallery) -> (Pipeline, mpsc::Receiver<Sighting>) {
        let (tx, rx) = mpsc::channel(8);
        let vision = spawn_vision(ScriptedVision).unwrap();
        let pipeline = Pipeline::new(
            TransportKind::Push,
            &Settings::default(),
            vision,
            gallery,
            Arc::new(OverlayStyle::default()),
            tx,
        );
        (pipeline, rx)
    }

    #[tokio::test]
    async fn test_recognized_face_is_reported() {
        let (pipeline, mut sightings) = pipeline(gallery_with(&[("p1", "Alice", 3)]));
        let processed = pipeline.process(face_frame(1, 3)).await.unwrap();

        assert_eq!(processed.detections.len(), 1);
        assert!(processed.detections[0].recognized);
        assert_eq!(processed.detections[0].label(), "Alice");
        assert!(!processed.jpeg.is_empty());
        assert_eq!(sightings.try_recv().unwrap().identity.person_id, "p1");
    }

    #[tokio::test]
    async fn test_unknown_face_is_not_reported() {
        let (pipeline, mut sightings) = pipeline(gallery_with(&[("p1", "Alice", 3)]));
        let processed = pipeline.process(face_frame(1, 4)).await.unwrap();

        assert!(!processed.detections[0].recognized);
        assert!(sightings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_silent_pipeline_reports_nothing() {
        let (pipeline, mut sightings) = pipeline(gallery_with(&[("p1", "Alice", 3)]));
        let processed = pipeline.silent().process(face_frame(1, 3)).await.unwrap();

        assert!(processed.detections[0].recognized);
        assert!(sightings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_boxes_rescaled_to_source_resolution() {
        let (pipeline, _sightings) = pipeline(Gallery::new());
        // Twice the canonical 640x480.
        let frame = RgbImage::from_pixel(1280, 960, image::Rgb([1, 0, 0]));
        let processed = pipeline.process(frame).await.unwrap();

        assert_eq!((processed.width, processed.height), (1280, 960));
        let bbox = processed.detections[0].bbox;
        assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (20.0, 40.0, 120.0, 160.0));
    }

    #[tokio::test]
    async fn test_vision_failure_propagates() {
        let (pipeline, _sightings) = pipeline(Gallery::new());
        let result = pipeline.process(face_frame(255, 0)).await;
        assert!(matches!(result, Err(PipelineError::Vision(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(PipelineError::Decode(_))));
    }
}
