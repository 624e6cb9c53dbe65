use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Axis-aligned face box in pixel coordinates of the frame it was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Map a box from one frame resolution to another by independent x/y ratios.
    pub fn rescaled(&self, scale_x: f32, scale_y: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * scale_x,
            y: self.y * scale_y,
            width: self.width * scale_x,
            height: self.height * scale_y,
            confidence: self.confidence,
        }
    }

    /// Corner form `[x1, y1, x2, y2]`, rounded to whole pixels.
    pub fn corners(&self) -> [i32; 4] {
        [
            self.x.round() as i32,
            self.y.round() as i32,
            (self.x + self.width).round() as i32,
            (self.y + self.height).round() as i32,
        ]
    }
}

/// Face embedding vector (fixed size for a given vision model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One face returned by the vision model: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// An enrolled person as exposed by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub title: String,
    pub has_reference_image: bool,
}

/// Who a face was matched to, and how closely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub person_id: String,
    pub name: String,
    pub score: f32,
}

/// Per-frame, per-face outcome. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub recognized: bool,
}

impl DetectionResult {
    pub fn unrecognized(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            confidence: bbox.confidence,
            identity: None,
            recognized: false,
        }
    }

    pub fn recognized(bbox: BoundingBox, identity: Identity) -> Self {
        Self {
            bbox,
            confidence: bbox.confidence,
            identity: Some(identity),
            recognized: true,
        }
    }

    /// Text drawn above the box.
    pub fn label(&self) -> &str {
        match &self.identity {
            Some(identity) => &identity.name,
            None => "Unknown",
        }
    }
}

/// An announcement that passed the cooldown gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    /// Always `"recognition"` on the wire.
    #[serde(rename = "type")]
    pub kind: String,
    pub person_id: String,
    pub name: String,
    pub title: String,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl RecognitionEvent {
    pub const KIND: &'static str = "recognition";

    pub fn new(identity: &Identity, title: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            person_id: identity.person_id.clone(),
            name: identity.name.clone(),
            title: title.into(),
            score: identity.score,
            timestamp: Utc::now(),
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_rescaled_box_maps_back_to_original_resolution() {
        // Detected on 640x480, original frame is 1280x720.
        let bbox = BoundingBox { x: 100.0, y: 120.0, width: 64.0, height: 48.0, confidence: 0.9 };
        let scaled = bbox.rescaled(1280.0 / 640.0, 720.0 / 480.0);
        assert_eq!(scaled.x, 200.0);
        assert_eq!(scaled.y, 180.0);
        assert_eq!(scaled.width, 128.0);
        assert_eq!(scaled.height, 72.0);
        assert_eq!(scaled.confidence, 0.9);
        assert_eq!(scaled.corners(), [200, 180, 328, 252]);
    }

    #[test]
    fn test_recognition_event_wire_format() {
        let identity = Identity { person_id: "p1".into(), name: "Alice".into(), score: 0.8 };
        let event = RecognitionEvent::new(&identity, "Engineer", None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "recognition");
        assert_eq!(json["name"], "Alice");
        assert!(json.get("session_id").is_none());
    }

    #[test]
    fn test_unrecognized_label() {
        let bbox = BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 0.5 };
        assert_eq!(DetectionResult::unrecognized(bbox).label(), "Unknown");
    }
}
