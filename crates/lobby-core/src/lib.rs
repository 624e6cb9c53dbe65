//! lobby-core — Recognition primitives shared by the daemon and the vision backend.
//!
//! Holds the data model, the embedding gallery, the similarity matcher, the
//! announcement deduplicator and the overlay renderer. Nothing in this crate
//! performs I/O; the vision model is reached only through [`VisionModel`].

pub mod dedup;
pub mod gallery;
pub mod matcher;
pub mod overlay;
pub mod types;
pub mod vision;

pub use dedup::Deduplicator;
pub use gallery::{Gallery, GalleryBuilder, GalleryEntry, GallerySnapshot};
pub use matcher::{MatchOutcome, SimilarityMatcher, TieBreak};
pub use types::{BoundingBox, Detection, DetectionResult, Embedding, Identity, Person, RecognitionEvent};
pub use vision::{VisionError, VisionModel};
