//! Reference embeddings keyed by person id, published as immutable snapshots.

use crate::types::{Detection, Embedding};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// One enrolled person's reference embedding plus the display fields needed
/// to announce them without a directory lookup.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub person_id: String,
    pub name: String,
    pub title: String,
    pub embedding: Embedding,
}

/// A complete gallery. Entries keep insertion order; person ids are unique.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
}

impl GallerySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    pub fn get(&self, person_id: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.person_id == person_id)
    }

    pub fn contains(&self, person_id: &str) -> bool {
        self.get(person_id).is_some()
    }
}

/// What happened when a person's reference detections were offered to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Zero faces in the reference image; the person is left out.
    NoFace,
    /// More than one face; the first returned embedding was used.
    TookFirstOf(usize),
    /// The id is already in this snapshot; the later offer is ignored.
    DuplicateId,
}

/// Accumulates a fresh snapshot during a full rebuild.
#[derive(Debug, Default)]
pub struct GalleryBuilder {
    entries: Vec<GalleryEntry>,
    seen: HashSet<String>,
}

impl GalleryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: GalleryEntry) -> bool {
        if !self.seen.insert(entry.person_id.clone()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Add a person from the vision model's output on their reference image.
    ///
    /// Multiple faces are accepted permissively: the first embedding wins.
    pub fn add_reference(
        &mut self,
        person_id: &str,
        name: &str,
        title: &str,
        detections: Vec<Detection>,
    ) -> AddOutcome {
        let count = detections.len();
        let Some(first) = detections.into_iter().next() else {
            tracing::warn!(person_id, "no face in reference image; skipping");
            return AddOutcome::NoFace;
        };

        let entry = GalleryEntry {
            person_id: person_id.to_string(),
            name: name.to_string(),
            title: title.to_string(),
            embedding: first.embedding,
        };
        if !self.insert(entry) {
            return AddOutcome::DuplicateId;
        }

        if count > 1 {
            tracing::warn!(
                person_id,
                faces = count,
                "reference image has several faces; using the first"
            );
            AddOutcome::TookFirstOf(count)
        } else {
            AddOutcome::Added
        }
    }

    pub fn build(self) -> GallerySnapshot {
        GallerySnapshot {
            entries: self.entries,
        }
    }
}

/// Shared handle to the current snapshot.
///
/// Readers clone the inner `Arc` and never observe a partially built gallery;
/// `publish` swaps the whole snapshot in one step.
#[derive(Clone, Default)]
pub struct Gallery {
    current: Arc<RwLock<Arc<GallerySnapshot>>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn publish(&self, next: GallerySnapshot) {
        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn det(values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 },
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_builder_n_people_one_face_each() {
        let mut builder = GalleryBuilder::new();
        for i in 0..5 {
            let id = format!("p{i}");
            let outcome = builder.add_reference(&id, "n", "t", vec![det(vec![i as f32, 1.0])]);
            assert_eq!(outcome, AddOutcome::Added);
        }
        let snapshot = builder.build();
        assert_eq!(snapshot.len(), 5);
        for i in 0..5 {
            assert!(snapshot.contains(&format!("p{i}")));
        }
    }

    #[test]
    fn test_builder_skips_person_without_face() {
        let mut builder = GalleryBuilder::new();
        assert_eq!(builder.add_reference("a", "A", "", vec![]), AddOutcome::NoFace);
        assert_eq!(builder.add_reference("b", "B", "", vec![det(vec![1.0])]), AddOutcome::Added);
        let snapshot = builder.build();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.contains("a"));
    }

    #[test]
    fn test_builder_takes_first_of_many_faces() {
        let mut builder = GalleryBuilder::new();
        let outcome = builder.add_reference("a", "A", "", vec![det(vec![1.0, 0.0]), det(vec![0.0, 1.0])]);
        assert_eq!(outcome, AddOutcome::TookFirstOf(2));
        let snapshot = builder.build();
        assert_eq!(snapshot.get("a").unwrap().embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_builder_rejects_duplicate_ids() {
        let mut builder = GalleryBuilder::new();
        builder.add_reference("a", "A", "", vec![det(vec![1.0])]);
        assert_eq!(builder.add_reference("a", "A2", "", vec![det(vec![2.0])]), AddOutcome::DuplicateId);
        let snapshot = builder.build();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a").unwrap().name, "A");
    }

    #[test]
    fn test_publish_replaces_snapshot_wholesale() {
        let gallery = Gallery::new();
        assert!(gallery.is_empty());

        let held = gallery.snapshot();
        let mut builder = GalleryBuilder::new();
        builder.add_reference("a", "A", "", vec![det(vec![1.0])]);
        gallery.publish(builder.build());

        // A reader holding the old snapshot keeps seeing it unchanged.
        assert!(held.is_empty());
        assert_eq!(gallery.len(), 1);
    }
}
