//! Best-match search of a query embedding over a gallery snapshot.

use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, Identity};
use serde::{Deserialize, Serialize};

/// Result of matching one face against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        person_id: String,
        name: String,
        score: f32,
    },
    Unmatched,
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<Identity> {
        match self {
            MatchOutcome::Matched {
                person_id,
                name,
                score,
            } => Some(Identity {
                person_id: person_id.clone(),
                name: name.clone(),
                score: *score,
            }),
            MatchOutcome::Unmatched => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Which entry wins when two gallery entries score exactly the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// A candidate scoring `>=` the running best replaces it, so the
    /// last-iterated of equal scores wins.
    #[default]
    LastWins,
    /// Only a strictly higher score replaces the running best.
    FirstWins,
}

/// Cosine similarity matcher with a fixed acceptance threshold.
///
/// Always visits every gallery entry; cost is O(gallery size) per face.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    pub threshold: f32,
    pub tie_break: TieBreak,
}

impl SimilarityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            tie_break: TieBreak::default(),
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn best_match(&self, query: &Embedding, gallery: &GallerySnapshot) -> MatchOutcome {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best = None;

        for entry in gallery.iter() {
            let sim = query.similarity(&entry.embedding);
            let replaces = match self.tie_break {
                TieBreak::LastWins => sim >= best_sim,
                TieBreak::FirstWins => sim > best_sim,
            };
            if replaces {
                best_sim = sim;
                best = Some(entry);
            }
        }

        match best {
            Some(entry) if best_sim > self.threshold => MatchOutcome::Matched {
                person_id: entry.person_id.clone(),
                name: entry.name.clone(),
                score: best_sim,
            },
            _ => MatchOutcome::Unmatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{GalleryBuilder, GalleryEntry};

    fn gallery(entries: &[(&str, Vec<f32>)]) -> GallerySnapshot {
        let mut builder = GalleryBuilder::new();
        for (id, values) in entries {
            builder.insert(GalleryEntry {
                person_id: id.to_string(),
                name: format!("name-{id}"),
                title: String::new(),
                embedding: Embedding::new(values.clone()),
            });
        }
        builder.build()
    }

    #[test]
    fn test_returns_global_maximum() {
        let g = gallery(&[
            ("decoy1", vec![0.0, 1.0, 0.0]),
            ("match", vec![0.9, 0.1, 0.0]),
            ("decoy2", vec![0.0, 0.0, 1.0]),
        ]);
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let outcome = SimilarityMatcher::new(0.5).best_match(&query, &g);
        match outcome {
            MatchOutcome::Matched { person_id, name, score } => {
                assert_eq!(person_id, "match");
                assert_eq!(name, "name-match");
                assert!(score > 0.9);
            }
            MatchOutcome::Unmatched => panic!("expected a match"),
        }
    }

    #[test]
    fn test_exact_tie_last_inserted_wins() {
        let g = gallery(&[("first", vec![1.0, 0.0]), ("second", vec![1.0, 0.0])]);
        let query = Embedding::new(vec![1.0, 0.0]);
        let outcome = SimilarityMatcher::new(0.5).best_match(&query, &g);
        assert_eq!(outcome.identity().unwrap().person_id, "second");
    }

    #[test]
    fn test_first_wins_policy_keeps_earlier_entry() {
        let g = gallery(&[("first", vec![1.0, 0.0]), ("second", vec![1.0, 0.0])]);
        let query = Embedding::new(vec![1.0, 0.0]);
        let outcome = SimilarityMatcher::new(0.5)
            .with_tie_break(TieBreak::FirstWins)
            .best_match(&query, &g);
        assert_eq!(outcome.identity().unwrap().person_id, "first");
    }

    #[test]
    fn test_below_threshold_is_unmatched() {
        let g = gallery(&[
            ("a", vec![0.0, 1.0, 0.0]),
            ("b", vec![0.0, 0.0, 1.0]),
            ("c", vec![0.3, 1.0, 0.0]),
        ]);
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(SimilarityMatcher::new(0.5).best_match(&query, &g), MatchOutcome::Unmatched);
    }

    #[test]
    fn test_empty_gallery_is_unmatched() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let outcome = SimilarityMatcher::new(0.0).best_match(&query, &GallerySnapshot::default());
        assert_eq!(outcome, MatchOutcome::Unmatched);
        assert!(!outcome.is_matched());
    }

    #[test]
    fn test_score_equal_to_threshold_is_unmatched() {
        let g = gallery(&[("a", vec![1.0, 0.0])]);
        let query = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(SimilarityMatcher::new(1.0).best_match(&query, &g), MatchOutcome::Unmatched);
        assert!(SimilarityMatcher::new(0.99).best_match(&query, &g).is_matched());
    }
}
