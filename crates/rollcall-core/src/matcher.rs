//! Roster-scoped embedding bank and 1:N nearest-neighbour identity matching.

use crate::types::{Embedding, IdentityId};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

/// Reference embeddings for the identities allowed in one session.
///
/// Built once at session start and never mutated afterwards. Identities are
/// kept in ascending id order so that traversal order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBank {
    entries: BTreeMap<IdentityId, Vec<Embedding>>,
}

impl EmbeddingBank {
    /// Keep only rostered identities, normalizing every stored vector.
    ///
    /// Zero-norm vectors are kept as-is (they can never win a match);
    /// identities left without any vector are skipped.
    pub fn build<I>(registered: I, roster: &HashSet<IdentityId>) -> Self
    where
        I: IntoIterator<Item = (IdentityId, Vec<Vec<f32>>)>,
    {
        let mut entries = BTreeMap::new();

        for (identity, vectors) in registered {
            if identity.is_empty() || !roster.contains(&identity) {
                continue;
            }

            let bank: Vec<Embedding> = vectors
                .into_iter()
                .filter(|v| !v.is_empty())
                .map(|v| {
                    let raw = Embedding::new(v);
                    raw.normalized().unwrap_or(raw)
                })
                .collect();

            if bank.is_empty() {
                continue;
            }
            tracing::debug!(identity = %identity, embeddings = bank.len(), "bank entry loaded");
            entries.entry(identity).or_insert_with(Vec::new).extend(bank);
        }

        tracing::info!(
            identities = entries.len(),
            roster = roster.len(),
            "embedding bank built"
        );

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Total number of reference vectors across all identities.
    pub fn embedding_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn identities(&self) -> impl Iterator<Item = &IdentityId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityId, &[Embedding])> {
        self.entries.iter().map(|(id, v)| (id, v.as_slice()))
    }
}

/// Accepted match for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity: IdentityId,
    /// Cosine distance to the closest reference vector.
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against a session's bank.
pub trait Matcher {
    fn best_match(
        &self,
        probe: &Embedding,
        bank: &EmbeddingBank,
        threshold: f32,
    ) -> Option<MatchOutcome>;
}

/// Global nearest neighbour by cosine distance.
///
/// Scans every reference vector of every identity and keeps the single
/// closest one. Ties resolve to the lowest identity id because the bank is
/// traversed in id order and only a strictly smaller distance replaces the
/// current best.
pub struct NearestNeighborMatcher;

impl Matcher for NearestNeighborMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        bank: &EmbeddingBank,
        threshold: f32,
    ) -> Option<MatchOutcome> {
        if bank.is_empty() {
            return None;
        }
        let probe = probe.normalized()?;

        let mut best: Option<(&IdentityId, f32)> = None;
        for (identity, references) in bank.iter() {
            for reference in references {
                let distance = probe.cosine_distance(reference);
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((identity, distance));
                }
            }
        }

        match best {
            Some((identity, distance)) if distance < threshold => Some(MatchOutcome {
                identity: identity.clone(),
                distance,
            }),
            Some((identity, distance)) => {
                tracing::debug!(nearest = %identity, distance, threshold, "no identity within threshold");
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> HashSet<IdentityId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Unit vector at `distance` (cosine) from [1, 0].
    fn at_distance(distance: f32) -> Vec<f32> {
        let cos = 1.0 - distance;
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_build_filters_to_roster() {
        let registered = vec![
            ("S1".to_string(), vec![vec![1.0, 0.0]]),
            ("S2".to_string(), vec![vec![0.0, 1.0]]),
            ("S9".to_string(), vec![vec![1.0, 1.0]]),
        ];
        let bank = EmbeddingBank::build(registered, &roster(&["S1", "S2"]));
        assert_eq!(bank.len(), 2);
        assert!(bank.contains("S1"));
        assert!(!bank.contains("S9"));
    }

    #[test]
    fn test_build_normalizes_and_skips_empty() {
        let registered = vec![
            ("S1".to_string(), vec![vec![3.0, 4.0]]),
            ("S2".to_string(), vec![]),
        ];
        let bank = EmbeddingBank::build(registered, &roster(&["S1", "S2"]));
        assert_eq!(bank.len(), 1);
        let (_, refs) = bank.iter().next().unwrap();
        assert!((refs[0].norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_closest_identity_wins() {
        let registered = vec![
            ("A".to_string(), vec![at_distance(0.1)]),
            ("B".to_string(), vec![at_distance(0.6)]),
        ];
        let bank = EmbeddingBank::build(registered, &roster(&["A", "B"]));
        let probe = Embedding::new(vec![1.0, 0.0]);

        let m = NearestNeighborMatcher.best_match(&probe, &bank, 0.55).unwrap();
        assert_eq!(m.identity, "A");
        assert!((m.distance - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_global_minimum_across_reference_sets() {
        // B has one far and one very close vector; the close one decides.
        let registered = vec![
            ("A".to_string(), vec![at_distance(0.2), at_distance(0.25)]),
            ("B".to_string(), vec![at_distance(0.9), at_distance(0.05)]),
        ];
        let bank = EmbeddingBank::build(registered, &roster(&["A", "B"]));
        let probe = Embedding::new(vec![2.0, 0.0]);

        let m = NearestNeighborMatcher.best_match(&probe, &bank, 0.55).unwrap();
        assert_eq!(m.identity, "B");
    }

    #[test]
    fn test_threshold_is_strict() {
        let registered = vec![("A".to_string(), vec![at_distance(0.6)])];
        let bank = EmbeddingBank::build(registered, &roster(&["A"]));
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(NearestNeighborMatcher.best_match(&probe, &bank, 0.55).is_none());
    }

    #[test]
    fn test_tie_resolves_to_lowest_identity() {
        let registered = vec![
            ("S2".to_string(), vec![vec![1.0, 0.0]]),
            ("S1".to_string(), vec![vec![1.0, 0.0]]),
        ];
        let bank = EmbeddingBank::build(registered, &roster(&["S1", "S2"]));
        let probe = Embedding::new(vec![1.0, 0.0]);
        let m = NearestNeighborMatcher.best_match(&probe, &bank, 0.55).unwrap();
        assert_eq!(m.identity, "S1");
    }

    #[test]
    fn test_mismatched_length_never_matches() {
        let registered = vec![("A".to_string(), vec![vec![1.0]])];
        let bank = EmbeddingBank::build(registered, &roster(&["A"]));
        let probe = Embedding::new(vec![1.0, 5.0, 5.0]);
        assert!(NearestNeighborMatcher.best_match(&probe, &bank, 0.55).is_none());
    }

    #[test]
    fn test_zero_probe_and_empty_bank() {
        let registered = vec![("A".to_string(), vec![vec![1.0, 0.0]])];
        let bank = EmbeddingBank::build(registered, &roster(&["A"]));
        let zero = Embedding::new(vec![0.0, 0.0]);
        assert!(NearestNeighborMatcher.best_match(&zero, &bank, 0.55).is_none());

        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(NearestNeighborMatcher
            .best_match(&probe, &EmbeddingBank::default(), 0.55)
            .is_none());
    }
}
