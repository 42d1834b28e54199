//! Pluggable candidate-selection strategies for stage 4.
//!
//! Stage 3 may produce more candidates than verification should spend budget
//! on. A strategy picks the subset to carry forward, trading candidate
//! quality against diversity of phrasing.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::types::{SolutionCandidate, StageConfiguration};

/// Lowercased alphanumeric token set, the unit of text similarity here.
pub(crate) fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard similarity over token sets. Two empty texts are identical.
pub(crate) fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let ta = token_set(a);
    let tb = token_set(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// Which selection strategy stage 4 uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategyKind {
    DiversityMaximizing,
    Greedy,
    RandomSampling,
}

impl std::fmt::Display for EnsembleStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DiversityMaximizing => write!(f, "diversity_maximizing"),
            Self::Greedy => write!(f, "greedy"),
            Self::RandomSampling => write!(f, "random_sampling"),
        }
    }
}

/// Selects the candidate subset stage 5 will verify.
pub trait EnsembleStrategy: Send + Sync {
    fn select(
        &self,
        candidates: &[SolutionCandidate],
        config: &StageConfiguration,
    ) -> Vec<SolutionCandidate>;

    fn name(&self) -> &str;
}

/// Construct the strategy for a configuration choice. Random sampling is
/// unseeded here; tests construct [`RandomSamplingStrategy::seeded`] directly.
pub fn ensemble_strategy_for(kind: EnsembleStrategyKind) -> Box<dyn EnsembleStrategy> {
    match kind {
        EnsembleStrategyKind::DiversityMaximizing => Box::new(DiversityMaximizingStrategy),
        EnsembleStrategyKind::Greedy => Box::new(GreedyStrategy),
        EnsembleStrategyKind::RandomSampling => Box::new(RandomSamplingStrategy::new()),
    }
}

/// Farthest-point selection: seed with the best candidate, then repeatedly
/// add the candidate with the best blend of quality and distance from the
/// already-selected set. Candidates closer than `diversity_threshold` to
/// everything selected are skipped while any sufficiently novel one remains.
pub struct DiversityMaximizingStrategy;

impl DiversityMaximizingStrategy {
    fn min_distance(candidate: &SolutionCandidate, selected: &[SolutionCandidate]) -> f64 {
        selected
            .iter()
            .map(|s| 1.0 - jaccard_similarity(&candidate.text, &s.text))
            .fold(f64::INFINITY, f64::min)
    }
}

impl EnsembleStrategy for DiversityMaximizingStrategy {
    fn select(
        &self,
        candidates: &[SolutionCandidate],
        config: &StageConfiguration,
    ) -> Vec<SolutionCandidate> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut pool: Vec<SolutionCandidate> = candidates.to_vec();
        pool.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selected = vec![pool.remove(0)];

        while selected.len() < config.max_candidates && !pool.is_empty() {
            let scored: Vec<(usize, f64, f64)> = pool
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let distance = Self::min_distance(c, &selected);
                    (i, distance, 0.5 * c.quality_score + 0.5 * distance)
                })
                .collect();

            // Prefer candidates that clear the diversity floor; fall back to
            // the best blended score when none do.
            let pick = scored
                .iter()
                .filter(|(_, d, _)| *d >= config.diversity_threshold)
                .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .or_else(|| {
                    scored
                        .iter()
                        .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                });

            match pick {
                Some((i, _, _)) => {
                    let candidate = pool.remove(*i);
                    selected.push(candidate);
                }
                None => break,
            }
        }

        selected
    }

    fn name(&self) -> &str {
        "diversity_maximizing"
    }
}

/// Top candidates by quality score, diversity ignored.
pub struct GreedyStrategy;

impl EnsembleStrategy for GreedyStrategy {
    fn select(
        &self,
        candidates: &[SolutionCandidate],
        config: &StageConfiguration,
    ) -> Vec<SolutionCandidate> {
        let mut sorted: Vec<SolutionCandidate> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(config.max_candidates);
        sorted
    }

    fn name(&self) -> &str {
        "greedy"
    }
}

/// Uniform sample of the candidate pool. Seedable for deterministic tests.
pub struct RandomSamplingStrategy {
    seed: Option<u64>,
}

impl RandomSamplingStrategy {
    pub fn new() -> Self {
        Self { seed: None }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl Default for RandomSamplingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl EnsembleStrategy for RandomSamplingStrategy {
    fn select(
        &self,
        candidates: &[SolutionCandidate],
        config: &StageConfiguration,
    ) -> Vec<SolutionCandidate> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut indices: Vec<usize> = (0..candidates.len()).collect();
        indices.shuffle(&mut rng);
        indices.truncate(config.max_candidates);
        indices.sort_unstable();

        indices.into_iter().map(|i| candidates[i].clone()).collect()
    }

    fn name(&self) -> &str {
        "random_sampling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidates() -> Vec<SolutionCandidate> {
        vec![
            SolutionCandidate::new("the claim is accurate and well supported", 0.9, 0.9),
            SolutionCandidate::new("the claim is accurate and well supported indeed", 0.85, 0.8),
            SolutionCandidate::new("evidence contradicts the stated figure entirely", 0.7, 0.7),
            SolutionCandidate::new("wording is ambiguous about the time frame", 0.6, 0.6),
        ]
    }

    fn config(max: usize) -> StageConfiguration {
        StageConfiguration::default()
            .with_max_candidates(max)
            .with_diversity_threshold(0.5)
    }

    #[test]
    fn test_jaccard_bounds() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_eq!(jaccard_similarity("a b c", "x y z"), 0.0);
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }

    #[test]
    fn test_greedy_takes_top_quality() {
        let selected = GreedyStrategy.select(&candidates(), &config(2));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].quality_score, 0.9);
        assert_eq!(selected[1].quality_score, 0.85);
    }

    #[test]
    fn test_diversity_skips_near_duplicate() {
        let selected = DiversityMaximizingStrategy.select(&candidates(), &config(2));
        assert_eq!(selected.len(), 2);
        // The near-duplicate of the best candidate loses to a distant one.
        assert_eq!(selected[0].quality_score, 0.9);
        assert_ne!(
            selected[1].text,
            "the claim is accurate and well supported indeed"
        );
    }

    #[test]
    fn test_diversity_empty_pool() {
        let selected = DiversityMaximizingStrategy.select(&[], &config(3));
        assert!(selected.is_empty());
    }

    #[test]
    fn test_random_sampling_is_deterministic_with_seed() {
        let pool = candidates();
        let a = RandomSamplingStrategy::seeded(7).select(&pool, &config(2));
        let b = RandomSamplingStrategy::seeded(7).select(&pool, &config(2));
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_selection_never_exceeds_max() {
        for strategy in [
            Box::new(GreedyStrategy) as Box<dyn EnsembleStrategy>,
            Box::new(DiversityMaximizingStrategy),
            Box::new(RandomSamplingStrategy::seeded(1)),
        ] {
            let selected = strategy.select(&candidates(), &config(3));
            assert!(selected.len() <= 3, "strategy {}", strategy.name());
        }
    }
}
