//! Vector math and the similarity-scoring kernel.
//!
//! Candidates are scored against a target vector with a Gaussian over cosine
//! distance, pushed down near negative exemplars, and nudged up when they sit close
//! to most of a multi-target set.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Guards divisions by a vector norm.
pub const EPSILON: f64 = 1e-8;

/// Guards inverse-std feature weights.
const STD_EPSILON: f64 = 1e-6;

/// Tunable kernel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringContext {
    /// Lower bound for the Gaussian width.
    pub sigma_floor: f64,
    /// Negatives only repel above this cosine similarity.
    pub penalty_threshold: f64,
    pub penalty_sigma: f64,
    pub penalty_weight: f64,
    /// A target counts as covering a candidate above this cosine similarity.
    pub overlap_threshold: f64,
    /// Coverage ratio that must be exceeded before any boost applies.
    pub overlap_min_coverage: f64,
    pub overlap_max_boost: f64,
}

impl Default for ScoringContext {
    fn default() -> Self {
        Self {
            sigma_floor: 0.05,
            penalty_threshold: 0.65,
            penalty_sigma: 0.08,
            penalty_weight: 3.0,
            overlap_threshold: 0.85,
            overlap_min_coverage: 0.5,
            overlap_max_boost: 0.2,
        }
    }
}

#[must_use]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[must_use]
pub fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

/// Cosine similarity, `0.0` when either side is a zero vector.
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    dot(a, b) / (norm(a) * norm(b) + EPSILON)
}

#[must_use]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[must_use]
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Unit-length copy of `v`. A zero vector comes back unchanged.
#[must_use]
pub fn normalized(v: &[f64]) -> Vec<f64> {
    let n = norm(v);
    if n <= EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / n).collect()
}

/// Component-wise mean, `None` for an empty set.
#[must_use]
pub fn mean_vector<V: AsRef<[f64]>>(vectors: &[V]) -> Option<Vec<f64>> {
    let first = vectors.first()?.as_ref();
    let mut sum = vec![0.0; first.len()];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.as_ref()) {
            *acc += x;
        }
    }
    let count = vectors.len() as f64;
    Some(sum.into_iter().map(|x| x / count).collect())
}

/// `weight·a + (1-weight)·b`.
#[must_use]
pub fn blend(a: &[f64], b: &[f64], weight: f64) -> Vec<f64> {
    a.iter()
        .zip(b)
        .map(|(x, y)| weight * x + (1.0 - weight) * y)
        .collect()
}

/// Mean squared distance of `vectors` to `center`.
#[must_use]
pub fn spread_variance<V: AsRef<[f64]>>(vectors: &[V], center: &[f64]) -> f64 {
    if vectors.is_empty() {
        return 0.0;
    }
    vectors
        .iter()
        .map(|v| squared_distance(v.as_ref(), center))
        .sum::<f64>()
        / vectors.len() as f64
}

/// `exp(-(1-cos)² / (2σ²))`: exactly `1.0` at zero cosine distance.
#[must_use]
pub fn gaussian_similarity(cosine: f64, sigma: f64) -> f64 {
    let distance = 1.0 - cosine;
    (-(distance * distance) / (2.0 * sigma * sigma)).exp()
}

/// Kernel width for a target variance.
#[must_use]
pub fn sigma_for_variance(variance: f64, floor: f64) -> f64 {
    variance.max(0.0).sqrt().max(floor)
}

/// Per-dimension weights from the spread of liked vectors.
///
/// Dimensions the likes agree on get heavier weights:
/// `w_d = (1/(std_d+1e-6)) / mean(1/(std+1e-6))`. Needs at least two likes.
/// The returned values are already square-rooted, ready to scale vectors with.
#[must_use]
pub fn feature_weights<V: AsRef<[f64]>>(likes: &[V]) -> Option<Vec<f64>> {
    if likes.len() < 2 {
        return None;
    }
    let mean = mean_vector(likes)?;
    let count = likes.len() as f64;
    let inverse_std: Vec<f64> = (0..mean.len())
        .map(|d| {
            let var = likes
                .iter()
                .map(|v| {
                    let diff = v.as_ref()[d] - mean[d];
                    diff * diff
                })
                .sum::<f64>()
                / count;
            1.0 / (var.sqrt() + STD_EPSILON)
        })
        .collect();
    let mean_inverse = inverse_std.iter().sum::<f64>() / inverse_std.len().max(1) as f64;
    if mean_inverse <= 0.0 {
        return None;
    }
    Some(inverse_std.into_iter().map(|w| (w / mean_inverse).sqrt()).collect())
}

#[must_use]
pub fn apply_weights(v: &[f64], sqrt_weights: &[f64]) -> Vec<f64> {
    v.iter().zip(sqrt_weights).map(|(x, w)| x * w).collect()
}

/// Repulsion from retained negatives. Always `>= 0`.
#[must_use]
pub fn negative_penalty<V: AsRef<[f64]>>(candidate: &[f64], negatives: &[V], ctx: &ScoringContext) -> f64 {
    negatives
        .iter()
        .map(|neg| cosine_similarity(candidate, neg.as_ref()))
        .filter(|&cos| cos > ctx.penalty_threshold)
        .map(|cos| ctx.penalty_weight * gaussian_similarity(cos, ctx.penalty_sigma))
        .sum()
}

/// Bonus for a candidate that most targets agree on. Capped at `overlap_max_boost`.
#[must_use]
pub fn overlap_boost<V: AsRef<[f64]>>(candidate: &[f64], targets: &[V], ctx: &ScoringContext) -> f64 {
    if targets.len() < 2 {
        return 0.0;
    }
    let close = targets
        .iter()
        .filter(|t| cosine_similarity(candidate, t.as_ref()) > ctx.overlap_threshold)
        .count();
    let ratio = close as f64 / targets.len() as f64;
    if ratio > ctx.overlap_min_coverage {
        (ratio * ctx.overlap_max_boost).min(ctx.overlap_max_boost)
    } else {
        0.0
    }
}

/// Components of one candidate score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub similarity: f64,
    pub penalty: f64,
    pub boost: f64,
    pub score: f64,
}

/// A target prepared for scoring many candidates.
#[derive(Debug, Clone)]
pub struct Kernel<'a> {
    target: Vec<f64>,
    sqrt_weights: Option<Vec<f64>>,
    sigma: f64,
    negatives: &'a [Vec<f64>],
    overlap_targets: &'a [Vec<f64>],
    ctx: ScoringContext,
}

impl<'a> Kernel<'a> {
    #[must_use]
    pub fn new(target: &[f64], variance: f64, ctx: ScoringContext) -> Self {
        Self {
            target: target.to_vec(),
            sqrt_weights: None,
            sigma: sigma_for_variance(variance, ctx.sigma_floor),
            negatives: &[],
            overlap_targets: &[],
            ctx,
        }
    }

    /// Scale target and candidates by square-rooted feature weights before comparing.
    #[must_use]
    pub fn with_weights(mut self, sqrt_weights: Option<Vec<f64>>) -> Self {
        if let Some(w) = &sqrt_weights {
            self.target = apply_weights(&self.target, w);
        }
        self.sqrt_weights = sqrt_weights;
        self
    }

    #[must_use]
    pub fn with_negatives(mut self, negatives: &'a [Vec<f64>]) -> Self {
        self.negatives = negatives;
        self
    }

    #[must_use]
    pub fn with_overlap_targets(mut self, targets: &'a [Vec<f64>]) -> Self {
        self.overlap_targets = targets;
        self
    }

    #[must_use]
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    #[must_use]
    pub fn score(&self, candidate: &[f64]) -> ScoreBreakdown {
        let weighted;
        let compared = match &self.sqrt_weights {
            Some(w) => {
                weighted = apply_weights(candidate, w);
                weighted.as_slice()
            }
            None => candidate,
        };
        let similarity = gaussian_similarity(cosine_similarity(&self.target, compared), self.sigma);
        let penalty = negative_penalty(candidate, self.negatives, &self.ctx);
        let boost = overlap_boost(candidate, self.overlap_targets, &self.ctx);
        ScoreBreakdown {
            similarity,
            penalty,
            boost,
            score: similarity - penalty + boost,
        }
    }

    /// Score `candidates` in parallel, best first. Ties keep input order.
    #[must_use]
    pub fn rank<'t>(&self, candidates: &[(usize, &'t [f64])]) -> Vec<(usize, ScoreBreakdown)> {
        let mut scored: Vec<(usize, ScoreBreakdown)> = candidates
            .par_iter()
            .map(|&(idx, v)| (idx, self.score(v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored
    }
}
