//! The session taste vector: one unit vector pulled toward liked tracks and pushed
//! away from disliked ones.

use crate::algorithm::normalized;
use serde::{Deserialize, Serialize};

/// Asymmetric learning rates. Positives move the vector faster than negatives, and
/// both move it faster during the first few feedback events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    pub positive_early: f64,
    pub positive_late: f64,
    pub negative_early: f64,
    pub negative_late: f64,
    /// Sessions with fewer feedback events than this use the early rates.
    pub early_events: usize,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            positive_early: 0.2,
            positive_late: 0.1,
            negative_early: 0.15,
            negative_late: 0.05,
            early_events: 5,
        }
    }
}

impl LearningRates {
    #[must_use]
    pub fn rate(&self, direction: f64, is_early: bool) -> f64 {
        match (direction > 0.0, is_early) {
            (true, true) => self.positive_early,
            (true, false) => self.positive_late,
            (false, true) => self.negative_early,
            (false, false) => self.negative_late,
        }
    }

    #[must_use]
    pub fn is_early(&self, feedback_events: usize) -> bool {
        feedback_events < self.early_events
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TasteVector {
    vector: Option<Vec<f64>>,
}

impl TasteVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Option<&[f64]> {
        self.vector.as_deref()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.vector.is_some()
    }

    /// Replace the vector outright (manual seed).
    pub fn set(&mut self, v: &[f64]) {
        self.vector = Some(normalized(v));
    }

    pub fn clear(&mut self) {
        self.vector = None;
    }

    /// Move toward (`direction > 0`) or away from (`direction <= 0`) `track`.
    ///
    /// An unset vector is initialised by the first positive and ignores negatives.
    /// The result is renormalised.
    pub fn update(&mut self, track: &[f64], direction: f64, is_early: bool, rates: &LearningRates) {
        let Some(current) = &self.vector else {
            if direction > 0.0 {
                self.vector = Some(normalized(track));
            }
            return;
        };

        let step = rates.rate(direction, is_early) * direction;
        let moved: Vec<f64> = current
            .iter()
            .zip(track)
            .map(|(v, t)| v + step * (t - v))
            .collect();
        self.vector = Some(normalized(&moved));
    }
}
