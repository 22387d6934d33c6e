//! Composite scoring.
//!
//! Combines an attempt's three sub-scores with a weight vector into a single
//! 0–1 acceptance metric. Sub-scores are normalized with fixed divisors before
//! weighting:
//!
//! | sub-score   | raw range | divisor |
//! |-------------|-----------|---------|
//! | detection   | 0–100     | 100     |
//! | subjective  | 0–10      | 10      |
//! | readability | 0–100     | 100     |
//!
//! Everything here is pure: identical inputs always give identical outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AttemptScores, Weights};

pub const DETECTION_SCALE: f64 = 100.0;
pub const SUBJECTIVE_SCALE: f64 = 10.0;
pub const READABILITY_SCALE: f64 = 100.0;

/// Sub-scores mapped onto [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedScores {
    pub detection: f64,
    pub subjective: f64,
    pub readability: f64,
}

impl NormalizedScores {
    pub fn as_array(&self) -> [f64; 3] {
        [self.detection, self.subjective, self.readability]
    }
}

/// Weighted share each sub-score contributed to the composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contributions {
    pub detection: f64,
    pub subjective: f64,
    pub readability: f64,
}

/// A composite score with the breakdown that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub value: f64,
    pub normalized: NormalizedScores,
    pub contributions: Contributions,
}

impl CompositeScore {
    /// Name of the sub-score with the smallest contribution.
    pub fn weakest_component(&self) -> &'static str {
        let c = &self.contributions;
        let mut weakest = ("detection", c.detection);
        for candidate in [("subjective", c.subjective), ("readability", c.readability)] {
            if candidate.1 < weakest.1 {
                weakest = candidate;
            }
        }
        weakest.0
    }
}

impl fmt::Display for CompositeScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} (detection {:.3} + subjective {:.3} + readability {:.3})",
            self.value,
            self.contributions.detection,
            self.contributions.subjective,
            self.contributions.readability
        )
    }
}

/// Normalize raw sub-scores with the fixed divisors, clamped to [0, 1].
pub fn normalize(scores: &AttemptScores) -> NormalizedScores {
    NormalizedScores {
        detection: unit(scores.detection / DETECTION_SCALE),
        subjective: unit(scores.subjective / SUBJECTIVE_SCALE),
        readability: unit(scores.readability / READABILITY_SCALE),
    }
}

/// Combine sub-scores with weights.
pub fn composite(scores: &AttemptScores, weights: &Weights) -> CompositeScore {
    let normalized = normalize(scores);
    let contributions = Contributions {
        detection: weights.detection * normalized.detection,
        subjective: weights.subjective * normalized.subjective,
        readability: weights.readability * normalized.readability,
    };
    CompositeScore {
        value: contributions.detection + contributions.subjective + contributions.readability,
        normalized,
        contributions,
    }
}

fn unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
