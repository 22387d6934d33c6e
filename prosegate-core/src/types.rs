//! Core types for Prosegate.
//!
//! Defines the persisted attempt/evaluation records, the generation parameter
//! set, the learned weight vector and the ephemeral parameter recommendation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::LearningError;

/// Tolerance on `sum(weights) == 1.0`.
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// Parameter key for sampling temperature.
pub const TEMPERATURE: &str = "temperature";
/// Parameter key for the frequency penalty.
pub const FREQUENCY_PENALTY: &str = "frequency_penalty";
/// Parameter key for the presence penalty.
pub const PRESENCE_PENALTY: &str = "presence_penalty";

/// The generation knob values used for one attempt.
///
/// Keys are opaque to the engine except for the handful the advisor nudges on
/// retry. `version` identifies the knob schema; records from another schema
/// version are never mixed into recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl GenerationParameters {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }
}

impl fmt::Display for GenerationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)?;
        for (key, value) in &self.values {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// How the detection collaborator produced its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// The trusted, primary detection backend.
    Authoritative,
    /// A fallback estimate; its extreme values are not trusted for learning.
    Heuristic,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Authoritative => "authoritative",
            DetectionMethod::Heuristic => "heuristic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authoritative" => Some(DetectionMethod::Authoritative),
            "heuristic" => Some(DetectionMethod::Heuristic),
            _ => None,
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stored record is untrustworthy for learning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ExclusionReason {
    /// Maximum detection score from a non-authoritative detector.
    SuspiciousPerfectScore,
    /// Identical parameters produced wildly different detection scores.
    InconsistentScores,
    /// Any other annotation found in the store.
    Other(String),
}

impl ExclusionReason {
    pub fn as_str(&self) -> &str {
        match self {
            ExclusionReason::SuspiciousPerfectScore => "suspicious-perfect-score",
            ExclusionReason::InconsistentScores => "inconsistent-scores",
            ExclusionReason::Other(reason) => reason,
        }
    }
}

impl From<String> for ExclusionReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "suspicious-perfect-score" => ExclusionReason::SuspiciousPerfectScore,
            "inconsistent-scores" => ExclusionReason::InconsistentScores,
            _ => ExclusionReason::Other(value),
        }
    }
}

impl From<ExclusionReason> for String {
    fn from(value: ExclusionReason) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three raw quality sub-scores of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttemptScores {
    /// Human-likeness, 0–100.
    pub detection: f64,
    /// Subjective quality, 0–10.
    pub subjective: f64,
    /// Readability, 0–100.
    pub readability: f64,
}

/// One retry iteration of one generation request.
///
/// Every field except `exclusion_reason` is immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub id: Uuid,
    pub request_id: Uuid,
    pub subject_key: String,
    pub component_type: String,
    /// 1-based position within the request.
    pub attempt_number: u32,
    pub parameters: GenerationParameters,
    pub content: String,
    pub detection_score: f64,
    pub detection_method: DetectionMethod,
    pub subjective_score: f64,
    pub readability_score: f64,
    /// Derived 0–1 acceptance metric.
    pub composite_score: f64,
    pub success: bool,
    pub exclusion_reason: Option<ExclusionReason>,
    pub created_at: DateTime<Utc>,
}

impl GenerationAttempt {
    pub fn scores(&self) -> AttemptScores {
        AttemptScores {
            detection: self.detection_score,
            subjective: self.subjective_score,
            readability: self.readability_score,
        }
    }

    /// Whether this record may feed learning and recommendations.
    pub fn is_qualifying(&self) -> bool {
        self.exclusion_reason.is_none()
    }
}

/// Subjective evaluation of an attempt's text; 1:1 with `GenerationAttempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectiveEvaluation {
    pub attempt_id: Uuid,
    pub narrative: String,
    pub realism_score: f64,
    pub voice_authenticity: f64,
    pub tonal_consistency: f64,
    pub ai_tendencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl SubjectiveEvaluation {
    /// Mean of the three 0–10 dimensions.
    pub fn subjective_score(&self) -> f64 {
        (self.realism_score + self.voice_authenticity + self.tonal_consistency) / 3.0
    }
}

/// Evidence-derived confidence in a weight vector or recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Confidence::None),
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weights applied to the normalized detection, subjective and readability scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub detection: f64,
    pub subjective: f64,
    pub readability: f64,
}

impl Weights {
    /// Build a weight triple, rejecting anything off the probability simplex.
    pub fn new(detection: f64, subjective: f64, readability: f64) -> Result<Self, LearningError> {
        let weights = Self {
            detection,
            subjective,
            readability,
        };
        weights.check()?;
        Ok(weights)
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.detection, self.subjective, self.readability]
    }

    pub fn from_array(values: [f64; 3]) -> Result<Self, LearningError> {
        Self::new(values[0], values[1], values[2])
    }

    pub fn sum(&self) -> f64 {
        self.detection + self.subjective + self.readability
    }

    /// Verify bounds and the unit-sum constraint.
    pub fn check(&self) -> Result<(), LearningError> {
        for (name, value) in [
            ("detection", self.detection),
            ("subjective", self.subjective),
            ("readability", self.readability),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(LearningError::InvalidWeights {
                    message: format!("{name} weight {value} is outside [0, 1]"),
                });
            }
        }
        if (self.sum() - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(LearningError::InvalidWeights {
                message: format!("weights sum to {} instead of 1.0", self.sum()),
            });
        }
        Ok(())
    }
}

/// The globally active, versioned weight vector.
///
/// Instances are immutable; the learner publishes a new one instead of
/// mutating the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub version: u64,
    pub weights: Weights,
    pub confidence: Confidence,
    pub sample_size: usize,
    pub last_updated: DateTime<Utc>,
}

impl WeightVector {
    pub fn new(
        version: u64,
        weights: Weights,
        confidence: Confidence,
        sample_size: usize,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            version,
            weights,
            confidence,
            sample_size,
            last_updated,
        }
    }
}

/// Where a parameter recommendation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationSource {
    BestPrevious,
    SweetSpot,
    Default,
}

impl fmt::Display for RecommendationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationSource::BestPrevious => write!(f, "best-previous"),
            RecommendationSource::SweetSpot => write!(f, "sweet-spot"),
            RecommendationSource::Default => write!(f, "default"),
        }
    }
}

/// Parameters chosen for the next attempt. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecommendation {
    pub parameters: GenerationParameters,
    pub source: RecommendationSource,
    pub confidence: Confidence,
    /// Number of qualifying records behind the recommendation.
    pub sample_size: usize,
    /// The attempt the parameters were copied from, for `best-previous`.
    pub based_on: Option<Uuid>,
    /// Whether the parameters were nudged after a failed attempt.
    pub adjusted_for_retry: bool,
}
