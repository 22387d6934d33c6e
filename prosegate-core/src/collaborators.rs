//! External collaborators: text generation, detection and subjective evaluation.
//!
//! The engine only sees these traits. Responses are validated on the way in:
//! an out-of-range or non-finite score is an `InvalidResponse`, never clamped
//! into something that looks real.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::scoring::{DETECTION_SCALE, SUBJECTIVE_SCALE};
use crate::types::{DetectionMethod, GenerationParameters, SubjectiveEvaluation};

pub const GENERATOR: &str = "generator";
pub const DETECTOR: &str = "detector";
pub const EVALUATOR: &str = "evaluator";

/// What the generator knows about the attempt besides subject and parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub component_type: String,
    /// 1-based attempt number within the request.
    pub attempt_number: u32,
    /// Why earlier attempts of this request were rejected, oldest first.
    #[serde(default)]
    pub feedback: Vec<String>,
    /// Caller-supplied template variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Human-likeness verdict from the detection service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 0–100; higher reads more human.
    pub score: f64,
    pub method: DetectionMethod,
}

impl Detection {
    pub fn validate(self) -> Result<Self, ServiceError> {
        if !self.score.is_finite() || !(0.0..=DETECTION_SCALE).contains(&self.score) {
            return Err(ServiceError::invalid_response(
                DETECTOR,
                format!("score {} outside 0-{DETECTION_SCALE}", self.score),
            ));
        }
        Ok(self)
    }
}

/// Raw response of the subjective evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectiveAssessment {
    pub narrative: String,
    pub realism: f64,
    pub voice_authenticity: f64,
    pub tonal_consistency: f64,
    #[serde(default)]
    pub ai_tendencies: BTreeSet<String>,
}

impl SubjectiveAssessment {
    pub fn validate(self) -> Result<Self, ServiceError> {
        for (name, value) in [
            ("realism", self.realism),
            ("voice_authenticity", self.voice_authenticity),
            ("tonal_consistency", self.tonal_consistency),
        ] {
            if !value.is_finite() || !(0.0..=SUBJECTIVE_SCALE).contains(&value) {
                return Err(ServiceError::invalid_response(
                    EVALUATOR,
                    format!("{name} {value} outside 0-{SUBJECTIVE_SCALE}"),
                ));
            }
        }
        Ok(self)
    }

    pub fn into_evaluation(self, attempt_id: Uuid, created_at: DateTime<Utc>) -> SubjectiveEvaluation {
        SubjectiveEvaluation {
            attempt_id,
            narrative: self.narrative,
            realism_score: self.realism,
            voice_authenticity: self.voice_authenticity,
            tonal_consistency: self.tonal_consistency,
            ai_tendencies: self.ai_tendencies,
            created_at,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        subject_key: &str,
        parameters: &GenerationParameters,
        context: &GenerationContext,
    ) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Detection, ServiceError>;
}

#[async_trait]
pub trait SubjectiveEvaluator: Send + Sync {
    async fn evaluate(&self, text: &str) -> Result<SubjectiveAssessment, ServiceError>;
}

// ─── Mocks ──────────────────────────────────────────────────────────────────

/// Replays queued replies in order and records every call.
///
/// An empty queue answers with a `Request` error rather than a made-up reply.
struct Script<T, C> {
    service: &'static str,
    replies: Mutex<VecDeque<Result<T, ServiceError>>>,
    calls: Mutex<Vec<C>>,
    delay: Option<Duration>,
}

impl<T, C> Script<T, C> {
    fn new(service: &'static str) -> Self {
        Self {
            service,
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    fn push(&self, reply: Result<T, ServiceError>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    async fn next(&self, call: C) -> Result<T, ServiceError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(ServiceError::request(self.service, "no queued response")))
    }

    fn calls(&self) -> Vec<C>
    where
        C: Clone,
    {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A generator call as seen by [`MockGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCall {
    pub subject_key: String,
    pub parameters: GenerationParameters,
    pub context: GenerationContext,
}

/// A scripted text generator for tests and dry runs.
pub struct MockGenerator {
    script: Script<String, GenerateCall>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            script: Script::new(GENERATOR),
        }
    }

    /// Delay every reply, e.g. to exercise call timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.script.push(Ok(text.into()));
    }

    pub fn queue_error(&self, error: ServiceError) {
        self.script.push(Err(error));
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.script.calls()
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(
        &self,
        subject_key: &str,
        parameters: &GenerationParameters,
        context: &GenerationContext,
    ) -> Result<String, ServiceError> {
        let call = GenerateCall {
            subject_key: subject_key.to_string(),
            parameters: parameters.clone(),
            context: context.clone(),
        };
        self.script.next(call).await
    }
}

/// A scripted detector that records the exact texts it was asked about.
pub struct MockDetector {
    script: Script<Detection, String>,
}

impl MockDetector {
    pub fn new() -> Self {
        Self {
            script: Script::new(DETECTOR),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    pub fn queue_score(&self, score: f64, method: DetectionMethod) {
        self.script.push(Ok(Detection { score, method }));
    }

    pub fn queue_error(&self, error: ServiceError) {
        self.script.push(Err(error));
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.script.calls()
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn detect(&self, text: &str) -> Result<Detection, ServiceError> {
        self.script.next(text.to_string()).await
    }
}

/// A scripted subjective evaluator.
pub struct MockEvaluator {
    script: Script<SubjectiveAssessment, String>,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self {
            script: Script::new(EVALUATOR),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    /// Queue an assessment scoring `score` on all three dimensions.
    pub fn queue_uniform(&self, score: f64) {
        self.queue_assessment(SubjectiveAssessment {
            narrative: format!("Uniform assessment at {score}"),
            realism: score,
            voice_authenticity: score,
            tonal_consistency: score,
            ai_tendencies: BTreeSet::new(),
        });
    }

    pub fn queue_assessment(&self, assessment: SubjectiveAssessment) {
        self.script.push(Ok(assessment));
    }

    pub fn queue_error(&self, error: ServiceError) {
        self.script.push(Err(error));
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.script.calls()
    }
}

impl Default for MockEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubjectiveEvaluator for MockEvaluator {
    async fn evaluate(&self, text: &str) -> Result<SubjectiveAssessment, ServiceError> {
        self.script.next(text.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_validation() {
        let ok = Detection {
            score: 100.0,
            method: DetectionMethod::Authoritative,
        };
        assert!(ok.validate().is_ok());

        for score in [-0.1, 100.5, f64::NAN, f64::INFINITY] {
            let err = Detection {
                score,
                method: DetectionMethod::Heuristic,
            }
            .validate()
            .unwrap_err();
            assert_eq!(err.service(), DETECTOR);
        }
    }

    #[test]
    fn test_assessment_validation() {
        let mut assessment = SubjectiveAssessment {
            narrative: "Reads like a technician wrote it.".into(),
            realism: 8.0,
            voice_authenticity: 9.0,
            tonal_consistency: 7.0,
            ai_tendencies: BTreeSet::new(),
        };
        assert!(assessment.clone().validate().is_ok());
        assessment.tonal_consistency = 11.0;
        assert!(matches!(
            assessment.validate(),
            Err(ServiceError::InvalidResponse { service: EVALUATOR, .. })
        ));
    }

    #[test]
    fn test_into_evaluation_keeps_dimensions() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let eval = SubjectiveAssessment {
            narrative: "n".into(),
            realism: 9.0,
            voice_authenticity: 8.0,
            tonal_consistency: 8.5,
            ai_tendencies: ["hedging".to_string()].into(),
        }
        .into_evaluation(id, now);
        assert_eq!(eval.attempt_id, id);
        assert!((eval.subjective_score() - 8.5).abs() < 1e-12);
        assert!(eval.ai_tendencies.contains("hedging"));
    }

    #[tokio::test]
    async fn test_mock_generator_replays_in_order() {
        let generator = MockGenerator::new();
        generator.queue_text("first");
        generator.queue_error(ServiceError::request(GENERATOR, "503"));

        let params = GenerationParameters::new(1).with("temperature", 0.7);
        let ctx = GenerationContext::default();
        assert_eq!(generator.generate("Steel", &params, &ctx).await.unwrap(), "first");
        assert!(generator.generate("Steel", &params, &ctx).await.is_err());
        // Exhausted queue is an error, not a fabricated reply.
        assert!(generator.generate("Steel", &params, &ctx).await.is_err());
        assert_eq!(generator.calls().len(), 3);
        assert_eq!(generator.calls()[0].parameters, params);
    }

    #[tokio::test]
    async fn test_mock_detector_records_texts() {
        let detector = MockDetector::new();
        detector.queue_score(81.0, DetectionMethod::Authoritative);
        let d = detector.detect("exact text").await.unwrap();
        assert_eq!(d.score, 81.0);
        assert_eq!(detector.seen_texts(), vec!["exact text".to_string()]);
    }
}
