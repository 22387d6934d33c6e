//! The attempt-retry state machine.
//!
//! One logical generation request runs
//!
//! ```text
//! START → GENERATE → DETECT → EVALUATE → DECISION { ACCEPT | RETRY | EXHAUSTED }
//!            ↑                                          │
//!            └──────────────── RETRY ───────────────────┘
//! ```
//!
//! The stages hand typed values to each other (`Generated` → `Detected` →
//! `Evaluated`), and a decision can only be made on an `Evaluated` value,
//! which can only be built from a `Detected` one. An attempt whose exact text
//! skipped detection therefore cannot be accepted.
//!
//! Every scored attempt is persisted as soon as it is decided, classified by
//! the contamination filter in the same store transaction, so concurrent
//! requests never see it before its verdict. Store work runs on the blocking
//! pool. Collaborator failures and timeouts
//! consume the attempt budget but are never persisted: there are no real
//! scores to store, and nothing is made up in their place.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::advisor::ParameterAdvisor;
use crate::collaborators::{
    DETECTOR, Detection, Detector, EVALUATOR, GENERATOR, GenerationContext, SubjectiveAssessment,
    SubjectiveEvaluator, TextGenerator,
};
use crate::config::{EngineConfig, ScoringConfig};
use crate::contamination::ContaminationFilter;
use crate::error::{ConfigError, ControllerError, EngineError, ServiceError};
use crate::learner::WeightLearner;
use crate::policy::{LanguagePolicy, PolicyViolation};
use crate::readability;
use crate::scoring::{self, CompositeScore};
use crate::store::ResultStore;
use crate::types::{
    AttemptScores, GenerationAttempt, GenerationParameters, ParameterRecommendation,
    SubjectiveEvaluation, WeightVector,
};

/// One logical generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: Uuid,
    pub subject_key: String,
    pub component_type: String,
    /// Passed through to the generator untouched.
    pub variables: BTreeMap<String, String>,
}

impl GenerationRequest {
    pub fn new(subject_key: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            subject_key: subject_key.into(),
            component_type: component_type.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.subject_key.trim().is_empty() {
            return Err(ControllerError::InvalidRequest {
                message: "subject key is empty".into(),
            });
        }
        if self.component_type.trim().is_empty() {
            return Err(ControllerError::InvalidRequest {
                message: "component type is empty".into(),
            });
        }
        Ok(())
    }
}

/// Stage of the attempt pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStage {
    Generate,
    Detect,
    Evaluate,
}

impl fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptStage::Generate => write!(f, "generate"),
            AttemptStage::Detect => write!(f, "detect"),
            AttemptStage::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// What the controller decided after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Retry,
    Exhausted,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Accept => write!(f, "accept"),
            Decision::Retry => write!(f, "retry"),
            Decision::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Why a scored attempt was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    BelowCompositeThreshold {
        score: f64,
        threshold: f64,
        weakest: &'static str,
    },
    BelowDetectionThreshold {
        score: f64,
        threshold: f64,
    },
    Policy(PolicyViolation),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::BelowCompositeThreshold {
                score,
                threshold,
                weakest,
            } => write!(
                f,
                "composite {score:.3} below {threshold:.3} (weakest: {weakest})"
            ),
            Rejection::BelowDetectionThreshold { score, threshold } => {
                write!(f, "detection {score:.1} below {threshold:.1}")
            }
            Rejection::Policy(violation) => write!(f, "policy: {violation}"),
        }
    }
}

/// An attempt that made it through all three stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAttempt {
    /// The record as persisted, with the exclusion reason the filter assigned.
    pub attempt: GenerationAttempt,
    pub evaluation: SubjectiveEvaluation,
    pub composite: CompositeScore,
    /// Version of the weight vector the composite was computed with.
    pub weights_version: u64,
    pub rejections: Vec<Rejection>,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Scored(Box<ScoredAttempt>),
    ServiceFailure {
        stage: AttemptStage,
        error: ServiceError,
    },
}

/// Diagnostic record of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptDiagnostics {
    pub attempt_number: u32,
    pub recommendation: ParameterRecommendation,
    pub outcome: AttemptOutcome,
    pub decision: Decision,
}

impl AttemptDiagnostics {
    pub fn scored(&self) -> Option<&ScoredAttempt> {
        match &self.outcome {
            AttemptOutcome::Scored(scored) => Some(scored),
            AttemptOutcome::ServiceFailure { .. } => None,
        }
    }
}

/// A request that ended in `ACCEPT`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedGeneration {
    pub request_id: Uuid,
    pub accepted: ScoredAttempt,
    /// Every attempt of the request, the accepted one last.
    pub history: Vec<AttemptDiagnostics>,
}

impl AcceptedGeneration {
    pub fn content(&self) -> &str {
        &self.accepted.attempt.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Exhausted,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Exhausted => write!(f, "exhausted"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A request that ended without acceptable content.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "generation {kind} for {subject_key}/{component_type} after {} attempt(s)",
    .history.len()
)]
pub struct GenerationFailure {
    pub request_id: Uuid,
    pub subject_key: String,
    pub component_type: String,
    pub kind: FailureKind,
    pub history: Vec<AttemptDiagnostics>,
}

impl GenerationFailure {
    /// Composite scores of the attempts that were scored, in attempt order.
    pub fn composite_scores(&self) -> Vec<f64> {
        self.history
            .iter()
            .filter_map(AttemptDiagnostics::scored)
            .map(|s| s.composite.value)
            .collect()
    }

    /// Detection scores of the attempts that were scored, in attempt order.
    pub fn detection_scores(&self) -> Vec<f64> {
        self.history
            .iter()
            .filter_map(AttemptDiagnostics::scored)
            .map(|s| s.attempt.detection_score)
            .collect()
    }
}

/// Terminal state of a generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Accepted(AcceptedGeneration),
    Exhausted(GenerationFailure),
    Cancelled(GenerationFailure),
}

impl GenerationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GenerationOutcome::Accepted(_))
    }

    pub fn history(&self) -> &[AttemptDiagnostics] {
        match self {
            GenerationOutcome::Accepted(a) => &a.history,
            GenerationOutcome::Exhausted(f) | GenerationOutcome::Cancelled(f) => &f.history,
        }
    }

    pub fn into_result(self) -> Result<AcceptedGeneration, GenerationFailure> {
        match self {
            GenerationOutcome::Accepted(accepted) => Ok(accepted),
            GenerationOutcome::Exhausted(failure) | GenerationOutcome::Cancelled(failure) => {
                Err(failure)
            }
        }
    }
}

/// The external services an attempt calls.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub detector: Arc<dyn Detector>,
    pub evaluator: Arc<dyn SubjectiveEvaluator>,
}

// Stage values. Only `detect` builds a `Detected`, only `evaluate` an `Evaluated`.

struct Generated {
    text: String,
}

struct Detected {
    text: String,
    detection: Detection,
}

struct Evaluated {
    text: String,
    detection: Detection,
    assessment: SubjectiveAssessment,
}

struct StageFailure {
    stage: AttemptStage,
    error: ServiceError,
}

/// Drives generation requests through the attempt state machine.
pub struct GenerationAttemptController {
    scoring: ScoringConfig,
    max_attempts: u32,
    call_timeout: Duration,
    store: Arc<ResultStore>,
    learner: Arc<WeightLearner>,
    advisor: Arc<ParameterAdvisor>,
    filter: Arc<ContaminationFilter>,
    policy: LanguagePolicy,
    collaborators: Collaborators,
}

impl GenerationAttemptController {
    pub fn new(
        config: &EngineConfig,
        store: Arc<ResultStore>,
        learner: Arc<WeightLearner>,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        let issues = config.validate();
        if !issues.is_empty() {
            return Err(ConfigError::Invalid {
                message: issues.join("; "),
            });
        }
        Ok(Self {
            scoring: config.scoring.clone(),
            max_attempts: config.controller.max_attempts,
            call_timeout: Duration::from_secs(config.controller.call_timeout_secs),
            advisor: Arc::new(ParameterAdvisor::new(
                config.advisor.clone(),
                config.confidence.clone(),
                Arc::clone(&store),
            )),
            filter: Arc::new(ContaminationFilter::new(config.contamination.clone())),
            policy: LanguagePolicy::from_config(&config.policy)?,
            store,
            learner,
            collaborators,
        })
    }

    /// Run `request` to a terminal state.
    ///
    /// `cancel` is checked before each attempt only; a started attempt always
    /// runs to its decision and is recorded. A persistence failure aborts the
    /// request with an error.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, EngineError> {
        request.validate()?;
        tracing::info!(
            request_id = %request.request_id,
            subject = %request.subject_key,
            component = %request.component_type,
            max_attempts = self.max_attempts,
            "Generation request started"
        );

        let mut history: Vec<AttemptDiagnostics> = Vec::new();
        let mut tried: Vec<GenerationParameters> = Vec::new();
        let mut feedback: Vec<String> = Vec::new();
        let mut persisted_any = false;

        for attempt_number in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                tracing::info!(
                    request_id = %request.request_id,
                    completed_attempts = history.len(),
                    "Generation request cancelled"
                );
                self.schedule_recompute(persisted_any);
                return Ok(GenerationOutcome::Cancelled(
                    self.failure(request, FailureKind::Cancelled, history),
                ));
            }
            let last = attempt_number == self.max_attempts;

            let recommendation = {
                let advisor = Arc::clone(&self.advisor);
                let subject = request.subject_key.clone();
                let component = request.component_type.clone();
                let tried = tried.clone();
                off_runtime(move || {
                    if tried.is_empty() {
                        advisor.recommend(&subject, &component)
                    } else {
                        advisor.recommend_after_failure(&subject, &component, &tried)
                    }
                })
                .await?
            };
            tried.push(recommendation.parameters.clone());
            let weights = self.learner.current();
            let context = GenerationContext {
                component_type: request.component_type.clone(),
                attempt_number,
                feedback: feedback.clone(),
                variables: request.variables.clone(),
            };
            tracing::debug!(
                request_id = %request.request_id,
                attempt = attempt_number,
                parameters = %recommendation.parameters,
                source = %recommendation.source,
                weights_version = weights.version,
                "Attempt started"
            );

            let evaluated = match self
                .run_stages(&request.subject_key, &recommendation.parameters, &context)
                .await
            {
                Ok(evaluated) => evaluated,
                Err(StageFailure { stage, error }) => {
                    let decision = if last {
                        Decision::Exhausted
                    } else {
                        Decision::Retry
                    };
                    tracing::warn!(
                        request_id = %request.request_id,
                        attempt = attempt_number,
                        stage = %stage,
                        error = %error,
                        decision = %decision,
                        "Attempt failed before scoring"
                    );
                    feedback.push(format!("attempt {attempt_number}: {stage} failed ({error})"));
                    history.push(AttemptDiagnostics {
                        attempt_number,
                        recommendation,
                        outcome: AttemptOutcome::ServiceFailure { stage, error },
                        decision,
                    });
                    continue;
                }
            };

            let mut scored = self.score(
                request,
                attempt_number,
                &recommendation.parameters,
                evaluated,
                &weights,
            );
            let decision = if scored.rejections.is_empty() {
                Decision::Accept
            } else if last {
                Decision::Exhausted
            } else {
                Decision::Retry
            };

            scored.attempt.exclusion_reason = {
                let filter = Arc::clone(&self.filter);
                let store = Arc::clone(&self.store);
                let attempt = scored.attempt.clone();
                let evaluation = scored.evaluation.clone();
                off_runtime(move || filter.record(&store, &attempt, &evaluation)).await?
            };
            persisted_any = true;

            tracing::info!(
                request_id = %request.request_id,
                attempt = attempt_number,
                attempt_id = %scored.attempt.id,
                composite = scored.composite.value,
                detection = scored.attempt.detection_score,
                subjective = scored.attempt.subjective_score,
                readability = scored.attempt.readability_score,
                decision = %decision,
                "Attempt decided"
            );

            if !scored.rejections.is_empty() {
                let reasons: Vec<String> = scored.rejections.iter().map(ToString::to_string).collect();
                feedback.push(format!("attempt {attempt_number}: {}", reasons.join("; ")));
            }
            let accepted = (decision == Decision::Accept).then(|| scored.clone());
            history.push(AttemptDiagnostics {
                attempt_number,
                recommendation,
                outcome: AttemptOutcome::Scored(Box::new(scored)),
                decision,
            });

            if let Some(accepted) = accepted {
                self.schedule_recompute(persisted_any);
                return Ok(GenerationOutcome::Accepted(AcceptedGeneration {
                    request_id: request.request_id,
                    accepted,
                    history,
                }));
            }
        }

        tracing::warn!(
            request_id = %request.request_id,
            subject = %request.subject_key,
            attempts = history.len(),
            "Generation request exhausted its attempt budget"
        );
        self.schedule_recompute(persisted_any);
        Ok(GenerationOutcome::Exhausted(self.failure(
            request,
            FailureKind::Exhausted,
            history,
        )))
    }

    async fn run_stages(
        &self,
        subject_key: &str,
        parameters: &GenerationParameters,
        context: &GenerationContext,
    ) -> Result<Evaluated, StageFailure> {
        let generated = self.generate(subject_key, parameters, context).await?;
        let detected = self.detect(generated).await?;
        self.evaluate(detected).await
    }

    async fn generate(
        &self,
        subject_key: &str,
        parameters: &GenerationParameters,
        context: &GenerationContext,
    ) -> Result<Generated, StageFailure> {
        let fail = |error| StageFailure {
            stage: AttemptStage::Generate,
            error,
        };
        let text = self
            .bounded(
                GENERATOR,
                self.collaborators
                    .generator
                    .generate(subject_key, parameters, context),
            )
            .await
            .map_err(fail)?;
        if text.trim().is_empty() {
            return Err(fail(ServiceError::invalid_response(GENERATOR, "empty text")));
        }
        Ok(Generated { text })
    }

    async fn detect(&self, generated: Generated) -> Result<Detected, StageFailure> {
        let detection = self
            .bounded(DETECTOR, self.collaborators.detector.detect(&generated.text))
            .await
            .and_then(Detection::validate)
            .map_err(|error| StageFailure {
                stage: AttemptStage::Detect,
                error,
            })?;
        Ok(Detected {
            text: generated.text,
            detection,
        })
    }

    async fn evaluate(&self, detected: Detected) -> Result<Evaluated, StageFailure> {
        let assessment = self
            .bounded(EVALUATOR, self.collaborators.evaluator.evaluate(&detected.text))
            .await
            .and_then(SubjectiveAssessment::validate)
            .map_err(|error| StageFailure {
                stage: AttemptStage::Evaluate,
                error,
            })?;
        Ok(Evaluated {
            text: detected.text,
            detection: detected.detection,
            assessment,
        })
    }

    async fn bounded<T>(
        &self,
        service: &'static str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ServiceError::Timeout {
                    service,
                    timeout_secs: self.call_timeout.as_secs(),
                })
            })
    }

    fn score(
        &self,
        request: &GenerationRequest,
        attempt_number: u32,
        parameters: &GenerationParameters,
        evaluated: Evaluated,
        weights: &WeightVector,
    ) -> ScoredAttempt {
        let Evaluated {
            text,
            detection,
            assessment,
        } = evaluated;
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let violations = self.policy.check(&text, &assessment.ai_tendencies);
        let evaluation = assessment.into_evaluation(id, created_at);
        let scores = AttemptScores {
            detection: detection.score,
            subjective: evaluation.subjective_score(),
            readability: readability::score(&text),
        };
        let composite = scoring::composite(&scores, &weights.weights);

        let mut rejections = Vec::new();
        if composite.value < self.scoring.success_threshold {
            rejections.push(Rejection::BelowCompositeThreshold {
                score: composite.value,
                threshold: self.scoring.success_threshold,
                weakest: composite.weakest_component(),
            });
        }
        if detection.score < self.scoring.detection_threshold {
            rejections.push(Rejection::BelowDetectionThreshold {
                score: detection.score,
                threshold: self.scoring.detection_threshold,
            });
        }
        rejections.extend(violations.into_iter().map(Rejection::Policy));

        let attempt = GenerationAttempt {
            id,
            request_id: request.request_id,
            subject_key: request.subject_key.clone(),
            component_type: request.component_type.clone(),
            attempt_number,
            parameters: parameters.clone(),
            content: text,
            detection_score: detection.score,
            detection_method: detection.method,
            subjective_score: scores.subjective,
            readability_score: scores.readability,
            composite_score: composite.value,
            success: rejections.is_empty(),
            exclusion_reason: None,
            created_at,
        };
        ScoredAttempt {
            attempt,
            evaluation,
            composite,
            weights_version: weights.version,
            rejections,
        }
    }

    fn failure(
        &self,
        request: &GenerationRequest,
        kind: FailureKind,
        history: Vec<AttemptDiagnostics>,
    ) -> GenerationFailure {
        GenerationFailure {
            request_id: request.request_id,
            subject_key: request.subject_key.clone(),
            component_type: request.component_type.clone(),
            kind,
            history,
        }
    }

    /// Let the learner catch up with new samples without holding up the caller.
    fn schedule_recompute(&self, persisted_any: bool) {
        if !persisted_any {
            return;
        }
        let learner = Arc::clone(&self.learner);
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || match learner.recompute_if_due(&store) {
            Ok(Some(vector)) => {
                tracing::info!(
                    version = vector.version,
                    confidence = %vector.confidence,
                    samples = vector.sample_size,
                    "Weight vector recomputed"
                );
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(%error, "Background weight recompute failed");
            }
        });
    }
}

/// Run synchronous store work on the blocking pool.
async fn off_runtime<T, E>(
    work: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    E: Into<EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ControllerError::Worker {
            message: e.to_string(),
        })?
        .map_err(Into::into)
}
