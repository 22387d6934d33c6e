//! # Prosegate Core
//!
//! Feedback-control engine around an external text generator.
//! Provides the attempt controller, composite scoring, weight learning,
//! parameter advice, contamination filtering and the append-only result store.

pub mod advisor;
pub mod collaborators;
pub mod config;
pub mod contamination;
pub mod controller;
pub mod error;
pub mod learner;
pub mod policy;
pub mod readability;
pub mod scoring;
pub mod solver;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use advisor::ParameterAdvisor;
pub use collaborators::{
    Detection, Detector, GenerationContext, MockDetector, MockEvaluator, MockGenerator,
    SubjectiveAssessment, SubjectiveEvaluator, TextGenerator,
};
pub use config::{EngineConfig, load_config};
pub use contamination::{ContaminationFilter, SweepReport};
pub use controller::{
    AcceptedGeneration, AttemptDiagnostics, Collaborators, Decision, GenerationAttemptController,
    GenerationFailure, GenerationOutcome, GenerationRequest,
};
pub use error::{EngineError, Result};
pub use learner::WeightLearner;
pub use scoring::{CompositeScore, composite};
pub use store::ResultStore;
pub use types::{
    Confidence, DetectionMethod, ExclusionReason, GenerationAttempt, GenerationParameters,
    ParameterRecommendation, RecommendationSource, SubjectiveEvaluation, WeightVector, Weights,
};
