//! Configuration system for Prosegate.
//!
//! Uses `figment` for layered configuration: config file -> environment ->
//! explicit overrides. There is intentionally no defaults layer for policy
//! values: a missing threshold is a startup error naming the field.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{Confidence, GenerationParameters, WEIGHT_SUM_EPSILON, Weights};

/// Environment variable prefix (`PROSEGATE_SCORING__SUCCESS_THRESHOLD`, ...).
pub const ENV_PREFIX: &str = "PROSEGATE_";

/// A complete, commented configuration. Written by `prosegate config init`.
pub const EXAMPLE_CONFIG: &str = r#"# Prosegate engine configuration

[scoring]
# Composite score (0-1) an attempt must reach to be accepted.
success_threshold = 0.90
# Raw detection score (0-100) an attempt must reach to be accepted.
detection_threshold = 70.0

[controller]
max_attempts = 3
call_timeout_secs = 60

[learning]
min_samples = 50
tolerance = 1e-10
recompute_every = 25

[learning.default_weights]
detection = 0.6
subjective = 0.3
readability = 0.1

[advisor]
min_sweet_spot_samples = 20
top_percentile = 0.25
recency_window_hours = 720

[advisor.defaults]
version = 1

[advisor.defaults.values]
temperature = 0.8
frequency_penalty = 0.2
presence_penalty = 0.1

[advisor.retry]
temperature_step = 0.1
penalty_step = 0.1
max_temperature = 1.3
max_penalty = 1.0

[confidence]
medium_samples = 100
high_samples = 300

[contamination]
perfect_score = 100.0
inconsistency_delta = 40.0
min_identical_runs = 3

[policy]
forbidden_phrases = ["game-changer", "revolutionary", "unparalleled"]
blocked_tendencies = ["formulaic_structure"]
"#;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub controller: ControllerConfig,
    pub learning: LearningConfig,
    pub advisor: AdvisorConfig,
    pub confidence: ConfidenceTiers,
    pub contamination: ContaminationPolicy,
    #[serde(default)]
    pub policy: LanguagePolicyConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Acceptance thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Minimum composite score (0–1).
    pub success_threshold: f64,
    /// Minimum raw detection score (0–100).
    pub detection_threshold: f64,
}

/// Retry budget and external call limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub max_attempts: u32,
    /// Timeout applied to each generate/detect/evaluate call.
    pub call_timeout_secs: u64,
}

/// Weight learner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Qualifying samples required before learned weights replace the defaults.
    pub min_samples: usize,
    pub default_weights: Weights,
    /// Pivot and feasibility tolerance of the constrained least-squares solver.
    pub tolerance: f64,
    /// New qualifying samples between automatic recomputations.
    #[serde(default = "default_recompute_every")]
    pub recompute_every: usize,
}

fn default_recompute_every() -> usize {
    25
}

/// Parameter advisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Qualifying samples required before a sweet spot is trusted.
    pub min_sweet_spot_samples: usize,
    /// Fraction (0, 1] of the corpus, by composite score, that counts as top performers.
    pub top_percentile: f64,
    /// How old a `best-previous` record may be.
    pub recency_window_hours: u64,
    /// Static fallback parameters; their `version` is the active knob schema.
    pub defaults: GenerationParameters,
    pub retry: RetryAdjustment,
}

/// How parameters are nudged after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAdjustment {
    pub temperature_step: f64,
    pub penalty_step: f64,
    pub max_temperature: f64,
    pub max_penalty: f64,
}

/// Sample-size thresholds for confidence tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceTiers {
    pub medium_samples: usize,
    pub high_samples: usize,
}

impl ConfidenceTiers {
    /// Tier for a sample count that already met the relevant minimum.
    pub fn tier(&self, sample_size: usize) -> Confidence {
        if sample_size >= self.high_samples {
            Confidence::High
        } else if sample_size >= self.medium_samples {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// Thresholds for contamination classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationPolicy {
    /// Detection score treated as the absolute maximum.
    pub perfect_score: f64,
    /// Detection score spread across identical parameters that marks the detector unreliable.
    pub inconsistency_delta: f64,
    /// Identical-parameter attempts needed before the spread rule applies.
    pub min_identical_runs: usize,
}

/// Subjective-language policy. Empty lists impose no restriction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguagePolicyConfig {
    #[serde(default)]
    pub forbidden_phrases: Vec<String>,
    #[serde(default)]
    pub blocked_tendencies: Vec<String>,
}

/// Result store location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolve_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        directories::ProjectDirs::from("dev", "prosegate", "prosegate")
            .map(|d| d.data_dir().join("prosegate.db"))
            .unwrap_or_else(|| PathBuf::from("prosegate.db"))
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        extract(Figment::from(Toml::string(source)))
    }

    /// Check value ranges and cross-field consistency. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let s = &self.scoring;
        if !(0.0..=1.0).contains(&s.success_threshold) {
            issues.push(format!(
                "scoring.success_threshold must be within [0, 1], got {}",
                s.success_threshold
            ));
        }
        if !(0.0..=100.0).contains(&s.detection_threshold) {
            issues.push(format!(
                "scoring.detection_threshold must be within [0, 100], got {}",
                s.detection_threshold
            ));
        }

        if self.controller.max_attempts == 0 {
            issues.push("controller.max_attempts must be at least 1".to_string());
        }
        if self.controller.call_timeout_secs == 0 {
            issues.push("controller.call_timeout_secs must be at least 1".to_string());
        }

        let l = &self.learning;
        if l.min_samples == 0 {
            issues.push("learning.min_samples must be at least 1".to_string());
        }
        if let Err(e) = l.default_weights.check() {
            issues.push(format!("learning.default_weights: {e}"));
        }
        if !(l.tolerance > 0.0 && l.tolerance < 1e-3) {
            issues.push(format!(
                "learning.tolerance must be within (0, 1e-3), got {}",
                l.tolerance
            ));
        }
        if l.recompute_every == 0 {
            issues.push("learning.recompute_every must be at least 1".to_string());
        }

        let a = &self.advisor;
        if a.min_sweet_spot_samples == 0 {
            issues.push("advisor.min_sweet_spot_samples must be at least 1".to_string());
        }
        if !(a.top_percentile > 0.0 && a.top_percentile <= 1.0) {
            issues.push(format!(
                "advisor.top_percentile must be within (0, 1], got {}",
                a.top_percentile
            ));
        }
        if a.defaults.values.is_empty() {
            issues.push("advisor.defaults.values must name at least one parameter".to_string());
        }
        if a.defaults.values.values().any(|v| !v.is_finite()) {
            issues.push("advisor.defaults.values must be finite numbers".to_string());
        }
        let r = &a.retry;
        if r.temperature_step < 0.0 || r.penalty_step < 0.0 {
            issues.push("advisor.retry steps must not be negative".to_string());
        }
        if r.max_temperature <= 0.0 || r.max_penalty < 0.0 {
            issues.push("advisor.retry maxima must be positive".to_string());
        }

        let c = &self.confidence;
        if c.medium_samples > c.high_samples {
            issues.push(format!(
                "confidence.medium_samples ({}) must not exceed confidence.high_samples ({})",
                c.medium_samples, c.high_samples
            ));
        }

        let p = &self.contamination;
        if !(0.0..=100.0).contains(&p.perfect_score) {
            issues.push(format!(
                "contamination.perfect_score must be within [0, 100], got {}",
                p.perfect_score
            ));
        }
        if !(p.inconsistency_delta > 0.0 && p.inconsistency_delta <= 100.0) {
            issues.push(format!(
                "contamination.inconsistency_delta must be within (0, 100], got {}",
                p.inconsistency_delta
            ));
        }
        if p.min_identical_runs < 2 {
            issues.push("contamination.min_identical_runs must be at least 2".to_string());
        }

        if self
            .policy
            .forbidden_phrases
            .iter()
            .any(|phrase| phrase.trim().is_empty())
        {
            issues.push("policy.forbidden_phrases must not contain empty entries".to_string());
        }

        issues
    }
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (dotted key paths such as `store.path`)
/// 2. Environment variables (prefixed with `PROSEGATE_`)
/// 3. The config file: `path` if given, else `./prosegate.toml`, else
///    `~/.config/prosegate/config.toml`
pub fn load_config(
    path: Option<&Path>,
    overrides: &[(&str, toml::Value)],
) -> Result<EngineConfig, ConfigError> {
    let mut figment = Figment::new();

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(found) = discover_config_file() {
                tracing::debug!(path = %found.display(), "Using discovered config file");
                figment = figment.merge(Toml::file(found));
            }
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value.clone()));
    }

    extract(figment)
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("prosegate.toml");
    if local.exists() {
        return Some(local);
    }
    directories::ProjectDirs::from("dev", "prosegate", "prosegate")
        .map(|d| d.config_dir().join("config.toml"))
        .filter(|p| p.exists())
}

fn extract(figment: Figment) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = figment.extract().map_err(map_figment_error)?;
    let issues = config.validate();
    if !issues.is_empty() {
        return Err(ConfigError::Invalid {
            message: issues.join("; "),
        });
    }
    Ok(config)
}

fn map_figment_error(err: figment::Error) -> ConfigError {
    match &err.kind {
        figment::error::Kind::MissingField(name) => {
            let name: &str = name;
            let mut segments = err.path.clone();
            if segments.last().map(String::as_str) != Some(name) {
                segments.push(name.to_string());
            }
            ConfigError::MissingField {
                field: segments.join("."),
            }
        }
        _ => ConfigError::ParseError {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> EngineConfig {
        EngineConfig::from_toml_str(EXAMPLE_CONFIG).unwrap()
    }

    #[test]
    fn test_example_config_parses_and_validates() {
        let config = example();
        assert_eq!(config.controller.max_attempts, 3);
        assert_eq!(config.learning.min_samples, 50);
        assert_eq!(config.learning.default_weights.detection, 0.6);
        assert_eq!(config.advisor.defaults.version, 1);
        assert_eq!(config.advisor.defaults.get("temperature"), Some(0.8));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_missing_threshold_is_fatal() {
        let source = EXAMPLE_CONFIG.replace("success_threshold = 0.90", "");
        let err = EngineConfig::from_toml_str(&source).unwrap_err();
        match err {
            ConfigError::MissingField { field } => {
                assert!(field.ends_with("success_threshold"), "got {field}");
            }
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_contamination_section_is_fatal() {
        let start = EXAMPLE_CONFIG.find("[contamination]").unwrap();
        let end = EXAMPLE_CONFIG.find("[policy]").unwrap();
        let mut source = EXAMPLE_CONFIG.to_string();
        source.replace_range(start..end, "");
        let err = EngineConfig::from_toml_str(&source).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_non_summing_default_weights_rejected() {
        let source = EXAMPLE_CONFIG.replace("readability = 0.1", "readability = 0.3");
        let err = EngineConfig::from_toml_str(&source).unwrap_err();
        match err {
            ConfigError::Invalid { message } => {
                assert!(message.contains("learning.default_weights"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = example();
        config.controller.max_attempts = 0;
        config.scoring.success_threshold = 1.5;
        config.confidence.medium_samples = 500;
        let issues = config.validate();
        assert_eq!(issues.len(), 3, "{issues:?}");
    }

    #[test]
    fn test_policy_section_is_optional() {
        let start = EXAMPLE_CONFIG.find("[policy]").unwrap();
        let source = &EXAMPLE_CONFIG[..start];
        let config = EngineConfig::from_toml_str(source).unwrap();
        assert!(config.policy.forbidden_phrases.is_empty());
        assert!(config.policy.blocked_tendencies.is_empty());
    }

    #[test]
    fn test_confidence_tiers() {
        let tiers = example().confidence;
        assert_eq!(tiers.tier(20), Confidence::Low);
        assert_eq!(tiers.tier(100), Confidence::Medium);
        assert_eq!(tiers.tier(299), Confidence::Medium);
        assert_eq!(tiers.tier(300), Confidence::High);
    }

    #[test]
    fn test_load_config_from_file_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prosegate.toml");
        std::fs::write(&path, EXAMPLE_CONFIG).unwrap();

        let db = dir.path().join("results.db");
        let overrides = [
            ("store.path", toml::Value::String(db.display().to_string())),
            ("controller.max_attempts", toml::Value::Integer(5)),
        ];
        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.controller.max_attempts, 5);
        assert_eq!(config.store.resolve_path(), db);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/prosegate.toml")), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = example();
        let toml_str = toml::to_string(&config).unwrap();
        let reparsed = EngineConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(reparsed, config);
    }
}
