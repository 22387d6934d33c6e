//! Parameter recommendations from historical evidence.
//!
//! Priority chain, first match wins:
//!
//! 1. **best-previous**: the newest qualifying, successful attempt for the
//!    exact subject/component pair, if it falls inside the recency window.
//! 2. **sweet-spot**: the per-key median over the top performers of the whole
//!    qualifying corpus, once enough samples exist.
//! 3. **default**: the configured static parameters, with confidence `none`.
//!
//! Only records with the active parameter schema version are considered, and
//! every store query used here filters excluded records.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{AdvisorConfig, ConfidenceTiers};
use crate::error::PersistenceError;
use crate::store::ResultStore;
use crate::types::{
    Confidence, FREQUENCY_PENALTY, GenerationAttempt, GenerationParameters,
    PRESENCE_PENALTY, ParameterRecommendation, RecommendationSource, TEMPERATURE,
};

pub struct ParameterAdvisor {
    config: AdvisorConfig,
    tiers: ConfidenceTiers,
    store: Arc<ResultStore>,
}

impl ParameterAdvisor {
    pub fn new(config: AdvisorConfig, tiers: ConfidenceTiers, store: Arc<ResultStore>) -> Self {
        Self {
            config,
            tiers,
            store,
        }
    }

    /// Parameters for the next request for `subject_key`/`component_type`.
    pub fn recommend(
        &self,
        subject_key: &str,
        component_type: &str,
    ) -> Result<ParameterRecommendation, PersistenceError> {
        if let Some(rec) = self.best_previous(subject_key, component_type)? {
            return Ok(rec);
        }
        if let Some(rec) = self.sweet_spot()? {
            return Ok(rec);
        }
        Ok(self.defaults())
    }

    /// Parameters for a retry, given every parameter set already tried in
    /// the current request.
    ///
    /// Runs the normal chain, then nudges the result away from anything in
    /// `tried` until it is new or the configured limits stop it moving.
    pub fn recommend_after_failure(
        &self,
        subject_key: &str,
        component_type: &str,
        tried: &[GenerationParameters],
    ) -> Result<ParameterRecommendation, PersistenceError> {
        let mut rec = self.recommend(subject_key, component_type)?;
        while tried.contains(&rec.parameters) {
            let nudged = self.nudge(&rec.parameters);
            if nudged == rec.parameters {
                tracing::debug!(
                    subject = subject_key,
                    parameters = %rec.parameters,
                    "Retry parameters already at their limits"
                );
                break;
            }
            rec.parameters = nudged;
            rec.adjusted_for_retry = true;
        }
        Ok(rec)
    }

    fn best_previous(
        &self,
        subject_key: &str,
        component_type: &str,
    ) -> Result<Option<ParameterRecommendation>, PersistenceError> {
        let Some(best) = self.store.query_best_previous(
            subject_key,
            component_type,
            self.config.defaults.version,
        )?
        else {
            return Ok(None);
        };
        let cutoff = recency_cutoff(Utc::now(), self.config.recency_window_hours);
        if cutoff.is_some_and(|cutoff| best.created_at < cutoff) {
            tracing::debug!(
                subject = subject_key,
                created_at = %best.created_at,
                "Best previous attempt is outside the recency window"
            );
            return Ok(None);
        }

        tracing::debug!(subject = subject_key, attempt_id = %best.id, "Recommending best previous parameters");
        Ok(Some(ParameterRecommendation {
            parameters: best.parameters,
            source: RecommendationSource::BestPrevious,
            confidence: Confidence::High,
            sample_size: 1,
            based_on: Some(best.id),
            adjusted_for_retry: false,
        }))
    }

    fn sweet_spot(&self) -> Result<Option<ParameterRecommendation>, PersistenceError> {
        let top = self.store.query_top_performers(
            self.config.min_sweet_spot_samples,
            self.config.top_percentile,
            self.config.defaults.version,
        )?;
        let Some(parameters) = median_parameters(self.config.defaults.version, &top.attempts) else {
            return Ok(None);
        };
        Ok(Some(ParameterRecommendation {
            parameters,
            source: RecommendationSource::SweetSpot,
            confidence: self.tiers.tier(top.sample_size),
            sample_size: top.sample_size,
            based_on: None,
            adjusted_for_retry: false,
        }))
    }

    fn defaults(&self) -> ParameterRecommendation {
        ParameterRecommendation {
            parameters: self.config.defaults.clone(),
            source: RecommendationSource::Default,
            confidence: Confidence::None,
            sample_size: 0,
            based_on: None,
            adjusted_for_retry: false,
        }
    }

    fn nudge(&self, parameters: &GenerationParameters) -> GenerationParameters {
        let retry = &self.config.retry;
        let mut next = parameters.clone();
        if let Some(t) = parameters.get(TEMPERATURE) {
            next.set(TEMPERATURE, step_up(t, retry.temperature_step, retry.max_temperature));
        }
        for key in [FREQUENCY_PENALTY, PRESENCE_PENALTY] {
            if let Some(p) = parameters.get(key) {
                next.set(key, step_up(p, retry.penalty_step, retry.max_penalty));
            }
        }
        next
    }
}

/// Per-key median over `attempts`. `None` when there are no attempts.
pub fn median_parameters(
    version: u32,
    attempts: &[GenerationAttempt],
) -> Option<GenerationParameters> {
    if attempts.is_empty() {
        return None;
    }
    let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for attempt in attempts {
        for (key, value) in &attempt.parameters.values {
            columns.entry(key.as_str()).or_default().push(*value);
        }
    }
    let mut parameters = GenerationParameters::new(version);
    for (key, mut values) in columns {
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        parameters.set(key, median);
    }
    Some(parameters)
}

/// Oldest timestamp inside a window of `hours` before `now`. `None` when the
/// window reaches past the representable range, i.e. there is no lower bound.
fn recency_cutoff(now: DateTime<Utc>, hours: u64) -> Option<DateTime<Utc>> {
    let window = TimeDelta::try_hours(i64::try_from(hours).ok()?)?;
    now.checked_sub_signed(window)
}

/// `value + step`, capped at `max` and rounded to four decimals.
fn step_up(value: f64, step: f64, max: f64) -> f64 {
    if value >= max {
        return value;
    }
    ((value + step).min(max) * 1e4).round() / 1e4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryAdjustment;
    use crate::types::{DetectionMethod, ExclusionReason};
    use chrono::{DateTime, Duration};
    use uuid::Uuid;

    fn defaults() -> GenerationParameters {
        GenerationParameters::new(1)
            .with(TEMPERATURE, 0.8)
            .with(FREQUENCY_PENALTY, 0.2)
            .with(PRESENCE_PENALTY, 0.1)
    }

    fn advisor(store: Arc<ResultStore>, min_sweet_spot_samples: usize) -> ParameterAdvisor {
        advisor_with_window(store, min_sweet_spot_samples, 24)
    }

    fn advisor_with_window(
        store: Arc<ResultStore>,
        min_sweet_spot_samples: usize,
        recency_window_hours: u64,
    ) -> ParameterAdvisor {
        ParameterAdvisor::new(
            AdvisorConfig {
                min_sweet_spot_samples,
                top_percentile: 0.5,
                recency_window_hours,
                defaults: defaults(),
                retry: RetryAdjustment {
                    temperature_step: 0.1,
                    penalty_step: 0.1,
                    max_temperature: 1.0,
                    max_penalty: 0.3,
                },
            },
            ConfidenceTiers {
                medium_samples: 5,
                high_samples: 10,
            },
            store,
        )
    }

    fn attempt(
        subject: &str,
        temperature: f64,
        composite: f64,
        success: bool,
        created_at: DateTime<Utc>,
    ) -> GenerationAttempt {
        GenerationAttempt {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            subject_key: subject.into(),
            component_type: "description".into(),
            attempt_number: 1,
            parameters: GenerationParameters::new(1)
                .with(TEMPERATURE, temperature)
                .with(FREQUENCY_PENALTY, 0.2),
            content: "text".into(),
            detection_score: 80.0,
            detection_method: DetectionMethod::Authoritative,
            subjective_score: 8.0,
            readability_score: 60.0,
            composite_score: composite,
            success,
            exclusion_reason: None,
            created_at,
        }
    }

    #[test]
    fn test_empty_store_falls_back_to_defaults() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let rec = advisor(store, 3).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::Default);
        assert_eq!(rec.confidence, Confidence::None);
        assert_eq!(rec.parameters, defaults());
    }

    #[test]
    fn test_best_previous_for_exact_pair() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let now = Utc::now();
        let older = attempt("Steel", 0.7, 0.95, true, now - Duration::hours(2));
        let newer = attempt("Steel", 0.9, 0.91, true, now - Duration::hours(1));
        let failed = attempt("Steel", 0.5, 0.99, false, now);
        for a in [&older, &newer, &failed] {
            store.insert(a).unwrap();
        }

        let rec = advisor(store, 100).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::BestPrevious);
        assert_eq!(rec.confidence, Confidence::High);
        assert_eq!(rec.based_on, Some(newer.id));
        assert_eq!(rec.parameters, newer.parameters);
    }

    #[test]
    fn test_best_previous_outside_window_is_ignored() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let stale = attempt("Steel", 0.7, 0.95, true, Utc::now() - Duration::hours(48));
        store.insert(&stale).unwrap();
        let rec = advisor(store, 100).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::Default);
    }

    #[test]
    fn test_huge_recency_window_means_no_lower_bound() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let ancient = attempt("Steel", 0.7, 0.95, true, Utc::now() - Duration::days(3650));
        store.insert(&ancient).unwrap();

        for hours in [10_000_000_000, 5_000_000_000, u64::MAX] {
            let rec = advisor_with_window(Arc::clone(&store), 100, hours)
                .recommend("Steel", "description")
                .unwrap();
            assert_eq!(rec.source, RecommendationSource::BestPrevious, "window {hours}h");
            assert_eq!(rec.based_on, Some(ancient.id));
        }
    }

    #[test]
    fn test_recency_cutoff_bounds() {
        let now = Utc::now();
        assert_eq!(recency_cutoff(now, 24), Some(now - Duration::hours(24)));
        assert_eq!(recency_cutoff(now, 0), Some(now));
        assert_eq!(recency_cutoff(now, 10_000_000_000), None);
        assert_eq!(recency_cutoff(now, u64::MAX), None);
    }

    #[test]
    fn test_sweet_spot_median_and_tier() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let now = Utc::now();
        // Composite rises with temperature; the top half is 0.6..=1.0.
        for (i, t) in [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0].iter().enumerate() {
            let a = attempt(&format!("Subject{i}"), *t, *t, false, now);
            store.insert(&a).unwrap();
        }

        let rec = advisor(store, 6).recommend("Copper", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::SweetSpot);
        assert_eq!(rec.sample_size, 10);
        assert_eq!(rec.confidence, Confidence::High);
        assert_eq!(rec.parameters.get(TEMPERATURE), Some(0.8));
        assert_eq!(rec.parameters.get(FREQUENCY_PENALTY), Some(0.2));
    }

    #[test]
    fn test_sweet_spot_needs_minimum_samples() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        for i in 0..4 {
            store
                .insert(&attempt(&format!("S{i}"), 0.5, 0.5, false, Utc::now()))
                .unwrap();
        }
        let rec = advisor(store, 5).recommend("Copper", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::Default);
    }

    #[test]
    fn test_excluded_record_never_recommended() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let mut suspicious = attempt("Steel", 1.4, 1.0, true, Utc::now());
        suspicious.detection_score = 100.0;
        suspicious.detection_method = DetectionMethod::Heuristic;
        store.insert(&suspicious).unwrap();
        store
            .mark_excluded(suspicious.id, &ExclusionReason::SuspiciousPerfectScore)
            .unwrap();
        for i in 0..3 {
            store
                .insert(&attempt(&format!("S{i}"), 0.6, 0.7, false, Utc::now()))
                .unwrap();
        }

        let rec = advisor(store, 3).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::SweetSpot);
        assert_ne!(rec.parameters.get(TEMPERATURE), Some(1.4));
        assert_eq!(rec.sample_size, 3);
    }

    #[test]
    fn test_other_schema_versions_are_ignored() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let mut old = attempt("Steel", 0.3, 0.99, true, Utc::now());
        old.parameters.version = 0;
        store.insert(&old).unwrap();
        let rec = advisor(store, 1).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::Default);
    }

    #[test]
    fn test_older_success_with_current_schema_is_found() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let now = Utc::now();
        let current = attempt("Steel", 0.7, 0.92, true, now - Duration::hours(3));
        let mut newer = attempt("Steel", 0.3, 0.99, true, now - Duration::hours(1));
        newer.parameters.version = 2;
        for a in [&current, &newer] {
            store.insert(a).unwrap();
        }
        let rec = advisor(store, 100).recommend("Steel", "description").unwrap();
        assert_eq!(rec.source, RecommendationSource::BestPrevious);
        assert_eq!(rec.based_on, Some(current.id));
    }

    #[test]
    fn test_retry_nudges_away_from_tried_parameters() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let advisor = advisor(store, 100);

        let first = advisor.recommend("Steel", "description").unwrap();
        let second = advisor
            .recommend_after_failure("Steel", "description", &[first.parameters.clone()])
            .unwrap();
        assert!(second.adjusted_for_retry);
        assert_eq!(second.parameters.get(TEMPERATURE), Some(0.9));
        assert_eq!(second.parameters.get(FREQUENCY_PENALTY), Some(0.3));
        assert_eq!(second.parameters.get(PRESENCE_PENALTY), Some(0.2));

        let third = advisor
            .recommend_after_failure(
                "Steel",
                "description",
                &[first.parameters.clone(), second.parameters.clone()],
            )
            .unwrap();
        assert_eq!(third.parameters.get(TEMPERATURE), Some(1.0));
        assert_eq!(third.parameters.get(FREQUENCY_PENALTY), Some(0.3));
        assert_eq!(third.parameters.get(PRESENCE_PENALTY), Some(0.3));
    }

    #[test]
    fn test_retry_stops_at_limits() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        let advisor = advisor(store, 100);
        let capped = GenerationParameters::new(1)
            .with(TEMPERATURE, 1.0)
            .with(FREQUENCY_PENALTY, 0.3)
            .with(PRESENCE_PENALTY, 0.3);
        let tried = vec![
            defaults(),
            GenerationParameters::new(1)
                .with(TEMPERATURE, 0.9)
                .with(FREQUENCY_PENALTY, 0.3)
                .with(PRESENCE_PENALTY, 0.2),
            capped.clone(),
        ];
        let rec = advisor
            .recommend_after_failure("Steel", "description", &tried)
            .unwrap();
        assert_eq!(rec.parameters, capped);
    }

    #[test]
    fn test_median_parameters() {
        let now = Utc::now();
        let attempts = vec![
            attempt("A", 0.2, 0.9, true, now),
            attempt("B", 0.6, 0.9, true, now),
            attempt("C", 0.4, 0.9, true, now),
            attempt("D", 1.0, 0.9, true, now),
        ];
        let median = median_parameters(1, &attempts).unwrap();
        assert!((median.get(TEMPERATURE).unwrap() - 0.5).abs() < 1e-12);
        assert!(median_parameters(1, &[]).is_none());
    }
}
