//! Weight learning from historical outcomes.
//!
//! `WeightLearner` owns the active [`WeightVector`]. Readers take a cheap
//! snapshot with [`WeightLearner::current`]; a recomputation builds a
//! complete new vector, appends it to the store's history and only then swaps
//! it in, so a reader sees either the old vector or the new one, never a mix.
//!
//! Learning fits the composite-score weights to the success label of every
//! qualifying attempt with the simplex-constrained least-squares solver in
//! [`crate::solver`]. Below `min_samples` the configured default weights are
//! used with `low` confidence.

use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfidenceTiers, LearningConfig};
use crate::error::{EngineError, LearningError, PersistenceError};
use crate::scoring::normalize;
use crate::solver::{self, SimplexSolution};
use crate::store::ResultStore;
use crate::types::{Confidence, GenerationAttempt, WeightVector, Weights};

/// Fit weights to the success labels of `samples`.
///
/// Pure: identical samples and tolerance give bit-identical weights.
pub fn fit(
    samples: &[GenerationAttempt],
    tolerance: f64,
) -> Result<SimplexSolution<3>, LearningError> {
    let rows: Vec<[f64; 3]> = samples
        .iter()
        .map(|a| normalize(&a.scores()).as_array())
        .collect();
    let targets: Vec<f64> = samples
        .iter()
        .map(|a| if a.success { 1.0 } else { 0.0 })
        .collect();
    solver::solve(&rows, &targets, tolerance)
}

/// Single writer, many readers of the active weight vector.
pub struct WeightLearner {
    config: LearningConfig,
    tiers: ConfidenceTiers,
    current: ArcSwap<WeightVector>,
    recompute_lock: Mutex<()>,
}

impl WeightLearner {
    /// Start from the configured default weights.
    pub fn new(config: LearningConfig, tiers: ConfidenceTiers) -> Self {
        let initial = WeightVector::new(0, config.default_weights, Confidence::Low, 0, Utc::now());
        Self {
            config,
            tiers,
            current: ArcSwap::from_pointee(initial),
            recompute_lock: Mutex::new(()),
        }
    }

    /// Start from the latest vector persisted in `store`, if any.
    pub fn resume(
        config: LearningConfig,
        tiers: ConfidenceTiers,
        store: &ResultStore,
    ) -> Result<Self, PersistenceError> {
        let learner = Self::new(config, tiers);
        if let Some(latest) = store.latest_weight_vector()? {
            tracing::info!(
                version = latest.version,
                confidence = %latest.confidence,
                samples = latest.sample_size,
                "Resuming persisted weight vector"
            );
            learner.current.store(Arc::new(latest));
        }
        Ok(learner)
    }

    /// The active vector. Stays valid for as long as the caller holds it.
    pub fn current(&self) -> Arc<WeightVector> {
        self.current.load_full()
    }

    /// Recompute from all qualifying history and publish the result.
    ///
    /// A solver failure is logged and the previous vector stays active; it
    /// is returned unchanged. Persistence failures propagate.
    pub fn recompute(&self, store: &ResultStore) -> Result<Arc<WeightVector>, EngineError> {
        let _writer = self
            .recompute_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let samples = store.query_all_qualifying()?;
        self.learn(&samples, store)
    }

    /// Recompute when enough new qualifying samples accumulated since the
    /// active vector was computed.
    pub fn recompute_if_due(
        &self,
        store: &ResultStore,
    ) -> Result<Option<Arc<WeightVector>>, EngineError> {
        let qualifying = store.count_qualifying()?;
        let trained_on = self.current().sample_size;
        if qualifying.abs_diff(trained_on) < self.config.recompute_every {
            return Ok(None);
        }
        tracing::debug!(qualifying, trained_on, "Weight recompute due");
        self.recompute(store).map(Some)
    }

    /// Recompute on a fixed period until `cancel` fires.
    pub fn spawn_periodic(
        self: Arc<Self>,
        store: Arc<ResultStore>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Periodic weight recompute stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let learner = Arc::clone(&self);
                        let store = Arc::clone(&store);
                        let result =
                            tokio::task::spawn_blocking(move || learner.recompute(&store)).await;
                        match result {
                            Ok(Ok(vector)) => {
                                tracing::debug!(version = vector.version, "Periodic weight recompute done");
                            }
                            Ok(Err(error)) => {
                                tracing::error!(%error, "Periodic weight recompute failed");
                            }
                            Err(error) => {
                                tracing::error!(%error, "Periodic weight recompute task panicked");
                            }
                        }
                    }
                }
            }
        })
    }

    fn learn(
        &self,
        samples: &[GenerationAttempt],
        store: &ResultStore,
    ) -> Result<Arc<WeightVector>, EngineError> {
        let previous = self.current();
        let sample_size = samples.len();

        if sample_size < self.config.min_samples {
            let unchanged = previous.weights == self.config.default_weights
                && previous.confidence == Confidence::Low
                && previous.sample_size == sample_size;
            if unchanged {
                return Ok(previous);
            }
            tracing::info!(
                samples = sample_size,
                min_samples = self.config.min_samples,
                "Too few qualifying samples, using default weights"
            );
            return self.publish(&previous, self.config.default_weights, Confidence::Low, sample_size, store);
        }

        let solution = match fit(samples, self.config.tolerance) {
            Ok(solution) => solution,
            Err(error) => {
                tracing::warn!(
                    %error,
                    samples = sample_size,
                    version = previous.version,
                    "Weight optimization failed, keeping previous vector"
                );
                return Ok(previous);
            }
        };
        let weights = match Weights::from_array(solution.weights) {
            Ok(weights) => weights,
            Err(error) => {
                tracing::warn!(%error, "Solver produced invalid weights, keeping previous vector");
                return Ok(previous);
            }
        };

        let confidence = self.tiers.tier(sample_size);
        tracing::info!(
            detection = weights.detection,
            subjective = weights.subjective,
            readability = weights.readability,
            mse = solution.objective,
            samples = sample_size,
            confidence = %confidence,
            "Learned composite weights"
        );
        self.publish(&previous, weights, confidence, sample_size, store)
    }

    fn publish(
        &self,
        previous: &WeightVector,
        weights: Weights,
        confidence: Confidence,
        sample_size: usize,
        store: &ResultStore,
    ) -> Result<Arc<WeightVector>, EngineError> {
        // Another process may have published since this learner last looked.
        let stored = store.latest_weight_vector()?.map_or(0, |v| v.version);
        let vector = Arc::new(WeightVector::new(
            previous.version.max(stored) + 1,
            weights,
            confidence,
            sample_size,
            Utc::now(),
        ));
        store.append_weight_vector(&vector)?;
        self.current.store(Arc::clone(&vector));
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionMethod, GenerationParameters, WEIGHT_SUM_EPSILON};
    use uuid::Uuid;

    fn config(min_samples: usize) -> LearningConfig {
        LearningConfig {
            min_samples,
            default_weights: Weights::new(0.6, 0.3, 0.1).unwrap(),
            tolerance: 1e-10,
            recompute_every: 10,
        }
    }

    fn tiers() -> ConfidenceTiers {
        ConfidenceTiers {
            medium_samples: 100,
            high_samples: 300,
        }
    }

    fn attempt(detection: f64, subjective: f64, readability: f64, success: bool) -> GenerationAttempt {
        GenerationAttempt {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            subject_key: "Steel".into(),
            component_type: "description".into(),
            attempt_number: 1,
            parameters: GenerationParameters::new(1).with("temperature", 0.8),
            content: "text".into(),
            detection_score: detection,
            detection_method: DetectionMethod::Authoritative,
            subjective_score: subjective,
            readability_score: readability,
            composite_score: 0.5,
            success,
            exclusion_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Success is driven by detection only; subjective and readability are noise.
    fn detection_driven(n: usize) -> Vec<GenerationAttempt> {
        (0..n)
            .map(|i| {
                let detection = (i * 37 % 100) as f64;
                let subjective = (i * 53 % 11) as f64 * 0.9;
                let readability = (i * 71 % 100) as f64;
                attempt(detection, subjective, readability, detection >= 60.0)
            })
            .collect()
    }

    #[test]
    fn test_below_minimum_uses_defaults_with_low_confidence() {
        let store = ResultStore::open_in_memory().unwrap();
        for a in detection_driven(12) {
            store.insert(&a).unwrap();
        }
        let learner = WeightLearner::new(config(50), tiers());
        let vector = learner.recompute(&store).unwrap();
        assert_eq!(vector.weights, Weights::new(0.6, 0.3, 0.1).unwrap());
        assert_eq!(vector.confidence, Confidence::Low);
        assert_eq!(vector.sample_size, 12);
    }

    #[test]
    fn test_learns_detection_heavy_weights() {
        let store = ResultStore::open_in_memory().unwrap();
        for a in detection_driven(120) {
            store.insert(&a).unwrap();
        }
        let learner = WeightLearner::new(config(50), tiers());
        let vector = learner.recompute(&store).unwrap();
        let w = vector.weights;
        assert!((w.sum() - 1.0).abs() < WEIGHT_SUM_EPSILON);
        assert!(w.detection > w.subjective && w.detection > w.readability, "{w:?}");
        assert_eq!(vector.confidence, Confidence::Medium);
        assert_eq!(vector.version, 1);
        assert_eq!(learner.current().version, 1);
        assert_eq!(store.latest_weight_vector().unwrap().unwrap().weights, w);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let samples = detection_driven(90);
        let a = fit(&samples, 1e-10).unwrap();
        let b = fit(&samples, 1e-10).unwrap();
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn test_solver_failure_keeps_previous_vector() {
        let store = ResultStore::open_in_memory().unwrap();
        let learner = WeightLearner::new(config(2), tiers());
        let before = learner.current();

        let mut samples = detection_driven(5);
        samples[2].detection_score = f64::NAN;
        let after = learner.learn(&samples, &store).unwrap();

        assert_eq!(after.version, before.version);
        assert_eq!(after.weights, before.weights);
        assert!(store.latest_weight_vector().unwrap().is_none());
    }

    #[test]
    fn test_recompute_if_due() {
        let store = ResultStore::open_in_memory().unwrap();
        let learner = WeightLearner::new(config(50), tiers());
        for a in detection_driven(5) {
            store.insert(&a).unwrap();
        }
        assert!(learner.recompute_if_due(&store).unwrap().is_none());

        for a in detection_driven(10) {
            store.insert(&a).unwrap();
        }
        let vector = learner.recompute_if_due(&store).unwrap().unwrap();
        assert_eq!(vector.sample_size, 15);
        assert!(learner.recompute_if_due(&store).unwrap().is_none());
    }

    #[test]
    fn test_unchanged_default_is_not_republished() {
        let store = ResultStore::open_in_memory().unwrap();
        let learner = WeightLearner::new(config(50), tiers());
        let first = learner.recompute(&store).unwrap();
        let second = learner.recompute(&store).unwrap();
        assert_eq!(first.version, 0);
        assert_eq!(second.version, 0);
        assert!(store.weight_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_resume_from_store() {
        let store = ResultStore::open_in_memory().unwrap();
        for a in detection_driven(60) {
            store.insert(&a).unwrap();
        }
        let learned = WeightLearner::new(config(50), tiers())
            .recompute(&store)
            .unwrap();

        let resumed = WeightLearner::resume(config(50), tiers(), &store).unwrap();
        assert_eq!(*resumed.current(), *learned);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let store = ResultStore::open_in_memory().unwrap();
        let learner = WeightLearner::new(config(50), tiers());
        let snapshot = learner.current();
        for a in detection_driven(60) {
            store.insert(&a).unwrap();
        }
        learner.recompute(&store).unwrap();
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.weights, Weights::new(0.6, 0.3, 0.1).unwrap());
        assert_eq!(learner.current().version, 1);
    }

    #[tokio::test]
    async fn test_periodic_recompute_stops_on_cancel() {
        let store = Arc::new(ResultStore::open_in_memory().unwrap());
        for a in detection_driven(60) {
            store.insert(&a).unwrap();
        }
        let learner = Arc::new(WeightLearner::new(config(50), tiers()));
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&learner).spawn_periodic(
            Arc::clone(&store),
            Duration::from_millis(10),
            cancel.clone(),
        );

        for _ in 0..200 {
            if learner.current().version > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(learner.current().version >= 1);
    }
}
