//! Contamination classification for the learning corpus.
//!
//! Decides whether a stored attempt is trustworthy enough to feed the weight
//! learner and the parameter advisor. Classification never deletes anything;
//! an untrustworthy record is annotated with an [`ExclusionReason`] and stays
//! in the store for auditing.
//!
//! Rules:
//! - **suspicious-perfect-score**: the detection score is at the configured
//!   maximum but came from a non-authoritative detector.
//! - **inconsistent-scores**: at least `min_identical_runs` attempts for the
//!   same subject with identical parameters disagree on the detection score by
//!   more than `inconsistency_delta`. That points at an unreliable detector,
//!   not at a real pattern, so every member of the group is annotated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::config::ContaminationPolicy;
use crate::error::PersistenceError;
use crate::store::{ResultStore, Verdict};
use crate::types::{DetectionMethod, ExclusionReason, GenerationAttempt, SubjectiveEvaluation};

/// How many recent same-subject records `record` compares against.
const HISTORY_WINDOW: usize = 50;

/// Outcome of a full-corpus contamination pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub newly_excluded: usize,
    pub by_reason: BTreeMap<String, usize>,
}

/// Classifies and annotates untrustworthy results.
#[derive(Debug, Clone)]
pub struct ContaminationFilter {
    policy: ContaminationPolicy,
}

impl ContaminationFilter {
    pub fn new(policy: ContaminationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ContaminationPolicy {
        &self.policy
    }

    /// Classify `attempt` against recent records for the same subject.
    ///
    /// `recent_history` may contain `attempt` itself; it is not double-counted.
    pub fn classify(
        &self,
        attempt: &GenerationAttempt,
        recent_history: &[GenerationAttempt],
    ) -> Option<ExclusionReason> {
        self.verdict(attempt, recent_history).map(|(reason, _)| reason)
    }

    /// The reason `attempt` is untrustworthy and every record it applies to.
    fn verdict(
        &self,
        attempt: &GenerationAttempt,
        recent_history: &[GenerationAttempt],
    ) -> Option<Verdict> {
        if self.is_suspicious_perfect(attempt) {
            return Some((ExclusionReason::SuspiciousPerfectScore, vec![attempt.id]));
        }
        self.inconsistent_group(attempt, recent_history)
            .map(|group| (ExclusionReason::InconsistentScores, group))
    }

    fn is_suspicious_perfect(&self, attempt: &GenerationAttempt) -> bool {
        attempt.detection_score >= self.policy.perfect_score
            && attempt.detection_method != DetectionMethod::Authoritative
    }

    /// Ids of the identical-parameter group when its detection scores spread
    /// further than the policy allows.
    fn inconsistent_group<'a>(
        &self,
        attempt: &'a GenerationAttempt,
        history: impl IntoIterator<Item = &'a GenerationAttempt>,
    ) -> Option<Vec<Uuid>> {
        let mut group: Vec<&GenerationAttempt> = vec![attempt];
        group.extend(history.into_iter().filter(|h| {
            h.id != attempt.id
                && h.subject_key == attempt.subject_key
                && h.component_type == attempt.component_type
                && h.parameters == attempt.parameters
        }));
        if group.len() < self.policy.min_identical_runs {
            return None;
        }

        let (min, max) = group.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |acc, a| {
            (acc.0.min(a.detection_score), acc.1.max(a.detection_score))
        });
        if max - min > self.policy.inconsistency_delta {
            Some(group.iter().map(|a| a.id).collect())
        } else {
            None
        }
    }

    /// Persist a scored attempt with its evaluation, classified.
    ///
    /// The attempt enters the store already carrying its verdict, and any
    /// earlier records it implicates are excluded in the same transaction.
    /// Returns the reason recorded for `attempt`, if any.
    pub fn record(
        &self,
        store: &ResultStore,
        attempt: &GenerationAttempt,
        evaluation: &SubjectiveEvaluation,
    ) -> Result<Option<ExclusionReason>, PersistenceError> {
        let stored = store.insert_classified(attempt, evaluation, HISTORY_WINDOW, |new, history| {
            self.verdict(new, history)
        })?;

        match &stored.exclusion_reason {
            Some(ExclusionReason::InconsistentScores) if stored.inserted => {
                tracing::warn!(
                    attempt_id = %attempt.id,
                    subject = %attempt.subject_key,
                    parameters = %attempt.parameters,
                    also_excluded = stored.also_excluded,
                    reason = %ExclusionReason::InconsistentScores,
                    "Identical parameters produced inconsistent detection scores"
                );
            }
            Some(reason) if stored.inserted => {
                tracing::warn!(
                    attempt_id = %attempt.id,
                    subject = %attempt.subject_key,
                    detection = attempt.detection_score,
                    method = %attempt.detection_method,
                    reason = %reason,
                    "Attempt excluded from learning"
                );
            }
            _ => {}
        }
        Ok(stored.exclusion_reason)
    }

    /// Re-classify every qualifying record and annotate the ones that no
    /// longer pass. Useful after a policy change.
    pub fn sweep(&self, store: &ResultStore) -> Result<SweepReport, PersistenceError> {
        let corpus = store.query_all_qualifying()?;
        let mut report = SweepReport {
            examined: corpus.len(),
            ..SweepReport::default()
        };

        let mut groups: HashMap<(&str, &str), Vec<&GenerationAttempt>> = HashMap::new();
        for attempt in &corpus {
            groups
                .entry((attempt.subject_key.as_str(), attempt.component_type.as_str()))
                .or_default()
                .push(attempt);
        }

        let mut flagged: HashSet<Uuid> = HashSet::new();
        for attempt in &corpus {
            if flagged.contains(&attempt.id) {
                continue;
            }

            let (reason, ids) = if self.is_suspicious_perfect(attempt) {
                (ExclusionReason::SuspiciousPerfectScore, vec![attempt.id])
            } else {
                let key = (attempt.subject_key.as_str(), attempt.component_type.as_str());
                let siblings = groups.get(&key).into_iter().flatten().copied();
                match self.inconsistent_group(attempt, siblings) {
                    Some(ids) => (ExclusionReason::InconsistentScores, ids),
                    None => continue,
                }
            };

            for id in ids {
                if flagged.insert(id) && store.mark_excluded(id, &reason)? {
                    report.newly_excluded += 1;
                    *report.by_reason.entry(reason.to_string()).or_default() += 1;
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            newly_excluded = report.newly_excluded,
            "Contamination sweep complete"
        );
        Ok(report)
    }
}
