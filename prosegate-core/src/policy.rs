//! Subjective-language policy.
//!
//! An attempt whose text uses a forbidden phrase, or whose evaluation reports
//! a blocked AI tendency, cannot be accepted regardless of its scores.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::config::LanguagePolicyConfig;
use crate::error::ConfigError;

/// A single policy breach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PolicyViolation {
    ForbiddenPhrase(String),
    BlockedTendency(String),
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::ForbiddenPhrase(p) => write!(f, "forbidden phrase '{p}'"),
            PolicyViolation::BlockedTendency(t) => write!(f, "blocked tendency '{t}'"),
        }
    }
}

/// Compiled language policy.
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    phrases: Vec<(String, Regex)>,
    blocked_tendencies: BTreeSet<String>,
}

impl LanguagePolicy {
    pub fn from_config(config: &LanguagePolicyConfig) -> Result<Self, ConfigError> {
        let phrases = config
            .forbidden_phrases
            .iter()
            .map(|phrase| {
                let pattern = format!(r"\b{}\b", regex::escape(phrase.trim()));
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (phrase.trim().to_string(), re))
                    .map_err(|e| ConfigError::Invalid {
                        message: format!("policy.forbidden_phrases '{phrase}': {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let blocked_tendencies = config
            .blocked_tendencies
            .iter()
            .map(|t| t.trim().to_lowercase())
            .collect();
        Ok(Self {
            phrases,
            blocked_tendencies,
        })
    }

    /// All violations in `text` and the evaluator's reported tendencies.
    pub fn check(&self, text: &str, ai_tendencies: &BTreeSet<String>) -> Vec<PolicyViolation> {
        let mut violations: Vec<PolicyViolation> = self
            .phrases
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(phrase, _)| PolicyViolation::ForbiddenPhrase(phrase.clone()))
            .collect();
        violations.extend(
            ai_tendencies
                .iter()
                .filter(|t| self.blocked_tendencies.contains(&t.trim().to_lowercase()))
                .map(|t| PolicyViolation::BlockedTendency(t.clone())),
        );
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LanguagePolicy {
        LanguagePolicy::from_config(&LanguagePolicyConfig {
            forbidden_phrases: vec!["game-changer".into(), "revolutionary".into()],
            blocked_tendencies: vec!["Formulaic_Structure".into()],
        })
        .unwrap()
    }

    #[test]
    fn test_clean_text_passes() {
        let v = policy().check("Aluminum forms a thin oxide layer.", &BTreeSet::new());
        assert!(v.is_empty());
    }

    #[test]
    fn test_forbidden_phrase_is_case_insensitive() {
        let v = policy().check("A truly Revolutionary alloy.", &BTreeSet::new());
        assert_eq!(v, vec![PolicyViolation::ForbiddenPhrase("revolutionary".into())]);
    }

    #[test]
    fn test_phrase_matches_whole_words_only() {
        let v = policy().check("Counterrevolutionary history aside.", &BTreeSet::new());
        assert!(v.is_empty());
    }

    #[test]
    fn test_blocked_tendency() {
        let tendencies: BTreeSet<String> =
            ["formulaic_structure".to_string(), "hedging".to_string()].into();
        let v = policy().check("Plain text.", &tendencies);
        assert_eq!(
            v,
            vec![PolicyViolation::BlockedTendency("formulaic_structure".into())]
        );
        assert_eq!(v[0].to_string(), "blocked tendency 'formulaic_structure'");
    }
}
