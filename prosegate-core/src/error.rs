//! Error types for the Prosegate core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, external services, persistence, weight learning
//! and the attempt controller. Contamination is deliberately absent: it is a
//! classification outcome (`ExclusionReason`), not a failure.

use std::path::PathBuf;

/// Top-level error type for the Prosegate core library.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from configuration loading and validation. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Failures of the generation, detection and evaluation collaborators.
///
/// These are transient: the controller counts them against the attempt budget
/// and never substitutes a score for the missing response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} timed out after {timeout_secs}s")]
    Timeout {
        service: &'static str,
        timeout_secs: u64,
    },

    #[error("{service} request failed: {message}")]
    Request {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl ServiceError {
    pub fn request(service: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            service,
            message: message.into(),
        }
    }

    pub fn invalid_response(service: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service,
            message: message.into(),
        }
    }

    /// Name of the collaborator that failed.
    pub fn service(&self) -> &'static str {
        match self {
            ServiceError::Timeout { service, .. }
            | ServiceError::Request { service, .. }
            | ServiceError::InvalidResponse { service, .. } => service,
        }
    }
}

/// Errors from the result store. Fatal for the request that hit them.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("SQLite error: {message}")]
    Sqlite { message: String },

    #[error("Stored record could not be decoded: {message}")]
    Corrupt { message: String },

    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Sqlite {
            message: err.to_string(),
        }
    }
}

/// Errors from the weight learner.
#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("Invalid weight vector: {message}")]
    InvalidWeights { message: String },

    #[error("Weight optimization did not converge: {reason}")]
    NotConverged { reason: String },
}

/// Errors from the attempt controller itself (not from its collaborators).
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Invalid generation request: {message}")]
    InvalidRequest { message: String },

    #[error("Blocking store task failed: {message}")]
    Worker { message: String },
}

/// A type alias for results using the top-level `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = EngineError::Config(ConfigError::MissingField {
            field: "scoring.success_threshold".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required field: scoring.success_threshold"
        );
    }

    #[test]
    fn test_error_display_service_timeout() {
        let err = EngineError::Service(ServiceError::Timeout {
            service: "detector",
            timeout_secs: 30,
        });
        assert_eq!(
            err.to_string(),
            "Service error: detector timed out after 30s"
        );
    }

    #[test]
    fn test_service_error_names_its_service() {
        let err = ServiceError::request("generator", "502 bad gateway");
        assert_eq!(err.service(), "generator");
        assert_eq!(err.to_string(), "generator request failed: 502 bad gateway");

        let err = ServiceError::invalid_response("evaluator", "realism=14");
        assert_eq!(err.service(), "evaluator");
    }

    #[test]
    fn test_persistence_from_rusqlite() {
        let err: PersistenceError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, PersistenceError::Sqlite { .. }));
        let err: EngineError = err.into();
        assert!(err.to_string().starts_with("Persistence error: SQLite error"));
    }

    #[test]
    fn test_learning_error_display() {
        let err = LearningError::NotConverged {
            reason: "objective is not finite".into(),
        };
        assert_eq!(
            err.to_string(),
            "Weight optimization did not converge: objective is not finite"
        );
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let err: EngineError = serde_err.into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
