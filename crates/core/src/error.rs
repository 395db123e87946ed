//! # Errors
//!
//! Typed failures for every layer of the orchestration core.
//!
//! `AuditError` is the stage-failure taxonomy fed to the recovery handler.
//! The remaining enums describe API misuse at each component boundary and
//! fold into `OrchestratorError` at the facade.

use thiserror::Error;

use crate::models::AuditStatus;

/// A classified stage failure inside a running audit
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
    /// Fetching the seed target failed with no fallback path
    #[error("crawl failed: {message}")]
    Crawl {
        message: String,
        /// Pages successfully processed before the failure
        pages_processed: usize,
    },

    #[error("technical analysis failed: {0}")]
    Technical(String),

    #[error("semantic analysis failed: {0}")]
    Semantic(String),

    #[error("report generation failed: {0}")]
    Report(String),

    /// The caller's deadline elapsed
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Transient transport failure, eligible for retry
    #[error("network error: {0}")]
    Network(String),
}

impl AuditError {
    /// Crawl failure with nothing fetched
    pub fn crawl(message: impl Into<String>) -> Self {
        Self::Crawl {
            message: message.into(),
            pages_processed: 0,
        }
    }

    /// Pages processed before the failure (only meaningful for crawl errors)
    pub fn pages_processed(&self) -> usize {
        match self {
            Self::Crawl {
                pages_processed, ..
            } => *pages_processed,
            _ => 0,
        }
    }
}

/// Agent registry misuse
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent name cannot be empty")]
    EmptyName,

    #[error("agent '{0}' is absent")]
    MissingAgent(String),

    #[error("agent '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("agent '{0}' not found")]
    NotFound(String),
}

/// Pipeline executor misuse
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid audit request: {0}")]
    InvalidRequest(String),

    #[error("audit '{0}' is already running")]
    AlreadyRunning(String),

    #[error("audit '{0}' is not running")]
    NotRunning(String),
}

/// Progress manager misuse
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("audit '{0}' is already tracked")]
    AlreadyTracked(String),

    #[error("audit '{0}' is not tracked")]
    NotTracked(String),
}

/// Errors returned by the public orchestrator API
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid audit request: {0}")]
    InvalidRequest(String),

    #[error("audit '{0}' is already active")]
    AlreadyActive(String),

    #[error("audit '{0}' not found")]
    NotFound(String),

    #[error("audit '{0}' is not active")]
    NotActive(String),

    #[error("audit '{id}' has not completed (status: {status})")]
    NotCompleted { id: String, status: AuditStatus },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether this error means the audit id is unknown
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_error_pages_processed() {
        let err = AuditError::Crawl {
            message: "connection reset".to_string(),
            pages_processed: 3,
        };
        assert_eq!(err.pages_processed(), 3);
        assert_eq!(AuditError::crawl("boom").pages_processed(), 0);
        assert_eq!(AuditError::Network("dns".into()).pages_processed(), 0);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RegistryError::AlreadyRegistered("seo".into()).to_string(),
            "agent 'seo' is already registered"
        );
        let err = OrchestratorError::NotCompleted {
            id: "a1".into(),
            status: AuditStatus::Running,
        };
        assert_eq!(err.to_string(), "audit 'a1' has not completed (status: running)");
        assert!(OrchestratorError::NotFound("x".into()).is_not_found());
    }
}
