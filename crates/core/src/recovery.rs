//! # Error Recovery
//!
//! Converts classified stage failures into recovery actions.
//!
//! ```text
//! Network   → retry (fixed budget, fixed delay) → abort once exhausted
//! Timeout   → mark audit partial, never retried
//! Semantic  → skip stage, synthetic empty result
//! Technical → minimal synthetic findings
//! Report    → minimal generated report
//! Crawl     → abort (partial if pages were processed)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::error::AuditError;
use crate::models::AuditStatus;
use crate::swarm::report::AuditReport;

/// Failure category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Crawl,
    Technical,
    Semantic,
    Report,
    Timeout,
    Network,
}

impl From<&AuditError> for ErrorKind {
    fn from(error: &AuditError) -> Self {
        match error {
            AuditError::Crawl { .. } => Self::Crawl,
            AuditError::Technical(_) => Self::Technical,
            AuditError::Semantic(_) => Self::Semantic,
            AuditError::Report(_) => Self::Report,
            AuditError::Timeout(_) => Self::Timeout,
            AuditError::Network(_) => Self::Network,
        }
    }
}

/// Named recovery routine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRoutine {
    RetryFetch,
    AbortCrawl,
    SkipSemanticAnalysis,
    MinimalTechnicalFindings,
    MinimalReport,
    MarkPartial,
}

impl RecoveryRoutine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryFetch => "retry_fetch",
            Self::AbortCrawl => "abort_crawl",
            Self::SkipSemanticAnalysis => "skip_semantic_analysis",
            Self::MinimalTechnicalFindings => "minimal_technical_findings",
            Self::MinimalReport => "minimal_report",
            Self::MarkPartial => "mark_partial",
        }
    }
}

/// A typed recovery decision for one failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: ErrorKind,
    pub action: RecoveryRoutine,
    /// Whether a synthetic result substitutes for the failed stage
    pub fallback: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: String,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RecoveryAction {
    /// Only network failures retry, and only within budget
    pub fn can_retry(&self) -> bool {
        self.kind == ErrorKind::Network && self.retry_count < self.max_retries
    }
}

/// What the pipeline should do next
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Retry { after: Duration },
    Fallback(serde_json::Value),
    MarkPartial,
    Abort,
}

/// Classifies failures and produces recovery actions
#[derive(Debug, Clone)]
pub struct ErrorRecovery {
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl ErrorRecovery {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.max_network_retries, config.retry_delay())
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Classify a failure into a recovery action
    pub fn handle(&self, error: &AuditError, retry_count: u32) -> RecoveryAction {
        let kind = ErrorKind::from(error);
        let (action, fallback, max_retries) = match kind {
            ErrorKind::Network => (RecoveryRoutine::RetryFetch, false, self.max_retries),
            ErrorKind::Timeout => (RecoveryRoutine::MarkPartial, false, 0),
            ErrorKind::Semantic => (RecoveryRoutine::SkipSemanticAnalysis, true, 0),
            ErrorKind::Technical => (RecoveryRoutine::MinimalTechnicalFindings, true, 0),
            ErrorKind::Report => (RecoveryRoutine::MinimalReport, true, 0),
            ErrorKind::Crawl => (RecoveryRoutine::AbortCrawl, false, 0),
        };

        RecoveryAction {
            kind,
            action,
            fallback,
            retry_count,
            max_retries,
            last_error: error.to_string(),
            next_retry_at: None,
        }
    }

    /// Consume one retry from the budget. Returns false once exhausted.
    pub fn record_retry(&self, action: &mut RecoveryAction) -> bool {
        if !action.can_retry() {
            action.next_retry_at = None;
            return false;
        }
        action.retry_count += 1;
        let delay = chrono::Duration::from_std(self.retry_delay).unwrap_or_else(|_| chrono::Duration::zero());
        action.next_retry_at = Some(Utc::now() + delay);
        true
    }

    /// Turn an action into a pipeline decision
    pub fn decide(&self, action: &RecoveryAction, audit_id: &str) -> RecoveryDecision {
        match action.kind {
            ErrorKind::Network if action.can_retry() => RecoveryDecision::Retry {
                after: self.retry_delay,
            },
            ErrorKind::Network | ErrorKind::Crawl => RecoveryDecision::Abort,
            ErrorKind::Timeout => RecoveryDecision::MarkPartial,
            ErrorKind::Semantic => RecoveryDecision::Fallback(semantic_fallback()),
            ErrorKind::Technical => RecoveryDecision::Fallback(technical_fallback()),
            ErrorKind::Report => {
                let report = minimal_report(audit_id, AuditStatus::Partial);
                RecoveryDecision::Fallback(serde_json::to_value(report).unwrap_or_default())
            }
        }
    }
}

/// Synthetic result for a skipped semantic stage
pub fn semantic_fallback() -> serde_json::Value {
    serde_json::json!({
        "status": "skipped",
        "keywords": [],
        "topics": [],
        "fallback": true,
    })
}

/// Minimal finding set for a failed technical stage
pub fn technical_fallback() -> serde_json::Value {
    serde_json::json!({
        "issues": [],
        "score": null,
        "fallback": true,
    })
}

/// Minimal report naming the audit and its status
pub fn minimal_report(audit_id: &str, status: AuditStatus) -> AuditReport {
    AuditReport {
        audit_id: audit_id.to_string(),
        score: None,
        pages_found: 0,
        pages_analyzed: 0,
        top_issues: Vec::new(),
        recommendations: vec![format!(
            "Audit {} finished with status '{}'; detailed report unavailable",
            audit_id, status
        )],
        fallback: true,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovery() -> ErrorRecovery {
        ErrorRecovery::new(3, Duration::from_millis(10))
    }

    #[test]
    fn test_network_retry_budget() {
        let recovery = recovery();
        let error = AuditError::Network("connection refused".into());
        let mut action = recovery.handle(&error, 0);

        assert_eq!(action.action, RecoveryRoutine::RetryFetch);
        for expected in 1..=3 {
            assert!(action.can_retry());
            assert!(recovery.record_retry(&mut action));
            assert_eq!(action.retry_count, expected);
            assert!(action.next_retry_at.is_some());
        }

        // retry_count == max_retries: refused
        assert_eq!(action.retry_count, action.max_retries);
        assert!(!action.can_retry());
        assert!(!recovery.record_retry(&mut action));
        assert_eq!(recovery.decide(&action, "a1"), RecoveryDecision::Abort);
    }

    #[test]
    fn test_timeout_is_never_retried() {
        let recovery = recovery();
        let action = recovery.handle(&AuditError::Timeout("deadline".into()), 0);
        assert!(!action.can_retry());
        assert_eq!(action.action, RecoveryRoutine::MarkPartial);
        assert_eq!(recovery.decide(&action, "a1"), RecoveryDecision::MarkPartial);
    }

    #[test]
    fn test_semantic_fallback_shape() {
        let recovery = recovery();
        let action = recovery.handle(&AuditError::Semantic("model down".into()), 0);
        assert!(action.fallback);
        match recovery.decide(&action, "a1") {
            RecoveryDecision::Fallback(value) => {
                assert_eq!(value["status"], "skipped");
                assert_eq!(value["keywords"], serde_json::json!([]));
                assert_eq!(value["topics"], serde_json::json!([]));
                assert_eq!(value["fallback"], true);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_technical_fallback_shape() {
        let recovery = recovery();
        let action = recovery.handle(&AuditError::Technical("parser crash".into()), 0);
        assert_eq!(action.action, RecoveryRoutine::MinimalTechnicalFindings);
        match recovery.decide(&action, "a1") {
            RecoveryDecision::Fallback(value) => {
                assert_eq!(value["fallback"], true);
                assert!(value["score"].is_null());
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_report_fallback_references_audit() {
        let recovery = recovery();
        let action = recovery.handle(&AuditError::Report("template".into()), 0);
        match recovery.decide(&action, "audit-9") {
            RecoveryDecision::Fallback(value) => {
                assert_eq!(value["audit_id"], "audit-9");
                assert_eq!(value["fallback"], true);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_crawl_failure_aborts() {
        let recovery = recovery();
        let action = recovery.handle(&AuditError::crawl("404 on seed"), 0);
        assert_eq!(action.kind, ErrorKind::Crawl);
        assert!(!action.fallback);
        assert_eq!(recovery.decide(&action, "a1"), RecoveryDecision::Abort);
    }
}
