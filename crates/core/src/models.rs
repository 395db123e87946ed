//! # Audit Models
//!
//! Shared data types for audit submission, execution tracking, and progress
//! reporting. `AuditRequest` and `ProgressUpdate` are the stable wire shapes
//! exchanged across process boundaries (snake_case JSON).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::swarm::report::AuditReport;

/// A request to audit a single seed target
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AuditRequest {
    /// Caller-chosen identifier, unique among active audits
    pub audit_id: String,
    /// Where the crawl starts
    pub seed_url: String,
    /// Upper bound on fetched pages
    pub max_pages: usize,
    /// Free-form options forwarded to agents
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    /// Submission time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AuditRequest {
    pub fn new(audit_id: impl Into<String>, seed_url: impl Into<String>, max_pages: usize) -> Self {
        Self {
            audit_id: audit_id.into(),
            seed_url: seed_url.into(),
            max_pages,
            options: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach an option
    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    /// Check the request before it is accepted.
    ///
    /// The audit id names the crawl output folder, so it must be a single
    /// plain path component.
    pub fn validate(&self) -> Result<(), String> {
        let id = self.audit_id.trim();
        if id.is_empty() {
            return Err("audit_id is empty".into());
        }
        if id.starts_with('.')
            || id.contains("..")
            || id.contains(['/', '\\'])
            || id.chars().any(char::is_control)
        {
            return Err(format!("audit_id '{}' is not a plain name", self.audit_id));
        }
        if self.seed_url.trim().is_empty() {
            return Err("seed_url is empty".into());
        }
        if self.max_pages == 0 {
            return Err("max_pages must be positive".into());
        }
        Ok(())
    }
}

/// Lifecycle status of an audit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Finished with some results missing
    Partial,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "partial" => Self::Partial,
            _ => Self::Pending,
        }
    }

    /// Whether the audit can still make progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether this is one of the three terminal states
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-audit record, owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExecution {
    pub audit_id: String,
    pub status: AuditStatus,
    /// Always within 0..=100
    pub progress: u8,
    pub current_step: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Last error message
    #[serde(default)]
    pub error: Option<String>,
    /// Stage and agent outputs keyed by producer
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
    /// Agent name -> last reported status
    #[serde(default)]
    pub agent_statuses: HashMap<String, String>,
    /// Seed target, kept for results and persistence
    #[serde(default)]
    pub seed_url: String,
}

impl AuditExecution {
    /// Create a running execution for a freshly submitted request
    pub fn start(request: &AuditRequest, step: &str, progress: u8) -> Self {
        Self {
            audit_id: request.audit_id.clone(),
            status: AuditStatus::Running,
            progress: progress.min(100),
            current_step: step.to_string(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
            results: HashMap::new(),
            agent_statuses: HashMap::new(),
            seed_url: request.seed_url.clone(),
        }
    }

    /// Move to a terminal status, stamping the end time once
    pub fn finish(&mut self, status: AuditStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    /// Elapsed time in milliseconds (up to now if still running)
    pub fn duration_ms(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0)
    }
}

/// A progress event delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProgressUpdate {
    pub audit_id: String,
    pub step: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(audit_id: &str, step: &str, progress: u8) -> Self {
        Self {
            audit_id: audit_id.to_string(),
            step: step.to_string(),
            progress: progress.min(100),
            agent_name: None,
            agent_status: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, name: &str, status: &str) -> Self {
        self.agent_name = Some(name.to_string());
        self.agent_status = Some(status.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Final output of a completed audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResults {
    pub audit_id: String,
    pub status: AuditStatus,
    pub seed_url: String,
    pub pages_found: usize,
    /// Agent name -> agent output
    pub agent_results: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub report: Option<AuditReport>,
    pub duration_ms: i64,
}

impl AuditResults {
    /// Assemble results from a finished execution record
    pub fn from_execution(execution: &AuditExecution) -> Self {
        let pages_found = execution
            .results
            .get("crawl")
            .and_then(|c| c.get("pages_found"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let report = execution
            .results
            .get("report")
            .and_then(|r| serde_json::from_value(r.clone()).ok());

        let agent_results = execution
            .results
            .iter()
            .filter(|(key, _)| execution.agent_statuses.contains_key(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            audit_id: execution.audit_id.clone(),
            status: execution.status,
            seed_url: execution.seed_url.clone(),
            pages_found,
            agent_results,
            report,
            duration_ms: execution.duration_ms(),
        }
    }
}

/// JSON Schema for the audit submission wire shape
pub fn audit_request_schema() -> schemars::Schema {
    schemars::schema_for!(AuditRequest)
}

/// JSON Schema for the progress wire shape
pub fn progress_update_schema() -> schemars::Schema {
    schemars::schema_for!(ProgressUpdate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_request_wire_shape() {
        let json = r#"{"audit_id":"t1","seed_url":"https://example.com","max_pages":5,"options":{"depth":2},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let request: AuditRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.audit_id, "t1");
        assert_eq!(request.max_pages, 5);
        assert_eq!(request.options["depth"], serde_json::json!(2));

        // options and timestamp are optional on input
        let minimal: AuditRequest =
            serde_json::from_str(r#"{"audit_id":"t2","seed_url":"https://x","max_pages":1}"#)
                .unwrap();
        assert!(minimal.options.is_empty());
    }

    #[test]
    fn test_request_validation() {
        assert!(AuditRequest::new("site-audit_42", "https://example.com", 5)
            .validate()
            .is_ok());

        for id in ["", "  ", "/etc/cron.d", "../../../tmp/x", "a/b", "a\\b", ".hidden", "x..y", "a\nb"] {
            let request = AuditRequest::new(id, "https://example.com", 5);
            assert!(request.validate().is_err(), "{:?} accepted", id);
        }

        assert!(AuditRequest::new("a1", "", 5).validate().is_err());
        assert!(AuditRequest::new("a1", "https://example.com", 0).validate().is_err());
    }

    #[test]
    fn test_progress_update_skips_absent_fields() {
        let update = ProgressUpdate::new("t1", "crawling", 25);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["audit_id"], "t1");
        assert_eq!(json["step"], "crawling");
        assert!(json.get("agent_name").is_none());
        assert!(json.get("error").is_none());

        let update = update.with_agent("keywords", "completed").with_error("slow");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["agent_name"], "keywords");
        assert_eq!(json["error"], "slow");
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(ProgressUpdate::new("a", "x", 250).progress, 100);
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            AuditStatus::Pending,
            AuditStatus::Running,
            AuditStatus::Completed,
            AuditStatus::Failed,
            AuditStatus::Partial,
        ] {
            assert_eq!(AuditStatus::from_str(status.as_str()), status);
        }
        assert!(AuditStatus::Running.is_active());
        assert!(AuditStatus::Partial.is_terminal());
    }

    #[test]
    fn test_finish_keeps_first_end_time() {
        let request = AuditRequest::new("a1", "https://example.com", 3);
        let mut execution = AuditExecution::start(&request, "initializing", 5);
        execution.finish(AuditStatus::Completed, None);
        let first = execution.end_time;
        execution.finish(AuditStatus::Failed, Some("late".into()));
        assert_eq!(execution.end_time, first);
        assert_eq!(execution.error.as_deref(), Some("late"));
    }

    #[test]
    fn test_schemas_name_wire_fields() {
        let schema = serde_json::to_string(&progress_update_schema()).unwrap();
        assert!(schema.contains("audit_id"));
        assert!(schema.contains("agent_status"));
        let schema = serde_json::to_string(&audit_request_schema()).unwrap();
        assert!(schema.contains("max_pages"));
    }
}
