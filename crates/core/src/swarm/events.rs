//! # Pipeline Events
//!
//! Results emitted by the executor, one per stage or agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Step of an audit run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Initializing,
    Crawling,
    Analyzing,
    Reporting,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Crawling => "crawling",
            Self::Analyzing => "analyzing",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "crawling" => Some(Self::Crawling),
            "analyzing" => Some(Self::Analyzing),
            "reporting" => Some(Self::Reporting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Fixed overall progress for the canonical steps
    pub fn canonical_progress(&self) -> Option<u8> {
        match self {
            Self::Initializing => Some(5),
            Self::Crawling => Some(25),
            Self::Analyzing => Some(70),
            Self::Reporting => Some(90),
            Self::Completed => Some(100),
            Self::Failed | Self::Cancelled | Self::TimedOut => None,
        }
    }

    /// Whether the run ends with this step
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Outcome carried by a result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
    /// Stage skipped, fallback data substituted
    Skipped,
    Partial,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Partial => "partial",
        }
    }
}

/// A result emitted by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub step: PipelineStep,
    /// Set for per-agent results
    #[serde(default)]
    pub agent_name: Option<String>,
    pub status: ResultStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl PipelineResult {
    /// Stage-level result
    pub fn stage(step: PipelineStep, status: ResultStatus) -> Self {
        Self {
            step,
            agent_name: None,
            status,
            data: serde_json::Value::Null,
            error: None,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Result for a single agent in the analysis stage
    pub fn agent(name: &str, status: ResultStatus) -> Self {
        Self {
            agent_name: Some(name.to_string()),
            ..Self::stage(PipelineStep::Analyzing, status)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_round_trip() {
        for step in [
            PipelineStep::Initializing,
            PipelineStep::Crawling,
            PipelineStep::Analyzing,
            PipelineStep::Reporting,
            PipelineStep::Completed,
            PipelineStep::Failed,
            PipelineStep::Cancelled,
            PipelineStep::TimedOut,
        ] {
            assert_eq!(PipelineStep::from_str(step.as_str()), Some(step));
        }
        assert_eq!(PipelineStep::from_str("bogus"), None);
    }

    #[test]
    fn test_agent_result() {
        let result = PipelineResult::agent("keywords", ResultStatus::Skipped).with_error("model down");
        assert_eq!(result.step, PipelineStep::Analyzing);
        assert_eq!(result.agent_name.as_deref(), Some("keywords"));
        assert!(!result.is_terminal());
        assert!(PipelineResult::stage(PipelineStep::TimedOut, ResultStatus::Partial).is_terminal());
    }
}
