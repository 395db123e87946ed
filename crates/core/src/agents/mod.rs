//! # Analysis Agents
//!
//! Pluggable analysis units run concurrently against crawled content.
//!
//! ## Architecture
//!
//! ```text
//! AgentRegistry (name → Arc<dyn Agent>)
//!   └── Agent::process(ctx, AgentInput { crawl, options }) → AgentResult
//! ```
//!
//! ## Built-in Agents
//!
//! - `TechnicalAgent` - status codes, titles, meta descriptions, thin pages
//! - `KeywordAgent` - term frequency across page text
//! - `LinkAgent` - internal/external link graph summary

pub mod keywords;
pub mod links;
pub mod registry;
pub mod technical;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::crawl::CrawlResult;
use crate::error::AuditError;
use crate::swarm::RunContext;

pub use keywords::KeywordAgent;
pub use links::LinkAgent;
pub use registry::{AgentRegistry, RegistryStats};
pub use technical::TechnicalAgent;

/// Outcome of one agent run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    Partial,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

/// What an agent analyses, which decides the fallback used when it fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Technical,
    Semantic,
    #[default]
    General,
}

impl AgentCategory {
    /// Map an agent failure onto the recovery taxonomy.
    /// General agents have no fallback and surface as plain failures.
    pub fn classify(&self, message: &str) -> Option<AuditError> {
        match self {
            Self::Technical => Some(AuditError::Technical(message.to_string())),
            Self::Semantic => Some(AuditError::Semantic(message.to_string())),
            Self::General => None,
        }
    }
}

/// Result returned by `Agent::process`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

impl AgentResult {
    pub fn completed(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            status: AgentStatus::Completed,
            data: HashMap::new(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_duration(mut self, started: std::time::Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as i64;
        self
    }
}

/// Input shared by every agent of one audit
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub audit_id: String,
    pub seed_url: String,
    pub options: HashMap<String, serde_json::Value>,
    pub crawl: Arc<CrawlResult>,
}

/// Capability contract every analysis unit implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier, used as the registry key
    fn name(&self) -> &str;

    /// Analyse the crawl output
    async fn process(&self, ctx: &RunContext, input: &AgentInput) -> anyhow::Result<AgentResult>;

    /// `Ok` means healthy
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn category(&self) -> AgentCategory {
        AgentCategory::General
    }
}

/// The stock agent set
pub fn builtin_agents() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(TechnicalAgent::default()),
        Arc::new(KeywordAgent::default()),
        Arc::new(LinkAgent),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_classification() {
        assert_eq!(
            AgentCategory::Semantic.classify("boom"),
            Some(AuditError::Semantic("boom".into()))
        );
        assert_eq!(
            AgentCategory::Technical.classify("boom"),
            Some(AuditError::Technical("boom".into()))
        );
        assert_eq!(AgentCategory::General.classify("boom"), None);
    }

    #[test]
    fn test_builtin_agent_names_are_unique() {
        let agents = builtin_agents();
        let mut names: Vec<&str> = agents.iter().map(|a| a.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), agents.len());
    }

    #[test]
    fn test_agent_result_serialization() {
        let result = AgentResult::completed("links").with_data("internal", serde_json::json!(4));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["data"]["internal"], 4);
    }
}
