//! # SiteScope Core
//!
//! Orchestration core for multi-stage site audits: crawl a target, run
//! pluggable analysis agents in parallel, aggregate their findings and
//! stream progress while tolerating partial failure.
//!
//! ## Architecture
//!
//! - `agents/` - `Agent` trait, thread-safe registry, built-in agents
//! - `crawl/` - `Crawler` trait and the reference HTTP crawler
//! - `swarm/` - pipeline executor, stage machine, events, reporting
//! - `progress` - bounded progress streams per audit
//! - `recovery` - failure classification, retries and fallbacks
//! - `orchestrator` - public facade tying it all together
//! - `state/` - SQLite persistence of audit records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sitescope_core::{AuditRequest, Orchestrator, OrchestratorConfig, RunContext};
//!
//! let orchestrator = Orchestrator::from_config(OrchestratorConfig::default())?;
//! let mut progress = orchestrator
//!     .start_audit(&RunContext::new(), AuditRequest::new("a1", "https://example.com", 20))
//!     .await?;
//! while let Some(update) = progress.recv().await {
//!     println!("{} {}%", update.step, update.progress);
//! }
//! let results = orchestrator.get_results("a1").await?;
//! ```

pub mod agents;
pub mod config;
pub mod crawl;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod state;
pub mod swarm;

pub use agents::{Agent, AgentInput, AgentRegistry, AgentResult, AgentStatus};
pub use config::OrchestratorConfig;
pub use crawl::{CrawlResult, Crawler, HttpCrawler, Page};
pub use error::{AuditError, OrchestratorError};
pub use models::{AuditExecution, AuditRequest, AuditResults, AuditStatus, ProgressUpdate};
pub use orchestrator::{progress_for_step, Orchestrator};
pub use swarm::RunContext;
