//! # Technical Agent
//!
//! Per-page technical checks: HTTP status, title, meta description, thin
//! content and slow responses. Produces an issue list and a 0-100 score.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{Agent, AgentCategory, AgentInput, AgentResult};
use crate::crawl::Page;
use crate::swarm::RunContext;

/// How bad an issue is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn penalty(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 3.0,
            Self::High => 8.0,
        }
    }
}

/// A single finding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechnicalIssue {
    pub url: String,
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl TechnicalIssue {
    fn new(page: &Page, code: &str, severity: Severity, message: String) -> Self {
        Self {
            url: page.url.clone(),
            code: code.to_string(),
            severity,
            message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TechnicalAgent {
    /// Pages below this word count are flagged as thin
    pub min_words: usize,
    /// Pages slower than this are flagged
    pub slow_page_ms: u64,
}

impl Default for TechnicalAgent {
    fn default() -> Self {
        Self {
            min_words: 250,
            slow_page_ms: 3_000,
        }
    }
}

impl TechnicalAgent {
    pub const NAME: &'static str = "technical";

    pub fn inspect(&self, page: &Page) -> Vec<TechnicalIssue> {
        let mut issues = Vec::new();

        if page.status >= 400 {
            issues.push(TechnicalIssue::new(
                page,
                "http_error",
                Severity::High,
                format!("Page returned HTTP {}", page.status),
            ));
            return issues;
        }

        match page.title.as_deref() {
            None => issues.push(TechnicalIssue::new(
                page,
                "missing_title",
                Severity::High,
                "Page has no <title>".to_string(),
            )),
            Some(title) if title.chars().count() > 60 => issues.push(TechnicalIssue::new(
                page,
                "long_title",
                Severity::Low,
                format!("Title is {} characters", title.chars().count()),
            )),
            Some(_) => {}
        }

        if page.meta_description.is_none() {
            issues.push(TechnicalIssue::new(
                page,
                "missing_meta_description",
                Severity::Medium,
                "Page has no meta description".to_string(),
            ));
        }

        if page.headings.is_empty() {
            issues.push(TechnicalIssue::new(
                page,
                "missing_heading",
                Severity::Low,
                "Page has no h1/h2 headings".to_string(),
            ));
        }

        if page.word_count < self.min_words {
            issues.push(TechnicalIssue::new(
                page,
                "thin_content",
                Severity::Medium,
                format!("Only {} words of content", page.word_count),
            ));
        }

        if page.load_time_ms > self.slow_page_ms {
            issues.push(TechnicalIssue::new(
                page,
                "slow_page",
                Severity::Medium,
                format!("Loaded in {} ms", page.load_time_ms),
            ));
        }

        issues
    }

    /// 100 minus the average per-page penalty
    pub fn score(issues: &[TechnicalIssue], pages: usize) -> u8 {
        if pages == 0 {
            return 0;
        }
        let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
        let per_page = penalty / pages as f64;
        (100.0 - per_page * 5.0).clamp(0.0, 100.0).round() as u8
    }
}

#[async_trait]
impl Agent for TechnicalAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn category(&self) -> AgentCategory {
        AgentCategory::Technical
    }

    async fn process(&self, _ctx: &RunContext, input: &AgentInput) -> anyhow::Result<AgentResult> {
        let started = Instant::now();
        let pages = &input.crawl.pages;

        let mut issues: Vec<TechnicalIssue> = pages.iter().flat_map(|p| self.inspect(p)).collect();
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        let score = Self::score(&issues, pages.len());

        tracing::debug!(
            "Technical analysis of {} found {} issues (score {})",
            input.audit_id,
            issues.len(),
            score
        );

        Ok(AgentResult::completed(Self::NAME)
            .with_data("issues", serde_json::to_value(&issues)?)
            .with_data("score", serde_json::json!(score))
            .with_data("pages_analyzed", serde_json::json!(pages.len()))
            .with_duration(started))
    }
}
