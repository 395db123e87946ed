//! # Audit Report
//!
//! Aggregates crawl metadata and agent outputs into the final report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::crawl::CrawlResult;
use crate::error::AuditError;

const MAX_TOP_ISSUES: usize = 10;

/// Final report of an audit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub audit_id: String,
    /// 0-100, absent when no agent produced a score
    pub score: Option<u8>,
    pub pages_found: usize,
    pub pages_analyzed: usize,
    pub top_issues: Vec<String>,
    pub recommendations: Vec<String>,
    /// Set when this is a synthetic stand-in for a failed report stage
    #[serde(default)]
    pub fallback: bool,
    pub generated_at: DateTime<Utc>,
}

/// Report generation collaborator
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn generate(
        &self,
        audit_id: &str,
        crawl: &CrawlResult,
        agent_results: &HashMap<String, serde_json::Value>,
    ) -> Result<AuditReport, AuditError>;
}

/// Averages agent scores and ranks issues by severity
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreReporter;

fn severity_rank(issue: &serde_json::Value) -> u8 {
    match issue.get("severity").and_then(|s| s.as_str()) {
        Some("high") => 3,
        Some("medium") => 2,
        Some("low") => 1,
        _ => 0,
    }
}

fn recommendation_for(code: &str) -> Option<&'static str> {
    Some(match code {
        "http_error" => "Fix or redirect pages returning error status codes",
        "missing_title" => "Add a unique <title> to every page",
        "long_title" => "Keep titles under 60 characters",
        "missing_meta_description" => "Write a meta description for each page",
        "missing_heading" => "Give each page a descriptive h1",
        "thin_content" => "Expand thin pages with substantive content",
        "slow_page" => "Reduce server response time on slow pages",
        _ => return None,
    })
}

#[async_trait]
impl Reporter for ScoreReporter {
    async fn generate(
        &self,
        audit_id: &str,
        crawl: &CrawlResult,
        agent_results: &HashMap<String, serde_json::Value>,
    ) -> Result<AuditReport, AuditError> {
        let scores: Vec<u64> = agent_results
            .values()
            .filter_map(|r| r.get("score").and_then(|s| s.as_u64()))
            .collect();
        let score = if scores.is_empty() {
            None
        } else {
            Some((scores.iter().sum::<u64>() / scores.len() as u64).min(100) as u8)
        };

        let mut issues: Vec<&serde_json::Value> = agent_results
            .values()
            .filter_map(|r| r.get("issues").and_then(|i| i.as_array()))
            .flatten()
            .collect();
        issues.sort_by_key(|issue| std::cmp::Reverse(severity_rank(issue)));

        let top_issues = issues
            .iter()
            .take(MAX_TOP_ISSUES)
            .map(|issue| {
                let message = issue.get("message").and_then(|m| m.as_str()).unwrap_or("issue");
                match issue.get("url").and_then(|u| u.as_str()) {
                    Some(url) => format!("{} ({})", message, url),
                    None => message.to_string(),
                }
            })
            .collect();

        // One recommendation per issue code, most frequent first
        let mut code_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for issue in &issues {
            if let Some(code) = issue.get("code").and_then(|c| c.as_str()) {
                *code_counts.entry(code).or_insert(0) += 1;
            }
        }
        let mut codes: Vec<(&str, usize)> = code_counts.into_iter().collect();
        codes.sort_by(|a, b| b.1.cmp(&a.1));
        let recommendations = codes
            .into_iter()
            .filter_map(|(code, count)| {
                recommendation_for(code).map(|text| format!("{} ({} pages)", text, count))
            })
            .collect();

        Ok(AuditReport {
            audit_id: audit_id.to_string(),
            score,
            pages_found: crawl.metadata.pages_found,
            pages_analyzed: crawl.pages.iter().filter(|p| p.status < 400).count(),
            top_issues,
            recommendations,
            fallback: false,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::Page;

    #[tokio::test]
    async fn test_score_reporter() {
        let crawl = CrawlResult::new(
            "https://example.com/",
            vec![
                Page {
                    url: "https://example.com/".into(),
                    status: 200,
                    ..Page::default()
                },
                Page {
                    url: "https://example.com/gone".into(),
                    status: 404,
                    ..Page::default()
                },
            ],
            Utc::now(),
        );

        let mut agent_results = HashMap::new();
        agent_results.insert(
            "technical".to_string(),
            serde_json::json!({
                "score": 80,
                "issues": [
                    {"url": "https://example.com/", "code": "missing_heading", "severity": "low", "message": "No heading"},
                    {"url": "https://example.com/gone", "code": "http_error", "severity": "high", "message": "HTTP 404"},
                ],
            }),
        );
        agent_results.insert("keywords".to_string(), serde_json::json!({"keywords": []}));

        let report = ScoreReporter
            .generate("a1", &crawl, &agent_results)
            .await
            .unwrap();

        assert_eq!(report.score, Some(80));
        assert_eq!(report.pages_found, 2);
        assert_eq!(report.pages_analyzed, 1);
        assert_eq!(report.top_issues[0], "HTTP 404 (https://example.com/gone)");
        assert_eq!(report.recommendations.len(), 2);
        assert!(!report.fallback);
    }

    #[tokio::test]
    async fn test_no_scores_means_no_score() {
        let crawl = CrawlResult::new("https://example.com/", Vec::new(), Utc::now());
        let report = ScoreReporter
            .generate("a1", &crawl, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.score, None);
        assert!(report.top_issues.is_empty());
    }
}
