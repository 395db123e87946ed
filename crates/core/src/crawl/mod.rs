//! # Crawl
//!
//! Fetch collaborator contract and the page model handed to agents.
//!
//! - `Crawler` - trait implemented by any fetcher
//! - `HttpCrawler` - breadth-first same-host crawler over `reqwest`
//! - `html` - regex-based extraction of titles, meta tags, links, and text

pub mod html;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AuditError;
use crate::swarm::RunContext;

pub use http::HttpCrawler;

/// A fetched page
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Page {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub meta_description: Option<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    /// Visible text with markup stripped
    #[serde(default)]
    pub text: String,
    pub word_count: usize,
    /// Absolute link targets found on the page
    #[serde(default)]
    pub links: Vec<String>,
    pub load_time_ms: u64,
}

/// Summary of a crawl run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlMetadata {
    pub seed_url: String,
    pub pages_found: usize,
    pub pages_failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Output of the crawl stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlResult {
    pub pages: Vec<Page>,
    pub metadata: CrawlMetadata,
}

impl CrawlResult {
    /// Build a result from fetched pages
    pub fn new(seed_url: &str, pages: Vec<Page>, started_at: DateTime<Utc>) -> Self {
        Self {
            metadata: CrawlMetadata {
                seed_url: seed_url.to_string(),
                pages_found: pages.len(),
                pages_failed: 0,
                started_at,
                finished_at: Utc::now(),
                errors: Vec::new(),
            },
            pages,
        }
    }

    /// Compact summary stored on the execution record
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "pages_found": self.metadata.pages_found,
            "pages_failed": self.metadata.pages_failed,
            "seed_url": self.metadata.seed_url,
            "errors": self.metadata.errors,
        })
    }
}

/// Fetch collaborator contract
#[async_trait]
pub trait Crawler: Send + Sync {
    /// Fetch up to `max_pages` pages starting at `seed_url`.
    ///
    /// Transport failures should be reported as `AuditError::Network` so
    /// the pipeline can retry them; anything else as `AuditError::Crawl`.
    ///
    /// The pipeline enforces a hard ceiling on this call. A crawl cut off
    /// there reports no processed pages and fails the audit, so crawlers
    /// that want partial credit must stop on their own before the ceiling
    /// and return `AuditError::Crawl` with `pages_processed` set.
    async fn crawl(
        &self,
        ctx: &RunContext,
        seed_url: &str,
        max_pages: usize,
        output_dir: Option<&Path>,
    ) -> Result<CrawlResult, AuditError>;
}
