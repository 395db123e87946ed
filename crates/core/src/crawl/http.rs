//! # HTTP Crawler
//!
//! Breadth-first crawler restricted to the seed's host. Only a failure on
//! the seed page fails the crawl; later page failures are recorded in the
//! crawl metadata and skipped.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use super::{html, CrawlResult, Crawler, Page};
use crate::error::AuditError;
use crate::swarm::RunContext;

/// Reference fetcher built on `reqwest`
#[derive(Debug, Clone)]
pub struct HttpCrawler {
    client: reqwest::Client,
}

impl HttpCrawler {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(20))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &Url) -> Result<Page, AuditError> {
        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let final_url = response.url().clone();
        let body = response.text().await.map_err(classify_transport_error)?;

        let text = html::extract_text(&body);
        Ok(Page {
            url: final_url.to_string(),
            status: status.as_u16(),
            title: html::extract_title(&body),
            meta_description: html::extract_meta_description(&body),
            headings: html::extract_headings(&body),
            word_count: text.split_whitespace().count(),
            text,
            links: html::extract_links(&final_url, &body),
            load_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Connection-level failures are retryable, anything else is a crawl failure
fn classify_transport_error(error: reqwest::Error) -> AuditError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        AuditError::Network(error.to_string())
    } else {
        AuditError::crawl(error.to_string())
    }
}

fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str()
}

#[async_trait]
impl Crawler for HttpCrawler {
    #[tracing::instrument(skip(self, ctx, output_dir))]
    async fn crawl(
        &self,
        ctx: &RunContext,
        seed_url: &str,
        max_pages: usize,
        output_dir: Option<&Path>,
    ) -> Result<CrawlResult, AuditError> {
        let started_at = Utc::now();
        let seed = Url::parse(seed_url)
            .map_err(|e| AuditError::crawl(format!("invalid seed url '{}': {}", seed_url, e)))?;

        let mut queue = VecDeque::from([seed.clone()]);
        let mut seen: HashSet<String> = HashSet::from([seed.to_string()]);
        let mut pages = Vec::new();
        let mut errors = Vec::new();

        while let Some(url) = queue.pop_front() {
            if pages.len() >= max_pages || ctx.is_cancelled() {
                break;
            }

            let page = match self.fetch(&url).await {
                Ok(page) => page,
                Err(e) if pages.is_empty() && url == seed => return Err(e),
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", url, e);
                    errors.push(format!("{}: {}", url, e));
                    continue;
                }
            };

            if url == seed && page.status >= 400 {
                return Err(AuditError::crawl(format!(
                    "seed returned HTTP {}",
                    page.status
                )));
            }

            for link in &page.links {
                let Ok(target) = Url::parse(link) else { continue };
                if same_host(&seed, &target) && seen.insert(target.to_string()) {
                    queue.push_back(target);
                }
            }
            pages.push(page);
        }

        let mut result = CrawlResult::new(seed_url, pages, started_at);
        result.metadata.pages_failed = errors.len();
        result.metadata.errors = errors;

        if let Some(dir) = output_dir {
            if let Err(e) = write_snapshot(dir, &result).await {
                tracing::warn!("Failed to write crawl snapshot: {}", e);
            }
        }

        tracing::info!(
            "Crawled {} pages from {} ({} failed)",
            result.metadata.pages_found,
            seed_url,
            result.metadata.pages_failed
        );
        Ok(result)
    }
}

async fn write_snapshot(dir: &Path, result: &CrawlResult) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let content = serde_json::to_vec_pretty(result)?;
    tokio::fs::write(dir.join("crawl.json"), content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_host() {
        let a = Url::parse("https://example.com/a").unwrap();
        let b = Url::parse("https://example.com/b?x=1").unwrap();
        let c = Url::parse("https://cdn.example.com/").unwrap();
        assert!(same_host(&a, &b));
        assert!(!same_host(&a, &c));
    }

    #[tokio::test]
    async fn test_invalid_seed_is_crawl_error() {
        let crawler = HttpCrawler::new("sitescope-test").unwrap();
        let err = crawler
            .crawl(&RunContext::new(), "not a url", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Crawl { .. }));
    }

    #[tokio::test]
    async fn test_write_snapshot() {
        let dir = Path::new(".sitescope/test_snapshot");
        let result = CrawlResult::new("https://example.com", Vec::new(), Utc::now());
        write_snapshot(dir, &result).await.unwrap();
        assert!(dir.join("crawl.json").exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
