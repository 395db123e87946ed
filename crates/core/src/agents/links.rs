use async_trait::async_trait;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::{Agent, AgentInput, AgentResult};
use crate::crawl::Page;
use crate::swarm::RunContext;

/// Internal/external link summary and pages nothing else links to
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkAgent;

impl LinkAgent {
    pub const NAME: &'static str = "links";

    pub fn summarize(seed_url: &str, pages: &[Page]) -> serde_json::Value {
        let host = Url::parse(seed_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        let mut internal = 0usize;
        let mut external = 0usize;
        let mut inbound: HashMap<&str, usize> = HashMap::new();
        let mut external_domains: HashSet<String> = HashSet::new();

        for page in pages {
            for link in &page.links {
                let target_host = Url::parse(link)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string));
                if target_host.is_some() && target_host == host {
                    internal += 1;
                    if link != &page.url {
                        *inbound.entry(link.as_str()).or_insert(0) += 1;
                    }
                } else {
                    external += 1;
                    if let Some(domain) = target_host {
                        external_domains.insert(domain);
                    }
                }
            }
        }

        let seed = Url::parse(seed_url).map(|u| u.to_string()).ok();
        let mut orphans: Vec<&str> = pages
            .iter()
            .map(|p| p.url.as_str())
            .filter(|url| !inbound.contains_key(url) && Some(url.to_string()) != seed)
            .collect();
        orphans.sort();

        let mut domains: Vec<String> = external_domains.into_iter().collect();
        domains.sort();

        serde_json::json!({
            "internal_links": internal,
            "external_links": external,
            "external_domains": domains,
            "orphan_pages": orphans,
        })
    }
}

#[async_trait]
impl Agent for LinkAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process(&self, _ctx: &RunContext, input: &AgentInput) -> anyhow::Result<AgentResult> {
        let started = Instant::now();
        let summary = Self::summarize(&input.seed_url, &input.crawl.pages);
        Ok(AgentResult::completed(Self::NAME)
            .with_data("links", summary)
            .with_duration(started))
    }
}
