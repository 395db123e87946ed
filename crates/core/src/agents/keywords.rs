//! # Keyword Agent
//!
//! Term frequency over page text, titles and headings. Title and heading
//! terms are weighted above body text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use super::{Agent, AgentCategory, AgentInput, AgentResult};
use crate::crawl::Page;
use crate::swarm::RunContext;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "do", "for", "from", "has", "have", "he", "her", "his", "how", "if", "in",
    "into", "is", "it", "its", "more", "my", "no", "not", "of", "on", "one", "or", "our", "out",
    "she", "so", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "to", "up", "us", "was", "we", "were", "what", "when", "which", "who", "will", "with", "you",
    "your",
];

const TITLE_WEIGHT: usize = 5;
const HEADING_WEIGHT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyword {
    pub term: String,
    pub weight: usize,
    /// Number of pages the term appears on
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct KeywordAgent {
    /// How many terms to report
    pub top_n: usize,
    pub min_term_len: usize,
}

impl Default for KeywordAgent {
    fn default() -> Self {
        Self {
            top_n: 20,
            min_term_len: 3,
        }
    }
}

impl KeywordAgent {
    pub const NAME: &'static str = "keywords";

    fn terms<'a>(&self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        let min_len = self.min_term_len;
        text.split(|c: char| !c.is_alphanumeric() && c != '-')
            .map(|t| t.trim_matches('-').to_lowercase())
            .filter(move |t| {
                t.chars().count() >= min_len
                    && !STOPWORDS.contains(&t.as_str())
                    && !t.chars().all(|c| c.is_ascii_digit())
            })
    }

    fn page_weights(&self, page: &Page) -> HashMap<String, usize> {
        let mut weights = HashMap::new();
        for term in self.terms(&page.text) {
            *weights.entry(term).or_insert(0) += 1;
        }
        if let Some(title) = &page.title {
            for term in self.terms(title) {
                *weights.entry(term).or_insert(0) += TITLE_WEIGHT;
            }
        }
        for heading in &page.headings {
            for term in self.terms(heading) {
                *weights.entry(term).or_insert(0) += HEADING_WEIGHT;
            }
        }
        weights
    }

    /// Top terms across all pages, heaviest first, ties broken alphabetically
    pub fn extract(&self, pages: &[Page]) -> Vec<Keyword> {
        let mut totals: HashMap<String, (usize, usize)> = HashMap::new();
        for page in pages {
            for (term, weight) in self.page_weights(page) {
                let entry = totals.entry(term).or_insert((0, 0));
                entry.0 += weight;
                entry.1 += 1;
            }
        }

        let mut keywords: Vec<Keyword> = totals
            .into_iter()
            .map(|(term, (weight, pages))| Keyword {
                term,
                weight,
                pages,
            })
            .collect();
        keywords.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.term.cmp(&b.term)));
        keywords.truncate(self.top_n);
        keywords
    }
}

#[async_trait]
impl Agent for KeywordAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn category(&self) -> AgentCategory {
        AgentCategory::Semantic
    }

    async fn process(&self, _ctx: &RunContext, input: &AgentInput) -> anyhow::Result<AgentResult> {
        let started = Instant::now();
        let keywords = self.extract(&input.crawl.pages);

        // Topics: top terms shared by more than one page
        let topics: Vec<&str> = keywords
            .iter()
            .filter(|k| k.pages > 1)
            .take(5)
            .map(|k| k.term.as_str())
            .collect();

        Ok(AgentResult::completed(Self::NAME)
            .with_data("keywords", serde_json::to_value(&keywords)?)
            .with_data("topics", serde_json::json!(topics))
            .with_duration(started))
    }
}
