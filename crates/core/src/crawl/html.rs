//! Lightweight HTML extraction.
//!
//! Regex-based on purpose: the crawler only needs titles, meta
//! descriptions, headings, anchors, and visible text.

use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

fn meta_description_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<meta\s+[^>]*name\s*=\s*["']description["'][^>]*content\s*=\s*["']([^"']*)["']"#)
            .expect("valid regex")
    })
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<h[12][^>]*>(.*?)</h[12]>").expect("valid regex"))
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<a\s+[^>]*href\s*=\s*["']([^"']+)["']"#).expect("valid regex"))
}

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
            .expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"))
}

fn clean(fragment: &str) -> String {
    let without_tags = tag_re().replace_all(fragment, " ");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn extract_title(html: &str) -> Option<String> {
    title_re()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|t| !t.is_empty())
}

pub fn extract_meta_description(html: &str) -> Option<String> {
    meta_description_re()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty())
}

pub fn extract_headings(html: &str) -> Vec<String> {
    heading_re()
        .captures_iter(html)
        .filter_map(|c| c.get(1).map(|m| clean(m.as_str())))
        .filter(|h| !h.is_empty())
        .collect()
}

/// Absolute http(s) link targets, deduplicated in document order
pub fn extract_links(base: &Url, html: &str) -> Vec<String> {
    let html = script_style_re().replace_all(html, " ");
    let mut links: Vec<String> = Vec::new();
    for cap in href_re().captures_iter(&html) {
        let Some(raw) = cap.get(1) else { continue };
        let Ok(mut resolved) = base.join(raw.as_str().trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let resolved = resolved.to_string();
        if !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    links
}

/// Visible text with scripts, styles, and markup removed
pub fn extract_text(html: &str) -> String {
    let without_scripts = script_style_re().replace_all(html, " ");
    clean(&without_scripts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
          <title> Rust Audits </title>
          <meta name="description" content="Fast site audits">
          <style>body { color: red }</style>
        </head><body>
          <h1>Welcome <em>home</em></h1>
          <script>var x = "<a href='/hidden'>";</script>
          <p>Crawl the web.</p>
          <a href="/about">About</a>
          <a href="https://other.org/page#top">Other</a>
          <a href="mailto:me@example.com">Mail</a>
          <a href="/about">About again</a>
        </body></html>
    "#;

    #[test]
    fn test_extract_title_and_meta() {
        assert_eq!(extract_title(PAGE).as_deref(), Some("Rust Audits"));
        assert_eq!(
            extract_meta_description(PAGE).as_deref(),
            Some("Fast site audits")
        );
        assert_eq!(extract_title("<html></html>"), None);
    }

    #[test]
    fn test_extract_headings() {
        assert_eq!(extract_headings(PAGE), vec!["Welcome home"]);
    }

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let base = Url::parse("https://example.com/docs/").unwrap();
        let links = extract_links(&base, PAGE);
        assert!(links.contains(&"https://example.com/about".to_string()));
        assert!(links.contains(&"https://other.org/page".to_string()));
        assert!(!links.iter().any(|l| l.starts_with("mailto:")));
        assert!(!links.iter().any(|l| l.ends_with("/hidden")));
        assert_eq!(
            links.iter().filter(|l| l.ends_with("/about")).count(),
            1,
            "duplicates are dropped"
        );
    }

    #[test]
    fn test_extract_text_drops_scripts() {
        let text = extract_text(PAGE);
        assert!(text.contains("Crawl the web."));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("var x"));
    }
}
