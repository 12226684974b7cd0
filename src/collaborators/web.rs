//! Page fetcher for link previews.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::channels::email::strip_html;
use crate::collaborators::{Page, PageFetcher};
use crate::error::CollaboratorError;

const SERVICE: &str = "web";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Longest page text kept for summaries.
const PAGE_TEXT_CHARS: usize = 8000;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|nav|footer|header)[^>]*>.*?</(script|style|nav|footer|header)>")
        .expect("valid regex")
});

pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<Page, CollaboratorError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(CollaboratorError::Rejected {
                service: SERVICE,
                status: resp.status().as_u16(),
            });
        }

        let html = resp
            .text()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse {
                service: SERVICE,
                reason: e.to_string(),
            })?;
        Ok(parse_page(&html))
    }
}

/// Reduce an HTML document to its title and visible text.
pub fn parse_page(html: &str) -> Page {
    let title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| strip_html(m.as_str()))
        .filter(|t| !t.is_empty());
    let body = NOISE_RE.replace_all(html, " ");
    let text: String = strip_html(&body).chars().take(PAGE_TEXT_CHARS).collect();
    Page { title, text }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_page_extracts_title_and_text() {
        let html = r#"<html><head><title> Rust 2024 </title><style>p{}</style></head>
            <body><nav>Home | About</nav><p>Edition <b>released</b>.</p>
            <script>var x = 1;</script></body></html>"#;
        let page = parse_page(html);
        assert_eq!(page.title.as_deref(), Some("Rust 2024"));
        assert!(page.text.contains("Edition released."));
        assert!(!page.text.contains("var x"));
        assert!(!page.text.contains("Home | About"));
    }

    #[test]
    fn parse_page_without_title() {
        let page = parse_page("<p>just text</p>");
        assert_eq!(page.title, None);
        assert_eq!(page.text, "just text");
    }
}
