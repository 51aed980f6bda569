//! arXiv search collaborator.
//!
//! Queries the Atom export API and maps entries to [`PaperRecord`]s. Every
//! request first passes through a shared [`RateLimiter`]; 429 and 503
//! responses are retried with exponential backoff before giving up.

use super::config::ResearchConfig;
use super::models::PaperRecord;
use super::rate_limit::RateLimiter;
use super::ResearchError;
use crate::ActivityError;
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::StatusCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_RESULTS_LIMIT: u32 = 100;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Anything that can find papers for a query.
#[async_trait]
pub trait PaperSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PaperRecord>, ActivityError>;
}

/// HTTP client for the arXiv export API.
///
/// Clones share the same rate limiter.
#[derive(Clone)]
pub struct ArxivClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry_base: Duration,
}

impl ArxivClient {
    pub fn new(base_url: impl Into<String>, limiter: Arc<RateLimiter>) -> Result<Self, ResearchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("durable-research/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ResearchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            limiter,
            retry_base: RETRY_BASE,
        })
    }

    pub fn from_config(config: &ResearchConfig) -> Result<Self, ResearchError> {
        Self::new(
            config.arxiv_base_url.clone(),
            Arc::new(RateLimiter::new(config.arxiv_min_interval)),
        )
    }

    /// Base delay of the 429/503 backoff (`base * 2^attempt`).
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Search all fields for `query`, most relevant first.
    pub async fn search_papers(&self, query: &str, max_results: u32) -> Result<Vec<PaperRecord>, ResearchError> {
        validate_max_results(max_results)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::InvalidInput("query cannot be empty".to_string()));
        }

        let params = [
            ("search_query", format!("all:{query}")),
            ("start", "0".to_string()),
            ("max_results", max_results.to_string()),
            ("sortBy", SortBy::Relevance.as_str().to_string()),
            ("sortOrder", SortOrder::Descending.as_str().to_string()),
        ];
        let papers = self.fetch_feed(&params).await?;
        debug!(query = %query, count = papers.len(), "arXiv search finished");
        Ok(papers)
    }

    /// List papers in an arXiv category such as `cs.LG`, optionally narrowed by `query`.
    pub async fn search_by_category(
        &self,
        category: &str,
        query: Option<&str>,
        max_results: u32,
        sort_by: SortBy,
        sort_order: SortOrder,
    ) -> Result<Vec<PaperRecord>, ResearchError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(ResearchError::InvalidInput("category cannot be empty".to_string()));
        }
        validate_max_results(max_results)?;

        let search_query = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => format!("(cat:{category}) AND (all:{q})"),
            None => format!("cat:{category}"),
        };
        let params = [
            ("search_query", search_query),
            ("start", "0".to_string()),
            ("max_results", max_results.to_string()),
            ("sortBy", sort_by.as_str().to_string()),
            ("sortOrder", sort_order.as_str().to_string()),
        ];
        let papers = self.fetch_feed(&params).await?;
        debug!(category = %category, count = papers.len(), "arXiv category search finished");
        Ok(papers)
    }

    /// Look up one paper by arXiv id (`2301.12345` or `2301.12345v1`).
    ///
    /// Returns `None` when arXiv has no entry for the id.
    pub async fn get_paper_by_id(&self, arxiv_id: &str) -> Result<Option<PaperRecord>, ResearchError> {
        let arxiv_id = arxiv_id.trim();
        if arxiv_id.is_empty() {
            return Err(ResearchError::InvalidInput("arxiv_id cannot be empty".to_string()));
        }
        let params = [("id_list", arxiv_id.to_string()), ("max_results", "1".to_string())];
        Ok(self.fetch_feed(&params).await?.into_iter().next())
    }

    /// One rate-limited GET against the export API, retrying 429 and 503.
    async fn fetch_feed(&self, params: &[(&str, String)]) -> Result<Vec<PaperRecord>, ResearchError> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            let response = self.http.get(&self.base_url).query(params).send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
                if attempt + 1 < MAX_ATTEMPTS {
                    let backoff = self.retry_base.saturating_mul(1 << attempt);
                    warn!(
                        status = status.as_u16(),
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "arXiv throttled the request; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                }
                let body = response.text().await.unwrap_or_default();
                return Err(ResearchError::Status {
                    status: status.as_u16(),
                    body,
                    retryable: true,
                });
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ResearchError::Status {
                    status: status.as_u16(),
                    body,
                    retryable: false,
                });
            }

            let body = response.text().await?;
            return parse_feed(&body);
        }
    }
}

fn validate_max_results(max_results: u32) -> Result<(), ResearchError> {
    if (1..=MAX_RESULTS_LIMIT).contains(&max_results) {
        Ok(())
    } else {
        Err(ResearchError::InvalidInput(format!(
            "max_results must be between 1 and {MAX_RESULTS_LIMIT}, got {max_results}"
        )))
    }
}

/// Sort field accepted by the export API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    Relevance,
    LastUpdatedDate,
    #[default]
    SubmittedDate,
}

impl SortBy {
    pub fn as_str(self) -> &'static str {
        match self {
            SortBy::Relevance => "relevance",
            SortBy::LastUpdatedDate => "lastUpdatedDate",
            SortBy::SubmittedDate => "submittedDate",
        }
    }
}

impl FromStr for SortBy {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relevance" => Ok(SortBy::Relevance),
            "lastUpdatedDate" => Ok(SortBy::LastUpdatedDate),
            "submittedDate" => Ok(SortBy::SubmittedDate),
            other => Err(ResearchError::InvalidInput(format!(
                "sort_by must be 'relevance', 'lastUpdatedDate', or 'submittedDate', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ascending",
            SortOrder::Descending => "descending",
        }
    }
}

impl FromStr for SortOrder {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascending" => Ok(SortOrder::Ascending),
            "descending" => Ok(SortOrder::Descending),
            other => Err(ResearchError::InvalidInput(format!(
                "sort_order must be 'ascending' or 'descending', got '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl PaperSearch for ArxivClient {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PaperRecord>, ActivityError> {
        Ok(self.search_papers(query, max_results).await?)
    }
}

/// Parse an arXiv Atom feed into paper records.
pub fn parse_feed(xml: &str) -> Result<Vec<PaperRecord>, ResearchError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entry: Option<PaperRecord> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(|e| ResearchError::Parse(format!("invalid Atom feed: {e}")))? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"entry" {
                    entry = Some(PaperRecord::default());
                } else if let Some(paper) = entry.as_mut() {
                    apply_attributes(paper, &name, &e)?;
                }
                path.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                if let Some(paper) = entry.as_mut() {
                    apply_attributes(paper, e.local_name().as_ref(), &e)?;
                }
            }
            Event::Text(t) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| ResearchError::Parse(format!("invalid text in Atom feed: {e}")))?;
                text.push_str(&unescaped);
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(e) => {
                path.pop();
                let local = e.local_name();
                let name = local.as_ref();
                if name == b"entry" {
                    if let Some(mut paper) = entry.take() {
                        if paper.abs_url.is_empty() {
                            paper.abs_url = format!("https://arxiv.org/abs/{}", paper.id);
                        }
                        papers.push(paper);
                    }
                } else if let Some(paper) = entry.as_mut() {
                    let in_author = path.last().is_some_and(|p| p.as_slice() == b"author");
                    apply_text(paper, name, in_author, &text);
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(papers)
}

fn apply_text(paper: &mut PaperRecord, name: &[u8], in_author: bool, text: &str) {
    if in_author {
        if name == b"name" && !text.trim().is_empty() {
            paper.authors.push(text.trim().to_string());
        }
        return;
    }
    match name {
        b"id" => {
            let raw = text.trim();
            paper.id = match raw.split_once("/abs/") {
                Some((_, id)) => id.to_string(),
                None => raw.to_string(),
            };
        }
        b"title" => paper.title = collapse_whitespace(text),
        b"summary" => paper.summary = collapse_whitespace(text),
        b"published" => paper.published = text.trim().to_string(),
        b"updated" => paper.updated = text.trim().to_string(),
        b"comment" => paper.comment = collapse_whitespace(text),
        b"journal_ref" => paper.journal_ref = collapse_whitespace(text),
        b"doi" => paper.doi = text.trim().to_string(),
        _ => {}
    }
}

fn apply_attributes(paper: &mut PaperRecord, name: &[u8], element: &BytesStart<'_>) -> Result<(), ResearchError> {
    match name {
        b"category" => {
            if let Some(term) = attribute(element, b"term")?.filter(|t| !t.is_empty()) {
                paper.categories.push(term);
            }
        }
        b"primary_category" => paper.primary_category = attribute(element, b"term")?.unwrap_or_default(),
        b"link" => {
            let href = attribute(element, b"href")?.unwrap_or_default();
            let title = attribute(element, b"title")?.unwrap_or_default();
            let kind = attribute(element, b"type")?.unwrap_or_default();
            let rel = attribute(element, b"rel")?.unwrap_or_default();
            if title == "pdf" || kind == "application/pdf" {
                paper.pdf_url = href;
            } else if rel == "alternate" {
                paper.abs_url = href;
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, ResearchError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ResearchError::Parse(format!("invalid attribute in Atom feed: {e}")))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| ResearchError::Parse(format!("invalid attribute value in Atom feed: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
