//! Payloads of the research workflow.
//!
//! Everything here crosses a durable boundary (activity input/output,
//! sub-orchestration input/output, continue-as-new state) and travels as JSON.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// What a client submits to start a research run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchInput {
    pub topic: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

/// State threaded through every execution of the top-level loop.
///
/// It is the only thing carried across continue-as-new, so the next
/// execution starts from exactly this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ResearchStateWire")]
pub struct ResearchState {
    pub topic: String,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub all_findings: Vec<ResearchFinding>,
    pub current_query: String,
}

#[derive(Deserialize)]
struct ResearchStateWire {
    topic: String,
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    #[serde(default)]
    current_iteration: u32,
    #[serde(default)]
    all_findings: Vec<ResearchFinding>,
    #[serde(default)]
    current_query: Option<String>,
}

impl From<ResearchStateWire> for ResearchState {
    fn from(wire: ResearchStateWire) -> Self {
        let current_query = match wire.current_query {
            Some(q) if !q.trim().is_empty() => q,
            _ => wire.topic.clone(),
        };
        Self {
            topic: wire.topic,
            max_iterations: wire.max_iterations,
            current_iteration: wire.current_iteration,
            all_findings: wire.all_findings,
            current_query,
        }
    }
}

impl ResearchState {
    pub fn new(topic: impl Into<String>, max_iterations: u32) -> Self {
        let topic = topic.into();
        Self {
            current_query: topic.clone(),
            topic,
            max_iterations,
            current_iteration: 0,
            all_findings: Vec::new(),
        }
    }
}

impl From<ResearchInput> for ResearchState {
    fn from(input: ResearchInput) -> Self {
        Self::new(input.topic, input.max_iterations)
    }
}

/// Input of the paper-research sub-orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperQuery {
    pub main_topic: String,
    pub query: String,
}

/// One arXiv entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperRecord {
    /// Identifier after `/abs/`, version suffix included (e.g. `2301.12345v1`).
    #[serde(alias = "arxiv_id")]
    pub id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub published: String,
    pub updated: String,
    pub categories: Vec<String>,
    pub primary_category: String,
    pub pdf_url: String,
    pub abs_url: String,
    pub comment: String,
    pub journal_ref: String,
    pub doi: String,
}

/// Condensed view of a paper used when prompting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub id: String,
    pub title: String,
    /// First three authors, then "et al." when there are more.
    pub authors: String,
    /// Publication date (YYYY-MM-DD).
    pub published: String,
    pub categories: String,
    /// Abstract cut to 500 characters.
    pub abstract_excerpt: String,
    pub abs_url: String,
}

impl From<&PaperRecord> for PaperSummary {
    fn from(paper: &PaperRecord) -> Self {
        let mut authors = paper.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        if paper.authors.len() > 3 {
            authors.push_str(" et al.");
        }
        Self {
            id: paper.id.clone(),
            title: paper.title.clone(),
            authors,
            published: paper.published.chars().take(10).collect(),
            categories: paper.categories.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
            abstract_excerpt: paper.summary.chars().take(500).collect(),
            abs_url: paper.abs_url.clone(),
        }
    }
}

/// Analysis of one query's papers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchFinding {
    pub query: String,
    pub insights: Vec<String>,
    /// 0 when nothing was found, otherwise 1..=10.
    pub relevance_score: u32,
    pub summary: String,
    pub key_points: Vec<String>,
    pub research_gaps: Vec<String>,
    pub top_papers: Vec<PaperRecord>,
}

impl ResearchFinding {
    /// Finding for a query whose search came back empty.
    pub fn no_papers(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            summary: "No papers found for this query".to_string(),
            ..Default::default()
        }
    }
}

/// Final output of a research run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub topic: String,
    pub iterations: u32,
    pub report: String,
    pub findings_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchInput {
    pub query: String,
    pub max_results: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeInput {
    pub papers: Vec<PaperRecord>,
    pub query: String,
    pub main_topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub topic: String,
    pub findings: Vec<ResearchFinding>,
    pub current_iteration: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapInput {
    pub topic: String,
    pub findings: Vec<ResearchFinding>,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub topic: String,
    pub findings: Vec<ResearchFinding>,
}
