//! Iterative arXiv research workflow.
//!
//! `research::iterative_research` runs one search/analyze/decide round per
//! execution and continues as new with the accumulated [`ResearchState`]
//! until the model says stop, no follow-up query is found, or the iteration
//! budget is spent. It then synthesizes a [`ResearchReport`].
//!
//! ```rust,no_run
//! use durable_research::research::{self, ResearchConfig, ResearchInput};
//! use durable_research::providers::sqlite::SqliteProvider;
//! use durable_research::{Client, Runtime};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResearchConfig::from_env()?;
//! let store = Arc::new(SqliteProvider::new(&config.database_url, None).await?);
//! let activities = research::ResearchActivities::from_config(&config)?.registry();
//! let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), research::orchestration_registry()).await;
//!
//! let client = Client::new(store);
//! let input = ResearchInput { topic: "graph neural networks".into(), max_iterations: 3 };
//! let id = client.schedule_new_orchestration(research::ITERATIVE_RESEARCH.name(), serde_json::to_string(&input)?).await?;
//! # let _ = (id, rt);
//! # Ok(())
//! # }
//! ```

pub mod activities;
pub mod arxiv;
pub mod config;
pub mod llm;
pub mod models;
pub mod orchestrations;
pub mod prompts;
pub mod rate_limit;

pub use activities::ResearchActivities;
pub use arxiv::{ArxivClient, PaperSearch, SortBy, SortOrder};
pub use config::ResearchConfig;
pub use llm::{LanguageModel, LlmRequest, OpenAiCompatibleClient};
pub use models::{
    AnalyzeInput, DecisionInput, GapInput, PaperQuery, PaperRecord, PaperSummary, ResearchFinding, ResearchInput,
    ResearchReport, ResearchState, SearchInput, SynthesisInput,
};
pub use orchestrations::orchestration_registry;
pub use rate_limit::RateLimiter;

use crate::{ActivityError, ActivityKey, OrchestrationKey};

pub const ITERATIVE_RESEARCH: OrchestrationKey<ResearchState, ResearchReport> =
    OrchestrationKey::new("research::iterative_research");
pub const PAPER_RESEARCH: OrchestrationKey<PaperQuery, ResearchFinding> =
    OrchestrationKey::new("research::paper_research");

pub const SEARCH_PAPERS: ActivityKey<SearchInput, Vec<PaperRecord>> = ActivityKey::new("research::search_papers");
pub const ANALYZE_PAPERS: ActivityKey<AnalyzeInput, ResearchFinding> = ActivityKey::new("research::analyze_papers");
pub const DECIDE_CONTINUATION: ActivityKey<DecisionInput, bool> = ActivityKey::new("research::decide_continuation");
pub const IDENTIFY_RESEARCH_GAPS: ActivityKey<GapInput, Option<String>> =
    ActivityKey::new("research::identify_research_gaps");
pub const SYNTHESIZE_REPORT: ActivityKey<SynthesisInput, String> = ActivityKey::new("research::synthesize_report");

/// Failures of the research collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String, retryable: bool },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Parse(String),
}

impl ResearchError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResearchError::Status { retryable, .. } => *retryable,
            ResearchError::Timeout(_) | ResearchError::Network(_) => true,
            ResearchError::InvalidInput(_) | ResearchError::Config(_) | ResearchError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ResearchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ResearchError::Timeout(e.to_string())
        } else if e.is_decode() {
            ResearchError::Parse(e.to_string())
        } else {
            ResearchError::Network(e.to_string())
        }
    }
}

impl From<ResearchError> for ActivityError {
    fn from(e: ResearchError) -> Self {
        if e.is_retryable() {
            ActivityError::transient(e.to_string())
        } else {
            ActivityError::terminal(e.to_string())
        }
    }
}
