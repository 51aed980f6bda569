//! Research activities.
//!
//! Each activity is a plain async function over its collaborator so tests can
//! call it directly; [`ResearchActivities`] binds them to the registry keys.

use super::arxiv::{ArxivClient, PaperSearch};
use super::config::ResearchConfig;
use super::llm::{LanguageModel, OpenAiCompatibleClient};
use super::models::{AnalyzeInput, DecisionInput, GapInput, PaperRecord, ResearchFinding, SearchInput, SynthesisInput};
use super::{ANALYZE_PAPERS, DECIDE_CONTINUATION, IDENTIFY_RESEARCH_GAPS, ResearchError, SEARCH_PAPERS, SYNTHESIZE_REPORT, prompts};
use crate::{ActivityContext, ActivityError, ActivityRegistry, ActivityRegistryBuilder};
use std::sync::Arc;

pub const MAX_SEARCH_RESULTS: u32 = 30;
pub const MAX_PAPERS_TO_ANALYZE: usize = 15;

/// Collaborators shared by every research activity.
#[derive(Clone)]
pub struct ResearchActivities {
    search: Arc<dyn PaperSearch>,
    llm: Arc<dyn LanguageModel>,
}

impl ResearchActivities {
    pub fn new(search: Arc<dyn PaperSearch>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { search, llm }
    }

    /// arXiv and chat-completions clients built from configuration.
    ///
    /// All search activities in the process share one rate limiter.
    pub fn from_config(config: &ResearchConfig) -> Result<Self, ResearchError> {
        Ok(Self::new(
            Arc::new(ArxivClient::from_config(config)?),
            Arc::new(OpenAiCompatibleClient::from_config(config)?),
        ))
    }

    pub fn register(self, builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
        let search = self.search;
        let analyze_llm = Arc::clone(&self.llm);
        let decide_llm = Arc::clone(&self.llm);
        let gaps_llm = Arc::clone(&self.llm);
        let synth_llm = self.llm;

        builder
            .register_key(SEARCH_PAPERS, move |ctx: ActivityContext, input: SearchInput| {
                let search = Arc::clone(&search);
                async move { search_papers(&ctx, search.as_ref(), input).await }
            })
            .register_key(ANALYZE_PAPERS, move |ctx: ActivityContext, input: AnalyzeInput| {
                let llm = Arc::clone(&analyze_llm);
                async move { analyze_papers(&ctx, llm.as_ref(), input).await }
            })
            .register_key(DECIDE_CONTINUATION, move |ctx: ActivityContext, input: DecisionInput| {
                let llm = Arc::clone(&decide_llm);
                async move { decide_continuation(&ctx, llm.as_ref(), input).await }
            })
            .register_key(IDENTIFY_RESEARCH_GAPS, move |ctx: ActivityContext, input: GapInput| {
                let llm = Arc::clone(&gaps_llm);
                async move { identify_research_gaps(&ctx, llm.as_ref(), input).await }
            })
            .register_key(SYNTHESIZE_REPORT, move |ctx: ActivityContext, input: SynthesisInput| {
                let llm = Arc::clone(&synth_llm);
                async move { synthesize_report(&ctx, llm.as_ref(), input).await }
            })
    }

    pub fn registry(self) -> ActivityRegistry {
        self.register(ActivityRegistry::builder()).build()
    }
}

pub async fn search_papers(
    ctx: &ActivityContext,
    search: &dyn PaperSearch,
    input: SearchInput,
) -> Result<Vec<PaperRecord>, ActivityError> {
    ctx.trace_info(format!("searching arXiv for '{}'", input.query));
    let papers = search.search(&input.query, input.max_results).await?;
    ctx.trace_info(format!("found {} papers", papers.len()));
    Ok(papers)
}

pub async fn analyze_papers(
    ctx: &ActivityContext,
    llm: &dyn LanguageModel,
    input: AnalyzeInput,
) -> Result<ResearchFinding, ActivityError> {
    if input.papers.is_empty() {
        return Ok(ResearchFinding::no_papers(input.query));
    }
    let papers: Vec<PaperRecord> = input.papers.iter().take(MAX_PAPERS_TO_ANALYZE).cloned().collect();
    ctx.trace_info(format!("analyzing {} papers for '{}'", papers.len(), input.query));

    let raw = llm.infer(prompts::analysis_request(&input, &papers)).await?;
    let finding = prompts::parse_analysis(&raw, &input.query, papers);
    if finding.summary == "Failed to parse LLM response" {
        ctx.trace_warn("analysis reply was not valid JSON; using defaults");
    }
    Ok(finding)
}

/// Whether another iteration is worthwhile. Never asks the model once the
/// iteration budget is spent.
pub async fn decide_continuation(
    ctx: &ActivityContext,
    llm: &dyn LanguageModel,
    input: DecisionInput,
) -> Result<bool, ActivityError> {
    if input.current_iteration >= input.max_iterations {
        return Ok(false);
    }
    let raw = llm.infer(prompts::decision_request(&input)).await?;
    let should_continue = prompts::parse_decision(&raw);
    ctx.trace_info(format!(
        "iteration {}/{}: continue = {should_continue}",
        input.current_iteration, input.max_iterations
    ));
    Ok(should_continue)
}

pub async fn identify_research_gaps(
    ctx: &ActivityContext,
    llm: &dyn LanguageModel,
    input: GapInput,
) -> Result<Option<String>, ActivityError> {
    let raw = llm.infer(prompts::gap_request(&input)).await?;
    let next = prompts::parse_gap_query(&raw);
    match &next {
        Some(query) => ctx.trace_info(format!("next query: '{query}'")),
        None => ctx.trace_info("no follow-up query identified"),
    }
    Ok(next)
}

pub async fn synthesize_report(
    ctx: &ActivityContext,
    llm: &dyn LanguageModel,
    input: SynthesisInput,
) -> Result<String, ActivityError> {
    ctx.trace_info(format!(
        "synthesizing {} findings for '{}'",
        input.findings.len(),
        input.topic
    ));
    let raw = llm.infer(prompts::synthesis_request(&input)).await?;
    Ok(prompts::parse_report(&raw))
}
