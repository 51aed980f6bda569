//! Research orchestrations.
//!
//! `iterative_research` does one round per execution and carries its
//! [`ResearchState`] across continue-as-new, so replayed history never grows
//! past a single iteration.

use super::models::{
    AnalyzeInput, DecisionInput, GapInput, PaperQuery, ResearchFinding, ResearchReport, ResearchState, SearchInput,
    SynthesisInput,
};
use super::activities::MAX_SEARCH_RESULTS;
use super::{
    ANALYZE_PAPERS, DECIDE_CONTINUATION, IDENTIFY_RESEARCH_GAPS, ITERATIVE_RESEARCH, PAPER_RESEARCH, SEARCH_PAPERS,
    SYNTHESIZE_REPORT,
};
use crate::{
    BackoffStrategy, OrchestrationContext, OrchestrationRegistry, OrchestrationRegistryBuilder, RetryPolicy,
    durable_info,
};
use std::time::Duration;

/// Search calls: 3 attempts, 5s doubling to at most 30s.
pub fn arxiv_retry_policy() -> RetryPolicy {
    RetryPolicy::new(3).with_backoff(BackoffStrategy::Exponential {
        base: Duration::from_secs(5),
        multiplier: 2.0,
        max: Duration::from_secs(30),
    })
}

/// Model calls: 3 attempts, 2s doubling to at most 30s.
pub fn llm_retry_policy() -> RetryPolicy {
    RetryPolicy::new(3).with_backoff(BackoffStrategy::Exponential {
        base: Duration::from_secs(2),
        multiplier: 2.0,
        max: Duration::from_secs(30),
    })
}

pub fn register(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register_key(ITERATIVE_RESEARCH, iterative_research)
        .register_key(PAPER_RESEARCH, paper_research)
}

pub fn orchestration_registry() -> OrchestrationRegistry {
    register(OrchestrationRegistry::builder()).build()
}

pub async fn iterative_research(ctx: OrchestrationContext, mut state: ResearchState) -> Result<ResearchReport, String> {
    if state.current_iteration == 0 {
        durable_info!(ctx, topic = %state.topic, max_iterations = state.max_iterations, "Starting research");
    }

    if state.current_iteration >= state.max_iterations {
        durable_info!(ctx, "Iteration budget spent; synthesizing report");
        return synthesize(&ctx, state).await;
    }

    state.current_iteration += 1;
    durable_info!(
        ctx,
        iteration = state.current_iteration,
        query = %state.current_query,
        "Starting iteration"
    );

    let finding = ctx
        .call_sub_orchestration(
            PAPER_RESEARCH,
            &PaperQuery {
                main_topic: state.topic.clone(),
                query: state.current_query.clone(),
            },
        )
        .await?;
    state.all_findings.push(finding);

    let should_continue = ctx
        .call_activity_with_retry(
            DECIDE_CONTINUATION,
            &DecisionInput {
                topic: state.topic.clone(),
                findings: state.all_findings.clone(),
                current_iteration: state.current_iteration,
                max_iterations: state.max_iterations,
            },
            llm_retry_policy(),
        )
        .await?;
    if !should_continue {
        durable_info!(ctx, "Concluding research early");
        return synthesize(&ctx, state).await;
    }

    let next_query = ctx
        .call_activity_with_retry(
            IDENTIFY_RESEARCH_GAPS,
            &GapInput {
                topic: state.topic.clone(),
                findings: state.all_findings.clone(),
                iteration: state.current_iteration,
            },
            llm_retry_policy(),
        )
        .await?;
    let Some(next_query) = next_query.filter(|q| !q.trim().is_empty()) else {
        durable_info!(ctx, "No further research gaps; synthesizing report");
        return synthesize(&ctx, state).await;
    };

    durable_info!(ctx, next_query = %next_query, "Continuing with next query");
    state.current_query = next_query;
    ctx.continue_as_new_typed(&state).await?;
    Err("continue-as-new does not resume the current execution".to_string())
}

async fn synthesize(ctx: &OrchestrationContext, state: ResearchState) -> Result<ResearchReport, String> {
    let findings_count = state.all_findings.len();
    let report = ctx
        .call_activity_with_retry(
            SYNTHESIZE_REPORT,
            &SynthesisInput {
                topic: state.topic.clone(),
                findings: state.all_findings,
            },
            llm_retry_policy(),
        )
        .await?;
    Ok(ResearchReport {
        topic: state.topic,
        iterations: state.current_iteration,
        report,
        findings_count,
    })
}

/// Search one query and analyze what comes back.
pub async fn paper_research(ctx: OrchestrationContext, input: PaperQuery) -> Result<ResearchFinding, String> {
    let papers = ctx
        .call_activity_with_retry(
            SEARCH_PAPERS,
            &SearchInput {
                query: input.query.clone(),
                max_results: MAX_SEARCH_RESULTS,
            },
            arxiv_retry_policy(),
        )
        .await?;

    if papers.is_empty() {
        durable_info!(ctx, query = %input.query, "No papers found");
        return Ok(ResearchFinding::no_papers(input.query));
    }

    durable_info!(ctx, query = %input.query, papers = papers.len(), "Analyzing papers");
    ctx.call_activity_with_retry(
        ANALYZE_PAPERS,
        &AnalyzeInput {
            papers,
            query: input.query,
            main_topic: input.main_topic,
        },
        llm_retry_policy(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policies() {
        let arxiv = arxiv_retry_policy();
        assert_eq!(arxiv.max_attempts, 3);
        assert_eq!(arxiv.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(arxiv.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(llm_retry_policy().delay_for_attempt(5), Duration::from_secs(30));
    }

    #[test]
    fn both_orchestrations_are_registered() {
        let registry = orchestration_registry();
        assert!(registry.has(ITERATIVE_RESEARCH.name()));
        assert!(registry.has(PAPER_RESEARCH.name()));
    }
}
