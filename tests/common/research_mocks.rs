//! In-process stand-ins for the arXiv and language-model collaborators.

use async_trait::async_trait;
use durable_research::ActivityError;
use durable_research::research::{LanguageModel, LlmRequest, PaperRecord, PaperSearch};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Returns `papers_per_query` papers for every query, except queries listed
/// in `empty_queries`.
pub struct MockSearch {
    pub papers_per_query: usize,
    pub empty_queries: Vec<String>,
    pub queries: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new(papers_per_query: usize) -> Self {
        Self {
            papers_per_query,
            empty_queries: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaperSearch for MockSearch {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PaperRecord>, ActivityError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.empty_queries.iter().any(|q| q == query) {
            return Ok(Vec::new());
        }
        let n = self.papers_per_query.min(max_results as usize);
        Ok((0..n)
            .map(|i| PaperRecord {
                id: format!("2401.{i:05}"),
                title: format!("{query} paper {i}"),
                summary: "An abstract.".to_string(),
                authors: vec!["A. Author".to_string()],
                abs_url: format!("http://arxiv.org/abs/2401.{i:05}"),
                ..Default::default()
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Analysis,
    Decision,
    Gaps,
    Synthesis,
}

pub fn classify(request: &LlmRequest) -> PromptKind {
    let system = request.system.as_str();
    if system.contains("evaluation agent") {
        PromptKind::Analysis
    } else if system.contains("decision agent") {
        PromptKind::Decision
    } else if system.contains("follow-up queries") {
        PromptKind::Gaps
    } else {
        PromptKind::Synthesis
    }
}

/// Answers every prompt kind with canned JSON.
///
/// Decisions are popped from `decisions`; once it runs dry the model says stop.
/// Gap queries are numbered `follow-up 1`, `follow-up 2`, ...
pub struct ScriptedModel {
    decisions: Mutex<VecDeque<bool>>,
    gap_replies: Mutex<u32>,
    pub no_gaps: bool,
    pub calls: Mutex<Vec<PromptKind>>,
}

impl ScriptedModel {
    pub fn new(decisions: impl IntoIterator<Item = bool>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            gap_replies: Mutex::new(0),
            no_gaps: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, kind: PromptKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn infer(&self, request: LlmRequest) -> Result<String, ActivityError> {
        let kind = classify(&request);
        self.calls.lock().unwrap().push(kind);
        let reply = match kind {
            PromptKind::Analysis => serde_json::json!({
                "insights": ["insight"],
                "relevance_score": 8,
                "summary": "solid work",
                "key_points": ["point"],
                "research_gaps": ["gap"]
            })
            .to_string(),
            PromptKind::Decision => {
                let next = self.decisions.lock().unwrap().pop_front().unwrap_or(false);
                serde_json::json!({ "should_continue": next, "reasoning": "scripted" }).to_string()
            }
            PromptKind::Gaps => {
                if self.no_gaps {
                    "[]".to_string()
                } else {
                    let mut n = self.gap_replies.lock().unwrap();
                    *n += 1;
                    serde_json::json!([format!("follow-up {}", *n)]).to_string()
                }
            }
            PromptKind::Synthesis => serde_json::json!({ "report": "# Report\n\nscripted synthesis" }).to_string(),
        };
        Ok(reply)
    }
}
