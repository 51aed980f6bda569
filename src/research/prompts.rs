//! Prompt construction and reply parsing for the research activities.
//!
//! Prompt wording is free to change. The parsers are the stable part: each
//! has a fallback so a malformed reply never fails an activity.

use super::llm::LlmRequest;
use super::models::{AnalyzeInput, DecisionInput, GapInput, PaperRecord, PaperSummary, ResearchFinding, SynthesisInput};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write;

pub const SYNTHESIS_MAX_TOKENS: u32 = 3000;
const FALLBACK_RELEVANCE: u32 = 5;

const ANALYSIS_SYSTEM: &str = "You are a research evaluation agent. Analyze arXiv papers and provide structured \
insights in JSON format. Focus on technical depth and research value.";
const DECISION_SYSTEM: &str = "You are a research decision agent. Evaluate research completeness and decide \
whether to continue. Return JSON.";
const GAPS_SYSTEM: &str = "You are a research agent. Generate focused follow-up queries for arXiv search. Return JSON.";
const SYNTHESIS_SYSTEM: &str = "You are a research analyst specializing in academic literature review. Provide \
comprehensive synthesis in JSON format.";

pub fn analysis_request(input: &AnalyzeInput, papers: &[PaperRecord]) -> LlmRequest {
    let mut digest = String::new();
    for (i, paper) in papers.iter().enumerate() {
        let p = PaperSummary::from(paper);
        let _ = write!(
            digest,
            "Paper {}:\n  Title: {}\n  arXiv ID: {}\n  Authors: {}\n  Published: {}\n  Categories: {}\n  Abstract: {}...\n  URL: {}\n\n",
            i + 1,
            p.title,
            p.id,
            p.authors,
            p.published,
            p.categories,
            p.abstract_excerpt,
            p.abs_url
        );
    }

    let prompt = format!(
        "You are evaluating arXiv papers for: {topic}\n\nQuery used: {query}\n\nPapers found:\n{digest}\
Provide a detailed analysis of these papers covering contributions, methods, results, emerging themes, \
open problems and the most influential papers.\n\n\
Return JSON with:\n\
- \"insights\": array of specific technical insights\n\
- \"relevance_score\": number 1-10 for relevance to the topic\n\
- \"summary\": brief summary of the research landscape\n\
- \"key_points\": array of the most important findings\n\
- \"research_gaps\": array of gaps or future directions",
        topic = input.main_topic,
        query = input.query,
    );
    LlmRequest::new(ANALYSIS_SYSTEM, prompt)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisReply {
    insights: Vec<String>,
    relevance_score: Option<f64>,
    summary: String,
    key_points: Vec<String>,
    research_gaps: Vec<String>,
}

/// Build a finding from the model's analysis reply.
///
/// An unparseable reply yields relevance 5 and a "Failed to parse" summary.
pub fn parse_analysis(raw: &str, query: &str, top_papers: Vec<PaperRecord>) -> ResearchFinding {
    let reply = json_payload(raw).and_then(|v| serde_json::from_value::<AnalysisReply>(v).ok());
    match reply {
        Some(reply) => ResearchFinding {
            query: query.to_string(),
            insights: reply.insights,
            relevance_score: reply
                .relevance_score
                .map(|s| s.round().clamp(0.0, 10.0) as u32)
                .unwrap_or(FALLBACK_RELEVANCE),
            summary: reply.summary,
            key_points: reply.key_points,
            research_gaps: reply.research_gaps,
            top_papers,
        },
        None => ResearchFinding {
            query: query.to_string(),
            relevance_score: FALLBACK_RELEVANCE,
            summary: "Failed to parse LLM response".to_string(),
            top_papers,
            ..Default::default()
        },
    }
}

pub fn decision_request(input: &DecisionInput) -> LlmRequest {
    let mut findings = String::new();
    for f in &input.findings {
        let _ = write!(
            findings,
            "Query: {}\nSummary: {}\nRelevance: {}/10\nPapers found: {}\n\n",
            f.query,
            f.summary,
            f.relevance_score,
            f.top_papers.len()
        );
    }
    let avg = if input.findings.is_empty() {
        0.0
    } else {
        input.findings.iter().map(|f| f64::from(f.relevance_score)).sum::<f64>() / input.findings.len() as f64
    };

    let prompt = format!(
        "You are investigating: {topic}\n\nCurrent iteration: {cur}/{max}\n\nFindings so far:\n{findings}\
Average relevance score: {avg:.1}/10\n\n\
Continue if fewer than 75% of iterations are used, relevance is high with unexplored aspects, \
recent queries found valuable new papers, or research gaps remain. Stop early only if relevance \
stays below 5.0, the last iterations added nothing new, or the topic is covered.\n\n\
Return JSON with:\n- \"should_continue\": boolean",
        topic = input.topic,
        cur = input.current_iteration,
        max = input.max_iterations,
    );
    LlmRequest::new(DECISION_SYSTEM, prompt)
}

/// `should_continue` from the reply. Anything unreadable means stop.
pub fn parse_decision(raw: &str) -> bool {
    json_payload(raw)
        .and_then(|v| v.get("should_continue").and_then(Value::as_bool))
        .unwrap_or(false)
}

pub fn gap_request(input: &GapInput) -> LlmRequest {
    let mut findings = String::new();
    for f in &input.findings {
        let _ = write!(
            findings,
            "Query: {}\nSummary: {}\nKey insights: {}\nResearch gaps: {}\n\n",
            f.query,
            f.summary,
            f.insights.join("; "),
            f.research_gaps.join("; ")
        );
    }
    let previous: HashSet<&str> = input.findings.iter().map(|f| f.query.as_str()).collect();
    let mut previous: Vec<&str> = previous.into_iter().collect();
    previous.sort_unstable();

    let prompt = format!(
        "You are investigating: {topic}\n\nThis is iteration {iteration} of your research.\n\n\
Current findings:\n{findings}\
Previous queries: {previous}\n\n\
Generate 2-4 short keyword-based arXiv search queries (2-5 words each) exploring different aspects, \
methods or applications of {topic}. Use terms that appear in paper titles, consider the research gaps, \
and do not repeat previous queries.\n\n\
Return JSON: {{\"queries\": [\"query1\", \"query2\"]}}",
        topic = input.topic,
        iteration = input.iteration,
        previous = previous.join(", "),
    );
    LlmRequest::new(GAPS_SYSTEM, prompt)
}

/// First query from a JSON array or from the `queries` field.
pub fn parse_gap_query(raw: &str) -> Option<String> {
    let value = json_payload(raw)?;
    let queries = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("queries")?.as_array()?,
        _ => return None,
    };
    queries
        .first()
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
}

pub fn synthesis_request(input: &SynthesisInput) -> LlmRequest {
    let mut findings = String::new();
    let mut citations = String::new();
    let mut cited = HashSet::new();

    for (i, f) in input.findings.iter().enumerate() {
        let _ = write!(
            findings,
            "\n=== Finding {} ===\nQuery: {}\nSummary: {}\nKey Points: {}\nInsights: {}\nResearch Gaps: {}\n",
            i + 1,
            f.query,
            f.summary,
            f.key_points.join("; "),
            f.insights.join("; "),
            f.research_gaps.join("; ")
        );
        for paper in &f.top_papers {
            if paper.id.is_empty() || !cited.insert(paper.id.as_str()) {
                continue;
            }
            let author = match paper.authors.as_slice() {
                [] => "Unknown".to_string(),
                [only] => only.clone(),
                [first, ..] => format!("{first} et al."),
            };
            let published: String = paper.published.chars().take(10).collect();
            let _ = writeln!(
                citations,
                "[{}] {}: \"{}\" ({}) - {}",
                cited.len(),
                author,
                paper.title,
                published,
                paper.abs_url
            );
        }
    }

    let prompt = format!(
        "Synthesize the following arXiv research findings into a comprehensive report about: {topic}\n\n\
Research Findings:\n{findings}\nAvailable Paper Citations:\n{citations}\n\
Structure the report as: 1. Executive Summary 2. Research Landscape Overview 3. Key Findings and \
Methodologies 4. Emerging Trends 5. Research Gaps and Future Directions 6. Conclusions. \
Link papers inline as [paper title](URL).\n\n\
Return JSON: {{\"report\": \"...\"}}",
        topic = input.topic,
    );
    LlmRequest::new(SYNTHESIS_SYSTEM, prompt).with_max_tokens(SYNTHESIS_MAX_TOKENS)
}

/// The `report` field, or the raw reply when it is not a JSON report.
pub fn parse_report(raw: &str) -> String {
    json_payload(raw)
        .and_then(|v| v.get("report").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

/// Parse a reply as JSON, tolerating prose or code fences around it.
fn json_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let start = trimmed.find(['{', '['])?;
    let end = trimmed.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(id: &str) -> PaperRecord {
        PaperRecord {
            id: id.into(),
            title: format!("Paper {id}"),
            authors: vec!["A".into(), "B".into()],
            abs_url: format!("https://arxiv.org/abs/{id}"),
            ..Default::default()
        }
    }

    #[test]
    fn analysis_reply_is_mapped() {
        let raw = r#"{"insights":["i1"],"relevance_score":7.6,"summary":"s","key_points":["k"],"research_gaps":["g"]}"#;
        let finding = parse_analysis(raw, "q", vec![paper("1")]);
        assert_eq!(finding.relevance_score, 8);
        assert_eq!(finding.insights, vec!["i1"]);
        assert_eq!(finding.research_gaps, vec!["g"]);
        assert_eq!(finding.query, "q");
        assert_eq!(finding.top_papers.len(), 1);
    }

    #[test]
    fn unparseable_analysis_falls_back() {
        let finding = parse_analysis("not json at all", "q", vec![]);
        assert_eq!(finding.relevance_score, 5);
        assert_eq!(finding.summary, "Failed to parse LLM response");
        assert!(finding.insights.is_empty());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"should_continue\": true}\n```";
        assert!(parse_decision(raw));
    }

    #[test]
    fn decision_defaults_to_stop() {
        assert!(!parse_decision("maybe"));
        assert!(!parse_decision(r#"{"other": true}"#));
        assert!(!parse_decision(r#"{"should_continue": "yes"}"#));
    }

    #[test]
    fn gap_query_from_array_or_object() {
        assert_eq!(parse_gap_query(r#"["graph pruning", "x"]"#).as_deref(), Some("graph pruning"));
        assert_eq!(parse_gap_query(r#"{"queries": [" sparse attention "]}"#).as_deref(), Some("sparse attention"));
        assert_eq!(parse_gap_query(r#"{"queries": []}"#), None);
        assert_eq!(parse_gap_query(r#"[""]"#), None);
        assert_eq!(parse_gap_query("none"), None);
    }

    #[test]
    fn report_field_or_raw_text() {
        assert_eq!(parse_report(r##"{"report": "# Report"}"##), "# Report");
        assert_eq!(parse_report("plain prose report"), "plain prose report");
    }

    #[test]
    fn synthesis_cites_each_paper_once() {
        let finding = ResearchFinding {
            query: "q".into(),
            top_papers: vec![paper("1"), paper("2"), paper("1")],
            ..Default::default()
        };
        let request = synthesis_request(&SynthesisInput {
            topic: "t".into(),
            findings: vec![finding.clone(), finding],
        });
        assert_eq!(request.max_tokens, SYNTHESIS_MAX_TOKENS);
        assert!(request.prompt.contains("[1] A et al.: \"Paper 1\""));
        assert!(request.prompt.contains("[2] A et al.: \"Paper 2\""));
        assert!(!request.prompt.contains("[3]"));
    }
}
