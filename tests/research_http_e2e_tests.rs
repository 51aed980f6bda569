#![allow(clippy::unwrap_used)]

use durable_research::research::{self, ITERATIVE_RESEARCH, ResearchActivities, ResearchConfig, ResearchReport, ResearchState};
use durable_research::{Client, Runtime};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/abs/2310.11111v1</id>
    <published>2023-10-17T00:00:00Z</published>
    <title>Mixture of Experts at Scale</title>
    <summary>Sparse routing.</summary>
    <author><name>Emmy Noether</name></author>
  </entry>
</feed>"#;

fn chat(content: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content.to_string() } }]
    }))
}

#[tokio::test]
async fn research_runs_against_http_collaborators() {
    let arxiv = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/query"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
        .expect(1)
        .mount(&arxiv)
        .await;

    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("evaluation agent"))
        .respond_with(chat(serde_json::json!({
            "insights": ["experts specialize"],
            "relevance_score": 9,
            "summary": "Strong results on sparse routing",
            "key_points": ["routing"],
            "research_gaps": ["load balancing"]
        })))
        .expect(1)
        .mount(&llm)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("decision agent"))
        .respond_with(chat(serde_json::json!({ "should_continue": false, "reasoning": "enough" })))
        .expect(1)
        .mount(&llm)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("research analyst"))
        .respond_with(chat(serde_json::json!({ "report": "## Summary\nMixture of experts works." })))
        .expect(1)
        .mount(&llm)
        .await;

    let arxiv_url = format!("{}/api/query", arxiv.uri());
    let llm_url = llm.uri();
    let config = ResearchConfig::from_lookup(|key| match key {
        "ARXIV_BASE_URL" => Some(arxiv_url.clone()),
        "ARXIV_MIN_INTERVAL_MS" => Some("0".to_string()),
        "LLM_BASE_URL" => Some(llm_url.clone()),
        "LLM_API_KEY" => Some("test".to_string()),
        _ => None,
    })
    .unwrap();

    let store = common::create_sqlite_store_memory().await;
    let activities = ResearchActivities::from_config(&config).unwrap().registry();
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        research::orchestration_registry(),
        common::fast_options(),
    )
    .await;
    let client = Client::new(store);
    client
        .start_orchestration_typed("moe", ITERATIVE_RESEARCH.name(), &ResearchState::new("mixture of experts", 3))
        .await
        .unwrap();
    let report: ResearchReport = client
        .wait_for_orchestration_typed("moe", Duration::from_secs(10))
        .await
        .unwrap();
    rt.shutdown().await;

    assert_eq!(
        report,
        ResearchReport {
            topic: "mixture of experts".to_string(),
            iterations: 1,
            report: "## Summary\nMixture of experts works.".to_string(),
            findings_count: 1,
        }
    );
}
