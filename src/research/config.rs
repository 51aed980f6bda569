use super::ResearchError;
use std::time::Duration;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ARXIV_BASE_URL: &str = "https://export.arxiv.org/api/query";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:research.db?mode=rwc";
pub const DEFAULT_ARXIV_MIN_INTERVAL: Duration = Duration::from_millis(3000);

/// Settings for the research collaborators, read from the environment.
#[derive(Clone)]
pub struct ResearchConfig {
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub arxiv_base_url: String,
    pub arxiv_min_interval: Duration,
    pub database_url: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            arxiv_base_url: DEFAULT_ARXIV_BASE_URL.to_string(),
            arxiv_min_interval: DEFAULT_ARXIV_MIN_INTERVAL,
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

// Keep the key out of logs
impl std::fmt::Debug for ResearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchConfig")
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_model", &self.llm_model)
            .field("arxiv_base_url", &self.arxiv_base_url)
            .field("arxiv_min_interval", &self.arxiv_min_interval)
            .field("database_url", &self.database_url)
            .finish()
    }
}

impl ResearchConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ResearchError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ResearchError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let arxiv_min_interval = match get("ARXIV_MIN_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|e| {
                ResearchError::Config(format!("ARXIV_MIN_INTERVAL_MS must be an integer, got '{raw}': {e}"))
            })?),
            None => defaults.arxiv_min_interval,
        };

        Ok(Self {
            llm_api_key: get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            llm_base_url: get("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_model: get("LLM_MODEL").unwrap_or(defaults.llm_model),
            arxiv_base_url: get("ARXIV_BASE_URL").unwrap_or(defaults.arxiv_base_url),
            arxiv_min_interval,
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ResearchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.llm_base_url, DEFAULT_LLM_BASE_URL);
        assert_eq!(cfg.llm_model, DEFAULT_LLM_MODEL);
        assert_eq!(cfg.arxiv_min_interval, Duration::from_secs(3));
        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert!(cfg.llm_api_key.is_none());
    }

    #[test]
    fn llm_key_falls_back_to_openai_variable() {
        let cfg = ResearchConfig::from_lookup(lookup(&[("LLM_API_KEY", ""), ("OPENAI_API_KEY", "sk-1")])).unwrap();
        assert_eq!(cfg.llm_api_key.as_deref(), Some("sk-1"));
        assert!(!format!("{cfg:?}").contains("sk-1"));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let err = ResearchConfig::from_lookup(lookup(&[("ARXIV_MIN_INTERVAL_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("ARXIV_MIN_INTERVAL_MS"));

        let cfg = ResearchConfig::from_lookup(lookup(&[("ARXIV_MIN_INTERVAL_MS", "250")])).unwrap();
        assert_eq!(cfg.arxiv_min_interval, Duration::from_millis(250));
    }
}
