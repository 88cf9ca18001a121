use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::prompts::DEFAULT_REPORT_STRUCTURE;
use crate::sources::DedupStrategy;
use crate::{ReportError, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "DEEPREPORT_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub boost: BoostConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPREPORT_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, ReportError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| ReportError::config_io(candidate.clone(), err))?;
        let config = Self::from_toml_str(&raw)?;

        // Secrets must exist at load time so inline keys are never needed.
        require_env(&config.llm.api_key_env)?;
        require_env(&config.search.api_key_env)?;
        Ok(config)
    }

    /// Parse and validate configuration text without touching the environment.
    pub fn from_toml_str(raw: &str) -> Result<Config, ReportError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| ReportError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), ReportError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(ReportError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.search.api_key_env.trim().is_empty() {
            return Err(ReportError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.research.max_search_depth == 0 {
            return Err(ReportError::InvalidConfiguration(
                "research.max_search_depth must be at least 1".into(),
            ));
        }
        if config.research.number_of_queries == 0 {
            return Err(ReportError::InvalidConfiguration(
                "research.number_of_queries must be at least 1".into(),
            ));
        }
        if config.retrieval.max_iterations == 0 {
            return Err(ReportError::InvalidConfiguration(
                "retrieval.max_iterations must be at least 1".into(),
            ));
        }
        if config.boost.factor < 1.0 {
            return Err(ReportError::InvalidConfiguration(
                "boost.factor must be >= 1.0".into(),
            ));
        }
        if config.retrieval.chunk_overlap >= config.retrieval.chunk_size {
            return Err(ReportError::InvalidConfiguration(
                "retrieval.chunk_overlap must be smaller than retrieval.chunk_size".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl LlmConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        120
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchProvider {
    #[default]
    Tavily,
    Perplexity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub provider: SearchProvider,
    #[serde(default = "SearchConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "SearchConfig::default_max_results")]
    pub max_results: usize,
    #[serde(default = "SearchConfig::default_topic")]
    pub topic: String,
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default = "SearchConfig::default_include_raw_content")]
    pub include_raw_content: bool,
}

impl SearchConfig {
    fn default_api_key_env() -> String {
        "TAVILY_API_KEY".to_string()
    }

    const fn default_max_results() -> usize {
        5
    }

    fn default_topic() -> String {
        "general".to_string()
    }

    const fn default_include_raw_content() -> bool {
        true
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProvider::default(),
            api_key_env: Self::default_api_key_env(),
            base_url: None,
            max_results: Self::default_max_results(),
            topic: Self::default_topic(),
            time_range: None,
            include_raw_content: Self::default_include_raw_content(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "ResearchConfig::default_number_of_queries")]
    pub number_of_queries: usize,
    #[serde(default = "ResearchConfig::default_max_search_depth")]
    pub max_search_depth: u32,
    #[serde(default = "ResearchConfig::default_report_structure")]
    pub report_structure: String,
    #[serde(default = "ResearchConfig::default_max_chars_per_source")]
    pub max_chars_per_source: usize,
    #[serde(default)]
    pub dedup_strategy: DedupStrategy,
    #[serde(default)]
    pub max_sources: Option<usize>,
    /// Deadline for the whole research fan-out; unfinished sections are abandoned.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "ResearchConfig::default_max_concurrent_sections")]
    pub max_concurrent_sections: usize,
}

impl ResearchConfig {
    const fn default_number_of_queries() -> usize {
        2
    }

    const fn default_max_search_depth() -> u32 {
        2
    }

    fn default_report_structure() -> String {
        DEFAULT_REPORT_STRUCTURE.to_string()
    }

    const fn default_max_chars_per_source() -> usize {
        16_000
    }

    const fn default_max_concurrent_sections() -> usize {
        8
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            number_of_queries: Self::default_number_of_queries(),
            max_search_depth: Self::default_max_search_depth(),
            report_structure: Self::default_report_structure(),
            max_chars_per_source: Self::default_max_chars_per_source(),
            dedup_strategy: DedupStrategy::default(),
            max_sources: None,
            timeout_secs: None,
            max_concurrent_sections: Self::default_max_concurrent_sections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoostConfig {
    #[serde(default = "BoostConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "BoostConfig::default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub preferred_domains: Vec<String>,
}

impl BoostConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_factor() -> f64 {
        1.5
    }
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            factor: Self::default_factor(),
            preferred_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "RetrievalConfig::default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "RetrievalConfig::default_top_k")]
    pub top_k: usize,
    #[serde(default = "RetrievalConfig::default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "RetrievalConfig::default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl RetrievalConfig {
    const fn default_max_iterations() -> u32 {
        3
    }

    const fn default_top_k() -> usize {
        5
    }

    const fn default_chunk_size() -> usize {
        1_000
    }

    const fn default_chunk_overlap() -> usize {
        100
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
            top_k: Self::default_top_k(),
            chunk_size: Self::default_chunk_size(),
            chunk_overlap: Self::default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            [llm]
            model = "gpt-4o-mini"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.search.provider, SearchProvider::Tavily);
        assert_eq!(config.research.number_of_queries, 2);
        assert_eq!(config.research.max_search_depth, 2);
        assert_eq!(config.research.dedup_strategy, DedupStrategy::KeepFirst);
        assert_eq!(config.retrieval.max_iterations, 3);
        assert!((config.boost.factor - 1.5).abs() < f64::EPSILON);
        assert!(config.research.report_structure.contains("Introduction"));
    }

    #[test]
    fn full_config_overrides_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            [llm]
            model = "gpt-4.1"
            base_url = "http://localhost:11434/v1"

            [search]
            provider = "perplexity"
            api_key_env = "PERPLEXITY_API_KEY"
            time_range = "month"

            [research]
            max_search_depth = 4
            dedup_strategy = "keep_last"
            timeout_secs = 90

            [boost]
            preferred_domains = ["cbi.ir", "amar.org.ir"]
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.search.provider, SearchProvider::Perplexity);
        assert_eq!(config.search.time_range.as_deref(), Some("month"));
        assert_eq!(config.research.max_search_depth, 4);
        assert_eq!(config.research.dedup_strategy, DedupStrategy::KeepLast);
        assert_eq!(config.research.timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.boost.preferred_domains.len(), 2);
    }

    #[test]
    fn zero_iteration_bounds_are_rejected() {
        let err = ConfigLoader::from_toml_str(
            r#"
            [llm]
            model = "gpt-4o-mini"

            [retrieval]
            max_iterations = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::InvalidConfiguration(_)));
    }

    #[test]
    fn load_reports_missing_secret() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[llm]\nmodel = \"gpt-4o-mini\"\napi_key_env = \"DEEPREPORT_TEST_ABSENT_KEY\""
        )
        .unwrap();
        unsafe {
            std::env::remove_var("DEEPREPORT_TEST_ABSENT_KEY");
        }

        let err = ConfigLoader::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ReportError::MissingSecret(var) if var == "DEEPREPORT_TEST_ABSENT_KEY"));
    }
}
