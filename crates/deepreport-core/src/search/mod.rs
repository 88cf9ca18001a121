//! Search backends and the batch fetcher that queries them concurrently.

mod perplexity;
mod tavily;

pub use perplexity::{PerplexityBackend, PerplexityConfig};
pub use tavily::{TavilyBackend, TavilyConfig};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::{SearchConfig, SearchProvider};
use crate::error::{BackendError, ReportError};
use crate::metrics;
use crate::sources::{SearchBatch, SourceRecord};

/// One external search engine. Must tolerate concurrent calls for distinct queries.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        time_range: Option<&str>,
    ) -> Result<Vec<SourceRecord>, BackendError>;
}

pub type DynSearchBackend = Arc<dyn SearchBackend>;

/// Build the configured backend.
pub fn backend_from_config(config: &SearchConfig) -> Result<DynSearchBackend, ReportError> {
    let api_key = crate::require_env(&config.api_key_env)?;
    let backend: DynSearchBackend = match config.provider {
        SearchProvider::Tavily => {
            let mut tavily = TavilyConfig::new(api_key);
            tavily.topic = config.topic.clone();
            tavily.include_raw_content = config.include_raw_content;
            if let Some(url) = &config.base_url {
                tavily.base_url = url.clone();
            }
            Arc::new(TavilyBackend::new(tavily)?)
        }
        SearchProvider::Perplexity => {
            let mut perplexity = PerplexityConfig::new(api_key);
            if let Some(url) = &config.base_url {
                perplexity.base_url = url.clone();
            }
            Arc::new(PerplexityBackend::new(perplexity)?)
        }
    };
    Ok(backend)
}

/// A query whose backend call failed; siblings in the batch are unaffected.
#[derive(Debug, Clone)]
pub struct SearchWarning {
    pub query: String,
    pub message: String,
}

/// Outcome of one fetch batch: one entry per non-empty query, in input order.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub batches: Vec<SearchBatch>,
    pub warnings: Vec<SearchWarning>,
}

impl FetchReport {
    pub fn total_results(&self) -> usize {
        self.batches.iter().map(|batch| batch.results.len()).sum()
    }
}

/// Issues a batch of queries concurrently against a single backend.
#[derive(Clone)]
pub struct SourceFetcher {
    backend: DynSearchBackend,
}

impl SourceFetcher {
    pub fn new(backend: DynSearchBackend) -> Self {
        Self { backend }
    }

    /// `max_results` bounds each query, not the batch. No retries happen here.
    pub async fn fetch(
        &self,
        queries: &[String],
        max_results: usize,
        time_range: Option<&str>,
    ) -> FetchReport {
        let mut report = FetchReport::default();

        let queries: Vec<&str> = queries
            .iter()
            .map(|query| query.trim())
            .filter(|query| {
                if query.is_empty() {
                    debug!("skipping empty search query");
                }
                !query.is_empty()
            })
            .collect();

        let calls = queries.iter().map(|query| {
            let backend = self.backend.clone();
            async move {
                let outcome = backend.search(query, max_results, time_range).await;
                (query.to_string(), outcome)
            }
        });

        for (query, outcome) in join_all(calls).await {
            match outcome {
                Ok(mut results) => {
                    results.truncate(max_results);
                    report.batches.push(SearchBatch { query, results });
                }
                Err(err) => {
                    warn!(
                        backend = self.backend.name(),
                        %query,
                        error = %err,
                        "search query failed; continuing with remaining queries"
                    );
                    metrics::record_search_failure(self.backend.name());
                    report.warnings.push(SearchWarning {
                        query: query.clone(),
                        message: err.to_string(),
                    });
                    report.batches.push(SearchBatch {
                        query,
                        results: Vec::new(),
                    });
                }
            }
        }

        debug!(
            backend = self.backend.name(),
            queries = report.batches.len(),
            results = report.total_results(),
            failures = report.warnings.len(),
            "search batch completed"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn search(
            &self,
            query: &str,
            max_results: usize,
            _time_range: Option<&str>,
        ) -> Result<Vec<SourceRecord>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.contains("boom") {
                return Err(BackendError::Unavailable("simulated outage".into()));
            }
            Ok((0..max_results + 2)
                .map(|idx| SourceRecord {
                    title: format!("{query} {idx}"),
                    url: format!("https://example.com/{query}/{idx}"),
                    content: "snippet".into(),
                    raw_content: None,
                    score: 0.5,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn failing_query_does_not_abort_siblings() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
        });
        let fetcher = SourceFetcher::new(backend.clone());

        let queries = vec!["housing".to_string(), "boom".to_string(), "rates".to_string()];
        let report = fetcher.fetch(&queries, 3, None).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.batches.len(), 3);
        assert_eq!(report.batches[0].results.len(), 3);
        assert!(report.batches[1].results.is_empty());
        assert_eq!(report.batches[2].results.len(), 3);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].query, "boom");
    }

    #[tokio::test]
    async fn blank_queries_are_skipped() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
        });
        let fetcher = SourceFetcher::new(backend.clone());

        let report = fetcher
            .fetch(&["  ".to_string(), "rates".to_string()], 1, Some("week"))
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].query, "rates");
    }

    #[test]
    fn backend_requires_the_configured_secret() {
        unsafe {
            std::env::remove_var("DEEPREPORT_TEST_SEARCH_KEY_UNSET");
        }
        let config = SearchConfig {
            api_key_env: "DEEPREPORT_TEST_SEARCH_KEY_UNSET".into(),
            ..SearchConfig::default()
        };

        match backend_from_config(&config) {
            Err(ReportError::MissingSecret(var)) => {
                assert_eq!(var, "DEEPREPORT_TEST_SEARCH_KEY_UNSET")
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("backend built without a secret"),
        }
    }
}
