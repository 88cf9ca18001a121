//! Source records plus the merge, boost, rank and digest transforms applied to
//! search results before they reach a model prompt.

use std::collections::HashMap;
use std::fmt::Write as _;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{BoostConfig, ResearchConfig};

/// Scores never exceed this value after boosting.
pub const MAX_SCORE: f64 = 1.0;

const SEPARATOR: &str =
    "================================================================================";
const SUBSEPARATOR: &str =
    "--------------------------------------------------------------------------------";
const TRUNCATION_MARKER: &str = "... [truncated]";
const UNAVAILABLE_MARKER: &str = "[full content unavailable]";
const EMPTY_DIGEST: &str = "No valid search results found.";

/// A single search hit. Identity is the `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub title: String,
    pub url: String,
    /// Snippet the backend considers most relevant.
    pub content: String,
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub score: f64,
}

/// Results returned for one query of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchBatch {
    pub query: String,
    pub results: Vec<SourceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    KeepFirst,
    KeepLast,
}

/// Merge result lists, removing duplicate URLs.
///
/// Output order follows the first appearance of each URL; with `KeepLast`
/// the record stored at that position is the most recently seen one.
pub fn merge<I>(batches: I, strategy: DedupStrategy) -> Vec<SourceRecord>
where
    I: IntoIterator<Item = Vec<SourceRecord>>,
{
    let mut merged: Vec<SourceRecord> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in batches.into_iter().flatten() {
        match positions.get(&record.url) {
            Some(&idx) => {
                if strategy == DedupStrategy::KeepLast {
                    merged[idx] = record;
                }
            }
            None => {
                positions.insert(record.url.clone(), merged.len());
                merged.push(record);
            }
        }
    }

    merged
}

/// Score multiplier for a configured allowlist of preferred domains.
#[derive(Debug, Clone)]
pub struct DomainBoost {
    factor: f64,
    domains: Vec<String>,
}

impl DomainBoost {
    pub fn new<I, S>(factor: f64, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|domain| normalize_domain(domain.as_ref()))
            .collect();
        Self { factor, domains }
    }

    pub fn from_config(config: &BoostConfig) -> Option<Self> {
        if !config.enabled || config.preferred_domains.is_empty() {
            return None;
        }
        Some(Self::new(config.factor, &config.preferred_domains))
    }

    pub fn matches(&self, url: &str) -> bool {
        match Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(strip_www))
        {
            Some(host) => self
                .domains
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{domain}"))),
            None => {
                let lowered = url.to_lowercase();
                self.domains.iter().any(|domain| lowered.contains(domain))
            }
        }
    }

    /// Boost matching records in place; returns how many were boosted.
    pub fn apply(&self, records: &mut [SourceRecord]) -> usize {
        let mut boosted = 0;
        for record in records.iter_mut() {
            if self.matches(&record.url) {
                record.score = (record.score * self.factor).min(MAX_SCORE);
                boosted += 1;
            }
        }
        boosted
    }
}

fn strip_www(host: &str) -> String {
    let host = host.to_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        return Url::parse(trimmed)
            .ok()
            .and_then(|url| url.host_str().map(strip_www));
    }
    let host = trimmed.split('/').next().unwrap_or(trimmed);
    Some(strip_www(host))
}

/// Sort descending by score and keep at most `limit` records.
pub fn rank(mut records: Vec<SourceRecord>, limit: Option<usize>) -> Vec<SourceRecord> {
    records.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    records
}

/// Render records into the fixed-format digest handed to drafting prompts.
pub fn format_digest(records: &[SourceRecord], max_chars: usize, include_raw: bool) -> String {
    if records.is_empty() {
        return EMPTY_DIGEST.to_string();
    }

    let mut output = String::from("Content from sources:\n");
    for record in records {
        let _ = writeln!(output, "{SEPARATOR}");
        let _ = writeln!(output, "Source: {}", record.title);
        let _ = writeln!(output, "{SUBSEPARATOR}");
        let _ = writeln!(output, "URL: {}\n===", record.url);
        let _ = writeln!(
            output,
            "Most relevant content from source: {}\n===",
            record.content
        );
        if include_raw {
            let body = match record.raw_content.as_deref() {
                Some(raw) if !raw.trim().is_empty() => truncate_chars(raw, max_chars),
                _ => UNAVAILABLE_MARKER.to_string(),
            };
            let _ = writeln!(
                output,
                "Full source content limited to {max_chars} characters: {body}\n"
            );
        }
        let _ = writeln!(output, "{SEPARATOR}\n");
    }

    output.trim_end().to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Merge → boost → rank → format, configured once and reused for every search round.
#[derive(Debug, Clone)]
pub struct DigestBuilder {
    pub strategy: DedupStrategy,
    pub boost: Option<DomainBoost>,
    pub max_sources: Option<usize>,
    pub max_chars_per_source: usize,
    pub include_raw_content: bool,
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::KeepFirst,
            boost: None,
            max_sources: None,
            max_chars_per_source: 16_000,
            include_raw_content: true,
        }
    }
}

impl DigestBuilder {
    pub fn from_config(research: &ResearchConfig, boost: &BoostConfig, include_raw: bool) -> Self {
        Self {
            strategy: research.dedup_strategy,
            boost: DomainBoost::from_config(boost),
            max_sources: research.max_sources,
            max_chars_per_source: research.max_chars_per_source,
            include_raw_content: include_raw,
        }
    }

    /// Merged, boosted and ranked records for a set of batches.
    pub fn select(&self, batches: Vec<SearchBatch>) -> Vec<SourceRecord> {
        let mut merged = merge(batches.into_iter().map(|b| b.results), self.strategy);
        if let Some(boost) = &self.boost {
            let boosted = boost.apply(&mut merged);
            if boosted > 0 {
                tracing::debug!(boosted, "boosted preferred-domain sources");
            }
        }
        rank(merged, self.max_sources)
    }

    pub fn digest(&self, batches: Vec<SearchBatch>) -> String {
        let selected = self.select(batches);
        format_digest(
            &selected,
            self.max_chars_per_source,
            self.include_raw_content,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, content: &str, score: f64) -> SourceRecord {
        SourceRecord {
            title: format!("title for {url}"),
            url: url.to_string(),
            content: content.to_string(),
            raw_content: None,
            score,
        }
    }

    #[test]
    fn keep_first_retains_earliest_record() {
        let first = vec![record("https://a.test/x", "first", 0.5)];
        let second = vec![
            record("https://a.test/x", "second", 0.7),
            record("https://b.test/y", "other", 0.4),
        ];

        let merged = merge(vec![first, second], DedupStrategy::KeepFirst);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "first");
    }

    #[test]
    fn keep_last_retains_latest_record() {
        let first = vec![record("https://a.test/x", "first", 0.5)];
        let second = vec![record("https://a.test/x", "second", 0.7)];

        let merged = merge(vec![first, second], DedupStrategy::KeepLast);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "second");
    }

    #[test]
    fn boost_multiplies_and_clamps() {
        let boost = DomainBoost::new(1.5, ["cbi.ir"]);
        let mut records = vec![
            record("https://www.cbi.ir/report", "a", 0.6),
            record("https://cbi.ir/other", "b", 0.8),
            record("https://example.com/", "c", 0.8),
        ];

        let boosted = boost.apply(&mut records);
        assert_eq!(boosted, 2);
        assert!((records[0].score - 0.9).abs() < 1e-9);
        assert_eq!(records[1].score, 1.0);
        assert_eq!(records[2].score, 0.8);
        assert!(records.iter().all(|r| r.score <= MAX_SCORE));
    }

    #[test]
    fn boost_matches_subdomains_and_url_entries() {
        let boost = DomainBoost::new(1.5, ["https://amar.org.ir/", "www.cbi.ir"]);
        assert!(boost.matches("https://stats.amar.org.ir/page"));
        assert!(boost.matches("https://cbi.ir/fa/Pages/default.aspx"));
        assert!(!boost.matches("https://notcbi.ir/"));
        assert!(!boost.matches("https://example.com/?ref=cbi"));
    }

    #[test]
    fn rank_sorts_descending_and_truncates() {
        let ranked = rank(
            vec![
                record("https://a.test", "a", 0.2),
                record("https://b.test", "b", 0.9),
                record("https://c.test", "c", 0.5),
            ],
            Some(2),
        );
        let urls: Vec<_> = ranked.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.test", "https://c.test"]);
    }

    #[test]
    fn digest_marks_truncation_and_absence() {
        let mut long = record("https://long.test", "snippet", 0.9);
        long.raw_content = Some("x".repeat(50));
        let missing = record("https://missing.test", "snippet", 0.8);

        let digest = format_digest(&[long, missing], 10, true);
        assert!(digest.starts_with("Content from sources:"));
        assert!(digest.contains(&format!("{}{}", "x".repeat(10), TRUNCATION_MARKER)));
        assert!(!digest.contains(&"x".repeat(11)));
        assert!(digest.contains(UNAVAILABLE_MARKER));
    }

    #[test]
    fn digest_handles_multibyte_content() {
        let mut persian = record("https://fa.test", "snippet", 0.9);
        persian.raw_content = Some("قیمت مسکن در تهران".to_string());
        let digest = format_digest(&[persian], 4, true);
        assert!(digest.contains("قیمت... [truncated]"));
    }

    #[test]
    fn digest_lists_each_url_once() {
        let builder = DigestBuilder::default();
        let batches = vec![
            SearchBatch {
                query: "q1".into(),
                results: vec![record("https://dup.test", "one", 0.4)],
            },
            SearchBatch {
                query: "q2".into(),
                results: vec![
                    record("https://dup.test", "two", 0.6),
                    record("https://solo.test", "three", 0.5),
                ],
            },
        ];

        let digest = builder.digest(batches);
        assert_eq!(digest.matches("URL: https://dup.test").count(), 1);
        assert_eq!(digest.matches("URL: https://solo.test").count(), 1);
    }

    #[test]
    fn empty_digest_is_explicit() {
        assert_eq!(format_digest(&[], 100, true), EMPTY_DIGEST);
    }
}
