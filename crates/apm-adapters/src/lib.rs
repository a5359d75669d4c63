//! Record source contract + the arXiv Atom API adapter.

use std::path::PathBuf;

use apm_core::{normalize_text, Record};
use apm_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "apm-adapters";

pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("arXiv API error: {0}")]
    Fetch(#[from] FetchError),
    #[error("arXiv API rejected the query: {0}")]
    Api(String),
    #[error("unparseable arXiv response: {0}")]
    Parse(String),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SourceError {
    /// Upstream HTTP status carried by a fetch failure.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            _ => None,
        }
    }
}

/// Anything that can list candidate records for one category.
///
/// Implementations set `is_new = true` on every record; novelty is decided by
/// the merge step, never by the source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, category: &str, max_results: u32) -> Result<Vec<Record>, SourceError>;
}

/// Queries `cat:{category}` sorted by last-updated date, newest first.
#[derive(Debug)]
pub struct ArxivAdapter {
    http: HttpFetcher,
    api_url: String,
}

impl ArxivAdapter {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn query_params(category: &str, max_results: u32) -> Vec<(&'static str, String)> {
        vec![
            ("search_query", format!("cat:{category}")),
            ("start", "0".to_string()),
            ("max_results", max_results.to_string()),
            ("sortBy", "lastUpdatedDate".to_string()),
            ("sortOrder", "descending".to_string()),
        ]
    }
}

#[async_trait]
impl RecordSource for ArxivAdapter {
    fn source_id(&self) -> &'static str {
        "arxiv"
    }

    async fn fetch(&self, category: &str, max_results: u32) -> Result<Vec<Record>, SourceError> {
        let params = Self::query_params(category, max_results);
        let response = self.http.fetch_bytes(&self.api_url, &params).await?;
        let records = parse_atom_feed(&response.body, Utc::now())?;
        debug!(category, count = records.len(), "parsed arXiv feed");
        Ok(records)
    }
}

/// Offline source that serves captured Atom responses from `{root}/{category}.xml`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, category: &str) -> PathBuf {
        self.root.join(format!("{category}.xml"))
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, category: &str, max_results: u32) -> Result<Vec<Record>, SourceError> {
        let path = self.fixture_path(category);
        let body = std::fs::read(&path).map_err(|source| SourceError::Fixture { path, source })?;
        let mut records = parse_atom_feed(&body, Utc::now())?;
        records.truncate(max_results as usize);
        Ok(records)
    }
}

/// Maps an arXiv Atom feed into records stamped with `fetched_at`.
pub fn parse_atom_feed(body: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Record>, SourceError> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| SourceError::Parse(format!("failed to parse Atom feed: {e}")))?;

    if let Some(error_entry) = feed.entries.iter().find(|e| is_error_entry(e)) {
        let detail = error_entry
            .summary
            .as_ref()
            .map(|s| normalize_text(&s.content))
            .unwrap_or_else(|| error_entry.id.clone());
        return Err(SourceError::Api(detail));
    }

    feed.entries
        .iter()
        .map(|entry| entry_to_record(entry, fetched_at))
        .collect()
}

fn is_error_entry(entry: &Entry) -> bool {
    entry.id.contains("/api/errors")
}

/// `http://arxiv.org/abs/2401.01234v2` -> `2401.01234v2`.
pub fn identifier_from_entry_id(entry_id: &str) -> Option<&str> {
    let (_, id) = entry_id.rsplit_once("/abs/")?;
    let id = id.trim();
    (!id.is_empty()).then_some(id)
}

fn entry_to_record(entry: &Entry, fetched_at: DateTime<Utc>) -> Result<Record, SourceError> {
    let identifier = identifier_from_entry_id(&entry.id)
        .ok_or_else(|| SourceError::Parse(format!("entry id {:?} has no /abs/ identifier", entry.id)))?;

    let (published_at, updated_at) = match (entry.published, entry.updated) {
        (Some(p), Some(u)) => (p, u),
        (Some(p), None) => (p, p),
        (None, Some(u)) => (u, u),
        (None, None) => {
            return Err(SourceError::Parse(format!(
                "entry {identifier} has neither published nor updated timestamp"
            )))
        }
    };

    let title = entry.title.as_ref().map(|t| t.content.as_str()).unwrap_or_default();
    let abstract_text = entry
        .summary
        .as_ref()
        .map(|s| s.content.as_str())
        .unwrap_or_default();
    let authors = entry
        .authors
        .iter()
        .map(|a| normalize_text(&a.name))
        .filter(|name| !name.is_empty())
        .collect();
    let categories = entry
        .categories
        .iter()
        .map(|c| c.term.trim().to_string())
        .filter(|term| !term.is_empty())
        .collect();

    Ok(Record::new(
        identifier,
        title,
        abstract_text,
        authors,
        categories,
        published_at,
        updated_at,
        fetched_at,
    ))
}
