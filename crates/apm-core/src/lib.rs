//! Core domain model for the arXiv paper monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "apm-core";

pub const ABS_URL_BASE: &str = "https://arxiv.org/abs/";
pub const PDF_URL_BASE: &str = "https://arxiv.org/pdf/";

/// Upstream per-request ceiling for `max_results`.
pub const MAX_RESULTS_CEILING: u32 = 2000;
pub const DEFAULT_MAX_RESULTS: u32 = 50;
pub const DEFAULT_CATEGORIES: [&str; 3] = ["cs.CV", "cs.LG", "cs.AI"];

/// A single fetched paper, keyed by its arXiv identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_url: String,
    pub document_url: String,
    pub fetched_at: DateTime<Utc>,
    pub is_new: bool,
}

impl Record {
    /// Builds a record with URLs derived from `identifier` and `is_new` set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: impl Into<String>,
        title: &str,
        abstract_text: &str,
        authors: Vec<String>,
        categories: Vec<String>,
        published_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            source_url: source_url_for(&identifier),
            document_url: document_url_for(&identifier),
            identifier,
            title: normalize_text(title),
            abstract_text: normalize_text(abstract_text),
            authors,
            categories,
            published_at,
            updated_at,
            fetched_at,
            is_new: true,
        }
    }
}

pub fn source_url_for(identifier: &str) -> String {
    format!("{ABS_URL_BASE}{identifier}")
}

pub fn document_url_for(identifier: &str) -> String {
    format!("{PDF_URL_BASE}{identifier}.pdf")
}

/// Collapses every whitespace run to a single space and trims both ends.
pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn default_enabled() -> bool {
    true
}

fn default_max_results() -> u32 {
    DEFAULT_MAX_RESULTS
}

/// One monitored arXiv category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl CategoryConfig {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            enabled: true,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.category.trim().is_empty() {
            return Err(ConfigError::EmptyCategory);
        }
        if self.max_results == 0 || self.max_results > MAX_RESULTS_CEILING {
            return Err(ConfigError::MaxResultsOutOfRange {
                category: self.category.clone(),
                max_results: self.max_results,
            });
        }
        Ok(())
    }
}

pub fn default_categories() -> Vec<CategoryConfig> {
    DEFAULT_CATEGORIES
        .iter()
        .map(|c| CategoryConfig::new(*c))
        .collect()
}

pub fn validate_categories(config: &[CategoryConfig]) -> Result<(), ConfigError> {
    config.iter().try_for_each(CategoryConfig::validate)
}

/// Category identifiers that appear more than once, in first-seen order.
pub fn duplicate_categories(config: &[CategoryConfig]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut dups = Vec::new();
    for entry in config {
        if !seen.insert(entry.category.as_str()) && !dups.contains(&entry.category) {
            dups.push(entry.category.clone());
        }
    }
    dups
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("category identifier must not be empty")]
    EmptyCategory,
    #[error("max_results for {category} must be between 1 and 2000, got {max_results}")]
    MaxResultsOutOfRange { category: String, max_results: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    NoData,
    Cleared,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::NoData => "no_data",
            Self::Cleared => "cleared",
        }
    }
}

/// A category skipped during a cycle because its fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFailure {
    pub category: String,
    pub message: String,
}

/// Summary of the most recent cycle. Overwritten wholesale on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub records_found: usize,
    pub new_records: usize,
    pub status: RunStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub failed_categories: Vec<CategoryFailure>,
}

impl FetchStatus {
    pub fn success(
        at: DateTime<Utc>,
        records_found: usize,
        new_records: usize,
        failed_categories: Vec<CategoryFailure>,
    ) -> Self {
        let mut message = format!("Fetched {records_found} papers, {new_records} new");
        if !failed_categories.is_empty() {
            let skipped = failed_categories
                .iter()
                .map(|f| f.category.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            message.push_str(&format!(" (skipped: {skipped})"));
        }
        Self {
            last_fetch_at: Some(at),
            records_found,
            new_records,
            status: RunStatus::Success,
            message,
            failed_categories,
        }
    }

    pub fn error(
        at: DateTime<Utc>,
        message: impl Into<String>,
        failed_categories: Vec<CategoryFailure>,
    ) -> Self {
        Self {
            last_fetch_at: Some(at),
            records_found: 0,
            new_records: 0,
            status: RunStatus::Error,
            message: message.into(),
            failed_categories,
        }
    }

    pub fn no_data() -> Self {
        Self {
            last_fetch_at: None,
            records_found: 0,
            new_records: 0,
            status: RunStatus::NoData,
            message: "No fetches performed yet".to_string(),
            failed_categories: Vec::new(),
        }
    }

    pub fn cleared() -> Self {
        Self {
            last_fetch_at: None,
            records_found: 0,
            new_records: 0,
            status: RunStatus::Cleared,
            message: "All data cleared".to_string(),
            failed_categories: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalize_collapses_whitespace_runs() {
        assert_eq!(
            normalize_text("  Deep\n   Learning\tfor \r\n Vision  "),
            "Deep Learning for Vision"
        );
        assert_eq!(normalize_text(" \n\t "), "");
    }

    #[test]
    fn urls_are_derived_from_identifier() {
        assert_eq!(source_url_for("2401.01234v2"), "https://arxiv.org/abs/2401.01234v2");
        assert_eq!(
            document_url_for("2401.01234v2"),
            "https://arxiv.org/pdf/2401.01234v2.pdf"
        );
    }

    #[test]
    fn record_new_normalizes_and_marks_new() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();
        let record = Record::new(
            "2401.00001v1",
            " A   title\n",
            "An\n abstract ",
            vec!["Ada".into()],
            vec!["cs.CV".into()],
            ts,
            ts,
            ts,
        );
        assert_eq!(record.title, "A title");
        assert_eq!(record.abstract_text, "An abstract");
        assert!(record.is_new);
        assert_eq!(record.document_url, "https://arxiv.org/pdf/2401.00001v1.pdf");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["abstract"], "An abstract");
    }

    #[test]
    fn category_config_defaults_apply_on_deserialize() {
        let parsed: CategoryConfig = serde_json::from_str(r#"{"category":"math.CO"}"#).unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.max_results, 50);
    }

    #[test]
    fn validation_rejects_out_of_range_max_results() {
        let mut entry = CategoryConfig::new("cs.CV");
        entry.max_results = 0;
        assert!(matches!(
            entry.validate(),
            Err(ConfigError::MaxResultsOutOfRange { max_results: 0, .. })
        ));
        entry.max_results = MAX_RESULTS_CEILING + 1;
        assert!(entry.validate().is_err());
        assert_eq!(
            CategoryConfig::new("  ").validate(),
            Err(ConfigError::EmptyCategory)
        );
        assert!(validate_categories(&default_categories()).is_ok());
    }

    #[test]
    fn duplicate_categories_are_reported_once() {
        let config = vec![
            CategoryConfig::new("cs.CV"),
            CategoryConfig::new("cs.LG"),
            CategoryConfig::new("cs.CV"),
            CategoryConfig::new("cs.CV"),
        ];
        assert_eq!(duplicate_categories(&config), vec!["cs.CV".to_string()]);
    }

    #[test]
    fn status_serializes_snake_case() {
        let status = FetchStatus::no_data();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "no_data");
        assert!(json["last_fetch_at"].is_null());
    }

    #[test]
    fn success_message_names_skipped_categories() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();
        let status = FetchStatus::success(
            ts,
            4,
            1,
            vec![CategoryFailure {
                category: "cs.AI".into(),
                message: "http status 503".into(),
            }],
        );
        assert_eq!(status.message, "Fetched 4 papers, 1 new (skipped: cs.AI)");
        assert_eq!(status.status.as_str(), "success");
    }
}
