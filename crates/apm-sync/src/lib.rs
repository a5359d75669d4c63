//! Fetch-merge cycle orchestration and interval scheduling.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apm_adapters::{ArxivAdapter, FixtureSource, RecordSource, ARXIV_API_URL};
use apm_core::{
    duplicate_categories, validate_categories, CategoryConfig, CategoryFailure, ConfigError,
    FetchStatus, Record,
};
use apm_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, JsonStore, RecordMap, SeenIds, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

mod scheduler;

pub use scheduler::Scheduler;

pub const CRATE_NAME: &str = "apm-sync";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub fetch_interval: Duration,
    pub scheduler_enabled: bool,
    pub arxiv_api_url: String,
    /// Serve captured feeds from this directory instead of calling the API.
    pub fixture_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub request_spacing_ms: u64,
    pub web_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./arxiv_data"),
            fetch_interval: Duration::from_secs(3600),
            scheduler_enabled: true,
            arxiv_api_url: ARXIV_API_URL.to_string(),
            fixture_dir: None,
            user_agent: "apm-bot/0.1".to_string(),
            http_timeout_secs: 30,
            http_max_retries: 0,
            request_spacing_ms: 3000,
            web_port: 8001,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("APM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            fetch_interval: fetch_interval_from_secs(env_parse(
                "APM_FETCH_INTERVAL_SECS",
                defaults.fetch_interval.as_secs(),
            )),
            scheduler_enabled: std::env::var("APM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            arxiv_api_url: std::env::var("APM_ARXIV_API_URL").unwrap_or(defaults.arxiv_api_url),
            fixture_dir: std::env::var("APM_FIXTURE_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("APM_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("APM_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_max_retries: env_parse("APM_HTTP_MAX_RETRIES", defaults.http_max_retries),
            request_spacing_ms: env_parse("APM_REQUEST_SPACING_MS", defaults.request_spacing_ms),
            web_port: env_parse("APM_WEB_PORT", defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            request_spacing: Some(Duration::from_millis(self.request_spacing_ms)),
        }
    }
}

/// Shortest accepted wait between scheduled cycles.
pub const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(1);

fn fetch_interval_from_secs(secs: u64) -> Duration {
    let interval = Duration::from_secs(secs);
    if interval < MIN_FETCH_INTERVAL {
        warn!(requested_secs = secs, "fetch interval too short; using 1s");
        return MIN_FETCH_INTERVAL;
    }
    interval
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Builds the cycle for a deployment: JSON store under `data_dir`, arXiv API
/// (or captured fixtures when `fixture_dir` is set) as the record source.
pub fn build_cycle(config: &MonitorConfig) -> Result<Arc<FetchCycle>> {
    let source: Arc<dyn RecordSource> = match &config.fixture_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using fixture record source");
            Arc::new(FixtureSource::new(dir.clone()))
        }
        None => {
            let http = HttpFetcher::new(config.http_client_config()).context("building arXiv http client")?;
            Arc::new(ArxivAdapter::new(http, config.arxiv_api_url.clone()))
        }
    };
    Ok(Arc::new(FetchCycle::new(
        JsonStore::new(config.data_dir.clone()),
        source,
    )))
}

/// Result of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_found: usize,
    pub new_records: usize,
    pub failed_categories: Vec<CategoryFailure>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a fetch cycle is already in progress")]
    Busy,
    #[error("all {} enabled categories failed: {}", .0.len(), describe_failures(.0))]
    AllCategoriesFailed(Vec<CategoryFailure>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn describe_failures(failures: &[CategoryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.category, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ConfigUpdateError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Merges fetched candidates into `records`, in order.
///
/// A candidate is new when its identifier was absent from `seen` before this
/// merge began; repeats of a new identifier within the same batch stay new.
/// Returns the number of distinct identifiers that became new.
pub fn merge_candidates(candidates: Vec<Record>, records: &mut RecordMap, seen: &mut SeenIds) -> usize {
    let mut fresh: HashSet<String> = HashSet::new();
    for mut candidate in candidates {
        let is_new =
            fresh.contains(&candidate.identifier) || seen.insert(candidate.identifier.clone());
        if is_new {
            fresh.insert(candidate.identifier.clone());
        }
        candidate.is_new = is_new;
        records.insert(candidate.identifier.clone(), candidate);
    }
    fresh.len()
}

/// Records sorted newest `updated_at` first, ties broken by identifier.
pub fn sorted_by_updated_desc(records: RecordMap) -> Vec<Record> {
    let mut out: Vec<Record> = records.into_values().collect();
    out.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    out
}

struct Collected {
    candidates: Vec<Record>,
    failures: Vec<CategoryFailure>,
    attempted: usize,
}

/// The fetch-merge cycle plus every other mutation of the shared datasets.
///
/// All read-modify-write operations hold `gate`, so at most one of them runs
/// at a time within the process.
pub struct FetchCycle {
    store: JsonStore,
    source: Arc<dyn RecordSource>,
    gate: Mutex<()>,
}

impl FetchCycle {
    pub fn new(store: JsonStore, source: Arc<dyn RecordSource>) -> Self {
        Self {
            store,
            source,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    /// Manual trigger: rejected with [`CycleError::Busy`] while another
    /// mutation is in flight.
    pub async fn trigger(&self) -> Result<CycleReport, CycleError> {
        let _guard = self.gate.try_lock().map_err(|_| CycleError::Busy)?;
        self.run_guarded("manual").await
    }

    /// Scheduled tick: waits for any in-flight mutation, then runs.
    pub async fn run_scheduled(&self) -> Result<CycleReport, CycleError> {
        let _guard = self.gate.lock().await;
        self.run_guarded("scheduled").await
    }

    async fn run_guarded(&self, trigger: &'static str) -> Result<CycleReport, CycleError> {
        let span = info_span!("fetch_cycle", trigger, source = self.source.source_id());
        async move {
            let started_at = Utc::now();
            let result = self.execute(started_at).await;

            let status = match &result {
                Ok(report) => FetchStatus::success(
                    report.finished_at,
                    report.records_found,
                    report.new_records,
                    report.failed_categories.clone(),
                ),
                Err(CycleError::AllCategoriesFailed(failures)) => {
                    FetchStatus::error(Utc::now(), result_message(&result), failures.clone())
                }
                Err(_) => FetchStatus::error(Utc::now(), result_message(&result), Vec::new()),
            };
            let saved = self.store.save_status(&status).await;

            match (result, saved) {
                (Ok(report), Ok(())) => {
                    let elapsed = report.finished_at - report.started_at;
                    info!(
                        records_found = report.records_found,
                        new_records = report.new_records,
                        skipped = report.failed_categories.len(),
                        elapsed_ms = elapsed.num_milliseconds(),
                        "fetch cycle complete"
                    );
                    Ok(report)
                }
                (Ok(_), Err(err)) => {
                    error!(error = %err, "fetch cycle merged but status could not be saved");
                    Err(err.into())
                }
                (Err(err), saved) => {
                    if let Err(save_err) = saved {
                        error!(error = %save_err, "failed to record error status");
                    }
                    error!(error = %err, "fetch cycle failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, started_at: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let config = self.store.load_config().await?;
        let collected = self.collect_candidates(&config).await;

        if collected.attempted > 0 && collected.failures.len() == collected.attempted {
            return Err(CycleError::AllCategoriesFailed(collected.failures));
        }

        let mut seen = self.store.load_seen_ids().await?;
        let mut records = self.store.load_records().await?;
        let records_found = collected.candidates.len();
        let new_records = merge_candidates(collected.candidates, &mut records, &mut seen);

        self.store.save_records(&records).await?;
        self.store.save_seen_ids(&seen).await?;

        Ok(CycleReport {
            started_at,
            finished_at: Utc::now(),
            records_found,
            new_records,
            failed_categories: collected.failures,
        })
    }

    /// Fetches every enabled category in configuration order. A failing
    /// category is recorded and skipped.
    async fn collect_candidates(&self, config: &[CategoryConfig]) -> Collected {
        let duplicates = duplicate_categories(config);
        if !duplicates.is_empty() {
            warn!(?duplicates, "duplicate category entries will be fetched more than once");
        }

        let mut collected = Collected {
            candidates: Vec::new(),
            failures: Vec::new(),
            attempted: 0,
        };
        for entry in config.iter().filter(|c| c.enabled) {
            collected.attempted += 1;
            match self.source.fetch(&entry.category, entry.max_results).await {
                Ok(records) => {
                    info!(category = %entry.category, count = records.len(), "fetched category");
                    collected.candidates.extend(records);
                }
                Err(err) => {
                    warn!(category = %entry.category, error = %err, "category fetch failed; skipping");
                    collected.failures.push(CategoryFailure {
                        category: entry.category.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        collected
    }

    pub async fn list_records(&self) -> Result<Vec<Record>, StoreError> {
        Ok(sorted_by_updated_desc(self.store.load_records().await?))
    }

    pub async fn status(&self) -> Result<FetchStatus, StoreError> {
        Ok(self
            .store
            .load_status()
            .await?
            .unwrap_or_else(FetchStatus::no_data))
    }

    /// Clears `is_new` everywhere and adds every stored identifier to the
    /// seen set. Returns the number of records touched.
    pub async fn mark_all_seen(&self) -> Result<usize, StoreError> {
        let _guard = self.gate.lock().await;
        let mut records = self.store.load_records().await?;
        let mut seen = self.store.load_seen_ids().await?;
        for (identifier, record) in records.iter_mut() {
            record.is_new = false;
            seen.insert(identifier.clone());
        }
        self.store.save_records(&records).await?;
        self.store.save_seen_ids(&seen).await?;
        info!(count = records.len(), "marked all records as seen");
        Ok(records.len())
    }

    pub async fn config(&self) -> Result<Vec<CategoryConfig>, StoreError> {
        self.store.load_config().await
    }

    pub async fn replace_config(&self, config: Vec<CategoryConfig>) -> Result<(), ConfigUpdateError> {
        validate_categories(&config)?;
        let duplicates = duplicate_categories(&config);
        if !duplicates.is_empty() {
            warn!(?duplicates, "saving configuration with duplicate categories");
        }
        let _guard = self.gate.lock().await;
        self.store.save_config(&config).await?;
        info!(entries = config.len(), "category configuration replaced");
        Ok(())
    }

    /// Empties records and the seen set and marks the status `cleared`.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.gate.lock().await;
        self.store.save_records(&RecordMap::new()).await?;
        self.store.save_seen_ids(&SeenIds::new()).await?;
        self.store.save_status(&FetchStatus::cleared()).await?;
        info!("all data cleared");
        Ok(())
    }
}

fn result_message(result: &Result<CycleReport, CycleError>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(err) => err.to_string(),
    }
}
