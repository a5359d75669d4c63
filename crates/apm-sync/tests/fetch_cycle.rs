use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm_adapters::{RecordSource, SourceError};
use apm_core::{CategoryConfig, Record, RunStatus};
use apm_storage::{JsonStore, RecordMap, RECORDS_FILE};
use apm_sync::{CycleError, FetchCycle, Scheduler};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::{tempdir, TempDir};
use tokio::sync::Notify;

fn paper(id: &str, title: &str, day: u32) -> Record {
    let ts = Utc.with_ymd_and_hms(2026, 3, day, 9, 30, 0).single().unwrap();
    Record::new(id, title, "An abstract.", vec!["Author".into()], vec!["cs.CV".into()], ts, ts, Utc::now())
}

/// In-memory source with per-category listings and failures.
#[derive(Default)]
struct ScriptedSource {
    listings: Mutex<HashMap<String, Vec<Record>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<(String, u32)>>,
}

impl ScriptedSource {
    fn set(&self, category: &str, records: Vec<Record>) {
        self.listings.lock().unwrap().insert(category.to_string(), records);
    }

    fn fail(&self, category: &str) {
        self.failing.lock().unwrap().insert(category.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, category: &str, max_results: u32) -> Result<Vec<Record>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((category.to_string(), max_results));
        if self.failing.lock().unwrap().contains(category) {
            return Err(SourceError::Api(format!("{category} unavailable")));
        }
        let mut records = self
            .listings
            .lock()
            .unwrap()
            .get(category)
            .cloned()
            .unwrap_or_default();
        records.truncate(max_results as usize);
        Ok(records)
    }
}

/// Source that parks inside `fetch` until released.
struct BlockingSource {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RecordSource for BlockingSource {
    fn source_id(&self) -> &'static str {
        "blocking"
    }

    async fn fetch(&self, _category: &str, _max_results: u32) -> Result<Vec<Record>, SourceError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![paper("slow-1", "Slow paper", 1)])
    }
}

fn category(name: &str, max_results: u32) -> CategoryConfig {
    CategoryConfig {
        category: name.to_string(),
        enabled: true,
        max_results,
    }
}

async fn setup(config: Vec<CategoryConfig>) -> (TempDir, Arc<ScriptedSource>, Arc<FetchCycle>) {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(ScriptedSource::default());
    let cycle = Arc::new(FetchCycle::new(JsonStore::new(dir.path()), source.clone()));
    cycle.replace_config(config).await.expect("config");
    (dir, source, cycle)
}

#[tokio::test]
async fn first_cycle_finds_new_records_second_finds_none() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 2)]).await;
    source.set("cs.CV", vec![paper("A", "Paper A", 1), paper("B", "Paper B", 2)]);

    let first = cycle.trigger().await.unwrap();
    assert_eq!((first.records_found, first.new_records), (2, 2));
    let seen = cycle.store().load_seen_ids().await.unwrap();
    assert_eq!(seen.iter().map(String::as_str).collect::<Vec<_>>(), vec!["A", "B"]);

    let second = cycle.trigger().await.unwrap();
    assert_eq!((second.records_found, second.new_records), (2, 0));
    assert_eq!(cycle.store().load_seen_ids().await.unwrap(), seen);
    assert!(cycle.list_records().await.unwrap().iter().all(|r| !r.is_new));

    let status = cycle.status().await.unwrap();
    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.records_found, 2);
    assert_eq!(status.new_records, 0);
    assert_eq!(status.message, "Fetched 2 papers, 0 new");
    assert!(status.last_fetch_at.is_some());
}

#[tokio::test]
async fn only_enabled_categories_are_fetched_in_config_order() {
    let mut disabled = category("cs.AI", 10);
    disabled.enabled = false;
    let (_dir, source, cycle) = setup(vec![category("cs.LG", 7), disabled, category("cs.CV", 3)]).await;
    source.set("cs.LG", vec![paper("L1", "lg", 4)]);
    source.set("cs.CV", vec![paper("C1", "cv", 5)]);

    let report = cycle.trigger().await.unwrap();

    assert_eq!(report.records_found, 2);
    let requested = source.requested.lock().unwrap().clone();
    assert_eq!(
        requested,
        vec![("cs.LG".to_string(), 7), ("cs.CV".to_string(), 3)]
    );
}

#[tokio::test]
async fn refetch_overwrites_fields_and_keeps_seen_rule() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    source.set("cs.CV", vec![paper("A", "Original title", 1)]);
    cycle.trigger().await.unwrap();

    source.set("cs.CV", vec![paper("A", "Revised title", 2), paper("C", "Fresh", 3)]);
    let report = cycle.trigger().await.unwrap();
    assert_eq!(report.new_records, 1);

    let records = cycle.list_records().await.unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, vec!["C", "A"]);
    let a = records.iter().find(|r| r.identifier == "A").unwrap();
    assert_eq!(a.title, "Revised title");
    assert!(!a.is_new);
    assert!(records.iter().find(|r| r.identifier == "C").unwrap().is_new);
}

#[tokio::test]
async fn failing_category_is_skipped_and_reported() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5), category("cs.AI", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1)]);
    source.fail("cs.AI");

    let report = cycle.trigger().await.unwrap();
    assert_eq!(report.records_found, 1);
    assert_eq!(report.failed_categories.len(), 1);
    assert_eq!(report.failed_categories[0].category, "cs.AI");

    let status = cycle.status().await.unwrap();
    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.message, "Fetched 1 papers, 1 new (skipped: cs.AI)");
    assert_eq!(status.failed_categories.len(), 1);
}

#[tokio::test]
async fn all_categories_failing_records_error_status() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5), category("cs.LG", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1)]);
    cycle.trigger().await.unwrap();
    source.fail("cs.CV");
    source.fail("cs.LG");

    let err = cycle.trigger().await.unwrap_err();
    assert!(matches!(err, CycleError::AllCategoriesFailed(ref f) if f.len() == 2));

    let status = cycle.status().await.unwrap();
    assert_eq!(status.status, RunStatus::Error);
    assert_eq!(status.records_found, 0);
    assert_eq!(status.new_records, 0);
    assert!(status.message.contains("cs.LG unavailable"));
    assert_eq!(cycle.list_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn clear_all_resets_novelty() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1), paper("B", "b", 2)]);
    cycle.trigger().await.unwrap();

    cycle.clear_all().await.unwrap();
    assert!(cycle.list_records().await.unwrap().is_empty());
    assert_eq!(cycle.status().await.unwrap().status, RunStatus::Cleared);
    assert!(cycle.store().load_seen_ids().await.unwrap().is_empty());

    let report = cycle.trigger().await.unwrap();
    assert_eq!(report.new_records, 2);
}

#[tokio::test]
async fn mark_all_seen_clears_flags_without_fetching() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    let mut stored = RecordMap::new();
    for record in [paper("A", "a", 1), paper("B", "b", 2)] {
        stored.insert(record.identifier.clone(), record);
    }
    cycle.store().save_records(&stored).await.unwrap();
    assert!(cycle.store().load_seen_ids().await.unwrap().is_empty());

    let touched = cycle.mark_all_seen().await.unwrap();

    assert_eq!(touched, 2);
    assert_eq!(source.calls(), 0);
    assert!(cycle.list_records().await.unwrap().iter().all(|r| !r.is_new));
    let seen = cycle.store().load_seen_ids().await.unwrap();
    assert_eq!(seen.iter().map(String::as_str).collect::<Vec<_>>(), vec!["A", "B"]);

    source.set("cs.CV", vec![paper("A", "a", 1), paper("B", "b", 2)]);
    let report = cycle.trigger().await.unwrap();
    assert_eq!(report.new_records, 0);
}

#[tokio::test]
async fn malformed_records_file_fails_cycle_with_error_status() {
    let (dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1)]);
    std::fs::write(dir.path().join(RECORDS_FILE), b"[1,").unwrap();

    let err = cycle.trigger().await.unwrap_err();
    assert!(matches!(err, CycleError::Store(_)));

    let status = cycle.status().await.unwrap();
    assert_eq!(status.status, RunStatus::Error);
    assert_eq!((status.records_found, status.new_records), (0, 0));
    assert!(status.message.contains(RECORDS_FILE));
    assert!(cycle.store().load_seen_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_defaults_to_no_data_placeholder() {
    let dir = tempdir().unwrap();
    let cycle = FetchCycle::new(JsonStore::new(dir.path()), Arc::new(ScriptedSource::default()));
    let status = cycle.status().await.unwrap();
    assert_eq!(status.status, RunStatus::NoData);
    assert!(status.last_fetch_at.is_none());
}

#[tokio::test]
async fn invalid_config_is_rejected_and_not_saved() {
    let (_dir, _source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    let err = cycle.replace_config(vec![category("cs.LG", 0)]).await.unwrap_err();
    assert!(err.to_string().contains("max_results"));
    assert_eq!(cycle.config().await.unwrap(), vec![category("cs.CV", 5)]);
}

#[tokio::test]
async fn duplicate_categories_are_fetched_each_time_but_dedupe_by_id() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5), category("cs.CV", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1)]);

    let report = cycle.trigger().await.unwrap();

    assert_eq!(source.calls(), 2);
    assert_eq!(report.records_found, 2);
    assert_eq!(report.new_records, 1);
    assert_eq!(cycle.list_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn manual_trigger_is_rejected_while_cycle_in_flight() {
    let dir = tempdir().unwrap();
    let source = Arc::new(BlockingSource {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let cycle = Arc::new(FetchCycle::new(JsonStore::new(dir.path()), source.clone()));
    cycle.replace_config(vec![category("cs.CV", 1)]).await.unwrap();

    let running = tokio::spawn({
        let cycle = cycle.clone();
        async move { cycle.run_scheduled().await }
    });
    source.entered.notified().await;

    assert!(matches!(cycle.trigger().await, Err(CycleError::Busy)));

    source.release.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.new_records, 1);
    assert_eq!(cycle.status().await.unwrap().status, RunStatus::Success);
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn scheduler_runs_immediately_and_restarts_after_toggle() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    source.set("cs.CV", vec![paper("A", "a", 1)]);
    let scheduler = Scheduler::new(cycle.clone(), Duration::from_secs(3600));

    assert!(scheduler.start().await);
    assert!(!scheduler.start().await);
    wait_until(|| source.calls() >= 1).await;

    assert!(!scheduler.toggle().await);
    assert!(!scheduler.is_enabled().await);

    assert!(scheduler.toggle().await);
    wait_until(|| source.calls() >= 2).await;
    assert!(scheduler.is_enabled().await);

    tokio::time::timeout(Duration::from_secs(2), scheduler.shutdown())
        .await
        .expect("shutdown interrupts the interval wait");
    assert!(!scheduler.is_enabled().await);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn scheduler_survives_failing_cycles() {
    let (_dir, source, cycle) = setup(vec![category("cs.CV", 5)]).await;
    source.fail("cs.CV");
    let scheduler = Scheduler::new(cycle.clone(), Duration::from_millis(20));

    assert!(scheduler.start().await);
    wait_until(|| source.calls() >= 3).await;
    assert!(scheduler.stop().await);
    assert!(!scheduler.stop().await);
    assert!(!scheduler.is_enabled().await);
    scheduler.shutdown().await;

    assert_eq!(cycle.status().await.unwrap().status, RunStatus::Error);
}
