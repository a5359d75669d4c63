//! Axum JSON control surface + Askama dashboard for the paper monitor.

use std::sync::Arc;

use anyhow::Context;
use apm_core::{CategoryConfig, FetchStatus, Record, RunStatus};
use apm_sync::{build_cycle, ConfigUpdateError, CycleError, FetchCycle, MonitorConfig, Scheduler};
use askama::Template;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "apm-web";

#[derive(Clone)]
pub struct AppState {
    pub cycle: Arc<FetchCycle>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(cycle: Arc<FetchCycle>, scheduler: Arc<Scheduler>) -> Self {
        Self { cycle, scheduler }
    }
}

#[derive(Debug, Clone)]
struct RecordRow {
    identifier: String,
    title: String,
    authors: String,
    categories: String,
    updated: String,
    source_url: String,
    document_url: String,
    is_new: bool,
}

impl From<&Record> for RecordRow {
    fn from(record: &Record) -> Self {
        Self {
            identifier: record.identifier.clone(),
            title: record.title.clone(),
            authors: record.authors.join(", "),
            categories: record.categories.join(", "),
            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            source_url: record.source_url.clone(),
            document_url: record.document_url.clone(),
            is_new: record.is_new,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    status_label: String,
    status_class: String,
    status_message: String,
    last_fetch: String,
    auto_fetch_enabled: bool,
    total_records: usize,
    new_records: usize,
    rows: Vec<RecordRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/papers", get(papers_handler))
        .route("/api/fetch", post(fetch_handler))
        .route("/api/status", get(status_handler))
        .route("/api/mark-all-seen", post(mark_all_seen_handler))
        .route("/api/toggle-auto-fetch", post(toggle_auto_fetch_handler))
        .route("/api/config", get(get_config_handler).post(replace_config_handler))
        .route("/api/clear", post(clear_handler))
        .layer(CorsLayer::very_permissive())
        .with_state(Arc::new(state))
}

/// Runs the HTTP server and, when enabled, the fetch scheduler until Ctrl-C.
pub async fn serve(config: MonitorConfig) -> anyhow::Result<()> {
    let cycle = build_cycle(&config)?;
    let scheduler = Arc::new(Scheduler::new(cycle.clone(), config.fetch_interval));
    if config.scheduler_enabled {
        scheduler.start().await;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, data_dir = %config.data_dir.display(), "serving paper monitor");

    axum::serve(listener, app(AppState::new(cycle, scheduler.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running http server")?;

    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let records = match state.cycle.list_records().await {
        Ok(records) => records,
        Err(err) => return server_error(err),
    };
    let status = match state.cycle.status().await {
        Ok(status) => status,
        Err(err) => return server_error(err),
    };

    let tpl = IndexTemplate {
        status_label: status.status.as_str().to_string(),
        status_class: if status.status == RunStatus::Error {
            "error".to_string()
        } else {
            String::new()
        },
        status_message: status.message.clone(),
        last_fetch: status
            .last_fetch_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string()),
        auto_fetch_enabled: state.scheduler.is_enabled().await,
        total_records: records.len(),
        new_records: records.iter().filter(|r| r.is_new).count(),
        rows: records.iter().map(RecordRow::from).collect(),
    };
    render_html(tpl)
}

async fn papers_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.list_records().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.trigger().await {
        Ok(report) => Json(json!({
            "status": "success",
            "records_found": report.records_found,
            "new_records": report.new_records,
            "failed_categories": report.failed_categories,
        }))
        .into_response(),
        Err(err @ CycleError::Busy) => json_error(StatusCode::CONFLICT, err.to_string()),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.status().await {
        Ok(status) => Json::<FetchStatus>(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn mark_all_seen_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.mark_all_seen().await {
        Ok(_) => json_ok("All papers marked as seen"),
        Err(err) => server_error(err),
    }
}

async fn toggle_auto_fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    let enabled = state.scheduler.toggle().await;
    Json(json!({ "enabled": enabled })).into_response()
}

async fn get_config_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.config().await {
        Ok(config) => Json(config).into_response(),
        Err(err) => server_error(err),
    }
}

async fn replace_config_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Vec<CategoryConfig>>, JsonRejection>,
) -> Response {
    let config = match payload {
        Ok(Json(config)) => config,
        Err(rejection) => return json_error(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };
    match state.cycle.replace_config(config).await {
        Ok(()) => json_ok("Configuration updated"),
        Err(err @ ConfigUpdateError::Invalid(_)) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn clear_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cycle.clear_all().await {
        Ok(()) => json_ok("All data cleared"),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

fn json_ok(message: &str) -> Response {
    Json(json!({ "status": "success", "message": message })).into_response()
}

fn json_error(code: StatusCode, message: String) -> Response {
    (code, Json(json!({ "status": "error", "message": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
