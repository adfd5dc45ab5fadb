//! Thin axum JSON surface over the ingestion pipeline and repository.
//!
//! Every route is plumbing: parse the category, call into the orchestrator
//! or repository, serialize the result. No business logic lives here.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fundscope_core::AnalysisCategory;
use fundscope_ingest::{category_statistics, Ingestor, SchedulerSettings};
use serde::Deserialize;
use serde_json::json;

pub const CRATE_NAME: &str = "fundscope-web";

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub scheduler: SchedulerSettings,
    pub cooldown: Duration,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, scheduler: SchedulerSettings, cooldown: Duration) -> Self {
        Self {
            ingestor,
            scheduler,
            cooldown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/analysis", get(list_snapshots_handler))
        .route("/api/analysis/fetch/{category}", post(fetch_category_handler))
        .route("/api/analysis/run-all", post(run_all_handler))
        .route("/api/analysis/search", get(search_handler))
        .route("/api/analysis/purge", post(purge_handler))
        .route("/api/analysis/scheduler/status", get(scheduler_status_handler))
        .route("/api/analysis/{category}/records", get(records_handler))
        .route(
            "/api/analysis/{category}/records/relevant",
            get(relevant_records_handler),
        )
        .route(
            "/api/analysis/{category}/statistics",
            get(statistics_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn parse_category(raw: &str) -> Result<AnalysisCategory, Response> {
    raw.parse::<AnalysisCategory>().map_err(|err| {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
    })
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn fetch_category_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(category) => category,
        Err(resp) => return resp,
    };
    match state.ingestor.ingest(category).await {
        Ok(summary) => Json(json!({
            "message": format!("{} data fetched and stored successfully", category.display_name()),
            "analysisId": summary.snapshot.id,
            "opportunitiesCount": summary.snapshot.projects_count,
            "relevantCount": summary.snapshot.relevant_count,
            "filteredOut": summary.filtered_out,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.ingestor.run_all(state.cooldown).await;
    Json(report).into_response()
}

async fn list_snapshots_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.ingestor.repository().snapshots().await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => server_error(err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(category) => category,
        Err(resp) => return resp,
    };
    match state
        .ingestor
        .repository()
        .records_for(category.snapshot_id())
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn relevant_records_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(category) => category,
        Err(resp) => return resp,
    };
    match state
        .ingestor
        .repository()
        .relevant_records_for(category.snapshot_id())
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn statistics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(category) => category,
        Err(resp) => return resp,
    };
    match category_statistics(state.ingestor.repository().as_ref(), category).await {
        Ok(Some(stats)) => Json(stats).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no snapshot stored for {category}") })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state.ingestor.repository().search_records(&query.q).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn purge_handler(State(state): State<Arc<AppState>>) -> Response {
    let repository = state.ingestor.repository();
    let snapshots = match repository.snapshot_count().await {
        Ok(count) => count,
        Err(err) => return server_error(err),
    };
    let records = match repository.record_count().await {
        Ok(count) => count,
        Err(err) => return server_error(err),
    };
    match repository.delete_all().await {
        Ok(()) => Json(json!({
            "message": "all analysis data purged",
            "deletedSnapshots": snapshots,
            "deletedRecords": records,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(&state.scheduler).into_response()
}
