//! HTTP surface: health, realtime and planning data queries, forced update.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::QueryError;
use crate::query::{QueryEngine, QueryParams};
use crate::scheduler::{Scheduler, UpdateOutcome};

pub struct AppState {
    pub engine: QueryEngine,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/realtime/data", get(realtime_data))
        .route("/api/planningdata/files", get(planning_files))
        .route("/api/planningdata/data", get(planning_overview))
        .route("/api/planningdata/{name}", get(planning_dataset))
        .route("/api/trajectories", get(trajectories))
        .route("/api/update", post(force_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(addr: &str, state: Arc<AppState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match self {
            QueryError::UnknownDataset(_) => StatusCode::NOT_FOUND,
            QueryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        debug!(kind = self.kind(), error = %self, "Rejected query");
        (
            status,
            Json(json!({ "error": self.kind(), "message": self.to_string() })),
        )
            .into_response()
    }
}

fn internal(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "Request handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal", "message": e.to_string() })),
    )
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.health())
}

async fn realtime_data(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let engine = state.engine.clone();
    let params = QueryParams::from_pairs(params);
    match tokio::task::spawn_blocking(move || engine.query_realtime(&params)).await {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => internal(e),
    }
}

async fn planning_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let engine = state.engine.clone();
    let params = QueryParams::from_pairs(params);
    match tokio::task::spawn_blocking(move || engine.query(&name, &params)).await {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => internal(e),
    }
}

async fn trajectories(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let engine = state.engine.clone();
    let params = QueryParams::from_pairs(params);
    match tokio::task::spawn_blocking(move || engine.trajectories(&params)).await {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => internal(e),
    }
}

async fn planning_files(State(state): State<Arc<AppState>>) -> Response {
    let datasets = state.engine.datasets();
    if datasets.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NoData", "message": "No planning data files available" })),
        )
            .into_response();
    }
    let files: Vec<&str> = datasets.iter().map(|d| d.file_name.as_str()).collect();
    Json(json!({ "files": files, "datasets": datasets })).into_response()
}

async fn planning_overview(State(state): State<Arc<AppState>>) -> Response {
    let datasets = state.engine.datasets();
    if datasets.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NoData", "message": "No planning data available" })),
        )
            .into_response();
    }
    let endpoints: BTreeMap<&str, String> = datasets
        .iter()
        .map(|d| (d.name.as_str(), format!("/api/planningdata/{}", d.name)))
        .collect();
    let records: BTreeMap<&str, usize> = datasets
        .iter()
        .map(|d| (d.name.as_str(), d.records))
        .collect();
    Json(json!({
        "message": "Planning data available at the following endpoints",
        "files": datasets.iter().map(|d| d.file_name.as_str()).collect::<Vec<_>>(),
        "endpoints": endpoints,
        "records": records,
    }))
    .into_response()
}

async fn force_update(State(state): State<Arc<AppState>>) -> Response {
    // Detached so a dropped connection does not abort the cycle half way.
    let scheduler = state.scheduler.clone();
    let outcome = match tokio::spawn(async move { scheduler.force_update().await }).await {
        Ok(outcome) => outcome,
        Err(e) => return internal(e),
    };

    match outcome {
        UpdateOutcome::Updated(report) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "message": "Data updated successfully", "report": report })),
        )
            .into_response(),
        UpdateOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running", "message": "An update is already in progress" })),
        )
            .into_response(),
        UpdateOutcome::Failed(report) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": "Failed to update data", "report": report })),
        )
            .into_response(),
        UpdateOutcome::Cancelled => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "cancelled", "message": "Service is shutting down" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::{Resource, ResourceSource};
    use crate::parser::parse_static;
    use crate::snapshot::SnapshotStore;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use bytes::Bytes;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl ResourceSource for Offline {
        async fn fetch(&self, _: Resource) -> Result<Bytes, FetchError> {
            Err(FetchError::Blocked("challenge".into()))
        }
    }

    fn app() -> Router {
        let store = Arc::new(SnapshotStore::new());
        store.publish_datasets(vec![
            parse_static(
                "stops.txt",
                b"stop_id,stop_name\n8814001,Brussel-Zuid\n8833001,Leuven\n",
                None,
            )
            .unwrap(),
        ]);
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(Offline),
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(3600),
        ));
        router(Arc::new(AppState {
            engine: QueryEngine::new(store),
            scheduler,
        }))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_dataset_query_envelope() {
        let (status, body) = call(
            app(),
            "GET",
            "/api/planningdata/stops?search=stop_name&stop_name=Brussel",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["stop_name"], "Brussel-Zuid");
        assert_eq!(body["pagination"]["totalRecords"], 1);
        assert_eq!(body["pagination"]["hasNextPage"], false);
    }

    #[tokio::test]
    async fn test_query_errors_map_to_status() {
        let (status, body) = call(app(), "GET", "/api/planningdata/shapes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "UnknownDataset");

        let (status, body) = call(app(), "GET", "/api/planningdata/stops?page=x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidPage");
    }

    #[tokio::test]
    async fn test_failed_forced_update_keeps_data() {
        let app = app();
        let (status, body) = call(app.clone(), "POST", "/api/update").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["report"]["failed"][0]["kind"], "blocked");

        let (status, body) = call(app.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");

        let (_, body) = call(app, "GET", "/api/planningdata/files").await;
        assert_eq!(body["files"][0], "stops.txt");
    }

    #[tokio::test]
    async fn test_trajectories_need_published_inputs() {
        let (status, body) = call(app(), "GET", "/api/trajectories?limit=5").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Unavailable");
    }

    #[tokio::test]
    async fn test_realtime_without_feed() {
        let (status, body) = call(app(), "GET", "/api/realtime/data?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRecords"], 0);
        assert!(body["header"].is_null());
    }
}
