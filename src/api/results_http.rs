//! HTTP browser for stored runs
//!
//! Read-only JSON endpoints over a [`RunStore`]:
//! - `GET /runs` lists every stored run
//! - `GET /runs/:name` lists the runs of one test
//! - `GET /runs/:name/:run/verdict` returns a run's verdict
//! - `GET /runs/:name/:run/history` returns a run's events
//!
//! `:run` may be `latest`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::checker::Verdict;
use crate::error::StoreError;
use crate::history::Event;
use crate::store::{RunInfo, RunStore};

/// Shared state for the results handlers
pub type SharedStore = Arc<RunStore>;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(e: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

/// Create an axum router over `store`
pub fn create_results_router(store: SharedStore) -> Router {
    Router::new()
        .route("/runs", get(handle_list))
        .route("/runs/:name", get(handle_runs_of))
        .route("/runs/:name/:run/verdict", get(handle_verdict))
        .route("/runs/:name/:run/history", get(handle_history))
        .with_state(store)
}

/// Serve the results browser on `addr` until the task is cancelled
pub async fn serve(store: RunStore, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, root = %store.root().display(), "serving stored runs");
    axum::serve(listener, create_results_router(Arc::new(store))).await
}

fn resolve(store: &RunStore, name: &str, run: &str) -> Result<std::path::PathBuf, StoreError> {
    let run = (run != "latest").then_some(run);
    store.resolve(name, run)
}

async fn handle_list(State(store): State<SharedStore>) -> ApiResult<Vec<RunInfo>> {
    store.list().map(Json).map_err(api_error)
}

async fn handle_runs_of(State(store): State<SharedStore>, Path(name): Path<String>) -> ApiResult<Vec<RunInfo>> {
    let runs: Vec<RunInfo> = store
        .list()
        .map_err(api_error)?
        .into_iter()
        .filter(|info| info.name == name)
        .collect();
    if runs.is_empty() {
        return Err(api_error(StoreError::NotFound(name)));
    }
    Ok(Json(runs))
}

async fn handle_verdict(
    State(store): State<SharedStore>,
    Path((name, run)): Path<(String, String)>,
) -> ApiResult<Verdict> {
    let dir = resolve(&store, &name, &run).map_err(api_error)?;
    store.load_verdict(&dir).map(Json).map_err(api_error)
}

async fn handle_history(
    State(store): State<SharedStore>,
    Path((name, run)): Path<(String, String)>,
) -> ApiResult<Vec<Event>> {
    let dir = resolve(&store, &name, &run).map_err(api_error)?;
    let history = store.load_history(&dir).map_err(api_error)?;
    Ok(Json(history.events().to_vec()))
}
