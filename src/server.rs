//! HTTP front-end for the memory agent.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Store a document (new, or update against `base_version`) |
//! | `GET` | `/documents/{id}` | Latest live revision |
//! | `DELETE` | `/documents/{id}?version=N` | Soft-delete against base version `N` |
//! | `POST` | `/search` | Run a retrieve workflow |
//! | `GET` | `/workflows/{id}` | Workflow execution record |
//! | `POST` | `/workflows/{id}/cancel` | Request cooperative cancellation |
//! | `GET` | `/health` | Store reachability, capabilities, worker availability |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "version conflict on document a: ...", "step": "persist" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `validation`, `chunking`, `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `conflict` | 409 |
//! | `transient`, `strategy_timeout` | 503 |
//! | anything else | 500 |
//!
//! Messages are sanitized; raw detail only reaches the log.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use memory_agent_core::models::{Document, DocumentFormat, Metadata, RetrievalRequest, ScoredDocument};
use memory_agent_core::workflow::{StoreReceipt, WorkflowExecution};
use memory_agent_core::{ErrorKind, MemoryError};

use crate::config::Config;
use crate::orchestrator::{HealthReport, Orchestrator, OrchestratorError};

/// Start the server on `[server].bind` with a background reconciler.
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let orchestrator = crate::app::build(config).await?;

    let resumed = orchestrator.resume_incomplete().await?;
    if !resumed.completed.is_empty() || !resumed.failed.is_empty() {
        info!(
            completed = resumed.completed.len(),
            failed = resumed.failed.len(),
            "Resumed unfinished workflows"
        );
    }
    let _reconciler = orchestrator.spawn_reconciler(Duration::from_secs(config.reconcile.interval_secs));

    let bind_addr = config.server.bind.clone();
    let app = router(orchestrator);

    info!(bind = %bind_addr, "Memory agent listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes, with CORS applied.
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_store))
        .route("/documents/{id}", get(handle_get).delete(handle_delete))
        .route("/search", post(handle_search))
        .route("/workflows/{id}", get(handle_workflow))
        .route("/workflows/{id}/cancel", post(handle_cancel))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(orchestrator)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    step: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                step: self.step,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Chunking => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient | ErrorKind::StrategyTimeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = err.kind();
        AppError {
            status: status_for(kind),
            code: kind.as_str().to_string(),
            message: err.message(),
            step: err.step().map(str::to_string),
        }
    }
}

impl From<MemoryError> for AppError {
    fn from(err: MemoryError) -> Self {
        OrchestratorError::from(err).into()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        step: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        step: None,
    }
}

fn parse_workflow_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid workflow id: {raw}")))
}

// ============ GET /health ============

async fn handle_health(State(orchestrator): State<Orchestrator>) -> Json<HealthReport> {
    Json(orchestrator.health_check().await)
}

// ============ Documents ============

/// Body of `POST /documents`.
#[derive(Deserialize)]
struct StoreBody {
    /// Generated when absent.
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default)]
    format: DocumentFormat,
    #[serde(default)]
    metadata: Metadata,
    /// The version the caller last read; 0 for a new document.
    #[serde(default)]
    base_version: u64,
}

async fn handle_store(
    State(orchestrator): State<Orchestrator>,
    Json(body): Json<StoreBody>,
) -> Result<(StatusCode, Json<StoreReceipt>), AppError> {
    let id = body.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut document = Document::new(id, body.content, body.format, body.metadata);
    document.version = body.base_version;
    let receipt = orchestrator.store_document(document).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn handle_get(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(orchestrator.retrieve_document(&id).await?))
}

#[derive(Deserialize)]
struct DeleteParams {
    version: Option<u64>,
}

async fn handle_delete(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<StoreReceipt>, AppError> {
    let version = params
        .version
        .ok_or_else(|| bad_request("version query parameter is required"))?;
    Ok(Json(orchestrator.delete_document(&id, version).await?))
}

// ============ POST /search ============

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredDocument>,
}

async fn handle_search(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<RetrievalRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let results = orchestrator.search_documents(request).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ Workflows ============

async fn handle_workflow(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let id = parse_workflow_id(&id)?;
    orchestrator
        .execution(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no workflow with id {id}")))
}

async fn handle_cancel(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let id = parse_workflow_id(&id)?;
    orchestrator
        .cancel(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no workflow with id {id}")))
}
