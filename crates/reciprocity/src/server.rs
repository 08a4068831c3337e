//! HTTP server for the follow-back audit.
//!
//! Provides REST API endpoints for:
//! - Discovery of stored result sets and sessions
//! - Starting runs and submitting second-factor codes
//! - Streaming run events over SSE (one observer at a time; a reconnecting
//!   observer resumes the stream and sees a pending second-factor request)
//! - Reading and downloading stored result sets

use std::convert::Infallible;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::classify::Classification;
use crate::error::{RunError, StoreError};
use crate::events::Observed;
use crate::run::{RunDispatcher, StartRequest};
use crate::store::{ExportKind, ResultRef};

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    /// Run dispatcher.
    pub dispatcher: RunDispatcher,
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/discovery", get(discovery_handler))
        .route("/results", get(list_results_handler))
        .route("/results/{folder}", get(show_result_handler))
        .route("/results/{folder}/{kind}", get(download_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/runs", post(start_run_handler).get(list_runs_handler))
        .route("/runs/{handle}/events", get(events_handler))
        .route("/runs/{handle}/second-factor", post(second_factor_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops unexpectedly.
pub async fn run_server(state: AppState, addr: &str) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Reciprocity server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Could not install the Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// JSON error response.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::InvalidRef(_) | StoreError::InvalidHandle(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) | StoreError::MissingMember { .. } => StatusCode::NOT_FOUND,
            StoreError::Io(_) | StoreError::Csv(_) | StoreError::Json(_) => {
                error!(error = %err, "Storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Store(store) => store.into(),
            RunError::AlreadyRunning(_) => Self {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
            RunError::NotRunning(_) => Self::not_found(err.to_string()),
            RunError::MissingCredentials | RunError::InvalidHandle(_) => Self {
                status: StatusCode::BAD_REQUEST,
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct DiscoveryQuery {
    #[serde(default)]
    skip_results: bool,
}

#[derive(Debug, Serialize)]
struct Download {
    kind: ExportKind,
    file_name: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct ResultView {
    folder: String,
    reference: ResultRef,
    #[serde(flatten)]
    classification: Classification,
    downloads: Vec<Download>,
}

impl ResultView {
    fn new(reference: ResultRef, classification: Classification) -> Self {
        let folder = reference.folder_name();
        let downloads = ExportKind::ALL
            .into_iter()
            .map(|kind| Download {
                kind,
                file_name: kind.file_name(&reference.timestamp),
                url: format!("/results/{folder}/{}", export_slug(kind)),
            })
            .collect();
        Self {
            folder,
            reference,
            classification,
            downloads,
        }
    }
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
    handle: String,
    events: String,
}

#[derive(Debug, Deserialize)]
struct SecondFactorRequest {
    code: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ActiveRun {
    handle: String,
    started_at: chrono::DateTime<chrono::Utc>,
}

fn export_slug(kind: ExportKind) -> &'static str {
    match kind {
        ExportKind::Following => "following",
        ExportKind::Followers => "followers",
        ExportKind::FollowingOnly => "following_only",
        ExportKind::FansOnly => "fans_only",
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn discovery_handler(
    State(state): State<AppState>,
    Query(query): Query<DiscoveryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let discovery = state.dispatcher.discover(query.skip_results)?;
    Ok(Json(discovery))
}

async fn list_results_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dispatcher.list_result_sets()?))
}

async fn show_result_handler(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reference = ResultRef::parse(&folder)?;
    let classification = state.dispatcher.load_result(&reference)?;
    Ok(Json(ResultView::new(reference, classification)))
}

async fn download_handler(
    State(state): State<AppState>,
    Path((folder, kind)): Path<(String, ExportKind)>,
) -> Result<Response, ApiError> {
    let reference = ResultRef::parse(&folder)?;
    let path = state.dispatcher.export_path(&reference, kind)?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::from(StoreError::Io(e)))?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        kind.file_name(&reference.timestamp)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn list_sessions_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dispatcher.list_sessions()?))
}

async fn list_runs_handler(State(state): State<AppState>) -> impl IntoResponse {
    let runs: Vec<_> = state
        .dispatcher
        .registry()
        .active()
        .into_iter()
        .map(|(handle, started_at)| ActiveRun { handle, started_at })
        .collect();
    Json(runs)
}

async fn start_run_handler(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = request.handle.trim().to_string();
    state.dispatcher.start(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            status: "started",
            events: format!("/runs/{handle}/events"),
            handle,
        }),
    ))
}

async fn second_factor_handler(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(request): Json<SecondFactorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .dispatcher
        .submit_second_factor(&handle, &request.code)?;
    Ok(Json(StatusResponse { status: "submitted" }))
}

async fn events_handler(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state
        .dispatcher
        .subscribe(&handle)
        .ok_or_else(|| ApiError::not_found(format!("no event stream for {handle}")))?;
    info!(handle = %handle, "Observer subscribed");

    let stream = subscription.into_stream().map(|observed| Ok(sse_event(&observed)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn sse_event(observed: &Observed) -> Event {
    match observed {
        Observed::Event(event) | Observed::Terminal(event) => match serde_json::to_string(event) {
            Ok(data) => Event::default().event(event.kind()).data(data),
            Err(e) => {
                error!(error = %e, "Failed to encode event");
                Event::default().event("log").data("{}")
            }
        },
        Observed::Disconnected => Event::default().event("disconnected").data("{}"),
    }
}
