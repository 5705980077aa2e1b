//! HTTP surface: REST + SSE over the engine.
//!
//! - `POST /run` - aggregate result
//! - `POST /stream/run` - text/event-stream of run events
//! - `GET /health` - liveness and configured providers

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::{Engine, RunOptions};
use crate::error::{Ai3Error, RunError};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: Option<RunOptions>,
}

/// Error body: `{"error": {"kind", "message"}}` with the mapped status.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl From<Ai3Error> for ApiError {
    fn from(err: Ai3Error) -> Self {
        let status = match &err {
            Ai3Error::Plan(_) => StatusCode::BAD_REQUEST,
            Ai3Error::Run(RunError::AllCandidatesFailed { .. }) => StatusCode::FAILED_DEPENDENCY,
            Ai3Error::Run(RunError::Timeout) => StatusCode::REQUEST_TIMEOUT,
            // 499: client closed request (nginx convention).
            Ai3Error::Run(RunError::Cancelled) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Ai3Error::Run(RunError::Configuration(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/stream/run", post(stream_run_handler))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until shutdown.
pub async fn run(engine: Arc<Engine>, bind_address: &str) -> Result<()> {
    let app = create_router(AppState { engine });
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(address = bind_address, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "providers": state.engine.providers().ids(),
        "models": state.engine.registry().model_ids(),
    }))
}

async fn run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let options = request.options.unwrap_or_default();
    let result = state.engine.run(&request.prompt, options).await?;
    Ok(Json(json!({
        "content": result.response.content,
        "confidence": result.response.confidence,
        "stats": result.stats,
        "run_id": result.run_id,
    })))
}

async fn stream_run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let options = request.options.unwrap_or_default();
    let cancel = CancellationToken::new();
    // Dropping the stream (client disconnect) cancels the run.
    let guard = cancel.clone().drop_guard();
    let (rx, _handle) = state
        .engine
        .clone()
        .run_stream(request.prompt, options, cancel);

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.name()).data(data));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
