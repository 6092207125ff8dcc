//! Alertmanager webhook server.
//!
//! Endpoints:
//! - `POST /alertmanager` - batch of alerts, answered with per-alert outcomes
//! - `GET /healthz` - liveness

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use crate::alerts::AlertmanagerPayload;
use crate::coordinator::IncidentCoordinator;

/// Server state shared across handlers.
pub struct AppState {
    pub coordinator: IncidentCoordinator,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: IncidentCoordinator) -> Self {
        Self { coordinator }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/alertmanager", post(alertmanager_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                )),
        )
        .with_state(state)
}

/// Start the HTTP server and run until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run_server(state: Arc<AppState>, addr: &str, request_timeout: Duration) -> Result<()> {
    let app = build_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Remediator listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Remediator stopped");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": "true" }))
}

async fn alertmanager_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> Response {
    match state.coordinator.handle_batch(&payload).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to process alert batch");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
