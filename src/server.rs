//! Axum router construction.
//!
//! Terraform uses the extension methods `LOCK` and `UNLOCK`, which axum's
//! method router cannot express, so the state listener has no routes at
//! all: every request lands in one fallback handler that runs the full
//! dispatch pipeline.  Health and metrics live on a separate admin router
//! so that every path on the state listener requires a credential.

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, Operation};
use crate::metrics::{metrics_handler, metrics_middleware, record_operation};
use crate::AppState;

/// Build the state protocol router.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_size;

    Router::new()
        .fallback(handle_state_request)
        .with_state(state)
        // metrics_middleware is inner so the trace span covers it.
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Build the admin router: `/healthz` and `/metrics`, no authentication.
pub fn admin_app() -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
}

/// `GET /healthz` -- liveness probe.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// Fallback handler for every state request.
async fn handle_state_request(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let operation = Operation::from_method(request.method());
    match handlers::dispatch(&state, request).await {
        Ok(response) => {
            record_operation(operation.as_str(), "ok");
            response
        }
        Err(e) => {
            record_operation(operation.as_str(), e.outcome());
            e.into_response()
        }
    }
}
