//! Lifecycle gate middleware.
//! Refuses API requests unless the process is `Running`.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::http::server::AppState;
use crate::lifecycle::state::LifecycleState;

pub async fn lifecycle_gate(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let current = state.lifecycle.state();
    if current != LifecycleState::Running {
        tracing::debug!(path = %req.uri().path(), state = %current, "Request refused by lifecycle gate");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "unavailable", "state": current })),
        )
            .into_response();
    }
    next.run(req).await
}
