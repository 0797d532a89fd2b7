use axum::{
    Json,
    extract::{Query, State as AxumState},
    response::IntoResponse,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::SharedState;

/// Root health check endpoint
/// Supports ?format=json for detailed JSON response
pub async fn root(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let format = params.get("format").map(|s| s.as_str());

    if format == Some("json") {
        Json(json!({
            "name": "gitlab_webhook",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "routes": state.hooks.routes(),
            "total_hooks": state.hooks.len(),
            "accepted_requests": state.accepted_count.load(Ordering::Relaxed),
            "status": "healthy"
        }))
        .into_response()
    } else {
        "gitlab_webhook - healthy".into_response()
    }
}
