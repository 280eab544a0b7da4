use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    status: &'static str,
    delivered: usize,
    failed: usize,
}

/// POST /api/broadcast: push an arbitrary JSON payload to every active call.
///
/// Each active session receives the payload as a text frame on its caller leg.
/// Delivery never blocks: a session whose queue is full counts as failed.
pub async fn handle_broadcast(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let report = state.relay.broadcast(&payload).await;

    tracing::info!(
        delivered = report.delivered,
        failed = report.failed,
        skipped = report.skipped,
        "Broadcast received"
    );

    (
        StatusCode::OK,
        Json(BroadcastResponse {
            status: "received",
            delivered: report.delivered,
            failed: report.failed,
        }),
    )
}
