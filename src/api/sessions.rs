use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::SessionEntry;
use crate::relay::{SessionId, SessionState};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SessionView {
    id: SessionId,
    state: SessionState,
    started_at: DateTime<Utc>,
}

impl From<SessionEntry> for SessionView {
    fn from(entry: SessionEntry) -> Self {
        Self {
            state: entry.state(),
            id: entry.id,
            started_at: entry.started_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// GET /api/sessions: registered sessions, oldest first.
pub async fn handle_sessions(State(state): State<AppState>) -> Json<Vec<SessionView>> {
    let mut sessions: Vec<SessionView> = state
        .relay
        .registry()
        .snapshot()
        .await
        .into_iter()
        .map(SessionView::from)
        .collect();
    sessions.sort_by_key(|s| s.started_at);
    Json(sessions)
}

/// GET /api/sessions/{id}: one registered session.
pub async fn handle_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = SessionId::from(id);
    match state.relay.registry().get(&id).await {
        Some(entry) => Json(SessionView::from(entry)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No active session with id {id}"),
            }),
        )
            .into_response(),
    }
}
