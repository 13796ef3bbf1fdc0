//! Session endpoint handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use jamclick_core::{PresenceEntry, SessionState};
use std::sync::Arc;

use crate::{
    models::{ErrorResponse, HealthResponse, SessionSummary},
    AppState,
};

/// GET /health - Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /sessions - Sessions with live subscribers
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let sessions = state
        .hub
        .sessions()
        .into_iter()
        .map(|id| SessionSummary {
            online: state.hub.presence(&id).len(),
            id,
        })
        .collect();
    Json(sessions)
}

/// GET /sessions/:id - Durable record of a session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, (StatusCode, Json<ErrorResponse>)> {
    match state.store.load(&id) {
        Ok(Some(session)) => Ok(Json(session)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::not_found(&format!("Session '{}' not found", id))),
        )),
        Err(e) => {
            log::warn!("Failed to load session {}: {}", id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal(&e.to_string())),
            ))
        }
    }
}

/// GET /sessions/:id/presence - Current presence table
pub async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Vec<PresenceEntry>> {
    Json(state.hub.presence(&id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamclick_core::{LocalHub, MemoryStore, SessionChannel, SessionStore};

    fn app_state() -> (Arc<AppState>, MemoryStore) {
        let store = MemoryStore::new();
        let state = Arc::new(AppState::new(LocalHub::new(), Arc::new(store.clone())).unwrap());
        (state, store)
    }

    #[tokio::test]
    async fn test_get_session_found_and_missing() {
        let (state, store) = app_state();
        let mut session = SessionState::new("jam-1", "host");
        session.beat_state.set_bpm(88);
        store.save(&session).unwrap();

        let Json(found) = get_session(State(state.clone()), Path("jam-1".to_string()))
            .await
            .unwrap();
        assert_eq!(found, session);

        let (status, Json(body)) = get_session(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not_found");
    }

    #[tokio::test]
    async fn test_presence_and_session_list() {
        let (state, _) = app_state();
        let channel = state.hub.subscribe("jam-1", "a");
        channel
            .track(PresenceEntry::new("a", "a", "Alice", 1))
            .unwrap();

        let Json(presence) = get_presence(State(state.clone()), Path("jam-1".to_string())).await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].display_name, "Alice");

        let Json(sessions) = list_sessions(State(state)).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "jam-1");
        assert_eq!(sessions[0].online, 1);
    }
}
