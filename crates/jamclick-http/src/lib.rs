//! WebSocket relay and REST API for jamclick sessions.
//!
//! Remote participants connect to `/sessions/:id/ws` and share one
//! in-process [`LocalHub`] topic per session. The relay forwards envelopes
//! and presence verbatim; the sync protocol runs in the clients. Changes
//! authored by a session's host are also recorded in the [`SessionStore`].
//!
//! # Usage
//!
//! ```ignore
//! use jamclick_core::{JsonFileStore, LocalHub};
//! use std::sync::Arc;
//!
//! let store = Arc::new(JsonFileStore::new("/tmp/sessions")?);
//! jamclick_http::start_server(LocalHub::new(), store, 1607).await?;
//! ```

mod models;
mod recorder;
mod routes;
mod websocket;

use axum::{routing::get, Router};
use jamclick_core::{LocalHub, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub use models::*;
pub use recorder::SessionRecorder;
pub use websocket::{bridge_events, ClientFrame};

/// Shared application state for HTTP handlers.
pub struct AppState {
    /// Topics of every relayed session.
    pub hub: LocalHub,
    /// Durable session records, read-only from the API.
    pub store: Arc<dyn SessionStore>,
    /// Writes host changes into `store`.
    pub recorder: SessionRecorder,
}

impl AppState {
    pub fn new(hub: LocalHub, store: Arc<dyn SessionStore>) -> jamclick_core::Result<Self> {
        let recorder = SessionRecorder::new(Arc::clone(&store))?;
        Ok(Self {
            hub,
            store,
            recorder,
        })
    }
}

/// Build the router with every endpoint.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::sessions::health))
        .route("/sessions", get(routes::sessions::list_sessions))
        .route("/sessions/:id", get(routes::sessions::get_session))
        .route("/sessions/:id/presence", get(routes::sessions::get_presence))
        .route("/sessions/:id/ws", get(websocket::ws_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Start the relay on the specified port and serve until the listener fails.
pub async fn start_server(
    hub: LocalHub,
    store: Arc<dyn SessionStore>,
    port: u16,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(hub, store)?);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Session relay listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
