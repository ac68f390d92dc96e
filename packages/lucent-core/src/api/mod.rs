//! HTTP playback surface.
//!
//! Thin handlers over the ingest manager: channel listing, direct
//! low-latency playback, and the web publisher's manifest and chunks.

mod play;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::ingest::Manager;

/// Errors from running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("serving http: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

/// Builds the playback router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channels", get(play::list_channels))
        .route("/live/{name}", get(play::play_live))
        .route("/web/{name}/index.json", get(play::web_manifest))
        .route("/web/{name}/chunks/{seq}", get(play::web_chunk))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the playback API on `listener` until the server errors.
pub async fn start_server(state: AppState, listener: TcpListener) -> Result<(), ServerError> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
