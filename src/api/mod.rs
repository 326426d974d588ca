//! HTTP API server for Courier gateway

pub mod webhooks;
pub mod websocket;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::channels::SessionRegistry;
use crate::config::Config;
use crate::db::{ConversationRepo, DbPool, NumberRepo, SessionRepo};
use crate::fanout::EventHub;
use crate::ingest::IngestPipeline;
use crate::{Error, Result};

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    pub config: Config,
    pub pipeline: Arc<IngestPipeline>,
    pub hub: Arc<EventHub>,
    pub registry: Arc<SessionRegistry>,
    pub sessions: SessionRepo,
    pub numbers: NumberRepo,
    pub conversations: ConversationRepo,
}

impl ApiState {
    /// Assemble API state over the shared pool
    #[must_use]
    pub fn new(
        db: DbPool,
        config: Config,
        pipeline: Arc<IngestPipeline>,
        hub: Arc<EventHub>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            numbers: NumberRepo::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            db,
            config,
            pipeline,
            hub,
            registry,
        }
    }
}

/// Build the full application router
pub fn router(state: Arc<ApiState>) -> Router {
    let uploads = ServeDir::new(&state.config.media.uploads_dir);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/numbers/{id}/session", get(number_session))
        .with_state(Arc::clone(&state))
        .nest("/api/webhooks", webhooks::router(Arc::clone(&state)))
        .merge(websocket::router(state))
        .nest_service("/api/uploads", uploads)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    token: Option<String>,
}

/// Socket session presence for a number
///
/// Authenticated with the same session token as the WebSocket upgrade;
/// numbers outside the operator's tenant look like they do not exist.
/// Numbers without a live session report `disconnected`.
async fn number_session(
    State(state): State<Arc<ApiState>>,
    Path(number_id): Path<i64>,
    Query(query): Query<SessionQuery>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let token = query.token.ok_or(StatusCode::UNAUTHORIZED)?;
    let user = state
        .sessions
        .authenticate(&token)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let number = state
        .numbers
        .find(number_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|n| n.tenant_id == user.tenant_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let status = state
        .registry
        .status(number.id)
        .unwrap_or_else(|| "disconnected".to_string());

    Ok(Json(serde_json::json!({
        "number_id": number.id,
        "status": status,
        "typing": state.registry.typing_peers(number.id),
    })))
}

/// Bind and serve the API
///
/// # Errors
///
/// Returns error if the listener cannot bind or the server fails
pub async fn serve(state: Arc<ApiState>) -> Result<()> {
    let port = state.config.port;
    let app = router(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Config(format!("bind port {port}: {e}")))?;

    tracing::info!(port, "API server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Config(format!("server error: {e}")))?;

    Ok(())
}
