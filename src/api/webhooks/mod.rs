//! Webhook handlers

pub mod whatsapp;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use super::ApiState;

/// Build the webhook router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/whatsapp", get(whatsapp::verify).post(whatsapp::receive))
        .with_state(state)
}
