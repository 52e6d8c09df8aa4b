//! API route modules.

pub mod events;
pub mod health;
pub mod oauth;
pub mod subscriptions;

use axum::{Json, Router, routing::get};
use utoipa::OpenApi;

use crate::api::openapi::ApiDoc;
use crate::api::server::AppState;

/// Router of the public OAuth listener.
pub fn create_oauth_router(state: AppState) -> Router {
    Router::new()
        .merge(oauth::router())
        .nest("/health", health::router())
        .with_state(state)
}

/// Router of the internal API listener.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", subscriptions::router().merge(events::router()))
        .nest("/health", health::router())
        .route("/api-docs/openapi.json", get(openapi_json))
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
