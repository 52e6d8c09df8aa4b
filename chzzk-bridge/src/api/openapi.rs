//! OpenAPI document, served as JSON at `/api-docs/openapi.json`.

use utoipa::OpenApi;

use crate::api::error::ApiErrorResponse;
use crate::api::models::{
    AuthorizationRequiredResponse, CallbackResponse, HealthResponse, LivenessResponse,
    MessageResponse, ScopeInfo, SubscribeResponse,
};
use crate::database::models::EventDbModel;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "chzzk-bridge API",
        description = "Bridges live chat and donation events to local subscribers as a resumable event stream.",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://127.0.0.1:39681", description = "Internal API listener"),
        (url = "http://localhost:39680", description = "OAuth callback listener")
    ),
    tags(
        (name = "subscriptions", description = "Open and close live sessions"),
        (name = "events", description = "Resumable event stream"),
        (name = "oauth", description = "Account interlock callback"),
        (name = "health", description = "Health check endpoints")
    ),
    paths(
        crate::api::routes::subscriptions::subscribe,
        crate::api::routes::subscriptions::unsubscribe,
        crate::api::routes::events::stream_events,
        crate::api::routes::oauth::oauth_callback,
        crate::api::routes::health::health_check,
        crate::api::routes::health::readiness_check,
        crate::api::routes::health::liveness_check,
    ),
    components(schemas(
        ApiErrorResponse,
        AuthorizationRequiredResponse,
        CallbackResponse,
        EventDbModel,
        HealthResponse,
        LivenessResponse,
        MessageResponse,
        ScopeInfo,
        SubscribeResponse,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        for expected in [
            "/api/v1/subscribe",
            "/api/v1/unsubscribe",
            "/api/v1/events",
            "/oauth_callback",
            "/health",
        ] {
            assert!(
                paths.iter().any(|p| p.as_str() == expected),
                "missing {expected}"
            );
        }
    }
}
