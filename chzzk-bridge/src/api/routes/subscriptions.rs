//! Subscribe and unsubscribe.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    AuthorizationRequiredResponse, MessageResponse, SubscribeResponse, SubscriberQuery,
};
use crate::api::server::AppState;
use crate::oauth::authorization_url;
use crate::session::{EstablishOutcome, LoginIntent};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
}

/// 401 carrying a fresh authorization state.
fn authorization_required(state: &AppState, subscriber: Uuid) -> ApiResult<Response> {
    let token = state.states.issue(subscriber);
    let url = authorization_url(&state.config, &token)?;
    let body = AuthorizationRequiredResponse {
        state: token,
        authorization_url: url.clone(),
        path: url,
    };
    Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response())
}

/// Open (or join) the subscriber's live session.
#[utoipa::path(
    post,
    path = "/api/v1/subscribe",
    tag = "subscriptions",
    params(SubscriberQuery),
    responses(
        (status = 200, description = "New live session opened", body = SubscribeResponse),
        (status = 204, description = "A session already exists"),
        (status = 400, description = "Missing or invalid subscriber", body = crate::api::error::ApiErrorResponse),
        (status = 401, description = "Authorization required", body = AuthorizationRequiredResponse),
        (status = 500, description = "Login failed or session unavailable", body = crate::api::error::ApiErrorResponse)
    )
)]
pub async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
) -> ApiResult<Response> {
    let subscriber = query.subscriber()?;

    if state.credentials.get(subscriber).await?.is_none() {
        return authorization_required(&state, subscriber);
    }

    match state
        .orchestrator
        .establish_session(LoginIntent::stored(subscriber))
        .await?
    {
        EstablishOutcome::Success {
            future,
            created: true,
        } => match tokio::time::timeout(state.config.session_open_timeout, future.wait()).await {
            Ok(Ok(session)) => {
                info!(subscriber = %subscriber, "Subscribed");
                let body = SubscribeResponse {
                    subscriber,
                    account_id: session.account_id().to_string(),
                };
                Ok((StatusCode::OK, Json(body)).into_response())
            }
            Ok(Err(_)) => Err(ApiError::session_unavailable(
                "Live session could not be opened",
            )),
            Err(_) => {
                warn!(subscriber = %subscriber, "Live session did not open in time");
                Err(ApiError::session_unavailable(
                    "Live session did not open in time",
                ))
            }
        },
        EstablishOutcome::Success { created: false, .. } => {
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        EstablishOutcome::LoginFailed => Err(ApiError::login_failed()),
        EstablishOutcome::RefreshTokenExpired => {
            info!(subscriber = %subscriber, "Refresh token expired, authorization required");
            authorization_required(&state, subscriber)
        }
    }
}

/// Close the subscriber's live session.
#[utoipa::path(
    post,
    path = "/api/v1/unsubscribe",
    tag = "subscriptions",
    params(SubscriberQuery),
    responses(
        (status = 200, description = "Session closed", body = MessageResponse),
        (status = 204, description = "No session"),
        (status = 400, description = "Missing or invalid subscriber", body = crate::api::error::ApiErrorResponse)
    )
)]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
) -> ApiResult<Response> {
    let subscriber = query.subscriber()?;
    let outcome = state.orchestrator.teardown(subscriber).await;

    if outcome.existed() {
        info!(subscriber = %subscriber, ?outcome, "Unsubscribed");
        let body = MessageResponse {
            message: "Unsubscribed".to_string(),
        };
        Ok((StatusCode::OK, Json(body)).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}
