//! Account-interlock callback.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{CallbackResponse, OAuthCallbackQuery, ScopeInfo};
use crate::api::server::AppState;
use crate::oauth::CALLBACK_PATH;
use crate::session::{EstablishOutcome, LoginIntent};

pub fn router() -> axum::Router<AppState> {
    Router::new().route(CALLBACK_PATH, get(oauth_callback))
}

/// Redeem the authorization state and log the subscriber in with the code.
#[utoipa::path(
    get,
    path = "/oauth_callback",
    tag = "oauth",
    params(OAuthCallbackQuery),
    responses(
        (status = 200, description = "Account linked", body = CallbackResponse),
        (status = 204, description = "A session for the subscriber already exists"),
        (status = 400, description = "Missing code or invalid state", body = crate::api::error::ApiErrorResponse),
        (status = 406, description = "Credential already registered", body = crate::api::error::ApiErrorResponse),
        (status = 500, description = "Login failed or session unavailable", body = crate::api::error::ApiErrorResponse)
    )
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Response> {
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing authorization code"))?;
    let token = query.state.unwrap_or_default();
    let subscriber = state
        .states
        .redeem(&token)
        .map_err(|_| ApiError::invalid_state())?;

    if state.credentials.get(subscriber).await?.is_some() {
        warn!(subscriber = %subscriber, "Callback for a subscriber that already has a credential");
        return Err(ApiError::credential_exists());
    }

    match state
        .orchestrator
        .establish_session(LoginIntent::from_code(subscriber, code, token))
        .await?
    {
        EstablishOutcome::Success {
            future,
            created: true,
        } => match tokio::time::timeout(state.config.session_open_timeout, future.wait()).await {
            Ok(Ok(session)) => {
                info!(
                    subscriber = %subscriber,
                    account_id = %session.account_id(),
                    "Account linked"
                );
                let body = CallbackResponse {
                    message: "Account linked, you can close this page".to_string(),
                    scopes: state.config.scopes.iter().copied().map(ScopeInfo::from).collect(),
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
        EstablishOutcome::LoginFailed | EstablishOutcome::RefreshTokenExpired => {
            Err(ApiError::login_failed())
        }
    }
}
