//! Request and response bodies.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::config::ApiScope;

/// Query carrying the subscriber id. `uuid` is accepted as a legacy alias.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct SubscriberQuery {
    /// Subscriber UUID
    #[serde(alias = "uuid")]
    pub subscriber: Option<String>,
}

impl SubscriberQuery {
    pub fn subscriber(&self) -> ApiResult<Uuid> {
        let raw = self
            .subscriber
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::bad_request("Requires subscriber query parameter"))?;
        Uuid::parse_str(raw)
            .map_err(|_| ApiError::bad_request("subscriber must be a UUID"))
    }
}

/// Query of the OAuth callback.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct OAuthCallbackQuery {
    /// Authorization code issued by the platform
    pub code: Option<String>,
    /// Authorization state issued by the bridge
    pub state: Option<String>,
}

/// 401 body asking the subscriber to go through account interlock.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequiredResponse {
    /// Single-use authorization state
    pub state: String,
    /// URL to open to grant access
    pub authorization_url: String,
    /// Same as `authorizationUrl`, kept for older clients
    pub path: String,
}

/// 200 body of a subscribe that opened a new session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscriber: Uuid,
    /// Platform account (channel) the session is bound to
    pub account_id: String,
}

/// A granted permission.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScopeInfo {
    pub name: String,
    pub label: String,
    pub description: String,
}

impl From<ApiScope> for ScopeInfo {
    fn from(scope: ApiScope) -> Self {
        Self {
            name: scope.to_string(),
            label: scope.label().to_string(),
            description: scope.description().to_string(),
        }
    }
}

/// 200 body of a successful OAuth callback.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackResponse {
    pub message: String,
    pub scopes: Vec<ScopeInfo>,
}

/// Generic message response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Registered session slots, pending ones included
    pub active_sessions: usize,
    /// Authorization states awaiting redemption
    pub pending_states: usize,
}

/// Liveness check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LivenessResponse {
    /// Always "alive" if responding
    pub status: String,
    pub uptime_secs: u64,
}
