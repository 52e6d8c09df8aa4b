//! Platform gateway boundary.
//!
//! The live-streaming platform is reached through three primitives:
//! authenticate, refresh and open a live session. Everything platform specific
//! (wire formats, the session transport) lives behind [`PlatformGateway`];
//! the rest of the bridge only sees the types in this module.

pub mod sandbox;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use sandbox::{SandboxGateway, SandboxSession};

/// How a subscriber proves access to a platform account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Authorization code returned by the account-interlock redirect.
    AuthorizationCode { code: String, state: String },
    /// Previously issued token pair.
    Token {
        access_token: String,
        refresh_token: String,
    },
}

/// Rotated tokens returned by a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<TokenPair> for Credentials {
    fn from(pair: TokenPair) -> Self {
        Credentials::Token {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedAccount {
    /// Platform account (channel) id
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as reported by the platform, without any skew applied
    pub expires_at: DateTime<Utc>,
}

/// A chat message as raised by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Account (channel) the message was received on
    pub account_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
}

/// A donation as raised by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationEvent {
    pub account_id: String,
    pub donator_id: String,
    pub donator_name: String,
    pub text: String,
    pub pay_amount: i64,
}

/// Callback interface a live session dispatches events into.
///
/// Called from the session's dispatch context; implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_chat_event(&self, event: ChatEvent);

    fn on_donation_event(&self, event: DonationEvent);
}

/// One open remote connection.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Account the session is subscribed to.
    fn account_id(&self) -> &str;

    /// Close the remote connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), GatewayError>;
}

/// The platform's login, refresh and connect primitives.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Log in with an authorization code or an existing token pair.
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthenticatedAccount, GatewayError>;

    /// Exchange a refresh token for a rotated token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, GatewayError>;

    /// Open a live session for an authenticated account, dispatching its
    /// events into `sink`.
    async fn open_session(
        &self,
        account: &AuthenticatedAccount,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn LiveSession>, GatewayError>;
}

/// Errors raised by a [`PlatformGateway`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Authorization code unknown, already used, or issued for another state.
    #[error("Invalid authorization grant: {0}")]
    InvalidGrant(String),

    /// Access token unknown or expired.
    #[error("Invalid access token")]
    InvalidToken,

    /// The platform refused to rotate the refresh token.
    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    /// Network or upstream failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The platform did not answer in time.
    #[error("Gateway timed out")]
    Timeout,

    /// Failure while closing a live session.
    #[error("Failed to close session: {0}")]
    Close(String),
}

impl GatewayError {
    /// Whether the subscriber has to go through account interlock again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::InvalidGrant(_) | Self::InvalidToken | Self::RefreshRejected(_)
        )
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}
