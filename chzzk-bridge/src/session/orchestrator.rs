//! Session orchestration.
//!
//! Turns a login intent into a registered session slot: consults the stored
//! credential, refreshes or authenticates through the gateway, persists
//! rotated credentials and opens the live session in the background.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{SessionFuture, SessionRegistry};
use crate::Result;
use crate::database::models::CredentialDbModel;
use crate::database::repositories::CredentialRepository;
use crate::database::time::with_skew;
use crate::gateway::{
    AuthenticatedAccount, Credentials, EventSink, GatewayError, LiveSession, PlatformGateway,
};
use crate::intake::EventIntake;

/// How the subscriber logs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMethod {
    /// Authorization code from the account-interlock callback.
    CreateFromCode { code: String, state: String },
    /// Credential already in the store.
    UseStoredCredential,
}

/// A subscriber's request to establish a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginIntent {
    pub subscriber: Uuid,
    pub method: LoginMethod,
}

impl LoginIntent {
    pub fn from_code(subscriber: Uuid, code: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            subscriber,
            method: LoginMethod::CreateFromCode {
                code: code.into(),
                state: state.into(),
            },
        }
    }

    pub fn stored(subscriber: Uuid) -> Self {
        Self {
            subscriber,
            method: LoginMethod::UseStoredCredential,
        }
    }
}

/// Result of [`SessionOrchestrator::establish_session`].
#[derive(Debug)]
pub enum EstablishOutcome {
    /// A slot is registered. `created` is false when another request already
    /// owns it.
    Success {
        future: Arc<SessionFuture>,
        created: bool,
    },
    /// The gateway refused the credentials. Nothing was persisted.
    LoginFailed,
    /// The stored refresh token was refused; the credential was deleted.
    RefreshTokenExpired,
}

/// Result of [`SessionOrchestrator::teardown`].
#[derive(Debug)]
pub enum TeardownOutcome {
    /// No session was registered.
    NotFound,
    /// The live session was closed.
    Closed,
    /// Establishment had failed or was cancelled; nothing to close.
    Cancelled,
    /// The session did not open in time; establishment was cancelled and a
    /// late handle is closed when it lands.
    TimedOut,
    /// The slot was removed but closing the live session failed.
    CloseFailed(GatewayError),
}

impl TeardownOutcome {
    /// Whether a session was registered for the subscriber.
    pub fn existed(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Subtracted from the platform-reported expiry before persisting.
    pub token_skew: Duration,
    /// Upper bound on waiting for a session during teardown.
    pub teardown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_skew: Duration::from_secs(60),
            teardown_timeout: Duration::from_secs(10),
        }
    }
}

enum LoginStep {
    Authenticated(AuthenticatedAccount),
    LoginFailed,
    RefreshTokenExpired,
}

/// Drives credential checks, the gateway and the session registry.
pub struct SessionOrchestrator {
    credentials: Arc<dyn CredentialRepository>,
    gateway: Arc<dyn PlatformGateway>,
    registry: Arc<SessionRegistry>,
    intake: Arc<EventIntake>,
    config: OrchestratorConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        gateway: Arc<dyn PlatformGateway>,
        registry: Arc<SessionRegistry>,
        intake: Arc<EventIntake>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            credentials,
            gateway,
            registry,
            intake,
            config,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a session slot for the subscriber and start establishing it.
    ///
    /// Concurrent calls for one subscriber share a single slot. Database
    /// errors are returned after the slot has been released.
    #[instrument(skip(self, intent), fields(subscriber = %intent.subscriber))]
    pub async fn establish_session(&self, intent: LoginIntent) -> Result<EstablishOutcome> {
        let (future, created) = self.registry.acquire(intent.subscriber);
        if !created {
            debug!("Session already registered");
            return Ok(EstablishOutcome::Success {
                future,
                created: false,
            });
        }

        match self.login(&intent).await {
            Ok(LoginStep::Authenticated(account)) => {
                self.spawn_open(future.clone(), account);
                Ok(EstablishOutcome::Success {
                    future,
                    created: true,
                })
            }
            Ok(LoginStep::LoginFailed) => {
                self.abandon(&future);
                Ok(EstablishOutcome::LoginFailed)
            }
            Ok(LoginStep::RefreshTokenExpired) => {
                self.abandon(&future);
                Ok(EstablishOutcome::RefreshTokenExpired)
            }
            Err(e) => {
                self.abandon(&future);
                Err(e)
            }
        }
    }

    async fn login(&self, intent: &LoginIntent) -> Result<LoginStep> {
        let subscriber = intent.subscriber;
        let (credentials, stored) = match &intent.method {
            LoginMethod::CreateFromCode { code, state } => (
                Credentials::AuthorizationCode {
                    code: code.clone(),
                    state: state.clone(),
                },
                None,
            ),
            LoginMethod::UseStoredCredential => {
                let Some(stored) = self.credentials.get(subscriber).await? else {
                    warn!("No stored credential");
                    return Ok(LoginStep::LoginFailed);
                };

                if stored.is_expired() {
                    match self.gateway.refresh(&stored.refresh_token).await {
                        Ok(pair) => {
                            debug!("Refreshed expired access token");
                            (pair.into(), Some(stored))
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                transient = e.is_transient(),
                                "Refresh failed, deleting credential"
                            );
                            self.credentials.delete(subscriber).await?;
                            return Ok(LoginStep::RefreshTokenExpired);
                        }
                    }
                } else {
                    (
                        Credentials::Token {
                            access_token: stored.access_token.clone(),
                            refresh_token: stored.refresh_token.clone(),
                        },
                        Some(stored),
                    )
                }
            }
        };

        let account = match self.gateway.authenticate(&credentials).await {
            Ok(account) => account,
            Err(e) => {
                warn!(
                    error = %e,
                    reauthorize = e.requires_reauthorization(),
                    "Login failed"
                );
                return Ok(LoginStep::LoginFailed);
            }
        };

        let candidate = CredentialDbModel::new(
            subscriber,
            &account.account_id,
            &account.access_token,
            &account.refresh_token,
            with_skew(account.expires_at, self.config.token_skew),
        );
        let changed = stored
            .as_ref()
            .is_none_or(|stored| !stored.same_tokens(&candidate));
        if changed {
            self.credentials.upsert(&candidate).await?;
            info!(account_id = %account.account_id, "Stored credential");
        }

        Ok(LoginStep::Authenticated(account))
    }

    fn abandon(&self, future: &SessionFuture) {
        future.cancel();
        self.registry
            .remove_if_current(future.subscriber(), future.generation());
    }

    fn spawn_open(&self, future: Arc<SessionFuture>, account: AuthenticatedAccount) {
        let gateway = self.gateway.clone();
        let registry = self.registry.clone();
        let intake = self.intake.clone();
        let sink: Arc<dyn EventSink> = intake.clone();
        let cancel = self.cancel.child_token();

        self.tracker.spawn(async move {
            let subscriber = future.subscriber();
            let opened = tokio::select! {
                _ = cancel.cancelled() => None,
                result = gateway.open_session(&account, sink) => Some(result),
            };

            match opened {
                Some(Ok(session)) => match future.fulfill(session) {
                    Ok(()) => info!(
                        subscriber = %subscriber,
                        account_id = %account.account_id,
                        "Live session opened"
                    ),
                    Err(session) => {
                        debug!(subscriber = %subscriber, "Slot resolved meanwhile, closing late session");
                        close_and_detach(session, &intake).await;
                    }
                },
                Some(Err(e)) => {
                    error!(subscriber = %subscriber, error = %e, "Failed to open live session");
                    future.cancel();
                    registry.remove_if_current(subscriber, future.generation());
                }
                None => {
                    debug!(subscriber = %subscriber, "Session establishment cancelled");
                    future.cancel();
                    registry.remove_if_current(subscriber, future.generation());
                }
            }
        });
    }

    /// Remove the subscriber's session and close it.
    ///
    /// Waits at most the configured teardown timeout for a pending session.
    #[instrument(skip(self))]
    pub async fn teardown(&self, subscriber: Uuid) -> TeardownOutcome {
        let Some(future) = self.registry.release(subscriber) else {
            return TeardownOutcome::NotFound;
        };

        match tokio::time::timeout(self.config.teardown_timeout, future.wait()).await {
            Ok(Ok(session)) => self.close_and_detach(session).await,
            Ok(Err(_)) => TeardownOutcome::Cancelled,
            Err(_) => {
                if future.cancel() {
                    warn!("Session did not open in time, cancelled");
                    TeardownOutcome::TimedOut
                } else if let Some(session) = future.session() {
                    // Fulfilled right after the deadline.
                    self.close_and_detach(session).await
                } else {
                    TeardownOutcome::Cancelled
                }
            }
        }
    }

    async fn close_and_detach(&self, session: Arc<dyn LiveSession>) -> TeardownOutcome {
        close_and_detach(session, &self.intake).await
    }

    /// Cancel background establishment and close every registered session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let futures = self.registry.drain();
        let count = futures.len();
        for future in futures {
            if !future.cancel()
                && let Some(session) = future.session()
            {
                self.close_and_detach(session).await;
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.teardown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for session tasks");
        }
        info!(sessions = count, "Session orchestrator stopped");
    }
}

/// Close a live session and let its account's event writer drain.
async fn close_and_detach(session: Arc<dyn LiveSession>, intake: &EventIntake) -> TeardownOutcome {
    let account_id = session.account_id().to_string();
    let result = session.close().await;
    intake.detach(&account_id);
    match result {
        Ok(()) => {
            info!(account_id = %account_id, "Live session closed");
            TeardownOutcome::Closed
        }
        Err(e) => {
            warn!(account_id = %account_id, error = %e, "Failed to close live session");
            TeardownOutcome::CloseFailed(e)
        }
    }
}
