//! Service container for dependency injection.
//!
//! Builds every shared component once at startup and hands them to the HTTP
//! layer through [`AppState`].

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::api::AppState;
use crate::config::BridgeConfig;
use crate::database::repositories::{
    CredentialRepository, EventRepository, SqlxCredentialRepository, SqlxEventRepository,
};
use crate::gateway::PlatformGateway;
use crate::intake::EventIntake;
use crate::oauth::StateRegistry;
use crate::session::{OrchestratorConfig, SessionOrchestrator, SessionRegistry};

/// How often expired authorization states are swept.
const STATE_PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: Arc<BridgeConfig>,
    /// Read pool.
    pub pool: SqlitePool,
    /// Single-connection write pool.
    pub write_pool: SqlitePool,
    pub credentials: Arc<dyn CredentialRepository>,
    pub events: Arc<dyn EventRepository>,
    pub gateway: Arc<dyn PlatformGateway>,
    /// Outstanding authorization states.
    pub states: Arc<StateRegistry>,
    pub intake: Arc<EventIntake>,
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create the container. Must be called inside a Tokio runtime.
    pub fn new(
        config: BridgeConfig,
        pool: SqlitePool,
        write_pool: SqlitePool,
        gateway: Arc<dyn PlatformGateway>,
    ) -> Self {
        info!("Initializing service container");

        let config = Arc::new(config);
        let credentials: Arc<dyn CredentialRepository> = Arc::new(
            SqlxCredentialRepository::new(pool.clone(), write_pool.clone()),
        );
        let events: Arc<dyn EventRepository> =
            Arc::new(SqlxEventRepository::new(pool.clone(), write_pool.clone()));

        let states = Arc::new(StateRegistry::new(config.state_ttl));
        let intake = Arc::new(EventIntake::new(events.clone()));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            credentials.clone(),
            gateway.clone(),
            Arc::new(SessionRegistry::new()),
            intake.clone(),
            OrchestratorConfig {
                token_skew: config.token_skew,
                teardown_timeout: config.teardown_timeout,
            },
        ));

        Self {
            config,
            pool,
            write_pool,
            credentials,
            events,
            gateway,
            states,
            intake,
            orchestrator,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start background tasks.
    pub fn initialize(&self) {
        let states = self.states.clone();
        let cancel = self.cancellation_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATE_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = states.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired authorization states");
                        }
                    }
                }
            }
        });
    }

    /// Shared state for the HTTP layer. Open event streams end when the
    /// container shuts down.
    pub fn app_state(&self) -> AppState {
        let mut state = AppState::new(
            self.config.clone(),
            self.states.clone(),
            self.orchestrator.clone(),
            self.credentials.clone(),
            self.events.clone(),
        );
        state.shutdown = self.cancellation_token.child_token();
        state
    }

    /// Close every live session, flush pending events and close the pools.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        self.orchestrator.shutdown().await;
        self.intake.shutdown().await;

        self.pool.close().await;
        self.write_pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
