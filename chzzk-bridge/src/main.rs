use std::sync::Arc;

use chzzk_bridge::api::BridgeServer;
use chzzk_bridge::config::BridgeConfig;
use chzzk_bridge::database;
use chzzk_bridge::database::repositories::CredentialRepository;
use chzzk_bridge::gateway::SandboxGateway;
use chzzk_bridge::logging;
use chzzk_bridge::services::ServiceContainer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = BridgeConfig::from_env_or_default()?;

    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    logging::panic_hook::install(logging_config.log_dir());

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    let write_pool = database::init_write_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    // The platform transport is not bundled; the sandbox gateway accepts any
    // authorization code and re-admits tokens persisted by earlier runs.
    let gateway = Arc::new(SandboxGateway::permissive());
    let container = ServiceContainer::new(config, pool, write_pool, gateway.clone());
    for credential in container.credentials.list().await? {
        gateway.register_token(
            credential.account_id.clone(),
            credential.access_token.clone(),
            credential.refresh_token.clone(),
            credential.get_expires_at(),
        );
    }

    container.initialize();
    logging_config.start_retention_cleanup(container.cancellation_token());

    let server = BridgeServer::new(container.app_state());
    let server_token = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        server_token.cancel();
    });

    info!(
        scopes = ?container.config.scopes,
        "chzzk-bridge initialized successfully"
    );

    let served = server.run().await;
    if let Err(e) = &served {
        error!(error = %e, "Server stopped with an error");
    }

    container.shutdown().await?;
    served?;
    Ok(())
}
