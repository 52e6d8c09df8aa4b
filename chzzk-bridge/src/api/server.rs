//! API server setup.
//!
//! Two listeners share one [`AppState`]: the public OAuth callback listener
//! and the internal subscriber API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::BridgeConfig;
use crate::database::repositories::{CredentialRepository, EventRepository};
use crate::delivery::DeliveryConfig;
use crate::error::{Error, Result};
use crate::oauth::StateRegistry;
use crate::session::SessionOrchestrator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub config: Arc<BridgeConfig>,
    /// Outstanding authorization states
    pub states: Arc<StateRegistry>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub events: Arc<dyn EventRepository>,
    /// Cancelled when the server shuts down; ends open event streams
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<BridgeConfig>,
        states: Arc<StateRegistry>,
        orchestrator: Arc<SessionOrchestrator>,
        credentials: Arc<dyn CredentialRepository>,
        events: Arc<dyn EventRepository>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            config,
            states,
            orchestrator,
            credentials,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            poll_interval: self.config.poll_interval,
            ..DeliveryConfig::default()
        }
    }
}

/// Runs the OAuth and API listeners until cancelled.
pub struct BridgeServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl BridgeServer {
    pub fn new(state: AppState) -> Self {
        Self {
            cancel_token: state.shutdown.clone(),
            state,
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn oauth_router(&self) -> Router {
        with_tracing(routes::create_oauth_router(self.state.clone()))
    }

    pub fn api_router(&self) -> Router {
        with_tracing(routes::create_api_router(self.state.clone()))
    }

    /// Bind both listeners and serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let oauth_listener = bind(&self.state.config.oauth_bind_addr()).await?;
        let api_listener = bind(&self.state.config.api_bind_addr()).await?;
        tracing::info!(
            "OAuth callback listening on http://{}",
            oauth_listener.local_addr()?
        );
        tracing::info!("API server listening on http://{}", api_listener.local_addr()?);

        let oauth = serve(oauth_listener, self.oauth_router(), self.cancel_token.clone());
        let api = serve(api_listener, self.api_router(), self.cancel_token.clone());
        tokio::try_join!(oauth, api)?;

        tracing::info!("API servers stopped");
        Ok(())
    }

    /// Shutdown the servers.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// Bind a listener, resolving host names.
async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("Cannot bind {addr}: {e}")))
}

async fn serve(listener: TcpListener, router: Router, cancel_token: CancellationToken) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
        })
        .await
        .map_err(|e| Error::Other(format!("Server error: {}", e)))
}

/// Request tracing, skipping the health checks.
fn with_tracing(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if req.uri().path().starts_with("/health") {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_request(|req: &Request, span: &Span| {
                if span.is_disabled() {
                    return;
                }
                let mut on_request =
                    tower_http::trace::DefaultOnRequest::new().level(tracing::Level::INFO);
                use tower_http::trace::OnRequest;
                on_request.on_request(req, span);
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            ),
    )
}
