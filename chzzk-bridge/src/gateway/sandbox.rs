//! In-process gateway.
//!
//! Simulates the platform's OAuth behaviour: authorization codes are
//! single-use, refresh rotates both tokens, and access tokens expire. Live
//! sessions are local handles whose events are raised by calling
//! [`SandboxGateway::emit_chat`] or [`SandboxGateway::emit_donation`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    AuthenticatedAccount, ChatEvent, Credentials, DonationEvent, EventSink, GatewayError,
    LiveSession, PlatformGateway, TokenPair,
};

/// Default lifetime of issued access tokens.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
struct PendingCode {
    account_id: String,
    state: Option<String>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    account_id: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct SandboxState {
    auth_codes: HashMap<String, PendingCode>,
    /// access token -> issued token
    issued: HashMap<String, IssuedToken>,
    /// refresh token -> access token
    refresh_tokens: HashMap<String, String>,
    sessions: Vec<Arc<SandboxSession>>,
}

/// In-process [`PlatformGateway`].
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
    token_ttl: Duration,
    permissive: bool,
    fail_open: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxGateway {
    /// Strict gateway: only registered codes and tokens are accepted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SandboxState::default()),
            token_ttl: DEFAULT_TOKEN_TTL,
            permissive: false,
            fail_open: AtomicBool::new(false),
            open_delay: Mutex::new(None),
        }
    }

    /// Gateway that accepts any authorization code, binding each unknown
    /// code to a freshly generated account.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::new()
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Register an authorization code. A `state` of `Some` must match the
    /// state presented with the code. Returns the account id bound to it.
    pub fn register_auth_code(
        &self,
        code: impl Into<String>,
        state: Option<&str>,
        account_id: Option<&str>,
    ) -> String {
        let account_id = account_id.map_or_else(generate_account_id, str::to_string);
        self.state.lock().auth_codes.insert(
            code.into(),
            PendingCode {
                account_id: account_id.clone(),
                state: state.map(str::to_string),
            },
        );
        account_id
    }

    /// Register an already issued token pair.
    pub fn register_token(
        &self,
        account_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();
        let mut state = self.state.lock();
        state
            .refresh_tokens
            .insert(refresh_token.clone(), access_token.clone());
        state.issued.insert(
            access_token,
            IssuedToken {
                account_id: account_id.into(),
                refresh_token,
                expires_at,
            },
        );
    }

    /// Make subsequent `open_session` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Delay subsequent `open_session` calls.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }

    /// Sessions opened so far, closed ones included.
    pub fn sessions(&self) -> Vec<Arc<SandboxSession>> {
        self.state.lock().sessions.clone()
    }

    /// Open sessions of an account.
    pub fn open_sessions(&self, account_id: &str) -> Vec<Arc<SandboxSession>> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| s.account_id == account_id && !s.is_closed())
            .cloned()
            .collect()
    }

    /// Raise a chat message on every open session of `account_id`.
    /// Returns the number of sessions it was dispatched to.
    pub fn emit_chat(
        &self,
        account_id: &str,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> usize {
        let sessions = self.open_sessions(account_id);
        for session in &sessions {
            session.sink.on_chat_event(ChatEvent {
                account_id: account_id.to_string(),
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
                content: content.to_string(),
            });
        }
        sessions.len()
    }

    /// Raise a donation on every open session of `account_id`.
    pub fn emit_donation(
        &self,
        account_id: &str,
        donator_id: &str,
        donator_name: &str,
        text: &str,
        pay_amount: i64,
    ) -> usize {
        let sessions = self.open_sessions(account_id);
        for session in &sessions {
            session.sink.on_donation_event(DonationEvent {
                account_id: account_id.to_string(),
                donator_id: donator_id.to_string(),
                donator_name: donator_name.to_string(),
                text: text.to_string(),
                pay_amount,
            });
        }
        sessions.len()
    }

    fn issue(&self, state: &mut SandboxState, account_id: String) -> AuthenticatedAccount {
        let access_token = random_token::<30>();
        let refresh_token = random_token::<36>();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.token_ttl).unwrap_or(chrono::Duration::days(1));

        state
            .refresh_tokens
            .insert(refresh_token.clone(), access_token.clone());
        state.issued.insert(
            access_token.clone(),
            IssuedToken {
                account_id: account_id.clone(),
                refresh_token: refresh_token.clone(),
                expires_at,
            },
        );

        AuthenticatedAccount {
            account_id,
            access_token,
            refresh_token,
            expires_at,
        }
    }
}

#[async_trait]
impl PlatformGateway for SandboxGateway {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthenticatedAccount, GatewayError> {
        let mut state = self.state.lock();
        match credentials {
            Credentials::AuthorizationCode { code, state: csrf } => {
                let account_id = match state.auth_codes.remove(code) {
                    Some(pending) => {
                        if pending.state.as_deref().is_some_and(|s| s != csrf) {
                            return Err(GatewayError::InvalidGrant(
                                "state does not match".to_string(),
                            ));
                        }
                        pending.account_id
                    }
                    None if self.permissive => generate_account_id(),
                    None => {
                        return Err(GatewayError::InvalidGrant(
                            "unknown authorization code".to_string(),
                        ));
                    }
                };
                Ok(self.issue(&mut state, account_id))
            }
            Credentials::Token { access_token, .. } => match state.issued.get(access_token) {
                Some(issued) if Utc::now() < issued.expires_at => Ok(AuthenticatedAccount {
                    account_id: issued.account_id.clone(),
                    access_token: access_token.clone(),
                    refresh_token: issued.refresh_token.clone(),
                    expires_at: issued.expires_at,
                }),
                _ => Err(GatewayError::InvalidToken),
            },
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, GatewayError> {
        let mut state = self.state.lock();
        let old_access = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| GatewayError::RefreshRejected("unknown refresh token".to_string()))?;
        let account_id = state
            .issued
            .remove(&old_access)
            .map(|t| t.account_id)
            .ok_or_else(|| GatewayError::RefreshRejected("token was revoked".to_string()))?;

        let account = self.issue(&mut state, account_id);
        debug!(account_id = %account.account_id, "Rotated sandbox tokens");
        Ok(TokenPair {
            access_token: account.access_token,
            refresh_token: account.refresh_token,
        })
    }

    async fn open_session(
        &self,
        account: &AuthenticatedAccount,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn LiveSession>, GatewayError> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(
                "session handshake failed".to_string(),
            ));
        }

        let session = Arc::new(SandboxSession {
            account_id: account.account_id.clone(),
            sink,
            closed: AtomicBool::new(false),
        });
        self.state.lock().sessions.push(session.clone());
        info!(account_id = %account.account_id, "Opened sandbox live session");
        Ok(session)
    }
}

/// Live session handle produced by [`SandboxGateway`].
pub struct SandboxSession {
    account_id: String,
    sink: Arc<dyn EventSink>,
    closed: AtomicBool,
}

impl SandboxSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveSession for SandboxSession {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn close(&self) -> Result<(), GatewayError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(account_id = %self.account_id, "Closed sandbox live session");
        }
        Ok(())
    }
}

fn random_token<const N: usize>() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; N]>())
}

/// 32 lowercase hex characters, the platform's channel id format.
fn generate_account_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().fold(String::with_capacity(32), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
