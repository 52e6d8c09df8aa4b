//! Account interlock (OAuth) helpers.

pub mod state;

pub use state::{DEFAULT_STATE_TTL, StateNotFound, StateRegistry};

use url::Url;

use crate::config::BridgeConfig;
use crate::{Error, Result};

/// Platform page that starts the account interlock.
pub const ACCOUNT_INTERLOCK_URL: &str = "https://chzzk.naver.com/account-interlock";

/// Path of the OAuth callback on the public listener.
pub const CALLBACK_PATH: &str = "/oauth_callback";

/// Redirect URI registered with the platform.
pub fn redirect_uri(config: &BridgeConfig) -> String {
    format!(
        "http://{}:{}{}",
        config.hostname, config.oauth_port, CALLBACK_PATH
    )
}

/// URL the subscriber has to open to grant access, carrying `state`.
pub fn authorization_url(config: &BridgeConfig, state: &str) -> Result<String> {
    let mut url = Url::parse(ACCOUNT_INTERLOCK_URL)
        .map_err(|e| Error::config(format!("Invalid interlock URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("clientId", &config.client_id)
        .append_pair("redirectUri", &redirect_uri(config))
        .append_pair("state", state);
    Ok(url.into())
}
