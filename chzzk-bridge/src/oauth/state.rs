//! Short-lived authorization states.
//!
//! A state is an opaque CSRF token handed to the subscriber before the
//! account-interlock redirect and redeemed exactly once by the callback.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Default lifetime of an issued state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30);

/// Redeeming failed: the state was never issued, already redeemed, replaced
/// by a newer one, or expired.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Authorization state not found or expired")]
pub struct StateNotFound;

#[derive(Debug, Clone, Copy)]
struct IssuedState {
    subscriber: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct Indexes {
    by_token: HashMap<String, IssuedState>,
    by_subscriber: HashMap<Uuid, String>,
}

/// Issues and redeems authorization states.
pub struct StateRegistry {
    ttl: Duration,
    inner: Mutex<Indexes>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_TTL)
    }
}

impl StateRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Issue a fresh state for `subscriber`, invalidating any previous one.
    pub fn issue(&self, subscriber: Uuid) -> String {
        let token = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        let issued = IssuedState {
            subscriber,
            expires_at: Instant::now() + self.ttl,
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_subscriber.insert(subscriber, token.clone()) {
            inner.by_token.remove(&previous);
        }
        inner.by_token.insert(token.clone(), issued);
        token
    }

    /// Redeem a state. Succeeds at most once per issued state.
    pub fn redeem(&self, token: &str) -> Result<Uuid, StateNotFound> {
        let mut inner = self.inner.lock();
        let issued = inner.by_token.remove(token).ok_or(StateNotFound)?;
        if inner.by_subscriber.get(&issued.subscriber).map(String::as_str) == Some(token) {
            inner.by_subscriber.remove(&issued.subscriber);
        }

        if Instant::now() < issued.expires_at {
            Ok(issued.subscriber)
        } else {
            Err(StateNotFound)
        }
    }

    /// Drop expired states. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<(String, Uuid)> = inner
            .by_token
            .iter()
            .filter(|(_, issued)| issued.expires_at <= now)
            .map(|(token, issued)| (token.clone(), issued.subscriber))
            .collect();

        for (token, subscriber) in &expired {
            inner.by_token.remove(token);
            if inner.by_subscriber.get(subscriber) == Some(token) {
                inner.by_subscriber.remove(subscriber);
            }
        }
        expired.len()
    }

    /// Number of states currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
