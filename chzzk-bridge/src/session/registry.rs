//! Per-subscriber session slots.
//!
//! Each subscriber owns at most one [`SessionFuture`]: a pending slot that is
//! resolved exactly once, either with an open live session or by
//! cancellation. Concurrent subscribe requests for the same subscriber share
//! the slot created by the first one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::gateway::LiveSession;

/// Awaiting a slot that was cancelled.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Session establishment was cancelled")]
pub struct SessionCancelled;

/// Resolution state of a slot.
#[derive(Clone)]
pub enum SlotState {
    Pending,
    Fulfilled(Arc<dyn LiveSession>),
    Cancelled,
}

impl fmt::Debug for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Fulfilled(session) => write!(f, "Fulfilled({})", session.account_id()),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// A session slot. Transitions `Pending -> Fulfilled | Cancelled` once.
pub struct SessionFuture {
    subscriber: Uuid,
    generation: u64,
    state: watch::Sender<SlotState>,
}

impl fmt::Debug for SessionFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFuture")
            .field("subscriber", &self.subscriber)
            .field("generation", &self.generation)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SessionFuture {
    fn new(subscriber: Uuid, generation: u64) -> Self {
        let (state, _) = watch::channel(SlotState::Pending);
        Self {
            subscriber,
            generation,
            state,
        }
    }

    pub fn subscriber(&self) -> Uuid {
        self.subscriber
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve with an open session. Hands the session back if the slot was
    /// already resolved.
    pub fn fulfill(&self, session: Arc<dyn LiveSession>) -> Result<(), Arc<dyn LiveSession>> {
        let mut session = Some(session);
        self.state.send_if_modified(|state| {
            if !matches!(state, SlotState::Pending) {
                return false;
            }
            match session.take() {
                Some(session) => {
                    *state = SlotState::Fulfilled(session);
                    true
                }
                None => false,
            }
        });
        match session {
            None => Ok(()),
            Some(session) => Err(session),
        }
    }

    /// Cancel a pending slot. Returns false if it was already resolved.
    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, SlotState::Pending) {
                *state = SlotState::Cancelled;
                true
            } else {
                false
            }
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), SlotState::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), SlotState::Cancelled)
    }

    /// The open session, if the slot is fulfilled.
    pub fn session(&self) -> Option<Arc<dyn LiveSession>> {
        match &*self.state.borrow() {
            SlotState::Fulfilled(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Wait for resolution. Fails immediately on a cancelled slot.
    pub async fn wait(&self) -> Result<Arc<dyn LiveSession>, SessionCancelled> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, SlotState::Pending))
            .await
            .map_err(|_| SessionCancelled)?;
        match &*state {
            SlotState::Fulfilled(session) => Ok(session.clone()),
            _ => Err(SessionCancelled),
        }
    }
}

/// Concurrent map of subscriber to session slot.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: DashMap<Uuid, Arc<SessionFuture>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the subscriber's slot, creating it if absent.
    ///
    /// The flag is true only for the caller that created the slot. A
    /// cancelled slot still in the map is replaced.
    pub fn acquire(&self, subscriber: Uuid) -> (Arc<SessionFuture>, bool) {
        match self.entries.entry(subscriber) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_cancelled() {
                    let future = self.new_future(subscriber);
                    entry.insert(future.clone());
                    (future, true)
                } else {
                    (entry.get().clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                let future = self.new_future(subscriber);
                entry.insert(future.clone());
                (future, true)
            }
        }
    }

    /// Remove the subscriber's slot without waiting on it.
    pub fn release(&self, subscriber: Uuid) -> Option<Arc<SessionFuture>> {
        self.entries.remove(&subscriber).map(|(_, future)| future)
    }

    /// Remove the subscriber's slot only if it is still `generation`.
    pub fn remove_if_current(&self, subscriber: Uuid, generation: u64) -> bool {
        self.entries
            .remove_if(&subscriber, |_, future| future.generation == generation)
            .is_some()
    }

    pub fn get(&self, subscriber: Uuid) -> Option<Arc<SessionFuture>> {
        self.entries.get(&subscriber).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, subscriber: Uuid) -> bool {
        self.entries.contains_key(&subscriber)
    }

    /// Number of registered slots, pending ones included.
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Remove and return every slot.
    pub fn drain(&self) -> Vec<Arc<SessionFuture>> {
        let subscribers: Vec<Uuid> = self.entries.iter().map(|entry| *entry.key()).collect();
        subscribers
            .into_iter()
            .filter_map(|subscriber| self.release(subscriber))
            .collect()
    }

    fn new_future(&self, subscriber: Uuid) -> Arc<SessionFuture> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Arc::new(SessionFuture::new(subscriber, generation))
    }
}
