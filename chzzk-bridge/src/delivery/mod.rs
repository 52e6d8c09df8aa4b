//! Resumable event delivery.
//!
//! A [`DeliveryStream`] reads a subscriber's event log from a cursor and
//! yields the events as a stream consumed by the SSE response. An event's
//! ordinal is persisted only once the consumer has taken it and polls for
//! the next one, so the stored cursor never passes an event the response
//! did not accept. Delivery is at-least-once: a reconnecting client may see
//! the last event of the previous connection again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::database::models::EventDbModel;
use crate::database::repositories::{CredentialRepository, EventRepository};

/// Default number of events fetched per query.
pub const DEFAULT_BATCH_SIZE: i64 = 256;

/// Delivery loop settings.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Pick the starting cursor: client resume ordinal, else the persisted
/// cursor, else 0.
pub async fn resolve_cursor(
    credentials: &dyn CredentialRepository,
    subscriber: Uuid,
    resume_from: Option<i64>,
) -> Result<i64> {
    if let Some(ordinal) = resume_from {
        return Ok(ordinal.max(0));
    }
    let persisted = credentials
        .get(subscriber)
        .await?
        .map(|credential| credential.last_delivered_cursor)
        .unwrap_or(0);
    Ok(persisted)
}

/// Per-connection delivery state.
pub struct DeliveryStream {
    subscriber: Uuid,
    /// Ordinal of the last event the consumer accepted.
    cursor: i64,
    /// Highest ordinal read from the log.
    fetched: i64,
    /// Yielded but not yet accepted.
    in_flight: Option<i64>,
    pending_commit: Option<i64>,
    buffer: VecDeque<EventDbModel>,
    credentials: Arc<dyn CredentialRepository>,
    events: Arc<dyn EventRepository>,
    config: DeliveryConfig,
}

impl DeliveryStream {
    pub fn new(
        subscriber: Uuid,
        cursor: i64,
        credentials: Arc<dyn CredentialRepository>,
        events: Arc<dyn EventRepository>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            subscriber,
            cursor,
            fetched: cursor,
            in_flight: None,
            pending_commit: None,
            buffer: VecDeque::new(),
            credentials,
            events,
            config,
        }
    }

    /// Ordinal of the last event the consumer accepted.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Events after the cursor in ordinal order: the backlog first, then
    /// whatever the poll loop finds. Ends when `shutdown` fires; dropping
    /// the stream ends delivery without accepting the in-flight event.
    pub fn into_stream(
        self,
        shutdown: CancellationToken,
    ) -> impl Stream<Item = EventDbModel> + Send + 'static {
        debug!(subscriber = %self.subscriber, cursor = self.cursor, "Delivery started");
        stream::unfold((self, shutdown), |(mut delivery, shutdown)| async move {
            let event = delivery.next_event(&shutdown).await?;
            Some((event, (delivery, shutdown)))
        })
    }

    async fn next_event(&mut self, shutdown: &CancellationToken) -> Option<EventDbModel> {
        // Being polled again means the previous event was accepted.
        if let Some(ordinal) = self.in_flight.take() {
            self.cursor = ordinal;
            self.pending_commit = Some(ordinal);
        }
        self.commit_cursor().await;

        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.in_flight = Some(event.ordinal);
                return Some(event);
            }
            if shutdown.is_cancelled() {
                break;
            }
            if self.fill_buffer().await {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            self.commit_cursor().await;
        }

        self.commit_cursor().await;
        debug!(subscriber = %self.subscriber, cursor = self.cursor, "Delivery stopped");
        None
    }

    /// Read the next batch after the fetched position. Returns whether
    /// anything was read.
    async fn fill_buffer(&mut self) -> bool {
        let batch = match self
            .events
            .list_after_for_subscriber(self.subscriber, self.fetched, self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(subscriber = %self.subscriber, error = %e, "Failed to read event log");
                return false;
            }
        };
        let Some(last) = batch.last() else {
            return false;
        };
        self.fetched = last.ordinal;
        self.buffer.extend(batch);
        true
    }

    async fn commit_cursor(&mut self) {
        let Some(cursor) = self.pending_commit else {
            return;
        };
        match self.credentials.update_cursor(self.subscriber, cursor).await {
            Ok(()) => self.pending_commit = None,
            Err(e) => warn!(
                subscriber = %self.subscriber,
                cursor,
                error = %e,
                "Failed to persist delivery cursor, retrying next tick"
            ),
        }
    }
}
