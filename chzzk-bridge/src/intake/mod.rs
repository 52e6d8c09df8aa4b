//! Event intake.
//!
//! Live sessions dispatch raw platform events into [`EventIntake`], which
//! normalizes them and appends them to the event log. Every account gets its
//! own unbounded queue drained by a single writer task, so the session's
//! dispatch context never blocks and events of one account are appended in
//! arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::database::models::NewEvent;
use crate::database::repositories::EventRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::gateway::{ChatEvent, DonationEvent, EventSink};

/// Per-account writer slot.
enum WriterSlot {
    /// Writer accepting new events.
    Active(Writer),
    /// Detached writer still draining its queue. The next writer of the
    /// account waits for it before appending.
    Draining { generation: u64, done: CancellationToken },
}

struct Writer {
    generation: u64,
    tx: mpsc::UnboundedSender<NewEvent>,
    /// Cancelled once the writer task has exited.
    done: CancellationToken,
}

type WriterMap = Arc<DashMap<String, WriterSlot>>;

/// Normalizes live-session events and appends them to the event log.
pub struct EventIntake {
    events: Arc<dyn EventRepository>,
    writers: WriterMap,
    next_generation: AtomicU64,
    tracker: TaskTracker,
    runtime: Handle,
}

impl EventIntake {
    /// Create an intake bound to the current tokio runtime.
    ///
    /// Must be called from within a runtime; writer tasks are spawned on it
    /// even when events arrive from foreign threads.
    pub fn new(events: Arc<dyn EventRepository>) -> Self {
        Self {
            events,
            writers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
        }
    }

    /// Queue a normalized event for its account's writer.
    ///
    /// At most one writer per account appends at any time, so events of an
    /// account are stored in arrival order even across `detach`.
    pub fn submit(&self, event: NewEvent) {
        let mut slot = match self.writers.entry(event.account_id.clone()) {
            Entry::Occupied(slot) => slot,
            Entry::Vacant(slot) => {
                let writer = self.spawn_writer(event.account_id.clone(), None);
                slot.insert_entry(WriterSlot::Active(writer))
            }
        };

        let previous = match slot.get() {
            WriterSlot::Active(writer) => match writer.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    // Writer went away; its successor waits for it to exit.
                    warn!(account_id = %event.account_id, "Event writer closed, restarting");
                    let done = writer.done.clone();
                    let writer = self.spawn_writer(event.account_id.clone(), Some(done));
                    if writer.tx.send(event).is_err() {
                        error!("Dropped event: writer could not be started");
                    }
                    slot.insert(WriterSlot::Active(writer));
                    return;
                }
            },
            WriterSlot::Draining { done, .. } => done.clone(),
        };

        let writer = self.spawn_writer(event.account_id.clone(), Some(previous));
        if writer.tx.send(event).is_err() {
            error!("Dropped event: writer could not be started");
        }
        slot.insert(WriterSlot::Active(writer));
    }

    /// Let the account's writer drain its queue and exit.
    pub fn detach(&self, account_id: &str) {
        if let Some(mut slot) = self.writers.get_mut(account_id)
            && let WriterSlot::Active(writer) = &*slot
        {
            let draining = WriterSlot::Draining {
                generation: writer.generation,
                done: writer.done.clone(),
            };
            // Dropping the sender closes the queue once it is drained.
            *slot = draining;
            debug!(account_id = %account_id, "Detached event writer");
        }
    }

    /// Number of accounts with a writer accepting events.
    pub fn writer_count(&self) -> usize {
        self.writers
            .iter()
            .filter(|slot| matches!(slot.value(), WriterSlot::Active(_)))
            .count()
    }

    /// Detach every writer and wait until all queued events are appended.
    pub async fn shutdown(&self) {
        let accounts: Vec<String> = self.writers.iter().map(|slot| slot.key().clone()).collect();
        for account_id in &accounts {
            self.detach(account_id);
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        debug!("Event intake drained");
    }

    fn spawn_writer(&self, account_id: String, previous: Option<CancellationToken>) -> Writer {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let done = CancellationToken::new();
        self.tracker.spawn_on(
            run_writer(
                account_id,
                generation,
                self.events.clone(),
                self.writers.clone(),
                rx,
                previous,
                done.clone(),
            ),
            &self.runtime,
        );
        Writer {
            generation,
            tx,
            done,
        }
    }
}

async fn run_writer(
    account_id: String,
    generation: u64,
    events: Arc<dyn EventRepository>,
    writers: WriterMap,
    mut rx: mpsc::UnboundedReceiver<NewEvent>,
    previous: Option<CancellationToken>,
    done: CancellationToken,
) {
    let _done = done.drop_guard();
    if let Some(previous) = previous {
        previous.cancelled().await;
    }

    debug!(account_id = %account_id, "Event writer started");
    while let Some(event) = rx.recv().await {
        match retry_on_sqlite_busy("append_event", || events.append(&event)).await {
            Ok(stored) => {
                debug!(account_id = %account_id, ordinal = stored.ordinal, "Appended event");
            }
            Err(e) => {
                error!(account_id = %account_id, error = %e, "Failed to append event");
            }
        }
    }

    writers.remove_if(&account_id, |_, slot| {
        matches!(slot, WriterSlot::Draining { generation: g, .. } if *g == generation)
    });
    debug!(account_id = %account_id, "Event writer stopped");
}

impl EventSink for EventIntake {
    fn on_chat_event(&self, event: ChatEvent) {
        self.submit(NewEvent::chat(
            event.account_id,
            event.sender_id,
            event.sender_name,
            event.content,
            Utc::now(),
        ));
    }

    fn on_donation_event(&self, event: DonationEvent) {
        self.submit(NewEvent::donation(
            event.account_id,
            event.donator_id,
            event.donator_name,
            event.text,
            Utc::now(),
            event.pay_amount,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxEventRepository;
    use crate::database::test_support::setup_test_db;

    fn chat(account: &str, content: &str) -> ChatEvent {
        ChatEvent {
            account_id: account.to_string(),
            sender_id: "viewer-id".to_string(),
            sender_name: "viewer".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_are_appended_in_arrival_order() {
        let db = setup_test_db().await;
        let repo = Arc::new(SqlxEventRepository::new(
            db.pool.clone(),
            db.write_pool.clone(),
        ));
        let intake = EventIntake::new(repo.clone());

        for i in 0..10 {
            intake.on_chat_event(chat("channel", &format!("m{i}")));
        }
        intake.on_donation_event(DonationEvent {
            account_id: "channel".to_string(),
            donator_id: "fan-id".to_string(),
            donator_name: "fan".to_string(),
            text: "thanks".to_string(),
            pay_amount: 1000,
        });
        intake.on_chat_event(chat("other", "elsewhere"));
        assert_eq!(intake.writer_count(), 2);

        intake.shutdown().await;
        assert_eq!(intake.writer_count(), 0);

        let stored = repo.list_after("channel", 0, 100).await.unwrap();
        assert_eq!(stored.len(), 11);
        for (i, event) in stored.iter().take(10).enumerate() {
            assert_eq!(event.ordinal, i as i64 + 1);
            assert_eq!(event.message, format!("m{i}"));
            assert_eq!(event.pay_amount, 0);
        }
        assert_eq!(stored[10].pay_amount, 1000);
        assert_eq!(stored[10].sender_name, "fan");

        assert_eq!(repo.latest_ordinal("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_detach_keeps_arrival_order() {
        let db = setup_test_db().await;
        let repo = Arc::new(SqlxEventRepository::new(
            db.pool.clone(),
            db.write_pool.clone(),
        ));
        let intake = EventIntake::new(repo.clone());

        let mut expected = Vec::new();
        for round in 0..3 {
            for i in 0..50 {
                let message = format!("r{round}-m{i}");
                intake.on_chat_event(chat("channel", &message));
                expected.push(message);
            }
            intake.detach("channel");
            assert_eq!(intake.writer_count(), 0);
        }
        // A later event starts a new writer behind the draining ones.
        intake.on_chat_event(chat("channel", "last"));
        expected.push("last".to_string());
        assert_eq!(intake.writer_count(), 1);

        intake.shutdown().await;

        let stored = repo.list_after("channel", 0, 1000).await.unwrap();
        let messages: Vec<String> = stored.iter().map(|e| e.message.clone()).collect();
        assert_eq!(messages, expected);
        assert!(intake.writers.is_empty());
    }

    #[tokio::test]
    async fn test_drained_writer_releases_slot() {
        let db = setup_test_db().await;
        let repo = Arc::new(SqlxEventRepository::new(
            db.pool.clone(),
            db.write_pool.clone(),
        ));
        let intake = EventIntake::new(repo.clone());

        intake.on_chat_event(chat("channel", "only"));
        intake.detach("channel");

        for _ in 0..200 {
            if intake.writers.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(intake.writers.is_empty());
        assert_eq!(repo.latest_ordinal("channel").await.unwrap(), 1);
    }
}
