//! Event log repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::Result;
use crate::database::begin_immediate;
use crate::database::models::{EventDbModel, NewEvent};

/// Append-only, cursor-addressable event log.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event, assigning the next ordinal for its account.
    async fn append(&self, event: &NewEvent) -> Result<EventDbModel>;

    /// Events of an account with `ordinal > after`, ascending, at most `limit`.
    async fn list_after(&self, account_id: &str, after: i64, limit: i64)
    -> Result<Vec<EventDbModel>>;

    /// Events of the account currently bound to `subscriber`, with `ordinal > after`.
    async fn list_after_for_subscriber(
        &self,
        subscriber: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<EventDbModel>>;

    /// Highest stored ordinal of an account, 0 when the log is empty.
    async fn latest_ordinal(&self, account_id: &str) -> Result<i64>;
}

/// SQLx implementation of [`EventRepository`].
pub struct SqlxEventRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxEventRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl EventRepository for SqlxEventRepository {
    async fn append(&self, event: &NewEvent) -> Result<EventDbModel> {
        // The write lock is held from the MAX() read until commit.
        let mut tx = begin_immediate(&self.write_pool).await?;

        let (ordinal,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM events WHERE account_id = ?",
        )
        .bind(&event.account_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO events (
                account_id, ordinal, sender_id, sender_name, message, occurred_at, pay_amount
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.account_id)
        .bind(ordinal)
        .bind(&event.sender_id)
        .bind(&event.sender_name)
        .bind(&event.message)
        .bind(event.occurred_at)
        .bind(event.pay_amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event.clone().into_stored(ordinal))
    }

    async fn list_after(
        &self,
        account_id: &str,
        after: i64,
        limit: i64,
    ) -> Result<Vec<EventDbModel>> {
        let events = sqlx::query_as::<_, EventDbModel>(
            r#"
            SELECT * FROM events
            WHERE account_id = ? AND ordinal > ?
            ORDER BY ordinal ASC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn list_after_for_subscriber(
        &self,
        subscriber: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<EventDbModel>> {
        let events = sqlx::query_as::<_, EventDbModel>(
            r#"
            SELECT e.* FROM events e
            JOIN credentials c ON c.account_id = e.account_id
            WHERE c.subscriber_id = ? AND e.ordinal > ?
            ORDER BY e.ordinal ASC
            LIMIT ?
            "#,
        )
        .bind(subscriber.to_string())
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn latest_ordinal(&self, account_id: &str) -> Result<i64> {
        let (ordinal,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(ordinal), 0) FROM events WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(ordinal)
    }
}
