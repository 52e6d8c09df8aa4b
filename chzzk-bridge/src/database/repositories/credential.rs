//! Credential repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::Result;
use crate::database::begin_immediate;
use crate::database::models::CredentialDbModel;
use crate::database::time::now_ms;

/// Credential data access operations.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Credential stored for a subscriber.
    async fn get(&self, subscriber: Uuid) -> Result<Option<CredentialDbModel>>;

    /// Credential currently bound to a platform account.
    async fn find_by_account(&self, account_id: &str) -> Result<Option<CredentialDbModel>>;

    /// All stored credentials, oldest first.
    async fn list(&self) -> Result<Vec<CredentialDbModel>>;

    /// Insert or replace the subscriber's credential.
    ///
    /// A different subscriber previously bound to the same account loses its
    /// credential. The delivery cursor survives token rotation and resets when
    /// the subscriber switches accounts.
    async fn upsert(&self, credential: &CredentialDbModel) -> Result<()>;

    /// Delete the subscriber's credential. Returns whether one existed.
    async fn delete(&self, subscriber: Uuid) -> Result<bool>;

    /// Persist the last delivered ordinal.
    ///
    /// The stored value is clamped to the highest ordinal in the account's log.
    async fn update_cursor(&self, subscriber: Uuid, cursor: i64) -> Result<()>;
}

/// SQLx implementation of [`CredentialRepository`].
pub struct SqlxCredentialRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxCredentialRepository {
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl CredentialRepository for SqlxCredentialRepository {
    async fn get(&self, subscriber: Uuid) -> Result<Option<CredentialDbModel>> {
        let credential = sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credentials WHERE subscriber_id = ?",
        )
        .bind(subscriber.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn find_by_account(&self, account_id: &str) -> Result<Option<CredentialDbModel>> {
        let credential = sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credentials WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn list(&self) -> Result<Vec<CredentialDbModel>> {
        let credentials = sqlx::query_as::<_, CredentialDbModel>(
            "SELECT * FROM credentials ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    async fn upsert(&self, credential: &CredentialDbModel) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;

        sqlx::query("DELETE FROM credentials WHERE account_id = ? AND subscriber_id != ?")
            .bind(&credential.account_id)
            .bind(&credential.subscriber_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO credentials (
                subscriber_id, account_id, access_token, refresh_token, expires_at,
                last_delivered_cursor, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(subscriber_id) DO UPDATE SET
                last_delivered_cursor = CASE
                    WHEN credentials.account_id = excluded.account_id
                    THEN credentials.last_delivered_cursor
                    ELSE excluded.last_delivered_cursor
                END,
                account_id = excluded.account_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.subscriber_id)
        .bind(&credential.account_id)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at)
        .bind(credential.last_delivered_cursor)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, subscriber: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE subscriber_id = ?")
            .bind(subscriber.to_string())
            .execute(&self.write_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_cursor(&self, subscriber: Uuid, cursor: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials SET
                last_delivered_cursor = MIN(?, COALESCE(
                    (SELECT MAX(e.ordinal) FROM events e WHERE e.account_id = credentials.account_id),
                    0
                )),
                updated_at = ?
            WHERE subscriber_id = ?
            "#,
        )
        .bind(cursor.max(0))
        .bind(now_ms())
        .bind(subscriber.to_string())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::NewEvent;
    use crate::database::repositories::{EventRepository, SqlxEventRepository};
    use crate::database::test_support::setup_test_db;
    use chrono::{Duration, Utc};

    fn credential(subscriber: Uuid, account: &str, access: &str) -> CredentialDbModel {
        CredentialDbModel::new(
            subscriber,
            account,
            access,
            format!("{access}-refresh"),
            Utc::now() + Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        let subscriber = Uuid::new_v4();

        assert!(repo.get(subscriber).await.unwrap().is_none());

        repo.upsert(&credential(subscriber, "channel", "at1"))
            .await
            .unwrap();
        let stored = repo.get(subscriber).await.unwrap().unwrap();
        assert_eq!(stored.account_id, "channel");
        assert_eq!(stored.access_token, "at1");

        let by_account = repo.find_by_account("channel").await.unwrap().unwrap();
        assert_eq!(by_account.subscriber_id, subscriber.to_string());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_keeps_cursor() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        let events = SqlxEventRepository::new(db.pool.clone(), db.write_pool.clone());
        let subscriber = Uuid::new_v4();

        repo.upsert(&credential(subscriber, "channel", "at1"))
            .await
            .unwrap();
        for i in 0..3 {
            events
                .append(&NewEvent::chat("channel", "u", "n", format!("m{i}"), Utc::now()))
                .await
                .unwrap();
        }
        repo.update_cursor(subscriber, 2).await.unwrap();

        repo.upsert(&credential(subscriber, "channel", "at2"))
            .await
            .unwrap();
        let stored = repo.get(subscriber).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "at2");
        assert_eq!(stored.last_delivered_cursor, 2);

        // Switching accounts starts over.
        repo.upsert(&credential(subscriber, "other", "at3"))
            .await
            .unwrap();
        let stored = repo.get(subscriber).await.unwrap().unwrap();
        assert_eq!(stored.account_id, "other");
        assert_eq!(stored.last_delivered_cursor, 0);
    }

    #[tokio::test]
    async fn test_account_is_unique() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        repo.upsert(&credential(first, "channel", "at1")).await.unwrap();
        repo.upsert(&credential(second, "channel", "at2")).await.unwrap();

        assert!(repo.get(first).await.unwrap().is_none());
        assert_eq!(
            repo.find_by_account("channel").await.unwrap().unwrap().subscriber_id,
            second.to_string()
        );
    }

    #[tokio::test]
    async fn test_cursor_never_exceeds_log() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        let events = SqlxEventRepository::new(db.pool.clone(), db.write_pool.clone());
        let subscriber = Uuid::new_v4();

        repo.upsert(&credential(subscriber, "channel", "at")).await.unwrap();
        events
            .append(&NewEvent::chat("channel", "u", "n", "hi", Utc::now()))
            .await
            .unwrap();

        repo.update_cursor(subscriber, 10).await.unwrap();
        assert_eq!(
            repo.get(subscriber).await.unwrap().unwrap().last_delivered_cursor,
            1
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        let subscriber = Uuid::new_v4();

        repo.upsert(&credential(subscriber, "channel", "at")).await.unwrap();
        assert!(repo.delete(subscriber).await.unwrap());
        assert!(!repo.delete(subscriber).await.unwrap());
        assert!(repo.get(subscriber).await.unwrap().is_none());
    }
}
