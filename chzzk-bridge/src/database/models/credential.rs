//! External credential database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms};
use crate::{Error, Result};

/// One external-account credential per subscriber.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CredentialDbModel {
    /// Subscriber UUID (primary key)
    pub subscriber_id: String,
    /// Platform account (channel) id, unique across subscribers
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch milliseconds (UTC), already reduced by the safety skew.
    pub expires_at: i64,
    /// Highest ordinal delivered to the subscriber.
    pub last_delivered_cursor: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CredentialDbModel {
    /// Create a new credential with a zero delivery cursor.
    ///
    /// `expires_at` is stored as given; callers subtract the skew first.
    pub fn new(
        subscriber: Uuid,
        account_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = now_ms();
        Self {
            subscriber_id: subscriber.to_string(),
            account_id: account_id.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: datetime_to_ms(expires_at),
            last_delivered_cursor: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the stored subscriber id.
    pub fn subscriber(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.subscriber_id)
            .map_err(|e| Error::validation(format!("Invalid subscriber id in store: {e}")))
    }

    pub fn get_expires_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.expires_at)
    }

    /// Whether the access token can no longer be used as is.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= now_ms()
    }

    /// Whether two credentials bind the same account with the same tokens.
    pub fn same_tokens(&self, other: &Self) -> bool {
        self.account_id == other.account_id
            && self.access_token == other.access_token
            && self.refresh_token == other.refresh_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_credential() {
        let subscriber = Uuid::new_v4();
        let expires = Utc::now() + Duration::hours(1);
        let credential = CredentialDbModel::new(subscriber, "channel", "at", "rt", expires);

        assert_eq!(credential.subscriber().unwrap(), subscriber);
        assert_eq!(credential.last_delivered_cursor, 0);
        assert!(!credential.is_expired());
        assert_eq!(credential.expires_at, datetime_to_ms(expires));
    }

    #[test]
    fn test_expired_credential() {
        let credential = CredentialDbModel::new(
            Uuid::new_v4(),
            "channel",
            "at",
            "rt",
            Utc::now() - Duration::seconds(1),
        );
        assert!(credential.is_expired());
    }

    #[test]
    fn test_same_tokens_ignores_timestamps() {
        let expires = Utc::now();
        let a = CredentialDbModel::new(Uuid::new_v4(), "channel", "at", "rt", expires);
        let mut b = a.clone();
        b.updated_at += 10;
        b.expires_at -= 60_000;
        assert!(a.same_tokens(&b));

        b.access_token = "rotated".to_string();
        assert!(!a.same_tokens(&b));
    }
}
