//! Event log database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::database::time::{datetime_to_ms, ms_to_datetime};

/// A stored event. `ordinal` is assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventDbModel {
    /// Gapless per-account ordinal, also used as the SSE event id
    #[serde(rename = "id")]
    pub ordinal: i64,
    /// Platform account (channel) the event was received on
    #[serde(rename = "channelId")]
    pub account_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    /// Unix epoch milliseconds (UTC)
    #[serde(rename = "messageTime")]
    pub occurred_at: i64,
    /// Donation amount, 0 for chat
    pub pay_amount: i64,
}

impl EventDbModel {
    pub fn get_occurred_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.occurred_at)
    }
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub account_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    pub occurred_at: i64,
    pub pay_amount: i64,
}

impl NewEvent {
    /// A chat message, which never carries an amount.
    pub fn chat(
        account_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            message: message.into(),
            occurred_at: datetime_to_ms(occurred_at),
            pay_amount: 0,
        }
    }

    pub fn donation(
        account_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
        pay_amount: i64,
    ) -> Self {
        Self {
            pay_amount,
            ..Self::chat(account_id, sender_id, sender_name, message, occurred_at)
        }
    }

    /// Attach the ordinal assigned by the store.
    pub fn into_stored(self, ordinal: i64) -> EventDbModel {
        EventDbModel {
            ordinal,
            account_id: self.account_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            message: self.message,
            occurred_at: self.occurred_at,
            pay_amount: self.pay_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_has_no_amount() {
        let event = NewEvent::chat("channel", "u1", "viewer", "hello", Utc::now());
        assert_eq!(event.pay_amount, 0);
    }

    #[test]
    fn test_donation_amount() {
        let event = NewEvent::donation("channel", "u1", "viewer", "thanks", Utc::now(), 1000);
        assert_eq!(event.pay_amount, 1000);
        assert_eq!(event.message, "thanks");
    }

    #[test]
    fn test_wire_format() {
        let event = NewEvent::donation("channel", "u1", "viewer", "hi", ms_to_datetime(42), 500)
            .into_stored(7);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["channelId"], "channel");
        assert_eq!(json["senderId"], "u1");
        assert_eq!(json["senderName"], "viewer");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["messageTime"], 42);
        assert_eq!(json["payAmount"], 500);
    }
}
