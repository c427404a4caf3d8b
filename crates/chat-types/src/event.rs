//! Realtime change events.
//!
//! The transport delivers `{ table, operation, row }` payloads. They are
//! decoded exactly once, at the transport boundary, into the closed
//! [`ChangeEvent`] variant; consumers never pattern-match loose JSON. Rows
//! are hints: after a reconnect consumers refetch from the backend instead of
//! trusting event continuity.

use crate::types::{Conversation, Message, NotificationEntry};
use serde::{Deserialize, Serialize};

/// The change operation reported by the backend's replication feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// A change event as it arrives on the wire, before typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChangeEvent {
    pub table: String,
    pub operation: Operation,
    pub row: serde_json::Value,
}

/// The closed set of `(table, operation)` pairs the sync layer reacts to.
///
/// Anything else, including rows that fail to deserialize, lands in
/// [`ChangeEvent::Ignored`] and is dropped by consumers.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    ConversationInserted(Conversation),
    ConversationUpdated(Conversation),
    NotificationInserted(NotificationEntry),
    Ignored { table: String, operation: Operation },
}

impl RawChangeEvent {
    /// Types a raw event. Unknown tables, unhandled operations, and
    /// malformed rows all map to [`ChangeEvent::Ignored`].
    pub fn decode(self) -> ChangeEvent {
        let ignored = |table: String, operation: Operation| ChangeEvent::Ignored { table, operation };

        match (self.table.as_str(), self.operation) {
            ("messages", Operation::Insert) => match serde_json::from_value(self.row) {
                Ok(message) => ChangeEvent::MessageInserted(message),
                Err(_) => ignored(self.table, self.operation),
            },
            ("messages", Operation::Update) => match serde_json::from_value(self.row) {
                Ok(message) => ChangeEvent::MessageUpdated(message),
                Err(_) => ignored(self.table, self.operation),
            },
            ("conversations", Operation::Insert) => match serde_json::from_value(self.row) {
                Ok(conversation) => ChangeEvent::ConversationInserted(conversation),
                Err(_) => ignored(self.table, self.operation),
            },
            ("conversations", Operation::Update) => match serde_json::from_value(self.row) {
                Ok(conversation) => ChangeEvent::ConversationUpdated(conversation),
                Err(_) => ignored(self.table, self.operation),
            },
            ("notifications", Operation::Insert) => match serde_json::from_value(self.row) {
                Ok(entry) => ChangeEvent::NotificationInserted(entry),
                Err(_) => ignored(self.table, self.operation),
            },
            _ => ignored(self.table, self.operation),
        }
    }
}
