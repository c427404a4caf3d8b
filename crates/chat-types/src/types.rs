//! Domain records mirrored from the backend's relational store.
//!
//! These types are owned by the sync layer: the UI observes them but never
//! mutates them directly. Mutations flow through fetch results or
//! event-driven patches.

use crate::ids::{ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a conversation is a two-party direct thread or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A conversation row plus the denormalized fields the list view needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Unread count for the current user, as of the last fetch or patch.
    pub unread_count: u32,
}

/// Membership row for one user in one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// An active member has not left the conversation. Permission-gated
    /// operations must filter on this.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Delivery lifecycle of a message as seen by this client.
///
/// A locally sent message starts as `Optimistic`, becomes `Confirmed` when
/// the create RPC succeeds, or `Failed` when it errors. Failed sends stay
/// visible; they are never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Optimistic,
    Confirmed,
    Failed,
}

impl Default for DeliveryState {
    fn default() -> Self {
        // Rows arriving from the server are confirmed by definition.
        DeliveryState::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_state: DeliveryState,
    pub reply_to_id: Option<MessageId>,
}

/// Pagination cursor pointing just past the oldest message the client holds.
///
/// Fetches use strict `created_at < cursor.created_at`, tie-breaking on `id`
/// when timestamps collide, so page boundaries never gap or duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

impl From<&Message> for MessageCursor {
    fn from(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id.clone(),
        }
    }
}

/// Payload for the message create RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub reply_to_id: Option<MessageId>,
}

/// A conversation joined with its participant rows, as returned by the
/// aggregate list RPC (one call for the whole list, never per-conversation
/// fan-out).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

/// Badge categories tracked by the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeCategory {
    Messages,
    Requests,
    Announcements,
    TownHall,
}

impl BadgeCategory {
    pub const ALL: [BadgeCategory; 4] = [
        BadgeCategory::Messages,
        BadgeCategory::Requests,
        BadgeCategory::Announcements,
        BadgeCategory::TownHall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeCategory::Messages => "messages",
            BadgeCategory::Requests => "requests",
            BadgeCategory::Announcements => "announcements",
            BadgeCategory::TownHall => "town_hall",
        }
    }
}

/// Per-category unread counters.
///
/// The authoritative poll result always overwrites any accumulated local
/// delta; deltas only bridge the interval between reconciliations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadgeCounts {
    pub messages: u32,
    pub requests: u32,
    pub announcements: u32,
    pub town_hall: u32,
    #[serde(default)]
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl BadgeCounts {
    pub fn get(&self, category: BadgeCategory) -> u32 {
        match category {
            BadgeCategory::Messages => self.messages,
            BadgeCategory::Requests => self.requests,
            BadgeCategory::Announcements => self.announcements,
            BadgeCategory::TownHall => self.town_hall,
        }
    }

    pub fn set(&mut self, category: BadgeCategory, value: u32) {
        match category {
            BadgeCategory::Messages => self.messages = value,
            BadgeCategory::Requests => self.requests = value,
            BadgeCategory::Announcements => self.announcements = value,
            BadgeCategory::TownHall => self.town_hall = value,
        }
    }

    pub fn total(&self) -> u32 {
        self.messages + self.requests + self.announcements + self.town_hall
    }
}

/// Kinds of raw notification rows the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Message activity. Filtered out before grouping: conversations already
    /// surface this through their unread counts.
    Message,
    Request,
    Announcement,
    TownHall,
}

/// A raw notification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub id: String,
    pub kind: NotificationKind,
    /// The entity the notification is about (request id, announcement id, ...).
    pub subject_id: String,
    pub actor_id: UserId,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl NotificationEntry {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

/// Notifications collapsed by `(kind, subject_id)` for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationGroup {
    pub subject_id: String,
    pub kind: NotificationKind,
    pub entries: Vec<NotificationEntry>,
    pub latest_at: DateTime<Utc>,
    pub unread_in_group: u32,
}

/// Minimal profile used to enrich incoming messages with sender identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Placeholder identity used when enrichment fails; the message still
    /// renders instead of blocking the thread.
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: "Unknown".to_string(),
            avatar_url: None,
        }
    }
}
