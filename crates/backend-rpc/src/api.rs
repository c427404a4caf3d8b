//! The backend operations the sync layer depends on.

use async_trait::async_trait;
use chat_types::{
    BadgeCounts, Conversation, ConversationId, ConversationKind, ConversationSummary, Message,
    MessageCursor, MessageId, NewMessage, NotificationEntry, Participant, SyncResult, UserId,
    UserProfile,
};

/// Remote operations against the chat backend.
///
/// Every fetch that backs a list view is a single aggregate call; callers
/// must not fan out per row. Implementations map transport and status
/// failures into the shared [`chat_types::SyncError`] taxonomy.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// One call returning every conversation the user belongs to, joined
    /// with participants, preview, and unread count.
    async fn get_conversations_with_details(
        &self,
        user_id: &UserId,
    ) -> SyncResult<Vec<ConversationSummary>>;

    /// Messages ordered newest-first. With a cursor, returns rows strictly
    /// older than it (id tie-break on equal timestamps).
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageCursor>,
        limit: u32,
    ) -> SyncResult<Vec<Message>>;

    /// Inserts a message and returns the server row with its assigned id.
    async fn insert_message(&self, new_message: &NewMessage) -> SyncResult<Message>;

    /// Marks every message up to and including `through_message_id` as read
    /// for `user_id` in one call.
    async fn mark_messages_read_batch(
        &self,
        conversation_id: &ConversationId,
        through_message_id: &MessageId,
        user_id: &UserId,
    ) -> SyncResult<()>;

    /// Existence check for a direct conversation between two users.
    async fn find_dm_conversation(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> SyncResult<Option<ConversationId>>;

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        creator: &UserId,
        members: &[UserId],
    ) -> SyncResult<Conversation>;

    /// Adds members; the server re-validates permission and membership
    /// regardless of client-side checks.
    async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        user_ids: &[UserId],
        added_by: &UserId,
    ) -> SyncResult<Vec<Participant>>;

    async fn get_participants(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Participant>>;

    /// Authoritative per-category unread counts. The requests category is
    /// returned already collapsed to distinct subjects.
    async fn get_badge_counts(&self, user_id: &UserId) -> SyncResult<BadgeCounts>;

    async fn get_user_profile(&self, user_id: &UserId) -> SyncResult<UserProfile>;

    async fn list_notifications(&self, user_id: &UserId) -> SyncResult<Vec<NotificationEntry>>;

    async fn mark_all_notifications_read(&self, user_id: &UserId) -> SyncResult<()>;
}
