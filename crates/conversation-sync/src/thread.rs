//! Pure mutations on a thread's visible message list.
//!
//! The list is kept ascending by `(created_at, id)`, oldest first. Every
//! function here is synchronous and side-effect free; the service applies
//! them under the per-conversation lock and publishes the result.

use chat_types::{
    ConversationId, DeliveryState, Message, MessageCursor, MessageId, UserId,
};
use chrono::{DateTime, Utc};

fn sort_key(message: &Message) -> (DateTime<Utc>, MessageId) {
    (message.created_at, message.id.clone())
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let key = sort_key(&message);
    let position = messages.partition_point(|m| sort_key(m) <= key);
    messages.insert(position, message);
}

/// Merges an older page (as fetched, newest first) into the front of the
/// list. Returns how many rows were actually new.
pub fn merge_older_page(messages: &mut Vec<Message>, page_newest_first: Vec<Message>) -> usize {
    let mut added = 0;
    for message in page_newest_first {
        if messages.iter().any(|m| m.id == message.id) {
            continue;
        }
        insert_sorted(messages, message);
        added += 1;
    }
    added
}

/// Applies an event-delivered row. Returns true when the list changed.
///
/// Dedup is by id. A confirmed row from the current user additionally
/// replaces a pending optimistic entry with the same text, which covers the
/// race where the realtime event beats the send RPC response.
pub fn apply_incoming(
    messages: &mut Vec<Message>,
    incoming: Message,
    current_user: &UserId,
) -> bool {
    if messages.iter().any(|m| m.id == incoming.id) {
        return false;
    }

    if &incoming.sender_id == current_user {
        let pending = messages.iter_mut().find(|m| {
            m.delivery_state == DeliveryState::Optimistic
                && m.id.is_temporary()
                && m.text == incoming.text
        });
        if let Some(slot) = pending {
            *slot = incoming;
            return true;
        }
    }

    insert_sorted(messages, incoming);
    true
}

/// Replaces the optimistic entry with the server row, in place. If the row
/// already arrived via an event, the leftover optimistic entry is removed
/// instead.
pub fn confirm_send(messages: &mut Vec<Message>, temp_id: &MessageId, confirmed: Message) {
    if messages.iter().any(|m| m.id == confirmed.id) {
        messages.retain(|m| m.id != *temp_id);
        return;
    }
    if let Some(slot) = messages.iter_mut().find(|m| m.id == *temp_id) {
        *slot = confirmed;
    }
}

/// Marks the optimistic entry as failed. The entry stays visible.
pub fn mark_send_failed(messages: &mut Vec<Message>, temp_id: &MessageId) -> bool {
    match messages.iter_mut().find(|m| m.id == *temp_id) {
        Some(message) => {
            message.delivery_state = DeliveryState::Failed;
            true
        }
        None => false,
    }
}

/// Cursor pointing at the oldest server-confirmed row, for the next older
/// page. Locally generated entries never become cursors.
pub fn oldest_cursor(messages: &[Message]) -> Option<MessageCursor> {
    messages
        .iter()
        .find(|m| !m.id.is_temporary())
        .map(MessageCursor::from)
}

/// Client-side note appended to an open thread when membership changes.
/// Purely presentational; the server row of record is the participant table.
pub fn system_note(conversation_id: &ConversationId, author: &UserId, text: String, now: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::from_string(format!("note-{}", uuid::Uuid::new_v4())),
        conversation_id: conversation_id.clone(),
        sender_id: author.clone(),
        text,
        created_at: now,
        delivery_state: DeliveryState::Confirmed,
        reply_to_id: None,
    }
}
