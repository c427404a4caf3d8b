//! Query-string construction for the messages table.

use chat_types::{ConversationId, MessageCursor};

/// Builds the PostgREST query for one page of messages, newest first.
///
/// The cursor filter is strict: `created_at < cursor.created_at`, or equal
/// timestamp with a smaller id. Combined with the matching
/// `created_at.desc,id.desc` ordering this makes page boundaries exact even
/// when timestamps collide.
pub fn messages_query(
    conversation_id: &ConversationId,
    before: Option<&MessageCursor>,
    limit: u32,
) -> String {
    let mut query = format!(
        "conversation_id=eq.{}&order=created_at.desc,id.desc&limit={}",
        conversation_id, limit
    );
    if let Some(cursor) = before {
        let ts = cursor.created_at.to_rfc3339();
        query.push_str(&format!(
            "&or=(created_at.lt.{ts},and(created_at.eq.{ts},id.lt.{id}))",
            id = cursor.id
        ));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_types::MessageId;
    use chrono::{TimeZone, Utc};

    #[test]
    fn first_page_has_no_cursor_filter() {
        let query = messages_query(&ConversationId::from_string("c1"), None, 25);
        assert_eq!(
            query,
            "conversation_id=eq.c1&order=created_at.desc,id.desc&limit=25"
        );
    }

    #[test]
    fn cursor_filter_is_strict_with_id_tie_break() {
        let cursor = MessageCursor {
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            id: MessageId::from_string("m42"),
        };
        let query = messages_query(&ConversationId::from_string("c1"), Some(&cursor), 25);
        assert!(query.contains("created_at.lt.2026-01-02T03:04:05+00:00"));
        assert!(query.contains("and(created_at.eq.2026-01-02T03:04:05+00:00,id.lt.m42)"));
    }
}
