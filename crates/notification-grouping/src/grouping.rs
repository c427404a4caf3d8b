//! Pure grouping of notification rows.

use chat_types::{NotificationEntry, NotificationGroup, NotificationKind};
use std::collections::HashMap;

/// Collapses raw rows into presentation groups.
///
/// Message-kind rows are dropped first. Remaining rows partition by
/// `(kind, subject_id)`; every entry is kept inside its group, newest
/// first. Groups order by their latest activity, newest first.
pub fn group(entries: Vec<NotificationEntry>) -> Vec<NotificationGroup> {
    let mut partitions: HashMap<(NotificationKind, String), Vec<NotificationEntry>> =
        HashMap::new();
    for entry in entries {
        if entry.kind == NotificationKind::Message {
            continue;
        }
        partitions
            .entry((entry.kind, entry.subject_id.clone()))
            .or_default()
            .push(entry);
    }

    let mut groups: Vec<NotificationGroup> = partitions
        .into_iter()
        .map(|((kind, subject_id), mut entries)| {
            entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let latest_at = entries
                .iter()
                .map(|e| e.created_at)
                .max()
                .expect("partition is never empty");
            let unread_in_group = entries.iter().filter(|e| e.is_unread()).count() as u32;
            NotificationGroup {
                subject_id,
                kind,
                entries,
                latest_at,
                unread_in_group,
            }
        })
        .collect();
    groups.sort_by(|a, b| b.latest_at.cmp(&a.latest_at));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_types::UserId;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn entry(
        id: &str,
        kind: NotificationKind,
        subject: &str,
        secs: i64,
        read: bool,
    ) -> NotificationEntry {
        NotificationEntry {
            id: id.to_string(),
            kind,
            subject_id: subject.to_string(),
            actor_id: UserId::from_string("u2"),
            created_at: at(secs),
            read_at: read.then(|| at(secs + 1)),
        }
    }

    #[test]
    fn empty_input_empty_output() {
        assert!(group(Vec::new()).is_empty());
    }

    #[test]
    fn message_notifications_are_filtered_out() {
        let groups = group(vec![
            entry("n1", NotificationKind::Message, "c1", 10, false),
            entry("n2", NotificationKind::Request, "r1", 20, false),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, NotificationKind::Request);
    }

    #[test]
    fn same_subject_collapses_with_all_entries_kept() {
        let groups = group(vec![
            entry("n1", NotificationKind::Request, "r1", 10, true),
            entry("n2", NotificationKind::Request, "r1", 30, false),
            entry("n3", NotificationKind::Request, "r1", 20, false),
        ]);
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.entries.len(), 3);
        assert_eq!(g.latest_at, at(30));
        assert_eq!(g.unread_in_group, 2);
        // Entries newest first within the group.
        let ids: Vec<&str> = g.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n3", "n1"]);
    }

    #[test]
    fn same_subject_different_kind_stays_separate() {
        let groups = group(vec![
            entry("n1", NotificationKind::Request, "x", 10, false),
            entry("n2", NotificationKind::Announcement, "x", 20, false),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn groups_sorted_by_latest_activity_desc() {
        let groups = group(vec![
            entry("n1", NotificationKind::Request, "old", 10, false),
            entry("n2", NotificationKind::Announcement, "new", 50, false),
            entry("n3", NotificationKind::TownHall, "mid", 30, false),
        ]);
        let subjects: Vec<&str> = groups.iter().map(|g| g.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["new", "mid", "old"]);
    }
}
