//! Observable notification feed with optimistic mark-all-read.

use crate::grouping::group;
use backend_rpc::BackendApi;
use chat_types::{
    Clock, NotificationEntry, NotificationGroup, NotificationListener, SyncResult, UserId,
};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Holds the user's notification rows and publishes their grouped form.
pub struct NotificationFeed {
    backend: Arc<dyn BackendApi>,
    clock: Arc<dyn Clock>,
    user_id: UserId,
    entries: Mutex<Vec<NotificationEntry>>,
    groups_tx: watch::Sender<Vec<NotificationGroup>>,
}

impl NotificationFeed {
    pub fn new(backend: Arc<dyn BackendApi>, clock: Arc<dyn Clock>, user_id: UserId) -> Self {
        let (groups_tx, _) = watch::channel(Vec::new());
        Self {
            backend,
            clock,
            user_id,
            entries: Mutex::new(Vec::new()),
            groups_tx,
        }
    }

    pub fn observe(&self) -> watch::Receiver<Vec<NotificationGroup>> {
        self.groups_tx.subscribe()
    }

    /// Listener handle the sync service calls with event-delivered rows.
    /// Holds a weak reference; entries arriving after the feed is dropped
    /// are discarded.
    pub fn handle(self: &Arc<Self>) -> FeedHandle {
        FeedHandle {
            feed: Arc::downgrade(self),
        }
    }

    /// Replaces the feed with the backend's current rows.
    pub async fn refresh(&self) -> SyncResult<()> {
        let rows = self.backend.list_notifications(&self.user_id).await?;
        let mut entries = self.entries.lock().await;
        *entries = rows;
        self.groups_tx.send_replace(group(entries.clone()));
        debug!(count = entries.len(), "notification feed refreshed");
        Ok(())
    }

    /// Applies one event-delivered row without a refetch.
    pub async fn ingest(&self, entry: NotificationEntry) {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return;
        }
        entries.push(entry);
        self.groups_tx.send_replace(group(entries.clone()));
    }

    /// Marks every notification read: the feed shows zero unread
    /// immediately, the RPC follows, and a failure rolls the feed back.
    pub async fn mark_all_read(&self) -> SyncResult<()> {
        let previous = {
            let mut entries = self.entries.lock().await;
            let previous = entries.clone();
            let now = self.clock.now();
            for entry in entries.iter_mut() {
                if entry.read_at.is_none() {
                    entry.read_at = Some(now);
                }
            }
            self.groups_tx.send_replace(group(entries.clone()));
            previous
        };

        match self.backend.mark_all_notifications_read(&self.user_id).await {
            Ok(()) => {
                debug!("all notifications marked read");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "mark-all-read failed, rolling back");
                let mut entries = self.entries.lock().await;
                *entries = previous;
                self.groups_tx.send_replace(group(entries.clone()));
                Err(e)
            }
        }
    }
}

/// Cloneable [`NotificationListener`] over the feed.
#[derive(Clone)]
pub struct FeedHandle {
    feed: Weak<NotificationFeed>,
}

impl NotificationListener for FeedHandle {
    fn notification_inserted(&self, entry: NotificationEntry) {
        let Some(feed) = self.feed.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            feed.ingest(entry).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chat_types::{
        BadgeCounts, Conversation, ConversationId, ConversationKind, ConversationSummary,
        ManualClock, Message, MessageCursor, MessageId, NewMessage, NotificationKind, Participant,
        SyncError, UserProfile,
    };
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NotificationBackend {
        rows: StdMutex<Vec<NotificationEntry>>,
        fail_mark: AtomicBool,
    }

    impl NotificationBackend {
        fn new(rows: Vec<NotificationEntry>) -> Arc<Self> {
            Arc::new(Self {
                rows: StdMutex::new(rows),
                fail_mark: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BackendApi for NotificationBackend {
        async fn list_notifications(
            &self,
            _user_id: &UserId,
        ) -> SyncResult<Vec<NotificationEntry>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn mark_all_notifications_read(&self, _user_id: &UserId) -> SyncResult<()> {
            if self.fail_mark.load(Ordering::SeqCst) {
                return Err(SyncError::Network("connection reset".to_string()));
            }
            Ok(())
        }

        async fn get_conversations_with_details(
            &self,
            _user_id: &UserId,
        ) -> SyncResult<Vec<ConversationSummary>> {
            Ok(Vec::new())
        }

        async fn fetch_messages(
            &self,
            _conversation_id: &ConversationId,
            _before: Option<&MessageCursor>,
            _limit: u32,
        ) -> SyncResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn insert_message(&self, _new_message: &NewMessage) -> SyncResult<Message> {
            unimplemented!("not used by the notification feed")
        }

        async fn mark_messages_read_batch(
            &self,
            _conversation_id: &ConversationId,
            _through_message_id: &MessageId,
            _user_id: &UserId,
        ) -> SyncResult<()> {
            Ok(())
        }

        async fn find_dm_conversation(
            &self,
            _user_a: &UserId,
            _user_b: &UserId,
        ) -> SyncResult<Option<ConversationId>> {
            Ok(None)
        }

        async fn create_conversation(
            &self,
            _kind: ConversationKind,
            _creator: &UserId,
            _members: &[UserId],
        ) -> SyncResult<Conversation> {
            unimplemented!("not used by the notification feed")
        }

        async fn add_participants(
            &self,
            _conversation_id: &ConversationId,
            _user_ids: &[UserId],
            _added_by: &UserId,
        ) -> SyncResult<Vec<Participant>> {
            Ok(Vec::new())
        }

        async fn get_participants(
            &self,
            _conversation_id: &ConversationId,
        ) -> SyncResult<Vec<Participant>> {
            Ok(Vec::new())
        }

        async fn get_badge_counts(&self, _user_id: &UserId) -> SyncResult<BadgeCounts> {
            Ok(BadgeCounts::default())
        }

        async fn get_user_profile(&self, user_id: &UserId) -> SyncResult<UserProfile> {
            Ok(UserProfile::placeholder(user_id.clone()))
        }
    }

    fn row(id: &str, subject: &str, secs: i64, read: bool) -> NotificationEntry {
        let created_at = Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap();
        NotificationEntry {
            id: id.to_string(),
            kind: NotificationKind::Request,
            subject_id: subject.to_string(),
            actor_id: UserId::from_string("u2"),
            created_at,
            read_at: read.then(|| created_at),
        }
    }

    fn feed(backend: Arc<NotificationBackend>) -> NotificationFeed {
        NotificationFeed::new(
            backend,
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
        )
    }

    fn total_unread(groups: &[chat_types::NotificationGroup]) -> u32 {
        groups.iter().map(|g| g.unread_in_group).sum()
    }

    #[tokio::test]
    async fn refresh_publishes_grouped_rows() {
        let backend = NotificationBackend::new(vec![
            row("n1", "r1", 10, false),
            row("n2", "r1", 20, false),
            row("n3", "r2", 30, true),
        ]);
        let feed = feed(backend);
        let rx = feed.observe();

        feed.refresh().await.unwrap();

        let groups = rx.borrow();
        assert_eq!(groups.len(), 2);
        assert_eq!(total_unread(&groups), 2);
    }

    #[tokio::test]
    async fn ingest_dedups_by_id() {
        let backend = NotificationBackend::new(Vec::new());
        let feed = feed(backend);
        let rx = feed.observe();

        feed.ingest(row("n1", "r1", 10, false)).await;
        feed.ingest(row("n1", "r1", 10, false)).await;

        assert_eq!(rx.borrow().len(), 1);
        assert_eq!(rx.borrow()[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn mark_all_read_zeroes_immediately() {
        let backend = NotificationBackend::new(vec![
            row("n1", "r1", 10, false),
            row("n2", "r2", 20, false),
        ]);
        let feed = feed(backend);
        let rx = feed.observe();
        feed.refresh().await.unwrap();

        feed.mark_all_read().await.unwrap();
        assert_eq!(total_unread(&rx.borrow()), 0);
    }

    #[tokio::test]
    async fn handle_routes_entries_into_feed() {
        let backend = NotificationBackend::new(Vec::new());
        let feed = Arc::new(feed(backend));
        let mut rx = feed.observe();

        feed.handle().notification_inserted(row("n1", "r1", 10, false));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while rx.borrow().is_empty() {
                rx.changed().await.expect("feed watch closed");
            }
        })
        .await
        .expect("entry not ingested");
        assert_eq!(rx.borrow()[0].entries[0].id, "n1");
    }

    #[tokio::test]
    async fn failed_mark_all_read_rolls_back() {
        let backend = NotificationBackend::new(vec![
            row("n1", "r1", 10, false),
            row("n2", "r2", 20, false),
        ]);
        backend.fail_mark.store(true, Ordering::SeqCst);
        let feed = feed(backend);
        let rx = feed.observe();
        feed.refresh().await.unwrap();

        let err = feed.mark_all_read().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(total_unread(&rx.borrow()), 2);
    }
}
