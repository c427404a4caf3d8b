//! Poll loop and command surface.

use crate::ledger::BadgeLedger;
use backend_rpc::BackendApi;
use chat_types::{BadgeCategory, BadgeCounts, Clock, CountListener, UserId};
use realtime_mux::ConnectionStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BadgeConfig {
    /// Poll cadence while the realtime transport is connected.
    pub poll_interval_connected: Duration,
    /// Poll cadence while disconnected; polling is then the only source of
    /// freshness, but a tight loop would hammer a possibly-degraded backend.
    pub poll_interval_disconnected: Duration,
}

impl Default for BadgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_connected: Duration::from_secs(10),
            poll_interval_disconnected: Duration::from_secs(90),
        }
    }
}

fn poll_interval(status: ConnectionStatus, config: &BadgeConfig) -> Duration {
    if status.is_connected() {
        config.poll_interval_connected
    } else {
        config.poll_interval_disconnected
    }
}

enum BadgeCommand {
    Delta(BadgeCategory, i32),
    RequestSubjectRead(String),
    Reconcile,
}

/// Cloneable command surface of the engine. Implements [`CountListener`] so
/// the sync service can report count-affecting writes without a direct
/// dependency on the engine.
#[derive(Clone)]
pub struct BadgeHandle {
    tx: mpsc::UnboundedSender<BadgeCommand>,
}

impl CountListener for BadgeHandle {
    fn count_changed(&self, category: BadgeCategory, delta: i32) {
        let _ = self.tx.send(BadgeCommand::Delta(category, delta));
    }

    fn request_subject_read(&self, subject_id: &str) {
        let _ = self
            .tx
            .send(BadgeCommand::RequestSubjectRead(subject_id.to_string()));
    }

    fn reconcile_now(&self) {
        let _ = self.tx.send(BadgeCommand::Reconcile);
    }
}

/// Owns the badge poll task. Observers watch [`BadgeEngine::observe`];
/// nothing else reads or writes badge state.
pub struct BadgeEngine {
    handle: BadgeHandle,
    counts_rx: watch::Receiver<BadgeCounts>,
    task: JoinHandle<()>,
}

impl BadgeEngine {
    /// Starts the poll loop. The first authoritative poll happens
    /// immediately.
    pub fn start(
        backend: Arc<dyn BackendApi>,
        clock: Arc<dyn Clock>,
        user_id: UserId,
        status: watch::Receiver<ConnectionStatus>,
        config: BadgeConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (counts_tx, counts_rx) = watch::channel(BadgeCounts::default());
        let task = tokio::spawn(run(backend, clock, user_id, status, config, rx, counts_tx));
        Self {
            handle: BadgeHandle { tx },
            counts_rx,
            task,
        }
    }

    pub fn handle(&self) -> BadgeHandle {
        self.handle.clone()
    }

    pub fn observe(&self) -> watch::Receiver<BadgeCounts> {
        self.counts_rx.clone()
    }
}

impl Drop for BadgeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    backend: Arc<dyn BackendApi>,
    clock: Arc<dyn Clock>,
    user_id: UserId,
    mut status: watch::Receiver<ConnectionStatus>,
    config: BadgeConfig,
    mut commands: mpsc::UnboundedReceiver<BadgeCommand>,
    counts_tx: watch::Sender<BadgeCounts>,
) {
    let mut ledger = BadgeLedger::new();
    let mut was_connected = status.borrow().is_connected();
    let mut period = poll_interval(*status.borrow(), &config);
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(BadgeCommand::Delta(category, delta)) => {
                    ledger.apply_delta(category, delta);
                    counts_tx.send_replace(ledger.visible());
                    debug!(category = category.as_str(), delta, "optimistic badge delta");
                }
                Some(BadgeCommand::RequestSubjectRead(subject_id)) => {
                    ledger.request_subject_read(&subject_id);
                    counts_tx.send_replace(ledger.visible());
                }
                Some(BadgeCommand::Reconcile) => {
                    poll(&backend, &clock, &user_id, &mut ledger, &counts_tx).await;
                }
                None => break,
            },
            _ = ticker.tick() => {
                poll(&backend, &clock, &user_id, &mut ledger, &counts_tx).await;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = status.borrow().is_connected();
                let next = poll_interval(*status.borrow(), &config);
                if next != period {
                    period = next;
                    ticker = tokio::time::interval_at(
                        tokio::time::Instant::now() + period,
                        period,
                    );
                    debug!(period_secs = period.as_secs(), "poll cadence changed");
                }
                // Events may have been missed while offline; reconcile right
                // away instead of waiting out the first tick.
                if connected && !was_connected {
                    poll(&backend, &clock, &user_id, &mut ledger, &counts_tx).await;
                }
                was_connected = connected;
            }
        }
    }
    debug!("badge engine stopped");
}

async fn poll(
    backend: &Arc<dyn BackendApi>,
    clock: &Arc<dyn Clock>,
    user_id: &UserId,
    ledger: &mut BadgeLedger,
    counts_tx: &watch::Sender<BadgeCounts>,
) {
    match backend.get_badge_counts(user_id).await {
        Ok(mut counts) => {
            counts.last_reconciled_at = Some(clock.now());
            ledger.reconcile(counts);
            counts_tx.send_replace(ledger.visible());
            debug!(total = ledger.visible().total(), "badge counts reconciled");
        }
        Err(e) => {
            // Keep the current estimate; the next tick tries again.
            warn!(error = %e, "badge poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chat_types::{
        Conversation, ConversationId, ConversationKind, ConversationSummary, ManualClock, Message,
        MessageCursor, MessageId, NewMessage, NotificationEntry, Participant, SyncResult,
        UserProfile,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountsBackend {
        counts: StdMutex<BadgeCounts>,
        polls: AtomicUsize,
    }

    impl CountsBackend {
        fn new(counts: BadgeCounts) -> Arc<Self> {
            Arc::new(Self {
                counts: StdMutex::new(counts),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendApi for CountsBackend {
        async fn get_badge_counts(&self, _user_id: &UserId) -> SyncResult<BadgeCounts> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.counts.lock().unwrap().clone())
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
            unimplemented!("not used by the badge engine")
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
            unimplemented!("not used by the badge engine")
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

        async fn get_user_profile(&self, user_id: &UserId) -> SyncResult<UserProfile> {
            Ok(UserProfile::placeholder(user_id.clone()))
        }

        async fn list_notifications(
            &self,
            _user_id: &UserId,
        ) -> SyncResult<Vec<NotificationEntry>> {
            Ok(Vec::new())
        }

        async fn mark_all_notifications_read(&self, _user_id: &UserId) -> SyncResult<()> {
            Ok(())
        }
    }

    fn counts(messages: u32) -> BadgeCounts {
        BadgeCounts {
            messages,
            ..BadgeCounts::default()
        }
    }

    async fn wait_for_counts<F>(rx: &mut watch::Receiver<BadgeCounts>, predicate: F)
    where
        F: Fn(&BadgeCounts) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if predicate(&rx.borrow()) {
                    return;
                }
                rx.changed().await.expect("counts watch closed");
            }
        })
        .await
        .expect("counts condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn startup_poll_publishes_authoritative_counts() {
        let backend = CountsBackend::new(counts(7));
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let engine = BadgeEngine::start(
            backend.clone(),
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
            status_rx,
            BadgeConfig::default(),
        );

        let mut rx = engine.observe();
        wait_for_counts(&mut rx, |c| c.messages == 7).await;
        assert!(rx.borrow().last_reconciled_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delta_adjusts_then_poll_overwrites() {
        let backend = CountsBackend::new(counts(5));
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let engine = BadgeEngine::start(
            backend.clone(),
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
            status_rx,
            BadgeConfig::default(),
        );
        let mut rx = engine.observe();
        wait_for_counts(&mut rx, |c| c.messages == 5).await;

        let handle = engine.handle();
        handle.count_changed(BadgeCategory::Messages, -3);
        wait_for_counts(&mut rx, |c| c.messages == 2).await;

        // The server meanwhile says 9; reconcile wins over the delta.
        *backend.counts.lock().unwrap() = counts(9);
        handle.reconcile_now();
        wait_for_counts(&mut rx, |c| c.messages == 9).await;
    }

    #[tokio::test(start_paused = true)]
    async fn request_reads_collapse_per_subject() {
        let backend = CountsBackend::new(BadgeCounts {
            requests: 3,
            ..BadgeCounts::default()
        });
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let engine = BadgeEngine::start(
            backend,
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
            status_rx,
            BadgeConfig::default(),
        );
        let mut rx = engine.observe();
        wait_for_counts(&mut rx, |c| c.requests == 3).await;

        let handle = engine.handle();
        handle.request_subject_read("subject-a");
        handle.request_subject_read("subject-a");
        wait_for_counts(&mut rx, |c| c.requests == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_cadence_is_slower() {
        let backend = CountsBackend::new(counts(0));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let _engine = BadgeEngine::start(
            backend.clone(),
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
            status_rx,
            BadgeConfig::default(),
        );

        // Connected: startup poll plus one per 10s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let connected_polls = backend.polls.load(Ordering::SeqCst);
        assert!(connected_polls >= 3, "got {connected_polls}");

        status_tx.send(ConnectionStatus::Disconnected).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let baseline = backend.polls.load(Ordering::SeqCst);

        // Disconnected: next poll only after the long interval.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.polls.load(Ordering::SeqCst), baseline);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(backend.polls.load(Ordering::SeqCst) > baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_polls_immediately() {
        let backend = CountsBackend::new(counts(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let engine = BadgeEngine::start(
            backend.clone(),
            Arc::new(ManualClock::starting_now()),
            UserId::from_string("me"),
            status_rx,
            BadgeConfig::default(),
        );
        let mut rx = engine.observe();
        wait_for_counts(&mut rx, |c| c.messages == 1).await;

        let before = backend.polls.load(Ordering::SeqCst);
        *backend.counts.lock().unwrap() = counts(4);
        status_tx.send(ConnectionStatus::Connected).unwrap();

        // No time passes here, so the first ticker tick cannot fire; only
        // the edge reaction can produce a poll.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(backend.polls.load(Ordering::SeqCst) > before);
        assert_eq!(rx.borrow().messages, 4);
    }

    #[test]
    fn config_defaults() {
        let config = BadgeConfig::default();
        assert_eq!(config.poll_interval_connected, Duration::from_secs(10));
        assert_eq!(config.poll_interval_disconnected, Duration::from_secs(90));
    }

    #[test]
    fn interval_follows_connectivity() {
        let config = BadgeConfig::default();
        assert_eq!(
            poll_interval(ConnectionStatus::Connected, &config),
            config.poll_interval_connected
        );
        assert_eq!(
            poll_interval(ConnectionStatus::Disconnected, &config),
            config.poll_interval_disconnected
        );
        assert_eq!(
            poll_interval(ConnectionStatus::Connecting, &config),
            config.poll_interval_disconnected
        );
    }
}
