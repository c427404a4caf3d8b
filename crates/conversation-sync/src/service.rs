//! The sync service and its background reaction loops.

use crate::config::SyncConfig;
use crate::thread::{
    apply_incoming, confirm_send, mark_send_failed, merge_older_page, oldest_cursor, system_note,
};
use backend_rpc::BackendApi;
use chat_types::{
    BadgeCategory, ChangeEvent, Clock, ConversationId, ConversationKind, ConversationSummary,
    CountListener, DeliveryState, Message, MessageCursor, MessageId, NewMessage,
    NotificationListener, Participant, SyncError, SyncResult, UserId, UserProfile,
};
use chrono::{DateTime, Utc};
use realtime_mux::{
    ChannelKey, ConnectionStatus, SubscriptionHandle, SubscriptionMultiplexer, TransportEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mutable state of one open conversation. Guarded by its own mutex so all
/// thread mutations serialize per conversation.
struct ThreadState {
    messages: Vec<Message>,
    watch_tx: watch::Sender<Vec<Message>>,
    subscription: SubscriptionHandle,
    last_send_at: Option<DateTime<Utc>>,
    load_task: Option<JoinHandle<()>>,
}

impl ThreadState {
    fn publish(&self) {
        self.watch_tx.send_replace(self.messages.clone());
    }
}

struct SyncCore {
    backend: Arc<dyn BackendApi>,
    mux: Arc<SubscriptionMultiplexer>,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn CountListener>,
    notifications: Arc<dyn NotificationListener>,
    config: SyncConfig,
    current_user: UserId,
    conversations: ttl_cache::TtlCache<UserId, Vec<ConversationSummary>>,
    first_pages: ttl_cache::TtlCache<ConversationId, Vec<Message>>,
    profiles: ttl_cache::TtlCache<UserId, UserProfile>,
    threads: Mutex<HashMap<ConversationId, Arc<Mutex<ThreadState>>>>,
}

/// Client-facing synchronization service.
///
/// Construction spawns the event reaction loop and the reconnect watcher,
/// and subscribes the user-scoped conversation-list and notification
/// channels; dropping the service stops the loops. All methods are cheap to
/// call from any task; long work happens on spawned tasks or behind awaits.
pub struct SyncService {
    core: Arc<SyncCore>,
    background: Vec<JoinHandle<()>>,
}

impl SyncService {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        mux: Arc<SubscriptionMultiplexer>,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn CountListener>,
        notifications: Arc<dyn NotificationListener>,
        config: SyncConfig,
        current_user: UserId,
    ) -> Self {
        let core = Arc::new(SyncCore {
            backend,
            conversations: ttl_cache::TtlCache::new(clock.clone()),
            first_pages: ttl_cache::TtlCache::new(clock.clone()),
            profiles: ttl_cache::TtlCache::new(clock.clone()),
            mux,
            clock,
            listener,
            notifications,
            config,
            current_user,
            threads: Mutex::new(HashMap::new()),
        });

        let events = core.mux.events();
        let status = core.mux.status();
        let startup = core.clone();
        let background = vec![
            tokio::spawn(run_event_loop(Arc::downgrade(&core), events)),
            tokio::spawn(run_status_watcher(Arc::downgrade(&core), status)),
            tokio::spawn(async move { startup.subscribe_user_channels().await }),
        ];

        Self { core, background }
    }

    /// The user's conversation list, joined with participants. One aggregate
    /// backend call at most per TTL window.
    pub async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.core.fetch_conversations().await
    }

    /// Opens a conversation: subscribes its realtime channel, starts loading
    /// the newest page, and returns the thread's watch stream.
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<watch::Receiver<Vec<Message>>> {
        self.core.open_conversation(conversation_id).await
    }

    /// Closes a conversation: aborts any in-flight load and releases the
    /// realtime subscription. A late load completion is discarded silently.
    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        self.core.close_conversation(conversation_id).await;
    }

    /// One page of messages, newest first. Without a cursor the cached
    /// newest page may be served; with a cursor the cache is always
    /// bypassed.
    pub async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageCursor>,
    ) -> SyncResult<Vec<Message>> {
        self.core.fetch_messages(conversation_id, before).await
    }

    /// Extends an open thread backward by one page. Returns how many rows
    /// were new.
    pub async fn load_older(&self, conversation_id: &ConversationId) -> SyncResult<usize> {
        self.core.load_older(conversation_id).await
    }

    /// Sends a message with an immediate optimistic entry, confirmed or
    /// marked failed in place when the RPC resolves.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> SyncResult<Message> {
        self.core
            .send_message(conversation_id, text, reply_to)
            .await
    }

    /// Re-issues a failed send identified by its temporary id.
    pub async fn retry_send(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> SyncResult<Message> {
        self.core.retry_send(conversation_id, temp_id).await
    }

    /// Marks everything up to `through` as read in one batched call and
    /// optimistically zeroes the conversation's unread count.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        through: &MessageId,
    ) -> SyncResult<()> {
        self.core.mark_read(conversation_id, through).await
    }

    /// Adds members after a local permission and dedup pass. The server
    /// re-validates regardless.
    pub async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        user_ids: Vec<UserId>,
    ) -> SyncResult<Vec<Participant>> {
        self.core.add_participants(conversation_id, user_ids).await
    }

    /// Finds the direct conversation with `other`, creating it if absent.
    /// One existence-check RPC; never a list scan.
    pub async fn get_or_create_direct_conversation(
        &self,
        other: &UserId,
    ) -> SyncResult<ConversationId> {
        self.core.get_or_create_direct_conversation(other).await
    }

    /// Sender profile from the TTL cache, fetching on miss. Failure yields a
    /// placeholder rather than an error.
    pub async fn profile(&self, user_id: &UserId) -> UserProfile {
        self.core.profile(user_id).await
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.core.mux.status()
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

impl SyncCore {
    /// Opens the channels that stay up for the life of the service: the
    /// user's conversation-table changes and notification inserts. Their
    /// handles are intentionally never released.
    async fn subscribe_user_channels(self: &Arc<Self>) {
        let filter = format!("user_id=eq.{}", self.current_user);
        let key = ChannelKey::conversation_list(&self.current_user);
        if let Err(e) = self.mux.subscribe(key, "conversations", &filter).await {
            warn!(error = %e, "failed to subscribe conversation list channel");
        }
        let key = ChannelKey::notifications(&self.current_user);
        if let Err(e) = self.mux.subscribe(key, "notifications", &filter).await {
            warn!(error = %e, "failed to subscribe notifications channel");
        }
    }

    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        if let Some(cached) = self.conversations.get(&self.current_user) {
            debug!("conversation list served from cache");
            return Ok(cached);
        }
        let summaries = self
            .backend
            .get_conversations_with_details(&self.current_user)
            .await?;
        self.conversations.set(
            self.current_user.clone(),
            summaries.clone(),
            self.config.conversations_ttl,
        );
        debug!(count = summaries.len(), "conversation list fetched");
        Ok(summaries)
    }

    async fn thread(&self, conversation_id: &ConversationId) -> Option<Arc<Mutex<ThreadState>>> {
        self.threads.lock().await.get(conversation_id).cloned()
    }

    async fn open_thread(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Arc<Mutex<ThreadState>>> {
        self.thread(conversation_id).await.ok_or_else(|| {
            SyncError::InvalidOperation(format!("conversation {conversation_id} is not open"))
        })
    }

    async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> SyncResult<watch::Receiver<Vec<Message>>> {
        let mut threads = self.threads.lock().await;
        if let Some(existing) = threads.get(conversation_id) {
            let state = existing.lock().await;
            return Ok(state.watch_tx.subscribe());
        }

        let key = ChannelKey::conversation_messages(conversation_id);
        let filter = format!("conversation_id=eq.{conversation_id}");
        let (subscription, _events) = self.mux.subscribe(key, "messages", &filter).await?;

        let (watch_tx, watch_rx) = watch::channel(Vec::new());
        let state = Arc::new(Mutex::new(ThreadState {
            messages: Vec::new(),
            watch_tx,
            subscription,
            last_send_at: None,
            load_task: None,
        }));
        threads.insert(conversation_id.clone(), state.clone());
        drop(threads);

        let core = self.clone();
        let id = conversation_id.clone();
        let thread = state.clone();
        let handle = tokio::spawn(async move {
            match core.load_newest_page(&id).await {
                Ok(page) => {
                    let mut state = thread.lock().await;
                    merge_older_page(&mut state.messages, page);
                    state.publish();
                    debug!(conversation = %id, "initial page loaded");
                }
                Err(e) if e.is_cancellation() => {
                    debug!(conversation = %id, "initial page load cancelled");
                }
                Err(e) => {
                    warn!(conversation = %id, error = %e, "initial page load failed");
                }
            }
        });
        state.lock().await.load_task = Some(handle);
        debug!(conversation = %conversation_id, "conversation opened");
        Ok(watch_rx)
    }

    async fn close_conversation(&self, conversation_id: &ConversationId) {
        let Some(state) = self.threads.lock().await.remove(conversation_id) else {
            return;
        };
        let mut state = state.lock().await;
        if let Some(task) = state.load_task.take() {
            task.abort();
        }
        self.mux.unsubscribe(&state.subscription).await;
        debug!(conversation = %conversation_id, "conversation closed");
    }

    async fn load_newest_page(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        if let Some(cached) = self.first_pages.get(conversation_id) {
            debug!(conversation = %conversation_id, "newest page served from cache");
            return Ok(cached);
        }
        let page = self
            .backend
            .fetch_messages(conversation_id, None, self.config.page_size)
            .await?;
        self.first_pages
            .set(conversation_id.clone(), page.clone(), self.config.messages_ttl);
        Ok(page)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageCursor>,
    ) -> SyncResult<Vec<Message>> {
        match before {
            None => self.load_newest_page(conversation_id).await,
            Some(cursor) => {
                self.backend
                    .fetch_messages(conversation_id, Some(cursor), self.config.page_size)
                    .await
            }
        }
    }

    async fn load_older(&self, conversation_id: &ConversationId) -> SyncResult<usize> {
        let thread = self.open_thread(conversation_id).await?;
        let cursor = {
            let state = thread.lock().await;
            oldest_cursor(&state.messages)
        };
        let Some(cursor) = cursor else {
            return Ok(0);
        };
        let page = self
            .backend
            .fetch_messages(conversation_id, Some(&cursor), self.config.page_size)
            .await?;
        let mut state = thread.lock().await;
        let added = merge_older_page(&mut state.messages, page);
        if added > 0 {
            state.publish();
        }
        debug!(conversation = %conversation_id, added, "older page merged");
        Ok(added)
    }

    async fn send_message(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> SyncResult<Message> {
        let thread = self.open_thread(conversation_id).await?;

        let temp_id = {
            let mut state = thread.lock().await;
            let now = self.clock.now();
            check_send_interval(&mut state, now, self.config.send_min_interval)?;

            let message = Message {
                id: MessageId::temporary(),
                conversation_id: conversation_id.clone(),
                sender_id: self.current_user.clone(),
                text: text.clone(),
                created_at: now,
                delivery_state: DeliveryState::Optimistic,
                reply_to_id: reply_to.clone(),
            };
            let temp_id = message.id.clone();
            state.messages.push(message);
            state.publish();
            temp_id
        };

        let new_message = NewMessage {
            conversation_id: conversation_id.clone(),
            sender_id: self.current_user.clone(),
            text,
            reply_to_id: reply_to,
        };
        self.finish_send(conversation_id, &thread, temp_id, &new_message)
            .await
    }

    async fn retry_send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> SyncResult<Message> {
        let thread = self.open_thread(conversation_id).await?;

        let new_message = {
            let mut state = thread.lock().await;
            let Some(position) = state
                .messages
                .iter()
                .position(|m| m.id == *temp_id && m.delivery_state == DeliveryState::Failed)
            else {
                return Err(SyncError::InvalidOperation(format!(
                    "no failed send with id {temp_id}"
                )));
            };
            let now = self.clock.now();
            check_send_interval(&mut state, now, self.config.send_min_interval)?;
            let failed = &mut state.messages[position];
            failed.delivery_state = DeliveryState::Optimistic;
            let new_message = NewMessage {
                conversation_id: conversation_id.clone(),
                sender_id: failed.sender_id.clone(),
                text: failed.text.clone(),
                reply_to_id: failed.reply_to_id.clone(),
            };
            state.publish();
            new_message
        };

        self.finish_send(conversation_id, &thread, temp_id.clone(), &new_message)
            .await
    }

    async fn finish_send(
        &self,
        conversation_id: &ConversationId,
        thread: &Arc<Mutex<ThreadState>>,
        temp_id: MessageId,
        new_message: &NewMessage,
    ) -> SyncResult<Message> {
        match self.backend.insert_message(new_message).await {
            Ok(confirmed) => {
                let mut state = thread.lock().await;
                confirm_send(&mut state.messages, &temp_id, confirmed.clone());
                state.publish();
                self.first_pages.invalidate(conversation_id);
                debug!(conversation = %conversation_id, message = %confirmed.id, "send confirmed");
                Ok(confirmed)
            }
            Err(e) => {
                let mut state = thread.lock().await;
                mark_send_failed(&mut state.messages, &temp_id);
                state.publish();
                warn!(conversation = %conversation_id, error = %e, "send failed");
                Err(e)
            }
        }
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        through: &MessageId,
    ) -> SyncResult<()> {
        // Optimistic zeroing first; the authoritative poll corrects any
        // divergence if the RPC fails.
        if let Some(mut summaries) = self.conversations.get(&self.current_user) {
            if let Some(summary) = summaries
                .iter_mut()
                .find(|s| s.conversation.id == *conversation_id)
            {
                let cleared = summary.conversation.unread_count;
                if cleared > 0 {
                    summary.conversation.unread_count = 0;
                    self.conversations.set(
                        self.current_user.clone(),
                        summaries,
                        self.config.conversations_ttl,
                    );
                    self.listener
                        .count_changed(BadgeCategory::Messages, -(cleared as i32));
                }
            }
        }

        self.backend
            .mark_messages_read_batch(conversation_id, through, &self.current_user)
            .await?;
        self.listener.reconcile_now();
        debug!(conversation = %conversation_id, through = %through, "marked read");
        Ok(())
    }

    async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        user_ids: Vec<UserId>,
    ) -> SyncResult<Vec<Participant>> {
        let summaries = self.fetch_conversations().await?;
        let summary = summaries
            .iter()
            .find(|s| s.conversation.id == *conversation_id)
            .ok_or_else(|| {
                SyncError::PermissionDenied("not a member of this conversation".to_string())
            })?;

        let is_member = summary.conversation.created_by == self.current_user
            || summary
                .participants
                .iter()
                .any(|p| p.user_id == self.current_user && p.is_active());
        if !is_member {
            return Err(SyncError::PermissionDenied(
                "only active members can add participants".to_string(),
            ));
        }

        let to_add: Vec<UserId> = user_ids
            .into_iter()
            .filter(|candidate| {
                !summary
                    .participants
                    .iter()
                    .any(|p| p.user_id == *candidate && p.is_active())
            })
            .collect();
        if to_add.is_empty() {
            debug!(conversation = %conversation_id, "all candidates already active");
            return Ok(Vec::new());
        }

        let added = self
            .backend
            .add_participants(conversation_id, &to_add, &self.current_user)
            .await?;
        self.conversations.invalidate(&self.current_user);

        if let Some(thread) = self.thread(conversation_id).await {
            let mut state = thread.lock().await;
            let note = system_note(
                conversation_id,
                &self.current_user,
                format!("{} participant(s) added", added.len()),
                self.clock.now(),
            );
            state.messages.push(note);
            state.publish();
        }

        info!(conversation = %conversation_id, added = added.len(), "participants added");
        Ok(added)
    }

    async fn get_or_create_direct_conversation(
        &self,
        other: &UserId,
    ) -> SyncResult<ConversationId> {
        if let Some(existing) = self
            .backend
            .find_dm_conversation(&self.current_user, other)
            .await?
        {
            return Ok(existing);
        }
        let conversation = self
            .backend
            .create_conversation(
                ConversationKind::Direct,
                &self.current_user,
                &[self.current_user.clone(), other.clone()],
            )
            .await?;
        self.conversations.invalidate(&self.current_user);
        info!(conversation = %conversation.id, other = %other, "direct conversation created");
        Ok(conversation.id)
    }

    async fn profile(&self, user_id: &UserId) -> UserProfile {
        if let Some(cached) = self.profiles.get(user_id) {
            return cached;
        }
        match self.backend.get_user_profile(user_id).await {
            Ok(profile) => {
                self.profiles
                    .set(user_id.clone(), profile.clone(), self.config.profile_ttl);
                profile
            }
            Err(e) => {
                debug!(user = %user_id, error = %e, "profile fetch failed, using placeholder");
                UserProfile::placeholder(user_id.clone())
            }
        }
    }

    /// Applies one decoded transport event. `pending_invalidation` is the
    /// event loop's debounce deadline for conversation-list invalidation.
    async fn handle_event(
        self: &Arc<Self>,
        event: TransportEvent,
        pending_invalidation: &mut Option<tokio::time::Instant>,
    ) {
        match event.change {
            ChangeEvent::MessageInserted(message) => {
                let conversation_id = message.conversation_id.clone();
                if let Some(thread) = self.thread(&conversation_id).await {
                    // Warm the sender's profile so rendering never waits.
                    let _ = self.profile(&message.sender_id).await;
                    let mut state = thread.lock().await;
                    if apply_incoming(&mut state.messages, message, &self.current_user) {
                        state.publish();
                    }
                } else {
                    // The cached newest page no longer reflects the server;
                    // a reopen within the TTL must refetch.
                    self.first_pages.invalidate(&conversation_id);
                    if message.sender_id != self.current_user {
                        self.listener.count_changed(BadgeCategory::Messages, 1);
                    }
                    schedule_invalidation(pending_invalidation, self.config.debounce_window);
                }
            }
            ChangeEvent::MessageUpdated(message) => {
                let conversation_id = message.conversation_id.clone();
                if let Some(thread) = self.thread(&conversation_id).await {
                    let mut state = thread.lock().await;
                    if let Some(slot) =
                        state.messages.iter_mut().find(|m| m.id == message.id)
                    {
                        *slot = message;
                        state.publish();
                    }
                }
            }
            ChangeEvent::ConversationInserted(_) | ChangeEvent::ConversationUpdated(_) => {
                schedule_invalidation(pending_invalidation, self.config.debounce_window);
            }
            ChangeEvent::NotificationInserted(entry) => {
                self.notifications.notification_inserted(entry);
            }
            ChangeEvent::Ignored { .. } => {}
        }
    }

    async fn refresh_after_reconnect(&self) {
        self.conversations.invalidate(&self.current_user);
        self.first_pages.clear();

        let threads: Vec<(ConversationId, Arc<Mutex<ThreadState>>)> = self
            .threads
            .lock()
            .await
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        for (id, thread) in threads {
            match self
                .backend
                .fetch_messages(&id, None, self.config.page_size)
                .await
            {
                Ok(page) => {
                    let mut state = thread.lock().await;
                    let added = merge_older_page(&mut state.messages, page);
                    if added > 0 {
                        state.publish();
                    }
                }
                Err(e) => {
                    warn!(conversation = %id, error = %e, "refetch after reconnect failed");
                }
            }
        }
        self.listener.reconcile_now();
    }
}

/// Enforces the per-conversation spacing between sends, retries included,
/// and records the attempt time. Rejection happens before any optimistic
/// entry is touched, so there is nothing to clean up.
fn check_send_interval(
    state: &mut ThreadState,
    now: DateTime<Utc>,
    min: std::time::Duration,
) -> SyncResult<()> {
    if let Some(last) = state.last_send_at {
        let min_interval = chrono::Duration::from_std(min).unwrap_or_default();
        let elapsed = now.signed_duration_since(last);
        if elapsed < min_interval {
            let retry_after = (min_interval - elapsed).to_std().ok();
            return Err(SyncError::RateLimited { retry_after });
        }
    }
    state.last_send_at = Some(now);
    Ok(())
}

/// Arms the debounce deadline if no burst is already pending. Keeping the
/// first deadline coalesces a burst into one invalidation.
fn schedule_invalidation(
    pending: &mut Option<tokio::time::Instant>,
    window: std::time::Duration,
) {
    if pending.is_none() {
        *pending = Some(tokio::time::Instant::now() + window);
    }
}

async fn run_event_loop(
    core: Weak<SyncCore>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    let mut pending_invalidation: Option<tokio::time::Instant> = None;
    loop {
        let deadline = pending_invalidation
            .unwrap_or_else(|| tokio::time::Instant::now() + std::time::Duration::from_secs(3600));
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(core) = core.upgrade() else { break };
                    core.handle_event(event, &mut pending_invalidation).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event loop lagged, forcing list invalidation");
                    let Some(core) = core.upgrade() else { break };
                    core.conversations.invalidate(&core.current_user);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline), if pending_invalidation.is_some() => {
                let Some(core) = core.upgrade() else { break };
                core.conversations.invalidate(&core.current_user);
                pending_invalidation = None;
                debug!("conversation list invalidated after event burst");
            }
        }
    }
    debug!("event loop stopped");
}

async fn run_status_watcher(core: Weak<SyncCore>, mut status: watch::Receiver<ConnectionStatus>) {
    let mut was_connected = status.borrow().is_connected();
    while status.changed().await.is_ok() {
        let connected = status.borrow().is_connected();
        if connected && !was_connected {
            let Some(core) = core.upgrade() else { break };
            info!("transport reconnected, refreshing local state");
            core.refresh_after_reconnect().await;
        }
        was_connected = connected;
    }
    debug!("status watcher stopped");
}
