//! Bounded, refcounted subscription table.

use crate::transport::{ChannelKey, ConnectionStatus, RealtimeTransport, TransportEvent};
use chat_types::{Clock, SyncResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

/// Multiplexer tunables.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum concurrent server-side channels.
    pub max_channels: usize,
    /// How long an unreferenced channel stays open before teardown.
    pub grace_period: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_channels: 10,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Proof of one unit of interest in a channel. Returned by `subscribe`;
/// passed back to `unsubscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub channel_key: ChannelKey,
    pub table: String,
    pub filter: String,
    pub created_at: DateTime<Utc>,
}

struct ChannelEntry {
    table: String,
    filter: String,
    refcount: usize,
    /// Bumped whenever the refcount leaves zero; stale delayed teardowns
    /// compare against it and bail.
    generation: u64,
    created_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
}

impl ChannelEntry {
    /// Recency rank for LRU eviction: a channel that never delivered an
    /// event ranks by its creation time.
    fn last_activity(&self) -> DateTime<Utc> {
        self.last_event_at.unwrap_or(self.created_at)
    }
}

/// Routes all subscription demand onto at most `max_channels` transport
/// channels.
///
/// Subscribing an already-open key increments a refcount instead of opening
/// a second channel. At the cap, the least recently active channel is torn
/// down to make room. Dropping the last reference starts a grace-period
/// timer; re-subscribing within it keeps the channel.
///
/// One internal mutex covers the whole table, so subscribe, unsubscribe,
/// and eviction are atomic with respect to each other.
pub struct SubscriptionMultiplexer {
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    config: MuxConfig,
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    events_tx: broadcast::Sender<TransportEvent>,
    next_generation: AtomicU64,
}

impl SubscriptionMultiplexer {
    /// Creates the multiplexer and starts its event pump, which re-broadcasts
    /// transport events to subscribers while tracking per-channel recency.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        clock: Arc<dyn Clock>,
        config: MuxConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let mux = Arc::new(Self {
            transport,
            clock,
            config,
            channels: Mutex::new(HashMap::new()),
            events_tx,
            next_generation: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&mux);
        let mut transport_rx = mux.transport.events();
        tokio::spawn(async move {
            pump_events(weak, &mut transport_rx).await;
        });

        mux
    }

    /// Subscribes to a channel, opening it on the transport if this is the
    /// first interest in the key.
    pub async fn subscribe(
        self: &Arc<Self>,
        key: ChannelKey,
        table: &str,
        filter: &str,
    ) -> SyncResult<(SubscriptionHandle, broadcast::Receiver<TransportEvent>)> {
        let mut channels = self.channels.lock().await;

        if let Some(entry) = channels.get_mut(&key) {
            entry.refcount += 1;
            if entry.refcount == 1 {
                // Back from zero within the grace period; invalidate any
                // pending teardown.
                entry.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            }
            debug!(channel = %key, refcount = entry.refcount, "joined existing channel");
            let handle = SubscriptionHandle {
                channel_key: key,
                table: entry.table.clone(),
                filter: entry.filter.clone(),
                created_at: entry.created_at,
            };
            return Ok((handle, self.events_tx.subscribe()));
        }

        if channels.len() >= self.config.max_channels {
            if let Some(victim) = eviction_victim(&channels) {
                debug!(channel = %victim, "evicting least recently active channel");
                if let Err(e) = self.transport.close_channel(&victim).await {
                    warn!(channel = %victim, error = %e, "failed to close evicted channel");
                }
                channels.remove(&victim);
            }
        }

        self.transport.open_channel(&key, table, filter).await?;
        let created_at = self.clock.now();
        channels.insert(
            key.clone(),
            ChannelEntry {
                table: table.to_string(),
                filter: filter.to_string(),
                refcount: 1,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                created_at,
                last_event_at: None,
            },
        );
        debug!(channel = %key, open = channels.len(), "opened channel");

        let handle = SubscriptionHandle {
            channel_key: key,
            table: table.to_string(),
            filter: filter.to_string(),
            created_at,
        };
        Ok((handle, self.events_tx.subscribe()))
    }

    /// Releases one unit of interest. When the last reference goes, the
    /// channel is torn down after the grace period unless re-subscribed.
    pub async fn unsubscribe(self: &Arc<Self>, handle: &SubscriptionHandle) {
        let mut channels = self.channels.lock().await;
        let Some(entry) = channels.get_mut(&handle.channel_key) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            debug!(channel = %handle.channel_key, refcount = entry.refcount, "released reference");
            return;
        }

        let generation = entry.generation;
        let key = handle.channel_key.clone();
        let mux = self.clone();
        let grace = self.config.grace_period;
        debug!(channel = %key, grace_ms = grace.as_millis() as u64, "scheduling teardown");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            mux.teardown_if_idle(&key, generation).await;
        });
    }

    async fn teardown_if_idle(&self, key: &ChannelKey, generation: u64) {
        let mut channels = self.channels.lock().await;
        let still_idle = matches!(
            channels.get(key),
            Some(entry) if entry.refcount == 0 && entry.generation == generation
        );
        if !still_idle {
            debug!(channel = %key, "teardown cancelled, channel re-subscribed");
            return;
        }
        if let Err(e) = self.transport.close_channel(key).await {
            warn!(channel = %key, error = %e, "failed to close channel");
        }
        channels.remove(key);
        debug!(channel = %key, "channel torn down");
    }

    async fn note_event(&self, key: &ChannelKey) {
        let mut channels = self.channels.lock().await;
        if let Some(entry) = channels.get_mut(key) {
            entry.last_event_at = Some(self.clock.now());
        }
    }

    /// All decoded events from every open channel.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_subscribed(&self, key: &ChannelKey) -> bool {
        self.channels.lock().await.contains_key(key)
    }
}

fn eviction_victim(channels: &HashMap<ChannelKey, ChannelEntry>) -> Option<ChannelKey> {
    channels
        .iter()
        .min_by_key(|(_, entry)| entry.last_activity())
        .map(|(key, _)| key.clone())
}

async fn pump_events(
    mux: Weak<SubscriptionMultiplexer>,
    transport_rx: &mut broadcast::Receiver<TransportEvent>,
) {
    loop {
        match transport_rx.recv().await {
            Ok(event) => {
                let Some(mux) = mux.upgrade() else { break };
                mux.note_event(&event.channel_key).await;
                let _ = mux.events_tx.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event pump lagged behind transport");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("event pump stopped");
}
