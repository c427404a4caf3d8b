//! Transport abstraction the multiplexer sits on.

use async_trait::async_trait;
use chat_types::{ChangeEvent, ConversationId, SyncResult, UserId};
use std::fmt;
use tokio::sync::{broadcast, watch};

/// Identity of one server-side channel. Equal keys share one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Channel carrying message inserts/updates for one conversation.
    pub fn conversation_messages(conversation_id: &ConversationId) -> Self {
        Self(format!("messages:{conversation_id}"))
    }

    /// Channel carrying conversation-table changes for one user's list.
    pub fn conversation_list(user_id: &UserId) -> Self {
        Self(format!("conversations:{user_id}"))
    }

    /// Channel carrying notification inserts for one user.
    pub fn notifications(user_id: &UserId) -> Self {
        Self(format!("notifications:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport connectivity, broadcast over a watch channel so consumers can
/// switch behavior (poll cadence, refetch-on-reconnect) without polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// A decoded change event tagged with the channel that delivered it.
///
/// Decoding happens once at the transport boundary; consumers match on the
/// closed [`ChangeEvent`] variant, never on loose JSON.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub channel_key: ChannelKey,
    pub change: ChangeEvent,
}

/// A pub/sub connection with per-channel subscriptions.
///
/// Implementations own reconnection: on transport loss they flip the status
/// stream, re-establish the connection with backoff, and rejoin every
/// channel that was open. Consumers refetch on the disconnected→connected
/// transition rather than assuming event continuity.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens (or records, when offline) a server-side channel for the given
    /// table and row filter.
    async fn open_channel(&self, key: &ChannelKey, table: &str, filter: &str) -> SyncResult<()>;

    async fn close_channel(&self, key: &ChannelKey) -> SyncResult<()>;

    /// Decoded events from every open channel.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;
}
