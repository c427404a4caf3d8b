//! Sync service tunables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long the aggregate conversation list stays fresh.
    pub conversations_ttl: Duration,
    /// How long a conversation's newest message page stays fresh.
    pub messages_ttl: Duration,
    /// How long a sender profile stays fresh.
    pub profile_ttl: Duration,
    /// Messages per pagination page.
    pub page_size: u32,
    /// Minimum spacing between sends in one conversation.
    pub send_min_interval: Duration,
    /// Window in which bursts of conversation-table events coalesce into a
    /// single cache invalidation.
    pub debounce_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversations_ttl: Duration::from_secs(60),
            messages_ttl: Duration::from_secs(30),
            profile_ttl: Duration::from_secs(300),
            page_size: 25,
            send_min_interval: Duration::from_secs(1),
            debounce_window: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.conversations_ttl, Duration::from_secs(60));
        assert_eq!(config.messages_ttl, Duration::from_secs(30));
        assert_eq!(config.page_size, 25);
        assert_eq!(config.send_min_interval, Duration::from_secs(1));
        assert_eq!(config.debounce_window, Duration::from_millis(500));
    }
}
