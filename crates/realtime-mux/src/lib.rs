//! Realtime change-event plumbing.
//!
//! The backend emits row-level change events over a pub/sub transport with
//! per-channel subscriptions. Channels are a scarce server-side resource, so
//! all subscription demand goes through the [`SubscriptionMultiplexer`]: it
//! refcounts duplicate interest, caps the number of concurrent channels with
//! LRU eviction, and tears idle channels down only after a grace period so
//! rapid navigation does not churn the transport.
//!
//! [`WebSocketTransport`] is the production [`RealtimeTransport`]; tests use
//! in-process fakes.

mod mux;
mod transport;
mod websocket;

pub use mux::{MuxConfig, SubscriptionHandle, SubscriptionMultiplexer};
pub use transport::{ChannelKey, ConnectionStatus, RealtimeTransport, TransportEvent};
pub use websocket::{compute_backoff, WebSocketConfig, WebSocketTransport};
