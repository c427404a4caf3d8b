//! Conversation and message synchronization.
//!
//! [`SyncService`] owns the client's view of conversations and open message
//! threads: a TTL-cached conversation list fetched with one aggregate call,
//! cursor pagination with exact page boundaries, optimistic sends that are
//! confirmed or failed in place, batched read receipts, and realtime event
//! reactions with debounced cache invalidation.
//!
//! Observers read threads through `watch` streams; they never mutate state
//! directly.

mod config;
mod service;
mod thread;

pub use config::SyncConfig;
pub use service::SyncService;
pub use thread::system_note;
