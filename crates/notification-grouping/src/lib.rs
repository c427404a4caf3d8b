//! Notification grouping and the observable feed.
//!
//! Raw notification rows arrive one per event. For presentation they
//! collapse by `(kind, subject_id)`: five reactions to one request are one
//! group with five entries, not five rows. Message-kind notifications are
//! filtered out entirely; conversations already surface that activity
//! through their unread counts.

mod feed;
mod grouping;

pub use feed::{FeedHandle, NotificationFeed};
pub use grouping::group;
