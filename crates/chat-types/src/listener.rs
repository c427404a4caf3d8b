//! Seam between the sync service and the badge engine.
//!
//! The sync service reports count-affecting writes through this trait; the
//! badge engine's handle implements it. Wiring happens at application
//! startup by explicit injection, never through globals.

use crate::types::{BadgeCategory, NotificationEntry};

pub trait CountListener: Send + Sync {
    /// An action known to change a category count completed locally; apply
    /// an optimistic delta until the next authoritative poll.
    fn count_changed(&self, category: BadgeCategory, delta: i32);

    /// A request subject's unread activity was cleared. Request badges count
    /// distinct subjects, so this is keyed rather than delta-based.
    fn request_subject_read(&self, subject_id: &str);

    /// A completed write invalidated local estimates; reconcile out of cycle
    /// instead of waiting for the next timer tick.
    fn reconcile_now(&self);
}

/// Listener for callers that do not track badges (tests, headless tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCountListener;

impl CountListener for NoopCountListener {
    fn count_changed(&self, _category: BadgeCategory, _delta: i32) {}
    fn request_subject_read(&self, _subject_id: &str) {}
    fn reconcile_now(&self) {}
}

/// Seam between the sync service and the notification feed. The service
/// decodes notification inserts off its realtime channels and hands the rows
/// over; the feed's handle implements this.
pub trait NotificationListener: Send + Sync {
    fn notification_inserted(&self, entry: NotificationEntry);
}

/// Listener for callers without a notification feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationListener;

impl NotificationListener for NoopNotificationListener {
    fn notification_inserted(&self, _entry: NotificationEntry) {}
}
