//! Shared domain types for the chat synchronization engine.
//!
//! Every other crate in the workspace builds on these definitions:
//!
//! - Typed ids ([`ConversationId`], [`MessageId`], [`UserId`])
//! - Domain records ([`Conversation`], [`Message`], [`Participant`],
//!   [`BadgeCounts`], [`NotificationEntry`])
//! - The closed realtime change-event variant ([`ChangeEvent`]), decoded once
//!   at the transport boundary
//! - The shared error taxonomy ([`SyncError`]) that distinguishes
//!   cancellation from failure
//! - Clock injection ([`Clock`]) so time-dependent logic is testable

mod clock;
mod error;
mod event;
mod ids;
mod listener;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SyncError, SyncResult};
pub use event::{ChangeEvent, Operation, RawChangeEvent};
pub use ids::{ConversationId, MessageId, UserId};
pub use listener::{
    CountListener, NoopCountListener, NoopNotificationListener, NotificationListener,
};
pub use types::{
    BadgeCategory, BadgeCounts, Conversation, ConversationKind, ConversationSummary,
    DeliveryState, Message, MessageCursor, NewMessage, NotificationEntry, NotificationGroup,
    NotificationKind, Participant, UserProfile,
};
