//! Badge count reconciliation.
//!
//! Per-category unread counts follow an estimate-then-reconcile model:
//! local actions apply optimistic deltas for immediate feedback, and a
//! periodic authoritative poll unconditionally replaces whatever the deltas
//! produced. Deltas are a bridge, never a source of truth.
//!
//! The poll cadence follows transport connectivity: frequent while the
//! realtime channel is up, relaxed while it is down.

mod engine;
mod ledger;

pub use engine::{BadgeConfig, BadgeEngine, BadgeHandle};
pub use ledger::BadgeLedger;
