//! Pure badge state machine.

use chat_types::{BadgeCategory, BadgeCounts};
use std::collections::{HashMap, HashSet};

/// Per-category lifecycle between authoritative polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CategoryState {
    /// Last poll result, unmodified.
    Synced(u32),
    /// Poll base plus accumulated local delta.
    Adjusted { base: u32, delta: i32 },
}

impl CategoryState {
    fn visible(&self) -> u32 {
        match *self {
            CategoryState::Synced(count) => count,
            // Saturate for display; the authoritative poll restores truth.
            CategoryState::Adjusted { base, delta } => {
                (base as i64 + delta as i64).max(0) as u32
            }
        }
    }
}

/// Holds the estimate-then-reconcile state for all categories.
///
/// `reconcile` unconditionally replaces every category with the poll result
/// and discards accumulated deltas, whatever their order or magnitude. The
/// requests category counts distinct subjects, so local adjustments there
/// are keyed by subject and clamped to one unit each.
#[derive(Debug)]
pub struct BadgeLedger {
    states: HashMap<BadgeCategory, CategoryState>,
    /// Subjects whose unread activity was cleared locally since the last
    /// poll. Each contributes exactly -1 to the requests estimate.
    read_request_subjects: HashSet<String>,
    last_reconciled: BadgeCounts,
}

impl BadgeLedger {
    pub fn new() -> Self {
        let mut states = HashMap::new();
        for category in BadgeCategory::ALL {
            states.insert(category, CategoryState::Synced(0));
        }
        Self {
            states,
            read_request_subjects: HashSet::new(),
            last_reconciled: BadgeCounts::default(),
        }
    }

    /// Applies a local delta to one category.
    pub fn apply_delta(&mut self, category: BadgeCategory, delta: i32) {
        let state = self
            .states
            .entry(category)
            .or_insert(CategoryState::Synced(0));
        *state = match *state {
            CategoryState::Synced(base) => CategoryState::Adjusted { base, delta },
            CategoryState::Adjusted { base, delta: prior } => CategoryState::Adjusted {
                base,
                delta: prior + delta,
            },
        };
    }

    /// Records that one request subject's unread activity was cleared.
    /// Clearing the same subject again has no further effect.
    pub fn request_subject_read(&mut self, subject_id: &str) {
        if self.read_request_subjects.insert(subject_id.to_string()) {
            self.apply_delta(BadgeCategory::Requests, -1);
        }
    }

    /// Replaces all state with the authoritative poll result. Deltas are
    /// discarded, never merged.
    pub fn reconcile(&mut self, authoritative: BadgeCounts) {
        for category in BadgeCategory::ALL {
            self.states
                .insert(category, CategoryState::Synced(authoritative.get(category)));
        }
        self.read_request_subjects.clear();
        self.last_reconciled = authoritative;
    }

    /// Current display counts.
    pub fn visible(&self) -> BadgeCounts {
        let mut counts = BadgeCounts {
            last_reconciled_at: self.last_reconciled.last_reconciled_at,
            ..BadgeCounts::default()
        };
        for category in BadgeCategory::ALL {
            let visible = self
                .states
                .get(&category)
                .map(CategoryState::visible)
                .unwrap_or(0);
            counts.set(category, visible);
        }
        counts
    }
}

impl Default for BadgeLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn polled(messages: u32, requests: u32) -> BadgeCounts {
        BadgeCounts {
            messages,
            requests,
            announcements: 0,
            town_hall: 0,
            last_reconciled_at: Some(Utc::now()),
        }
    }

    #[test]
    fn deltas_adjust_immediately() {
        let mut ledger = BadgeLedger::new();
        ledger.reconcile(polled(5, 0));
        ledger.apply_delta(BadgeCategory::Messages, -2);
        assert_eq!(ledger.visible().messages, 3);
        ledger.apply_delta(BadgeCategory::Messages, 1);
        assert_eq!(ledger.visible().messages, 4);
    }

    #[test]
    fn display_saturates_at_zero() {
        let mut ledger = BadgeLedger::new();
        ledger.reconcile(polled(1, 0));
        ledger.apply_delta(BadgeCategory::Messages, -5);
        assert_eq!(ledger.visible().messages, 0);
    }

    #[test]
    fn poll_result_unconditionally_replaces_any_delta_sequence() {
        let mut ledger = BadgeLedger::new();
        ledger.reconcile(polled(5, 3));
        for delta in [-2, 7, -1, -9, 4] {
            ledger.apply_delta(BadgeCategory::Messages, delta);
        }
        ledger.request_subject_read("r1");
        ledger.request_subject_read("r2");

        let authoritative = polled(11, 2);
        ledger.reconcile(authoritative.clone());
        assert_eq!(ledger.visible().messages, authoritative.messages);
        assert_eq!(ledger.visible().requests, authoritative.requests);
    }

    #[test]
    fn request_subjects_count_once_each() {
        let mut ledger = BadgeLedger::new();
        ledger.reconcile(polled(0, 3));

        ledger.request_subject_read("subject-a");
        ledger.request_subject_read("subject-a");
        ledger.request_subject_read("subject-a");
        assert_eq!(ledger.visible().requests, 2);

        ledger.request_subject_read("subject-b");
        assert_eq!(ledger.visible().requests, 1);
    }

    #[test]
    fn reconcile_resets_subject_memory() {
        let mut ledger = BadgeLedger::new();
        ledger.reconcile(polled(0, 2));
        ledger.request_subject_read("subject-a");
        ledger.reconcile(polled(0, 2));

        // After a poll the subject can go unread and be cleared again.
        ledger.request_subject_read("subject-a");
        assert_eq!(ledger.visible().requests, 1);
    }

    #[test]
    fn last_reconciled_at_carried_through() {
        let mut ledger = BadgeLedger::new();
        let counts = polled(1, 1);
        let stamp = counts.last_reconciled_at;
        ledger.reconcile(counts);
        assert_eq!(ledger.visible().last_reconciled_at, stamp);
    }
}
