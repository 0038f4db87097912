//! The Suppression Core: per-condition edge and cooldown tracking. Kept
//! separate from the timer core because the two suppression regimes
//! (this one vs. legacy `lastValue` dedup) are mutually exclusive per
//! condition.

use crate::config::Edge;

/// Runtime state for one `(watcherId, eventSubject, conditionIndex,
/// sourceKey)` tuple.
#[derive(Debug, Clone, Default)]
pub struct ConditionState {
    pub prev_match: bool,
    pub last_sent_epoch_sec: i64,
}

/// Should this matching evaluation actually notify? Mutates `state` in
/// place: `prevMatch` is always set true here (the caller has already
/// confirmed a match), and `lastSentAt` advances only when allowed.
pub fn should_notify(
    state: &mut ConditionState,
    edge: Edge,
    cooldown_sec: Option<u64>,
    now: i64,
) -> bool {
    let mut allow = match edge {
        Edge::Rising => !state.prev_match,
        Edge::Level => true,
    };
    state.prev_match = true;

    if allow {
        if let Some(cooldown) = cooldown_sec {
            if cooldown > 0 && now - state.last_sent_epoch_sec < cooldown as i64 {
                allow = false;
            }
        }
    }

    if allow {
        state.last_sent_epoch_sec = now;
    }
    allow
}

/// Called on a non-match for a `rising` condition: arms the next rising
/// edge without touching the cooldown clock.
pub fn mark_not_matched(state: &mut ConditionState) {
    state.prev_match = false;
}

/// Compute the suppression key: `"<watcherId>::<subject>::<conditionIndex>::<sourceKey>"`.
pub fn suppression_key(watcher_id: &str, subject: &str, condition_index: usize, source_key: &str) -> String {
    format!("{watcher_id}::{subject}::{condition_index}::{source_key}")
}

// ===========================================================================
// Tests
// ===========================================================================
