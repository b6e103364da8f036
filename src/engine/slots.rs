use chrono::NaiveDate;

use crate::limits::{SESSION_MINUTES, SLOT_MINUTES};
use crate::model::*;

/// Tile one rule's window on `date` into back-to-back slots, starting at the
/// rule start. A remainder shorter than a full slot is left unused.
pub fn tile(rule: &AvailabilityRule, date: NaiveDate) -> Vec<CandidateSlot> {
    let Some(window) = rule.window() else {
        return Vec::new();
    };
    let mut slots = Vec::new();
    let mut start = window.start;
    loop {
        let (Some(session_end), Some(end)) =
            (start.plus(SESSION_MINUTES), start.plus(SLOT_MINUTES))
        else {
            break;
        };
        if end > window.end {
            break;
        }
        slots.push(CandidateSlot {
            date,
            start_time: start,
            end_time: end,
            session_start: start,
            session_end,
            break_start: session_end,
            break_end: end,
            status: SlotStatus::Available,
        });
        start = end;
    }
    slots
}

/// All slots of every rule that applies on `date`, ordered by start. Rules
/// that tile to the same start yield that slot once.
pub fn tile_day(provider: &Provider, date: NaiveDate) -> Vec<CandidateSlot> {
    let mut slots: Vec<CandidateSlot> = provider
        .rules_on(date)
        .flat_map(|rule| tile(rule, date))
        .collect();
    slots.sort_by_key(|s| s.start_time);
    slots.dedup_by_key(|s| s.start_time);
    slots
}
