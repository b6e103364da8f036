use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};

use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;
use crate::observability;
use crate::time::WallTime;

use super::slots::tile_day;
use super::{within, Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Classify every slot of `provider` between `from` and `to` (inclusive).
///
/// Per date: no matching rule yields a single `Unavailable` marker; otherwise
/// each generated slot is `Blocked` if a blackout touches it, else `Booked` if
/// an active booking overlaps it, else `Available`. At most `display_cap`
/// available slots are kept per day (the earliest); booked and blocked slots
/// are always kept. Dates before `now` produce nothing, and on the current
/// date available slots that have already started are dropped.
///
/// The cap only trims the listing; it has no say in what counts as occupied.
pub fn resolve(
    provider: &Provider,
    bookings: &[Booking],
    from: NaiveDate,
    to: NaiveDate,
    now: NaiveDateTime,
    display_cap: usize,
) -> Vec<AvailabilityEntry> {
    let today = now.date();
    let now_time = WallTime::from_naive(now.time());
    let mut entries = Vec::new();
    for date in from.iter_days().take_while(|d| *d <= to) {
        if date < today {
            continue;
        }
        let not_before = (date == today).then_some(now_time);
        entries.extend(resolve_day(provider, bookings, date, not_before, display_cap));
    }
    entries
}

fn resolve_day(
    provider: &Provider,
    bookings: &[Booking],
    date: NaiveDate,
    not_before: Option<WallTime>,
    display_cap: usize,
) -> Vec<AvailabilityEntry> {
    if provider.rules_on(date).next().is_none() {
        return vec![AvailabilityEntry::Unavailable { date }];
    }

    let blackouts = provider.blackout_windows_on(date);
    let day_bookings: Vec<&Booking> = bookings
        .iter()
        .filter(|b| b.date == date && b.is_active())
        .collect();

    let mut shown_available = 0usize;
    let mut entries = Vec::new();
    for mut slot in tile_day(provider, date) {
        let window = slot.window();
        if blackouts.iter().any(|b| b.overlaps(&window)) {
            slot.status = SlotStatus::Blocked;
        } else if let Some(b) = day_bookings.iter().find(|b| b.window.overlaps(&window)) {
            slot.status = SlotStatus::Booked {
                booking_id: b.id,
                patient_id: b.patient_id.clone(),
            };
        } else {
            if not_before.is_some_and(|t| slot.start_time <= t) {
                continue;
            }
            if shown_available >= display_cap {
                continue;
            }
            shown_available += 1;
        }
        entries.push(AvailabilityEntry::Slot(slot));
    }
    entries
}

impl Engine {
    /// Read path: the slots a patient may choose from. Takes no locks beyond
    /// the store's read guards; results may be stale by the time a booking is
    /// submitted, which the write path settles.
    pub async fn availability(
        &self,
        provider: &ProviderRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilityEntry>, EngineError> {
        if to < from {
            return Err(EngineError::validation("to", "must not be before from"));
        }
        if (to - from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::validation("to", "query window too wide"));
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.storage_timeout;
        let (profile, bookings) = futures::try_join!(
            within(deadline, "get_provider", self.providers.get_provider(provider)),
            within(
                deadline,
                "find_active_bookings_between",
                self.bookings.find_active_bookings_between(provider, from, to),
            ),
        )?;

        let entries = resolve(
            &profile,
            &bookings,
            from,
            to,
            self.clock.now(),
            self.config.display_cap,
        );

        metrics::counter!(observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
        metrics::histogram!(observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            "availability for provider {} {from}..{to}: {} entries",
            provider.key(),
            entries.len()
        );
        Ok(entries)
    }
}
