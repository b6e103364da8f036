use chrono::NaiveDate;
use tokio::time::Instant;

use crate::model::*;
use crate::time::TimeWindow;

use super::{within, Engine, EngineError};

/// First active booking of `provider` on `date` whose window overlaps
/// `window` under the half-open rule. Adjacent windows never conflict.
/// Bookings written under another encoding of the provider id still count.
pub fn find_conflict<'a>(
    bookings: &'a [Booking],
    provider: &ProviderRef,
    date: NaiveDate,
    window: &TimeWindow,
) -> Option<&'a Booking> {
    bookings
        .iter()
        .find(|b| b.occupies(date, window) && b.provider.matches(provider))
}

impl Engine {
    pub async fn has_conflict(
        &self,
        provider: &ProviderRef,
        date: NaiveDate,
        window: &TimeWindow,
    ) -> Result<bool, EngineError> {
        let deadline = Instant::now() + self.config.storage_timeout;
        Ok(self
            .conflicting_booking(provider, date, window, deadline)
            .await?
            .is_some())
    }

    pub(super) async fn conflicting_booking(
        &self,
        provider: &ProviderRef,
        date: NaiveDate,
        window: &TimeWindow,
        deadline: Instant,
    ) -> Result<Option<Booking>, EngineError> {
        let bookings = within(
            deadline,
            "find_active_bookings",
            self.bookings.find_active_bookings(provider, date),
        )
        .await?;
        Ok(find_conflict(&bookings, provider, date, window).cloned())
    }
}
