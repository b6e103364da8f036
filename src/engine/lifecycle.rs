use tokio::time::Instant;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{within, Engine, EngineError};

impl Engine {
    /// Cancel the booking the token was issued for. The window becomes
    /// bookable again immediately.
    pub async fn cancel(&self, token: &str) -> Result<Booking, EngineError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(EngineError::validation("token", "is required"));
        }
        let deadline = Instant::now() + self.config.storage_timeout;
        let booking = within(
            deadline,
            "find_by_cancellation_token",
            self.bookings.find_by_cancellation_token(token),
        )
        .await?;
        let cancelled = within(
            deadline,
            "update_status",
            self.bookings
                .update_status(booking.id, BookingStatus::Cancelled),
        )
        .await?;
        info!(
            "booking {} cancelled: provider {} {} {}",
            cancelled.id,
            cancelled.provider.key(),
            cancelled.date,
            cancelled.window
        );
        Ok(cancelled)
    }

    pub async fn update_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let deadline = Instant::now() + self.config.storage_timeout;
        let updated = within(
            deadline,
            "update_status",
            self.bookings.update_status(id, status),
        )
        .await?;
        info!("booking {id} is now {status}");
        Ok(updated)
    }
}
