use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::ledger::Ledger;
use crate::model::*;
use crate::notify::NotificationSender;
use crate::observability;
use crate::store::{BookingRepository, StoreError};

use super::request::BookingRequest;
use super::{within, Engine, EngineError};

/// Where a booking attempt stands.
///
/// `Received → ConflictChecked → Persisted → SideEffectsAttempted →
/// Committed | RolledBack`. Failures before `Persisted` end the attempt with
/// nothing stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPhase {
    Received,
    ConflictChecked,
    Persisted,
    SideEffectsAttempted,
    Committed,
    RolledBack,
}

impl BookingPhase {
    pub fn can_advance_to(self, next: BookingPhase) -> bool {
        use BookingPhase::*;
        matches!(
            (self, next),
            (Received, ConflictChecked)
                | (ConflictChecked, Persisted)
                | (Persisted, SideEffectsAttempted)
                | (SideEffectsAttempted, Committed)
                | (SideEffectsAttempted, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingPhase::Committed | BookingPhase::RolledBack)
    }
}

/// The path one attempt took through the phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingAttempt {
    pub booking_id: Ulid,
    trail: Vec<BookingPhase>,
}

impl BookingAttempt {
    pub fn new(booking_id: Ulid) -> Self {
        Self {
            booking_id,
            trail: vec![BookingPhase::Received],
        }
    }

    pub fn phase(&self) -> BookingPhase {
        self.trail.last().copied().unwrap_or(BookingPhase::Received)
    }

    pub fn trail(&self) -> &[BookingPhase] {
        &self.trail
    }

    pub fn advance(&mut self, next: BookingPhase) {
        let current = self.phase();
        if !current.can_advance_to(next) {
            error!(
                "booking {}: illegal phase transition {current:?} -> {next:?}",
                self.booking_id
            );
            debug_assert!(false, "illegal phase transition {current:?} -> {next:?}");
        }
        debug!("booking {}: {current:?} -> {next:?}", self.booking_id);
        self.trail.push(next);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub cancellation_token: String,
    pub booking: Booking,
    pub trail: Vec<BookingPhase>,
}

impl Engine {
    pub async fn book(&self, request: &BookingRequest) -> Result<BookingReceipt, EngineError> {
        self.book_within(request, self.config.storage_timeout).await
    }

    /// Run one booking attempt. `timeout` bounds every storage call the
    /// caller waits on: provider lookup, conflict check and the insert. Once
    /// the conflict check passes, the rest runs to completion on its own
    /// task: dropping the returned future cannot leave a stored booking
    /// without either a sent confirmation or a compensating delete. An insert
    /// that lands after the deadline is deleted again.
    pub async fn book_within(
        &self,
        request: &BookingRequest,
        timeout: Duration,
    ) -> Result<BookingReceipt, EngineError> {
        let started = std::time::Instant::now();
        let result = self.run_attempt(request, Instant::now() + timeout).await;
        metrics::counter!(
            observability::BOOKING_ATTEMPTS_TOTAL,
            "outcome" => observability::outcome_label(&result)
        )
        .increment(1);
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_attempt(
        &self,
        request: &BookingRequest,
        deadline: Instant,
    ) -> Result<BookingReceipt, EngineError> {
        // Received
        let valid = request.validate(self.clock.now())?;
        let mut attempt = BookingAttempt::new(Ulid::new());
        within(
            deadline,
            "get_provider",
            self.providers.get_provider(&valid.provider),
        )
        .await?;

        // ConflictChecked
        if let Some(existing) = self
            .conflicting_booking(&valid.provider, valid.date, &valid.window, deadline)
            .await?
        {
            warn!(
                "booking conflict: provider {} {} {} overlaps booking {}",
                valid.provider.key(),
                valid.date,
                valid.window,
                existing.id
            );
            return Err(EngineError::Conflict {
                booking_id: Some(existing.id),
            });
        }
        attempt.advance(BookingPhase::ConflictChecked);

        let booking = valid.into_booking(attempt.booking_id);
        let commit = Commit {
            bookings: self.bookings.clone(),
            notifier: self.notifier.clone(),
            ledger: self.ledger.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(commit.run(booking, attempt, deadline))
            .await
            .map_err(|e| EngineError::Internal {
                operation: "book",
                detail: format!("commit task failed: {e}"),
            })?
    }
}

/// Everything after the conflict check. Owns its collaborators so it can
/// outlive the request that started it.
struct Commit {
    bookings: Arc<dyn BookingRepository>,
    notifier: Arc<dyn NotificationSender>,
    ledger: Arc<dyn Ledger>,
    config: EngineConfig,
}

impl Commit {
    async fn run(
        self,
        booking: Booking,
        mut attempt: BookingAttempt,
        deadline: Instant,
    ) -> Result<BookingReceipt, EngineError> {
        let key = booking.provider.key();

        // The insert runs on its own task so a missed deadline never cuts it
        // off halfway through a journal append.
        let mut insert = tokio::spawn({
            let bookings = self.bookings.clone();
            let booking = booking.clone();
            async move { bookings.insert_booking(booking).await }
        });

        // Persisted: the store re-checks overlap atomically with the insert,
        // so a request that raced past ConflictChecked is turned away here.
        let inserted = match timeout_at(deadline, &mut insert).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Journal(format!("insert task failed: {e}"))),
            Err(_) => {
                error!(
                    "insert_booking for booking {} (provider {key}) missed its deadline",
                    booking.id
                );
                tokio::spawn(self.remove_late_insert(insert, key));
                return Err(EngineError::Internal {
                    operation: "insert_booking",
                    detail: "storage deadline exceeded".into(),
                });
            }
        };
        let id = match inserted {
            Ok(id) => id,
            Err(StoreError::Occupied { booking_id }) => {
                warn!(
                    "booking race lost: provider {key} {} {} taken by {booking_id}",
                    booking.date, booking.window
                );
                return Err(EngineError::Conflict {
                    booking_id: Some(booking_id),
                });
            }
            Err(e) => {
                error!("insert_booking failed for provider {key} on {}: {e}", booking.date);
                return Err(EngineError::from_store("insert_booking", e));
            }
        };
        attempt.advance(BookingPhase::Persisted);

        // SideEffectsAttempted: the confirmation is load-bearing, the debit is not.
        attempt.advance(BookingPhase::SideEffectsAttempted);
        if let Err(detail) = self.send_confirmation(&booking).await {
            warn!("confirmation for booking {id} (provider {key}) failed: {detail}; rolling back");
            let rolled_back = self.compensate(id, &key).await;
            attempt.advance(BookingPhase::RolledBack);
            return Err(EngineError::Notification {
                detail,
                rolled_back,
            });
        }

        let reason = format!("booking {id}");
        if let Err(e) = self
            .ledger
            .debit(&booking.provider, self.config.booking_fee, &reason)
            .await
        {
            metrics::counter!(observability::LEDGER_FAILURES_TOTAL).increment(1);
            warn!("ledger debit for booking {id} (provider {key}) failed, reconcile out of band: {e}");
        }

        attempt.advance(BookingPhase::Committed);
        info!(
            "booking {id} committed: provider {key} {} {}",
            booking.date, booking.window
        );
        Ok(BookingReceipt {
            booking_id: id,
            cancellation_token: booking.cancellation_token.clone(),
            booking,
            trail: attempt.trail().to_vec(),
        })
    }

    async fn send_confirmation(&self, booking: &Booking) -> Result<(), String> {
        match tokio::time::timeout(self.config.notify_timeout, self.notifier.notify(booking)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.notify_timeout)),
        }
    }

    /// The caller was already told the booking failed. Wait for the insert
    /// to settle and undo it if it landed.
    async fn remove_late_insert(
        self,
        insert: JoinHandle<Result<Ulid, StoreError>>,
        key: ProviderKey,
    ) {
        match insert.await {
            Ok(Ok(id)) => {
                warn!("booking {id} (provider {key}) was stored after its deadline; rolling back");
                self.compensate(id, &key).await;
            }
            Ok(Err(e)) => debug!("late insert for provider {key} did not land: {e}"),
            Err(e) => error!("late insert task for provider {key} failed: {e}"),
        }
    }

    /// Delete the just-stored booking, retrying with backoff. Each attempt
    /// gets `compensation_timeout`. Returns false only if the booking may
    /// still be stored.
    async fn compensate(&self, id: Ulid, key: &ProviderKey) -> bool {
        let attempts = self.config.compensation_retries.max(1);
        let mut backoff = Duration::from_millis(50);
        for n in 1..=attempts {
            let limit = self.config.compensation_timeout;
            let outcome = match tokio::time::timeout(limit, self.bookings.delete_booking(id)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Journal(format!("delete timed out after {limit:?}"))),
            };
            match outcome {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    metrics::counter!(observability::COMPENSATIONS_TOTAL, "result" => "deleted")
                        .increment(1);
                    info!("booking {id} (provider {key}) rolled back");
                    return true;
                }
                Err(e) if n < attempts => {
                    warn!("compensating delete of booking {id} failed (attempt {n}/{attempts}): {e}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    metrics::counter!(observability::COMPENSATIONS_TOTAL, "result" => "failed")
                        .increment(1);
                    error!(
                        "COMPENSATION FAILED: booking {id} for provider {key} is still stored \
                         but its confirmation was never sent; remove it by hand: {e}"
                    );
                    return false;
                }
            }
        }
        false
    }
}
