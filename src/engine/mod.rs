mod availability;
mod conflict;
mod error;
mod lifecycle;
mod request;
mod slots;
mod transaction;

pub use availability::resolve;
pub use conflict::find_conflict;
pub use error::EngineError;
pub use request::{BookingRequest, ValidatedBooking};
pub use slots::{tile, tile_day};
pub use transaction::{BookingAttempt, BookingPhase, BookingReceipt};

use std::future::Future;
use std::sync::Arc;

use tokio::time::{timeout_at, Instant};
use tracing::error;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::ledger::Ledger;
use crate::notify::NotificationSender;
use crate::store::{BookingRepository, BookingStore, ProviderRepository, StoreError};

/// The services a booking engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub providers: Arc<dyn ProviderRepository>,
    pub bookings: Arc<dyn BookingRepository>,
    pub notifier: Arc<dyn NotificationSender>,
    pub ledger: Arc<dyn Ledger>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// One store serving both repositories.
    pub fn with_store(
        store: Arc<BookingStore>,
        notifier: Arc<dyn NotificationSender>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            providers: store.clone(),
            bookings: store,
            notifier,
            ledger,
            clock,
        }
    }
}

pub struct Engine {
    pub(super) providers: Arc<dyn ProviderRepository>,
    pub(super) bookings: Arc<dyn BookingRepository>,
    pub(super) notifier: Arc<dyn NotificationSender>,
    pub(super) ledger: Arc<dyn Ledger>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let Collaborators {
            providers,
            bookings,
            notifier,
            ledger,
            clock,
        } = collaborators;
        Self {
            providers,
            bookings,
            notifier,
            ledger,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Await a storage call, failing with `Internal` once `deadline` passes.
pub(super) async fn within<T>(
    deadline: Instant,
    operation: &'static str,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, EngineError> {
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let err = EngineError::from_store(operation, e);
            if let EngineError::Internal { detail, .. } = &err {
                error!("{operation} failed: {detail}");
            }
            Err(err)
        }
        Err(_) => {
            error!("{operation} timed out");
            Err(EngineError::Internal {
                operation,
                detail: "storage deadline exceeded".into(),
            })
        }
    }
}
