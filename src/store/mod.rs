mod journal;

pub use journal::Journal;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::engine::find_conflict;
use crate::limits::*;
use crate::model::*;
use crate::time::WallTime;

use journal::{writer_loop, JournalCommand};

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(Ulid),
    /// An active booking already holds part of the requested window.
    Occupied { booking_id: Ulid },
    Invalid(Vec<FieldError>),
    LimitExceeded(&'static str),
    Journal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Occupied { booking_id } => {
                write!(f, "window occupied by booking {booking_id}")
            }
            StoreError::Invalid(problems) => {
                write!(f, "invalid: ")?;
                for (i, p) in problems.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ── Repository seams ─────────────────────────────────────────────

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Fails with `StoreError::NotFound` if the provider is unknown.
    async fn get_provider(&self, id: &ProviderRef) -> Result<Provider, StoreError>;
}

/// Implementations must match bookings by provider under every id encoding
/// (see `ProviderRef::matches`).
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn find_active_bookings(
        &self,
        provider: &ProviderRef,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn find_active_bookings_between(
        &self,
        provider: &ProviderRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Conditional insert: fails with `StoreError::Occupied` if an active
    /// booking overlaps. Check and write are one atomic step per provider.
    async fn insert_booking(&self, booking: Booking) -> Result<Ulid, StoreError>;

    /// Compensation only: removes a booking that was never confirmed to anyone.
    async fn delete_booking(&self, id: Ulid) -> Result<(), StoreError>;

    async fn find_by_cancellation_token(&self, token: &str) -> Result<Booking, StoreError>;

    /// Apply a lifecycle transition; illegal transitions fail with `Invalid`.
    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, StoreError>;
}

// ── Per-provider state ───────────────────────────────────────────

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

#[derive(Debug, Default)]
pub struct ProviderState {
    pub profile: Option<Provider>,
    /// Every booking on record, cancelled ones included, sorted by `(date, start)`.
    pub bookings: Vec<Booking>,
}

fn order_key(b: &Booking) -> (NaiveDate, WallTime) {
    (b.date, b.window.start)
}

impl ProviderState {
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = order_key(&booking);
        let pos = self.bookings.partition_point(|b| order_key(b) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        self.between(date, date)
    }

    /// Bookings with `from <= date <= to`, in order.
    pub fn between(&self, from: NaiveDate, to: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < from);
        let hi = self.bookings.partition_point(|b| b.date <= to);
        if lo >= hi { &[] } else { &self.bookings[lo..hi] }
    }
}

/// Apply a journal record to one provider's state (caller holds the lock).
fn apply_event(
    state: &mut ProviderState,
    event: Event,
    booking_index: &DashMap<Ulid, ProviderKey>,
    token_index: &DashMap<String, Ulid>,
) {
    match event {
        Event::ProviderUpserted { provider } => state.profile = Some(provider),
        Event::BookingInserted { booking } => {
            booking_index.insert(booking.id, booking.provider.key());
            token_index.insert(booking.cancellation_token.clone(), booking.id);
            state.insert_booking(booking);
        }
        Event::BookingDeleted { id, .. } => {
            if let Some(removed) = state.remove_booking(id) {
                token_index.remove(&removed.cancellation_token);
            }
            booking_index.remove(&id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = state.bookings.iter_mut().find(|b| b.id == id) {
                b.status = status;
            }
        }
    }
}

// ── Reference store ──────────────────────────────────────────────

/// Concurrent provider and booking store with optional journaling.
///
/// Every mutation takes the provider's write lock for the whole
/// check → journal → apply sequence, so two writers for the same provider
/// never interleave. Writers for different providers run in parallel.
pub struct BookingStore {
    providers: DashMap<ProviderKey, SharedProviderState>,
    /// Reverse lookup: booking id → owning provider.
    booking_to_provider: DashMap<Ulid, ProviderKey>,
    token_to_booking: DashMap<String, Ulid>,
    journal_tx: Option<mpsc::Sender<JournalCommand>>,
    /// Mutations hold it shared; compaction holds it exclusively.
    compaction_gate: RwLock<()>,
}

impl BookingStore {
    pub fn in_memory() -> Self {
        Self {
            providers: DashMap::new(),
            booking_to_provider: DashMap::new(),
            token_to_booking: DashMap::new(),
            journal_tx: None,
            compaction_gate: RwLock::new(()),
        }
    }

    /// Replay the journal at `path` and keep appending to it. Must be called
    /// inside a tokio runtime; the journal writer runs as a background task
    /// until the store is dropped.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Journal::replay(path)?;
        let journal = Journal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(journal, rx));

        let mut store = Self::in_memory();
        store.journal_tx = Some(tx);

        let mut states: HashMap<ProviderKey, ProviderState> = HashMap::new();
        for event in events {
            let state = states.entry(event.provider_key()).or_default();
            apply_event(state, event, &store.booking_to_provider, &store.token_to_booking);
        }
        for (key, state) in states {
            store.providers.insert(key, Arc::new(RwLock::new(state)));
        }
        tracing::info!(
            "booking store replayed {} providers, {} bookings from {}",
            store.providers.len(),
            store.booking_to_provider.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn get_state(&self, key: &ProviderKey) -> Option<SharedProviderState> {
        self.providers.get(key).map(|e| e.value().clone())
    }

    fn state_or_default(&self, key: ProviderKey) -> SharedProviderState {
        self.providers.entry(key).or_default().value().clone()
    }

    fn resolve_booking(&self, id: &Ulid) -> Result<SharedProviderState, StoreError> {
        let key = self
            .booking_to_provider
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("booking {id}")))?;
        self.get_state(&key)
            .ok_or_else(|| StoreError::NotFound(format!("provider {key}")))
    }

    /// Journal the event via the group-commit writer. No-op without a journal.
    async fn persist(&self, event: &Event) -> Result<(), StoreError> {
        let Some(tx) = &self.journal_tx else {
            return Ok(());
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(JournalCommand::Append {
            event: event.clone(),
            response: resp_tx,
        })
        .await
        .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        resp_rx
            .await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    async fn persist_and_apply(
        &self,
        state: &mut ProviderState,
        event: Event,
    ) -> Result<(), StoreError> {
        self.persist(&event).await?;
        apply_event(state, event, &self.booking_to_provider, &self.token_to_booking);
        Ok(())
    }

    pub async fn upsert_provider(&self, provider: Provider) -> Result<(), StoreError> {
        let problems = provider.problems();
        if !problems.is_empty() {
            return Err(StoreError::Invalid(problems));
        }
        let _gate = self.compaction_gate.read().await;
        let state = self.state_or_default(provider.id.key());
        let mut guard = state.write().await;
        self.persist_and_apply(&mut guard, Event::ProviderUpserted { provider })
            .await
    }

    /// Rewrite the journal as the minimal event list for the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(tx) = &self.journal_tx else {
            return Ok(());
        };
        let _gate = self.compaction_gate.write().await;

        let states: Vec<SharedProviderState> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for state in states {
            let guard = state.read().await;
            if let Some(profile) = &guard.profile {
                events.push(Event::ProviderUpserted {
                    provider: profile.clone(),
                });
            }
            events.extend(guard.bookings.iter().map(|b| Event::BookingInserted {
                booking: b.clone(),
            }));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(JournalCommand::Rewrite {
            events,
            response: resp_tx,
        })
        .await
        .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        resp_rx
            .await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.journal_tx else {
            return 0;
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        if tx
            .send(JournalCommand::AppendsSinceRewrite { response: resp_tx })
            .await
            .is_err()
        {
            return 0;
        }
        resp_rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ProviderRepository for BookingStore {
    async fn get_provider(&self, id: &ProviderRef) -> Result<Provider, StoreError> {
        let key = id.key();
        let not_found = || StoreError::NotFound(format!("provider {key}"));
        let state = self.get_state(&key).ok_or_else(not_found)?;
        let guard = state.read().await;
        guard.profile.clone().ok_or_else(not_found)
    }
}

#[async_trait]
impl BookingRepository for BookingStore {
    async fn find_active_bookings(
        &self,
        provider: &ProviderRef,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError> {
        self.find_active_bookings_between(provider, date, date).await
    }

    async fn find_active_bookings_between(
        &self,
        provider: &ProviderRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(state) = self.get_state(&provider.key()) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard
            .between(from, to)
            .iter()
            .filter(|b| b.is_active() && b.provider.matches(provider))
            .cloned()
            .collect())
    }

    async fn insert_booking(&self, booking: Booking) -> Result<Ulid, StoreError> {
        if self.booking_to_provider.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        let _gate = self.compaction_gate.read().await;
        let state = self.state_or_default(booking.provider.key());
        let mut guard = state.write().await;

        if let Some(existing) = find_conflict(
            guard.on_date(booking.date),
            &booking.provider,
            booking.date,
            &booking.window,
        ) {
            return Err(StoreError::Occupied {
                booking_id: existing.id,
            });
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(StoreError::LimitExceeded("too many bookings for provider"));
        }

        let id = booking.id;
        self.persist_and_apply(&mut guard, Event::BookingInserted { booking })
            .await?;
        Ok(id)
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let state = self.resolve_booking(&id)?;
        let mut guard = state.write().await;
        let provider = guard
            .booking(id)
            .map(|b| b.provider.key())
            .ok_or_else(|| StoreError::NotFound(format!("booking {id}")))?;
        self.persist_and_apply(&mut guard, Event::BookingDeleted { id, provider })
            .await
    }

    async fn find_by_cancellation_token(&self, token: &str) -> Result<Booking, StoreError> {
        let not_found = || StoreError::NotFound("booking for cancellation token".into());
        let id = self
            .token_to_booking
            .get(token)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let state = self.resolve_booking(&id)?;
        let guard = state.read().await;
        guard.booking(id).cloned().ok_or_else(not_found)
    }

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let state = self.resolve_booking(&id)?;
        let mut guard = state.write().await;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("booking {id}")))?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::Invalid(vec![FieldError::new(
                "status",
                format!("cannot move from {} to {status}", current.status),
            )]));
        }
        let event = Event::BookingStatusChanged {
            id,
            provider: current.provider.key(),
            status,
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(Booking { status, ..current })
    }
}
