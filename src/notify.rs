use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use ulid::Ulid;

use crate::model::{Booking, ProviderKey};
use crate::time::TimeWindow;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivers the booking confirmation. A booking only stands once this
/// succeeds.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, booking: &Booking) -> Result<(), NotifyError>;
}

/// What goes out about a confirmed booking. Carries no patient identifier
/// and no cancellation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub provider: ProviderKey,
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl From<&Booking> for BookingNotice {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id,
            provider: b.provider.key(),
            date: b.date,
            window: b.window,
        }
    }
}

/// In-process confirmation channel.
///
/// Every notice goes to the outbox, which some dispatcher must be draining:
/// with no outbox subscriber a notice cannot be delivered and `notify` fails.
/// Per-provider watchers additionally see notices for their provider, on a
/// best-effort basis.
pub struct NotifyHub {
    outbox: broadcast::Sender<BookingNotice>,
    watchers: DashMap<ProviderKey, broadcast::Sender<BookingNotice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            outbox: broadcast::channel(CHANNEL_CAPACITY).0,
            watchers: DashMap::new(),
        }
    }

    pub fn subscribe_outbox(&self) -> broadcast::Receiver<BookingNotice> {
        self.outbox.subscribe()
    }

    /// Watch confirmations for one provider. Creates the channel if needed.
    pub fn watch(&self, provider: ProviderKey) -> broadcast::Receiver<BookingNotice> {
        self.watchers
            .entry(provider)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn unwatch(&self, provider: &ProviderKey) {
        self.watchers.remove(provider);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for NotifyHub {
    async fn notify(&self, booking: &Booking) -> Result<(), NotifyError> {
        let notice = BookingNotice::from(booking);
        if let Some(watcher) = self.watchers.get(&notice.provider) {
            let _ = watcher.send(notice.clone());
        }
        self.outbox
            .send(notice)
            .map(|_| ())
            .map_err(|_| NotifyError("no dispatcher is draining the outbox".into()))
    }
}

/// Feed every outbox notice to `deliver` until the hub is dropped. Falling
/// behind skips the overwritten notices but keeps the dispatcher alive, since
/// `notify` fails for as long as nobody holds the outbox. Returns the number
/// of notices delivered.
pub async fn drain_outbox(
    mut outbox: broadcast::Receiver<BookingNotice>,
    mut deliver: impl FnMut(BookingNotice),
) -> u64 {
    let mut delivered = 0;
    loop {
        match outbox.recv().await {
            Ok(notice) => {
                deliver(notice);
                delivered += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("outbox dispatcher fell behind, {skipped} confirmations skipped");
            }
            Err(RecvError::Closed) => return delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::model::*;

    fn booking(provider: &str) -> Booking {
        Booking {
            id: Ulid::new(),
            provider: ProviderRef::parse(provider),
            patient_id: "patient-1".into(),
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            window: TimeWindow::new("09:00".parse().unwrap(), "10:30".parse().unwrap()),
            status: BookingStatus::Confirmed,
            cancellation_token: new_cancellation_token(),
        }
    }

    #[tokio::test]
    async fn outbox_receives_notice() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe_outbox();
        let b = booking("dr-a");

        hub.notify(&b).await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.booking_id, b.id);
        assert_eq!(notice.provider, b.provider.key());
    }

    #[tokio::test]
    async fn notify_without_dispatcher_fails() {
        let hub = NotifyHub::new();
        assert!(hub.notify(&booking("dr-a")).await.is_err());
    }

    #[tokio::test]
    async fn watcher_only_sees_its_provider() {
        let hub = NotifyHub::new();
        let _outbox = hub.subscribe_outbox();
        let mut rx = hub.watch(ProviderRef::parse("dr-a").key());

        hub.notify(&booking("dr-b")).await.unwrap();
        let a = booking("dr-a");
        hub.notify(&a).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().booking_id, a.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notice_omits_patient_and_token() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe_outbox();
        let b = booking("dr-a");
        hub.notify(&b).await.unwrap();

        let json = serde_json::to_string(&rx.recv().await.unwrap()).unwrap();
        assert!(!json.contains("patient-1"));
        assert!(!json.contains(&b.cancellation_token));
    }

    #[tokio::test]
    async fn dispatcher_survives_falling_behind() {
        let hub = Arc::new(NotifyHub::new());
        let outbox = hub.subscribe_outbox();
        for _ in 0..CHANNEL_CAPACITY + 44 {
            hub.notify(&booking("dr-a")).await.unwrap();
        }

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(drain_outbox(outbox, move |notice| {
            let _ = seen_tx.send(notice.booking_id);
        }));

        // The backlog that survived the overflow is delivered.
        for _ in 0..CHANNEL_CAPACITY {
            seen.recv().await.unwrap();
        }

        // The dispatcher still holds the outbox, so new bookings confirm.
        let late = booking("dr-a");
        hub.notify(&late).await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), late.id);

        drop(hub);
        assert_eq!(dispatcher.await.unwrap(), CHANNEL_CAPACITY as u64 + 1);
    }

    #[tokio::test]
    async fn unwatch_drops_channel() {
        let hub = NotifyHub::new();
        let _outbox = hub.subscribe_outbox();
        let key = ProviderRef::parse("dr-a").key();
        let mut rx = hub.watch(key.clone());
        hub.unwatch(&key);

        hub.notify(&booking("dr-a")).await.unwrap();
        assert!(rx.recv().await.is_err());
    }
}
