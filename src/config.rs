use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_DISPLAY_CAP;

/// Knobs the engine reads on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Available slots shown per day in availability listings.
    pub display_cap: usize,
    /// Deadline for the side-effect-free storage calls of a request.
    pub storage_timeout: Duration,
    /// Notification deadline; expiry counts as a failed notification.
    pub notify_timeout: Duration,
    /// Attempts made at the compensating delete before giving up loudly.
    pub compensation_retries: u32,
    /// Deadline for each compensating delete attempt.
    pub compensation_timeout: Duration,
    /// Ledger debit per committed booking, in minor currency units.
    pub booking_fee: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_cap: DEFAULT_DISPLAY_CAP,
            storage_timeout: Duration::from_millis(5_000),
            notify_timeout: Duration::from_millis(10_000),
            compensation_retries: 3,
            compensation_timeout: Duration::from_millis(2_000),
            booking_fee: 0,
        }
    }
}

/// Process-level settings for the `slotbook` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub providers_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source; unset or unparsable values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            display_cap: parsed(&lookup, "SLOTBOOK_DISPLAY_CAP").unwrap_or(defaults.display_cap),
            storage_timeout: parsed(&lookup, "SLOTBOOK_STORAGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.storage_timeout),
            notify_timeout: parsed(&lookup, "SLOTBOOK_NOTIFY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_timeout),
            compensation_retries: parsed(&lookup, "SLOTBOOK_COMPENSATION_RETRIES")
                .unwrap_or(defaults.compensation_retries)
                .max(1),
            compensation_timeout: parsed(&lookup, "SLOTBOOK_COMPENSATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.compensation_timeout),
            booking_fee: parsed(&lookup, "SLOTBOOK_BOOKING_FEE").unwrap_or(defaults.booking_fee),
        };

        Self {
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            providers_file: lookup("SLOTBOOK_PROVIDERS").map(PathBuf::from),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            engine,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}
