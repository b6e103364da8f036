use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::{TimeWindow, WallTime};

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Provider identity ─────────────────────────────────────────────

/// A provider id as found in storage. The same provider may have been written
/// under its native id or under that id's string form; both must resolve to the
/// same provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRef {
    Native(Ulid),
    Text(String),
}

/// Canonical form of a `ProviderRef`. Every index is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey(String);

impl ProviderRef {
    /// Interpret caller input: a valid ULID becomes `Native`, anything else `Text`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match Ulid::from_string(raw) {
            Ok(id) => ProviderRef::Native(id),
            Err(_) => ProviderRef::Text(raw.to_string()),
        }
    }

    pub fn key(&self) -> ProviderKey {
        match self {
            ProviderRef::Native(id) => ProviderKey(id.to_string()),
            ProviderRef::Text(s) => {
                let s = s.trim();
                match Ulid::from_string(s) {
                    Ok(id) => ProviderKey(id.to_string()),
                    Err(_) => ProviderKey(s.to_string()),
                }
            }
        }
    }

    /// True if both refs name the same provider, whatever their encoding.
    pub fn matches(&self, other: &ProviderRef) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl ProviderKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Provider schedule ─────────────────────────────────────────────

/// Recurring weekly window during which a provider takes appointments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub day_of_week: u8,
    pub start_time: WallTime,
    pub end_time: WallTime,
}

impl AvailabilityRule {
    pub fn window(&self) -> Option<TimeWindow> {
        TimeWindow::try_new(self.start_time, self.end_time)
    }

    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.day_of_week == day_of_week(date)
    }
}

/// Closed date range during which a sub-window is closed regardless of rules.
///
/// The range is continuous: it starts at `from_date start_time`, ends at
/// `to_date end_time`, and covers every day in between entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutRange {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub start_time: WallTime,
    pub end_time: WallTime,
}

impl BlackoutRange {
    pub fn is_well_formed(&self) -> bool {
        self.from_date <= self.to_date
            && (self.from_date, self.start_time) < (self.to_date, self.end_time)
    }

    /// The part of this blackout that falls on `date`, if any.
    pub fn window_on(&self, date: NaiveDate) -> Option<TimeWindow> {
        if date < self.from_date || date > self.to_date {
            return None;
        }
        let start = if date == self.from_date {
            self.start_time
        } else {
            WallTime::MIDNIGHT
        };
        let end = if date == self.to_date {
            self.end_time
        } else {
            WallTime::END_OF_DAY
        };
        TimeWindow::try_new(start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderRef,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rules: Vec<AvailabilityRule>,
    #[serde(default)]
    pub blackouts: Vec<BlackoutRange>,
}

impl Provider {
    pub fn new(id: ProviderRef) -> Self {
        Self {
            id,
            name: None,
            rules: Vec::new(),
            blackouts: Vec::new(),
        }
    }

    pub fn rules_on(&self, date: NaiveDate) -> impl Iterator<Item = &AvailabilityRule> {
        self.rules.iter().filter(move |r| r.applies_on(date))
    }

    pub fn blackout_windows_on(&self, date: NaiveDate) -> Vec<TimeWindow> {
        self.blackouts
            .iter()
            .filter_map(|b| b.window_on(date))
            .collect()
    }

    /// Shape problems in the schedule. Empty means the provider is usable.
    pub fn problems(&self) -> Vec<FieldError> {
        use crate::limits::*;
        let mut problems = Vec::new();
        if self.id.key().as_str().is_empty() {
            problems.push(FieldError::new("id", "must not be empty"));
        }
        if self.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            problems.push(FieldError::new("name", "too long"));
        }
        if self.rules.len() > MAX_RULES_PER_PROVIDER {
            problems.push(FieldError::new("rules", "too many availability rules"));
        }
        if self.blackouts.len() > MAX_BLACKOUTS_PER_PROVIDER {
            problems.push(FieldError::new("blackouts", "too many blackout ranges"));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.day_of_week > 6 {
                problems.push(FieldError::new(
                    format!("rules[{i}].day_of_week"),
                    "must be 0 (Sunday) to 6 (Saturday)",
                ));
            }
            if rule.window().is_none() {
                problems.push(FieldError::new(
                    format!("rules[{i}].end_time"),
                    "must be after start_time",
                ));
            }
        }
        for (i, blackout) in self.blackouts.iter().enumerate() {
            if !blackout.is_well_formed() {
                problems.push(FieldError::new(
                    format!("blackouts[{i}]"),
                    "must end after it starts",
                ));
            }
        }
        problems
    }
}

// ── Bookings ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Everything except a cancellation occupies the provider's time.
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider: ProviderRef,
    pub patient_id: String,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub status: BookingStatus,
    pub cancellation_token: String,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Active and overlapping `window` on `date`.
    pub fn occupies(&self, date: NaiveDate, window: &TimeWindow) -> bool {
        self.is_active() && self.date == date && self.window.overlaps(window)
    }
}

/// 160 random bits, hex encoded.
pub fn new_cancellation_token() -> String {
    format!("{:020x}{:020x}", Ulid::new().random(), Ulid::new().random())
}

// ── Derived slots ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked { booking_id: Ulid, patient_id: String },
    Blocked,
}

/// A fixed-length bookable slot: session followed by a break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSlot {
    pub date: NaiveDate,
    pub start_time: WallTime,
    pub end_time: WallTime,
    pub session_start: WallTime,
    pub session_end: WallTime,
    pub break_start: WallTime,
    pub break_end: WallTime,
    pub status: SlotStatus,
}

impl CandidateSlot {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time)
    }
}

/// One line of an availability listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AvailabilityEntry {
    Slot(CandidateSlot),
    /// The provider has no availability rule for this weekday.
    Unavailable { date: NaiveDate },
}

impl AvailabilityEntry {
    pub fn date(&self) -> NaiveDate {
        match self {
            AvailabilityEntry::Slot(slot) => slot.date,
            AvailabilityEntry::Unavailable { date } => *date,
        }
    }

    pub fn as_slot(&self) -> Option<&CandidateSlot> {
        match self {
            AvailabilityEntry::Slot(slot) => Some(slot),
            AvailabilityEntry::Unavailable { .. } => None,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            AvailabilityEntry::Slot(slot) => match slot.status {
                SlotStatus::Available => "available",
                SlotStatus::Booked { .. } => "booked",
                SlotStatus::Blocked => "blocked",
            },
            AvailabilityEntry::Unavailable { .. } => "unavailable",
        }
    }
}

// ── Validation detail ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ── Journal records ───────────────────────────────────────────────

/// Journal record: one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderUpserted {
        provider: Provider,
    },
    BookingInserted {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        provider: ProviderKey,
    },
    BookingStatusChanged {
        id: Ulid,
        provider: ProviderKey,
        status: BookingStatus,
    },
}

impl Event {
    pub fn provider_key(&self) -> ProviderKey {
        match self {
            Event::ProviderUpserted { provider } => provider.id.key(),
            Event::BookingInserted { booking } => booking.provider.key(),
            Event::BookingDeleted { provider, .. }
            | Event::BookingStatusChanged { provider, .. } => provider.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn t(s: &str) -> WallTime {
        s.parse().unwrap()
    }

    #[test]
    fn provider_ref_encodings_share_a_key() {
        let id = Ulid::new();
        let native = ProviderRef::Native(id);
        let text = ProviderRef::Text(id.to_string());
        let padded = ProviderRef::Text(format!("  {id} "));
        assert!(native.matches(&text));
        assert!(text.matches(&padded));
        assert!(!native.matches(&ProviderRef::Native(Ulid::new())));
    }

    #[test]
    fn provider_ref_parse() {
        let id = Ulid::new();
        assert_eq!(ProviderRef::parse(&id.to_string()), ProviderRef::Native(id));
        assert_eq!(
            ProviderRef::parse("therapist-7"),
            ProviderRef::Text("therapist-7".into())
        );
    }

    #[test]
    fn weekday_numbering_starts_sunday() {
        assert_eq!(day_of_week(d("2026-01-04")), 0); // Sunday
        assert_eq!(day_of_week(d("2026-01-05")), 1);
        assert_eq!(day_of_week(d("2026-01-10")), 6);
    }

    #[test]
    fn single_day_blackout() {
        let b = BlackoutRange {
            from_date: d("2026-01-05"),
            to_date: d("2026-01-05"),
            start_time: t("12:00"),
            end_time: t("14:00"),
        };
        assert!(b.is_well_formed());
        assert_eq!(
            b.window_on(d("2026-01-05")),
            Some(TimeWindow::new(t("12:00"), t("14:00")))
        );
        assert_eq!(b.window_on(d("2026-01-06")), None);
    }

    #[test]
    fn multi_day_blackout_is_continuous() {
        let b = BlackoutRange {
            from_date: d("2026-01-05"),
            to_date: d("2026-01-07"),
            start_time: t("15:00"),
            end_time: t("10:00"),
        };
        assert!(b.is_well_formed());
        assert_eq!(
            b.window_on(d("2026-01-05")),
            Some(TimeWindow::new(t("15:00"), WallTime::END_OF_DAY))
        );
        assert_eq!(
            b.window_on(d("2026-01-06")),
            Some(TimeWindow::new(WallTime::MIDNIGHT, WallTime::END_OF_DAY))
        );
        assert_eq!(
            b.window_on(d("2026-01-07")),
            Some(TimeWindow::new(WallTime::MIDNIGHT, t("10:00")))
        );
    }

    #[test]
    fn inverted_blackout_is_malformed() {
        let b = BlackoutRange {
            from_date: d("2026-01-05"),
            to_date: d("2026-01-05"),
            start_time: t("14:00"),
            end_time: t("12:00"),
        };
        assert!(!b.is_well_formed());
        let b = BlackoutRange {
            from_date: d("2026-01-06"),
            to_date: d("2026-01-05"),
            start_time: t("08:00"),
            end_time: t("12:00"),
        };
        assert!(!b.is_well_formed());
    }

    #[test]
    fn provider_problems_are_listed_per_field() {
        let mut p = Provider::new(ProviderRef::Text("p1".into()));
        p.rules.push(AvailabilityRule {
            day_of_week: 7,
            start_time: t("10:00"),
            end_time: t("09:00"),
        });
        let problems = p.problems();
        let fields: Vec<_> = problems.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["rules[0].day_of_week", "rules[0].end_time"]);
    }

    #[test]
    fn status_lifecycle() {
        use BookingStatus::*;
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(Pending.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.is_active());
        assert!(NoShow.is_active());
    }

    #[test]
    fn cancellation_tokens_are_unique() {
        let a = new_cancellation_token();
        let b = new_cancellation_token();
        assert_eq!(a.len(), 40);
        assert_ne!(a, b);
    }

    #[test]
    fn event_bincode_roundtrip() {
        let event = Event::BookingInserted {
            booking: Booking {
                id: Ulid::new(),
                provider: ProviderRef::Text("p1".into()),
                patient_id: "patient-1".into(),
                date: d("2026-01-05"),
                window: TimeWindow::new(t("09:00"), t("10:00")),
                status: BookingStatus::Confirmed,
                cancellation_token: new_cancellation_token(),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
