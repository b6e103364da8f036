use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Minutes since local midnight.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// A wall-clock string that is not `HH:MM` on the 24h grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub input: String,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected HH:MM (00:00-23:59), got {:?}", self.input)
    }
}

impl std::error::Error for FormatError {}

/// Parse `HH:MM` into minutes since midnight. A single-digit hour is accepted,
/// minutes must always have two digits.
pub fn to_minutes(s: &str) -> Result<Minutes, FormatError> {
    let err = || FormatError { input: s.to_string() };
    let (h, m) = s.split_once(':').ok_or_else(err)?;
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
        return Err(err());
    }
    let hours: Minutes = h.parse().map_err(|_| err())?;
    let minutes: Minutes = m.parse().map_err(|_| err())?;
    if hours > 23 || minutes > 59 {
        return Err(err());
    }
    Ok(hours * 60 + minutes)
}

/// Format minutes since midnight as zero-padded `HH:MM`. `MINUTES_PER_DAY`
/// renders as `24:00`; anything later is not a wall-clock time.
pub fn from_minutes(minutes: Minutes) -> Result<String, FormatError> {
    if minutes > MINUTES_PER_DAY {
        return Err(FormatError {
            input: minutes.to_string(),
        });
    }
    Ok(hh_mm(minutes))
}

fn hh_mm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open overlap test: `[s1, e1)` and `[s2, e2)` share at least one minute.
/// Touching boundaries do not overlap.
pub fn overlaps(s1: Minutes, e1: Minutes, s2: Minutes, e2: Minutes) -> bool {
    s1 < e2 && s2 < e1
}

/// A point on the local wall clock at minute granularity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallTime(Minutes);

impl WallTime {
    pub const MIDNIGHT: WallTime = WallTime(0);
    /// Exclusive bound for windows that run to the end of the day. Written
    /// `24:00`, which only `parse_end` accepts.
    pub const END_OF_DAY: WallTime = WallTime(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: Minutes) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub const fn minutes(self) -> Minutes {
        self.0
    }

    pub fn plus(self, delta: Minutes) -> Option<Self> {
        self.0.checked_add(delta).and_then(Self::from_minutes)
    }

    pub fn from_naive(t: NaiveTime) -> Self {
        Self(t.hour() * 60 + t.minute())
    }

    /// Parse the end of a window: any `HH:MM`, or `24:00` for end of day.
    pub fn parse_end(s: &str) -> Result<Self, FormatError> {
        if s == "24:00" {
            return Ok(Self::END_OF_DAY);
        }
        s.parse()
    }
}

impl FromStr for WallTime {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        to_minutes(s).map(Self)
    }
}

impl TryFrom<String> for WallTime {
    type Error = FormatError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse_end(&s)
    }
}

impl From<WallTime> for String {
    fn from(t: WallTime) -> Self {
        hh_mm(t.0)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hh_mm(self.0))
    }
}

impl fmt::Debug for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WallTime({self})")
    }
}

/// Half-open wall-clock window `[start, end)` inside one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: WallTime,
    pub end: WallTime,
}

impl TimeWindow {
    pub fn new(start: WallTime, end: WallTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: WallTime, end: WallTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Minutes {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        overlaps(
            self.start.minutes(),
            self.end.minutes(),
            other.start.minutes(),
            other.end.minutes(),
        )
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> WallTime {
        s.parse().unwrap()
    }

    #[test]
    fn parses_wall_clock() {
        assert_eq!(to_minutes("00:00"), Ok(0));
        assert_eq!(to_minutes("09:30"), Ok(570));
        assert_eq!(to_minutes("9:30"), Ok(570));
        assert_eq!(to_minutes("23:59"), Ok(1439));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "9", "24:00", "12:60", "12:5", "ab:cd", "-1:00", "12:00:00", " 9:00", "123:00"] {
            assert!(to_minutes(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn formats_zero_padded() {
        assert_eq!(from_minutes(0).unwrap(), "00:00");
        assert_eq!(from_minutes(570).unwrap(), "09:30");
        assert_eq!(from_minutes(MINUTES_PER_DAY).unwrap(), "24:00");
    }

    #[test]
    fn refuses_to_format_past_end_of_day() {
        assert!(from_minutes(MINUTES_PER_DAY + 1).is_err());
        assert_eq!(from_minutes(2000).unwrap_err().input, "2000");
    }

    #[test]
    fn end_of_day_only_as_window_end() {
        assert!("24:00".parse::<WallTime>().is_err());
        assert_eq!(WallTime::parse_end("24:00"), Ok(WallTime::END_OF_DAY));
        assert_eq!(WallTime::parse_end("13:30"), Ok(t("13:30")));
        assert!(WallTime::parse_end("24:01").is_err());
    }

    #[test]
    fn touching_windows_do_not_overlap() {
        assert!(!overlaps(540, 600, 600, 660));
        assert!(!overlaps(600, 660, 540, 600));
        assert!(overlaps(540, 601, 600, 660));
    }

    #[test]
    fn containment_overlaps_both_ways() {
        let outer = TimeWindow::new(t("08:00"), t("11:00"));
        let inner = TimeWindow::new(t("09:00"), t("10:00"));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn try_new_requires_order() {
        assert!(TimeWindow::try_new(t("10:00"), t("10:00")).is_none());
        assert!(TimeWindow::try_new(t("11:00"), t("10:00")).is_none());
        assert_eq!(TimeWindow::try_new(t("10:00"), t("11:30")).unwrap().duration(), 90);
    }

    #[test]
    fn wall_time_plus_is_bounded() {
        assert_eq!(t("22:30").plus(90), Some(WallTime::END_OF_DAY));
        assert_eq!(t("23:00").plus(90), None);
    }

    #[test]
    fn wall_time_serializes_as_string() {
        let json = serde_json::to_string(&t("07:05")).unwrap();
        assert_eq!(json, "\"07:05\"");
        let back: WallTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t("07:05"));
        assert!(serde_json::from_str::<WallTime>("\"7:5\"").is_err());
        let end: WallTime = serde_json::from_str("\"24:00\"").unwrap();
        assert_eq!(end, WallTime::END_OF_DAY);
    }
}
