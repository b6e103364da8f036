use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_ID_LEN;
use crate::model::*;
use crate::time::{FormatError, TimeWindow, WallTime};

use super::EngineError;

/// A booking request exactly as a caller sent it. Nothing is trusted until
/// `validate` turns it into a `ValidatedBooking`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub provider_id: Option<String>,
    pub patient_id: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBooking {
    pub provider: ProviderRef,
    pub patient_id: String,
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl BookingRequest {
    pub fn new(
        provider_id: impl Into<String>,
        patient_id: impl Into<String>,
        date: impl Into<String>,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: Some(provider_id.into()),
            patient_id: Some(patient_id.into()),
            date: Some(date.into()),
            start_time: Some(start_time.into()),
            end_time: Some(end_time.into()),
        }
    }

    /// Check every field and report all problems at once. The booking must
    /// start after `now`.
    pub fn validate(&self, now: NaiveDateTime) -> Result<ValidatedBooking, EngineError> {
        let mut problems = Vec::new();

        let provider =
            required_id(&mut problems, "provider_id", &self.provider_id).map(ProviderRef::parse);
        let patient_id =
            required_id(&mut problems, "patient_id", &self.patient_id).map(str::to_string);

        let date = required(&mut problems, "date", &self.date).and_then(|s| {
            match s.parse::<NaiveDate>() {
                Ok(d) => Some(d),
                Err(_) => {
                    problems.push(FieldError::new("date", "expected YYYY-MM-DD"));
                    None
                }
            }
        });
        if let Some(d) = date
            && d < now.date()
        {
            problems.push(FieldError::new("date", "must not be in the past"));
        }

        let start = wall_time(&mut problems, "start_time", &self.start_time, str::parse::<WallTime>);
        let end = wall_time(&mut problems, "end_time", &self.end_time, WallTime::parse_end);
        let window = match (start, end) {
            (Some(s), Some(e)) => {
                let window = TimeWindow::try_new(s, e);
                if window.is_none() {
                    problems.push(FieldError::new("end_time", "must be after start_time"));
                }
                window
            }
            _ => None,
        };
        if let (Some(d), Some(w)) = (date, window)
            && d == now.date()
            && w.start <= WallTime::from_naive(now.time())
        {
            problems.push(FieldError::new("start_time", "must be in the future"));
        }

        match (provider, patient_id, date, window) {
            (Some(provider), Some(patient_id), Some(date), Some(window)) if problems.is_empty() => {
                Ok(ValidatedBooking {
                    provider,
                    patient_id,
                    date,
                    window,
                })
            }
            _ => Err(EngineError::Validation(problems)),
        }
    }
}

impl ValidatedBooking {
    /// The record to persist: confirmed on creation, with a fresh
    /// cancellation token.
    pub fn into_booking(self, id: Ulid) -> Booking {
        Booking {
            id,
            provider: self.provider,
            patient_id: self.patient_id,
            date: self.date,
            window: self.window,
            status: BookingStatus::Confirmed,
            cancellation_token: new_cancellation_token(),
        }
    }
}

fn required<'a>(
    problems: &mut Vec<FieldError>,
    field: &str,
    value: &'a Option<String>,
) -> Option<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            problems.push(FieldError::new(field, "is required"));
            None
        }
    }
}

fn required_id<'a>(
    problems: &mut Vec<FieldError>,
    field: &str,
    value: &'a Option<String>,
) -> Option<&'a str> {
    let v = required(problems, field, value)?;
    if v.len() > MAX_ID_LEN {
        problems.push(FieldError::new(field, "too long"));
        return None;
    }
    Some(v)
}

fn wall_time(
    problems: &mut Vec<FieldError>,
    field: &str,
    value: &Option<String>,
    parse: fn(&str) -> Result<WallTime, FormatError>,
) -> Option<WallTime> {
    let raw = required(problems, field, value)?;
    match parse(raw) {
        Ok(t) => Some(t),
        Err(e) => {
            problems.push(FieldError::new(field, e.to_string()));
            None
        }
    }
}
