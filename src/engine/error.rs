use ulid::Ulid;

use crate::model::FieldError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing input, or a date/time in the past.
    Validation(Vec<FieldError>),
    /// An active booking already overlaps the requested window.
    Conflict { booking_id: Option<Ulid> },
    NotFound(String),
    /// The confirmation could not be sent after the booking was stored.
    /// `rolled_back` is false only if the compensating delete also failed.
    Notification { detail: String, rolled_back: bool },
    Internal {
        operation: &'static str,
        detail: String,
    },
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Notification { .. } => "notification",
            EngineError::Internal { .. } => "internal",
        }
    }

    /// Convert a storage failure, keeping the operation name for diagnosis.
    pub fn from_store(operation: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Occupied { booking_id } => EngineError::Conflict {
                booking_id: Some(booking_id),
            },
            StoreError::Invalid(problems) => EngineError::Validation(problems),
            other @ (StoreError::AlreadyExists(_)
            | StoreError::LimitExceeded(_)
            | StoreError::Journal(_)) => EngineError::Internal {
                operation,
                detail: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(problems) => {
                write!(f, "invalid request")?;
                for (i, p) in problems.iter().enumerate() {
                    write!(f, "{} {p}", if i == 0 { ":" } else { ";" })?;
                }
                Ok(())
            }
            EngineError::Conflict {
                booking_id: Some(id),
            } => write!(f, "time window conflicts with booking {id}"),
            EngineError::Conflict { booking_id: None } => {
                write!(f, "time window conflicts with an existing booking")
            }
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Notification {
                detail,
                rolled_back: true,
            } => write!(f, "confirmation not sent, booking withdrawn: {detail}"),
            EngineError::Notification {
                detail,
                rolled_back: false,
            } => write!(
                f,
                "confirmation not sent and booking withdrawal failed: {detail}"
            ),
            EngineError::Internal { operation, detail } => {
                write!(f, "internal error in {operation}: {detail}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
