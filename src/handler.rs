use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::{FieldError, ProviderRef};
use crate::time::{TimeWindow, WallTime};

/// One caller request, as a JSON object tagged by `op`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Availability {
        provider_id: String,
        from: String,
        to: String,
    },
    Book(BookingRequest),
    Cancel {
        token: String,
    },
    Conflict {
        provider_id: String,
        date: String,
        start_time: String,
        end_time: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn created(body: Value) -> Self {
        Self { status: 201, body }
    }

    fn error(err: &EngineError) -> Self {
        let mut body = json!({
            "error": err.kind(),
            "message": err.to_string(),
        });
        if let EngineError::Validation(problems) = err {
            body["problems"] = json!(problems);
        }
        Self {
            status: status_code(err),
            body,
        }
    }
}

pub fn status_code(err: &EngineError) -> u16 {
    match err {
        EngineError::Validation(_) => 400,
        EngineError::NotFound(_) => 404,
        EngineError::Conflict { .. } => 409,
        EngineError::Notification { .. } => 503,
        EngineError::Internal { .. } => 500,
    }
}

/// Parse one line and run it against the engine.
pub async fn dispatch(engine: &Engine, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return Response::error(&EngineError::validation("request", e.to_string()));
        }
    };
    match handle(engine, request).await {
        Ok(response) => response,
        Err(e) => Response::error(&e),
    }
}

async fn handle(engine: &Engine, request: Request) -> Result<Response, EngineError> {
    match request {
        Request::Availability {
            provider_id,
            from,
            to,
        } => {
            let (from, to) = collect_problems(|p| (date(p, "from", &from), date(p, "to", &to)))?;
            let entries = engine
                .availability(&ProviderRef::parse(&provider_id), from, to)
                .await?;
            Ok(Response::ok(json!({ "entries": entries })))
        }
        Request::Book(req) => {
            let receipt = engine.book(&req).await?;
            Ok(Response::created(json!({
                "booking_id": receipt.booking_id,
                "cancellation_token": receipt.cancellation_token,
                "booking": receipt.booking,
            })))
        }
        Request::Cancel { token } => {
            let booking = engine.cancel(&token).await?;
            Ok(Response::ok(json!({
                "booking_id": booking.id,
                "status": booking.status.label(),
            })))
        }
        Request::Conflict {
            provider_id,
            date: raw_date,
            start_time,
            end_time,
        } => {
            let (date, window) = collect_problems(|p| {
                let date = date(p, "date", &raw_date);
                let window = window(p, &start_time, &end_time);
                (date, window)
            })?;
            let conflict = engine
                .has_conflict(&ProviderRef::parse(&provider_id), date, &window)
                .await?;
            Ok(Response::ok(json!({ "conflict": conflict })))
        }
    }
}

fn collect_problems<A, B>(
    parse: impl FnOnce(&mut Vec<FieldError>) -> (Option<A>, Option<B>),
) -> Result<(A, B), EngineError> {
    let mut problems = Vec::new();
    match parse(&mut problems) {
        (Some(a), Some(b)) if problems.is_empty() => Ok((a, b)),
        _ => Err(EngineError::Validation(problems)),
    }
}

fn date(problems: &mut Vec<FieldError>, field: &str, raw: &str) -> Option<NaiveDate> {
    match raw.trim().parse() {
        Ok(d) => Some(d),
        Err(_) => {
            problems.push(FieldError::new(field, "expected YYYY-MM-DD"));
            None
        }
    }
}

fn window(problems: &mut Vec<FieldError>, start: &str, end: &str) -> Option<TimeWindow> {
    let mut time = |field: &str, raw: &str| match raw.parse::<WallTime>() {
        Ok(t) => Some(t),
        Err(e) => {
            problems.push(FieldError::new(field, e.to_string()));
            None
        }
    };
    let (start, end) = (time("start_time", start)?, time("end_time", end)?);
    let window = TimeWindow::try_new(start, end);
    if window.is_none() {
        problems.push(FieldError::new("end_time", "must be after start_time"));
    }
    window
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDateTime;

    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::engine::Collaborators;
    use crate::ledger::InMemoryLedger;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::BookingStore;

    async fn engine() -> (Engine, Arc<NotifyHub>) {
        let store = Arc::new(BookingStore::in_memory());
        let mut provider = Provider::new(ProviderRef::parse("dr-a"));
        provider.rules.push(AvailabilityRule {
            day_of_week: 1,
            start_time: "09:00".parse().unwrap(),
            end_time: "12:00".parse().unwrap(),
        });
        store.upsert_provider(provider).await.unwrap();

        let hub = Arc::new(NotifyHub::new());
        let now: NaiveDateTime = "2026-01-05T08:00:00".parse().unwrap();
        let engine = Engine::new(
            Collaborators::with_store(
                store,
                hub.clone(),
                Arc::new(InMemoryLedger::new()),
                Arc::new(FixedClock(now)),
            ),
            EngineConfig::default(),
        );
        (engine, hub)
    }

    #[tokio::test]
    async fn book_then_conflict_then_cancel() {
        let (engine, hub) = engine().await;
        let _outbox = hub.subscribe_outbox();
        let book = r#"{"op":"book","provider_id":"dr-a","patient_id":"p1","date":"2026-01-05","start_time":"09:00","end_time":"10:30"}"#;

        let created = dispatch(&engine, book).await;
        assert_eq!(created.status, 201);
        let token = created.body["cancellation_token"].as_str().unwrap().to_string();

        let again = dispatch(&engine, book).await;
        assert_eq!(again.status, 409);
        assert_eq!(again.body["error"], "conflict");

        let check = dispatch(
            &engine,
            r#"{"op":"conflict","provider_id":"dr-a","date":"2026-01-05","start_time":"10:00","end_time":"11:00"}"#,
        )
        .await;
        assert_eq!(check.status, 200);
        assert_eq!(check.body["conflict"], true);

        let cancel = dispatch(&engine, &json!({"op": "cancel", "token": token}).to_string()).await;
        assert_eq!(cancel.status, 200);
        assert_eq!(cancel.body["status"], "cancelled");

        assert_eq!(dispatch(&engine, book).await.status, 201);
    }

    #[tokio::test]
    async fn availability_lists_entries() {
        let (engine, _hub) = engine().await;
        let resp = dispatch(
            &engine,
            r#"{"op":"availability","provider_id":"dr-a","from":"2026-01-05","to":"2026-01-06"}"#,
        )
        .await;
        assert_eq!(resp.status, 200);
        let entries = resp.body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["kind"], "slot");
        assert_eq!(entries[0]["start_time"], "09:00");
        assert_eq!(entries[0]["status"]["state"], "available");
        assert_eq!(entries[2]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn malformed_requests_are_400() {
        let (engine, _hub) = engine().await;
        assert_eq!(dispatch(&engine, "not json").await.status, 400);
        assert_eq!(dispatch(&engine, r#"{"op":"launch"}"#).await.status, 400);

        let resp = dispatch(
            &engine,
            r#"{"op":"conflict","provider_id":"dr-a","date":"5 Jan","start_time":"25:00","end_time":"10:00"}"#,
        )
        .await;
        assert_eq!(resp.status, 400);
        let fields: Vec<&str> = resp.body["problems"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["date", "start_time"]);
    }

    #[tokio::test]
    async fn unknown_provider_is_404() {
        let (engine, _hub) = engine().await;
        let resp = dispatch(
            &engine,
            r#"{"op":"availability","provider_id":"dr-z","from":"2026-01-05","to":"2026-01-05"}"#,
        )
        .await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn undeliverable_confirmation_is_503() {
        let (engine, _hub) = engine().await;
        let resp = dispatch(
            &engine,
            r#"{"op":"book","provider_id":"dr-a","patient_id":"p1","date":"2026-01-05","start_time":"09:00","end_time":"10:30"}"#,
        )
        .await;
        assert_eq!(resp.status, 503);
        assert_eq!(resp.body["error"], "notification");
    }
}
