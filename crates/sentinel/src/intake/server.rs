//! Intake HTTP surface.
//!
//! Routes:
//!
//! | method | path                  | body                          |
//! |--------|-----------------------|-------------------------------|
//! | POST   | /api/v1/events        | envelope or raw payload       |
//! | POST   | /api/v1/events/batch  | NDJSON, one event per line    |
//! | POST   | /api/v1/incidents     | legacy fixed shape            |
//!
//! Every request passes bearer auth (constant-time), a body-size cap,
//! severity validation, the min-severity gate, fingerprint suppression,
//! and the per-project rate limit before admission to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq as _;
use tracing::{info, warn};

use sentinel_config::SentinelConfig;

use super::ratelimit::RateLimiter;
use super::suppress::SuppressionMap;
use crate::entities::{truncate_graphemes, Event, Severity, TITLE_MAX_GRAPHEMES};
use crate::error::SentinelError;
use crate::fingerprint;
use crate::scheduler::Scheduler;
use crate::storage::Store;

/// Payload fields probed, in order, for a human title.
const TITLE_FIELDS: &[&str] = &[
    "title",
    "alert_name",
    "alertname",
    "name",
    "error_msg",
    "error",
    "message",
    "msg",
    "reason",
    "summary",
];

/// Shared state behind the intake routes.
pub struct IntakeState {
    pub config: Arc<SentinelConfig>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn Store>,
    pub suppression: Arc<SuppressionMap>,
    pub ratelimit: RateLimiter,
}

/// Build the intake router.
pub fn build_router(state: Arc<IntakeState>) -> Router {
    Router::new()
        .route("/api/v1/events", post(events_handler))
        .route("/api/v1/events/batch", post(batch_handler))
        .route("/api/v1/incidents", post(incidents_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct IntakeQuery {
    project: Option<String>,
    severity: Option<String>,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Terminal outcomes of the admission pipeline.
enum Admission {
    Queued { event_id: String, task_id: String },
    Deduplicated { event_id: String },
    Filtered,
}

impl Admission {
    fn into_response(self, accepted_status: StatusCode) -> Response {
        match self {
            Self::Queued { event_id, task_id } => (
                accepted_status,
                Json(EventResponse {
                    event_id: Some(event_id),
                    task_id: Some(task_id),
                    status: "queued",
                    reason: None,
                }),
            )
                .into_response(),
            Self::Deduplicated { event_id } => (
                StatusCode::OK,
                Json(EventResponse {
                    event_id: Some(event_id),
                    task_id: None,
                    status: "deduplicated",
                    reason: None,
                }),
            )
                .into_response(),
            Self::Filtered => (
                StatusCode::OK,
                Json(EventResponse {
                    event_id: None,
                    task_id: None,
                    status: "filtered",
                    reason: None,
                }),
            )
                .into_response(),
        }
    }
}

fn error_response(error: &SentinelError) -> Response {
    let status = match error {
        SentinelError::UnknownProject(_)
        | SentinelError::InvalidSeverity(_)
        | SentinelError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        SentinelError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        SentinelError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        SentinelError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(EventResponse {
            event_id: None,
            task_id: None,
            status: "rejected",
            reason: Some(error.to_string()),
        }),
    )
        .into_response()
}

/// Constant-time bearer-token check. An empty configured token disables
/// auth.
fn authorize(config: &SentinelConfig, headers: &HeaderMap) -> bool {
    let expected = config.intake.auth_token.as_bytes();
    if expected.is_empty() {
        return true;
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    presented.as_bytes().ct_eq(expected).into()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(EventResponse {
            event_id: None,
            task_id: None,
            status: "rejected",
            reason: Some("invalid token".to_string()),
        }),
    )
        .into_response()
}

/// Extract a display title: the provided one if non-empty, else the first
/// non-empty string among the probe fields. Control characters are
/// scrubbed and the result is grapheme-bounded.
fn extract_title(provided: Option<&str>, payload: &serde_json::Value) -> String {
    let raw = provided
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            TITLE_FIELDS.iter().find_map(|field| {
                payload
                    .get(field)
                    .and_then(serde_json::Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
            })
        })
        .unwrap_or_default();

    let scrubbed: String = raw.chars().filter(|c| !c.is_control()).collect();
    truncate_graphemes(scrubbed.trim(), TITLE_MAX_GRAPHEMES)
}

/// The shared admission pipeline; single events, batch lines and the
/// legacy endpoint all land here.
async fn admit(
    state: &IntakeState,
    project_key: &str,
    payload: serde_json::Value,
    source: String,
    severity: Severity,
    title: Option<&str>,
) -> Result<Admission, SentinelError> {
    let Some(project) = state.config.project(project_key) else {
        return Err(SentinelError::UnknownProject(project_key.to_string()));
    };

    let min_severity =
        Severity::parse(&state.config.intake.min_severity).unwrap_or(Severity::Info);
    if severity < min_severity {
        return Ok(Admission::Filtered);
    }

    let title = extract_title(title, &payload);
    let (fields, is_override) = state.config.dedup_fields(project);
    let fp = fingerprint::compute(project_key, &payload, fields, is_override);
    let event_id = format!("evt-{}", &uuid::Uuid::new_v4().to_string()[..8]);

    let window = state.config.dedup_window(project);
    if !state.suppression.check_and_insert(&fp, window) {
        info!(project = project_key, fingerprint = %fp, "suppressed duplicate");
        return Ok(Admission::Deduplicated { event_id });
    }

    if !state.ratelimit.allow(project_key) {
        return Err(SentinelError::RateLimited(project_key.to_string()));
    }

    let event = Event {
        id: event_id.clone(),
        project_key: project_key.to_string(),
        payload,
        source,
        severity,
        title,
        received_at: Utc::now(),
    };
    if let Err(e) = state.store.create_event(&event).await {
        warn!(event = %event.id, error = %e, "event persist failed");
    }

    let task_id = state.scheduler.submit(event).await?;
    Ok(Admission::Queued { event_id, task_id })
}

fn parse_severity(raw: Option<&str>) -> Result<Severity, SentinelError> {
    match raw {
        None => Ok(Severity::Warning),
        Some(s) => {
            Severity::parse(s).ok_or_else(|| SentinelError::InvalidSeverity(s.to_string()))
        }
    }
}

/// Decoded single-event request: either the envelope form or, when the
/// `project` query parameter is present, an arbitrary JSON payload.
#[derive(Debug)]
struct DecodedEvent {
    project_key: String,
    payload: serde_json::Value,
    source: String,
    severity: Severity,
    title: Option<String>,
}

fn decode_event(body: &[u8], query: &IntakeQuery) -> Result<DecodedEvent, SentinelError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| SentinelError::InvalidPayload(e.to_string()))?;

    if let Some(project_key) = query.project.clone() {
        // Query-string form: the entire body is the payload.
        return Ok(DecodedEvent {
            project_key,
            payload: value,
            source: "custom".to_string(),
            severity: parse_severity(query.severity.as_deref())?,
            title: None,
        });
    }

    #[derive(Deserialize)]
    struct Envelope {
        project_key: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        title: Option<String>,
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| SentinelError::InvalidPayload(format!("missing project_key: {e}")))?;
    Ok(DecodedEvent {
        project_key: envelope.project_key,
        payload: envelope.payload,
        source: envelope.source.unwrap_or_else(|| "custom".to_string()),
        severity: parse_severity(envelope.severity.as_deref())?,
        title: envelope.title,
    })
}

async fn events_handler(
    State(state): State<Arc<IntakeState>>,
    Query(query): Query<IntakeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorize(&state.config, &headers) {
        return unauthorized();
    }
    let limit = state.config.intake.max_payload_size;
    if body.len() > limit {
        return error_response(&SentinelError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }

    let decoded = match decode_event(&body, &query) {
        Ok(decoded) => decoded,
        Err(e) => return error_response(&e),
    };
    match admit(
        &state,
        &decoded.project_key,
        decoded.payload,
        decoded.source,
        decoded.severity,
        decoded.title.as_deref(),
    )
    .await
    {
        Ok(admission) => admission.into_response(StatusCode::ACCEPTED),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Serialize)]
struct BatchLineResult {
    line: usize,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    total: usize,
    accepted: usize,
    results: Vec<BatchLineResult>,
}

async fn batch_handler(
    State(state): State<Arc<IntakeState>>,
    Query(query): Query<IntakeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorize(&state.config, &headers) {
        return unauthorized();
    }
    let limit = state.config.intake.max_payload_size * 10;
    if body.len() > limit {
        return error_response(&SentinelError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }

    let text = String::from_utf8_lossy(&body);
    let mut results = Vec::new();
    let mut accepted = 0usize;

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let number = index + 1;
        let outcome = match decode_event(line.as_bytes(), &query) {
            Ok(decoded) => {
                admit(
                    &state,
                    &decoded.project_key,
                    decoded.payload,
                    decoded.source,
                    decoded.severity,
                    decoded.title.as_deref(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        results.push(match outcome {
            Ok(Admission::Queued { event_id, task_id }) => {
                accepted += 1;
                BatchLineResult {
                    line: number,
                    status: "queued".to_string(),
                    event_id: Some(event_id),
                    task_id: Some(task_id),
                    reason: None,
                }
            }
            Ok(Admission::Deduplicated { event_id }) => BatchLineResult {
                line: number,
                status: "deduplicated".to_string(),
                event_id: Some(event_id),
                task_id: None,
                reason: None,
            },
            Ok(Admission::Filtered) => BatchLineResult {
                line: number,
                status: "filtered".to_string(),
                event_id: None,
                task_id: None,
                reason: None,
            },
            Err(e) => BatchLineResult {
                line: number,
                status: "rejected".to_string(),
                event_id: None,
                task_id: None,
                reason: Some(e.to_string()),
            },
        });
    }

    let total = results.len();
    (
        StatusCode::OK,
        Json(BatchResponse {
            total,
            accepted,
            results,
        }),
    )
        .into_response()
}

/// Legacy fixed-shape incident body.
#[derive(Debug, Deserialize)]
struct LegacyIncident {
    project_key: String,
    #[serde(default)]
    alert_name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(flatten)]
    rest: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IncidentResponse {
    incident_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    status: &'static str,
}

async fn incidents_handler(
    State(state): State<Arc<IntakeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorize(&state.config, &headers) {
        return unauthorized();
    }
    let limit = state.config.intake.max_payload_size;
    if body.len() > limit {
        return error_response(&SentinelError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }

    let incident: LegacyIncident = match serde_json::from_slice(&body) {
        Ok(incident) => incident,
        Err(e) => return error_response(&SentinelError::InvalidPayload(e.to_string())),
    };
    let severity = match parse_severity(incident.severity.as_deref()) {
        Ok(severity) => severity,
        Err(e) => return error_response(&e),
    };

    // The whole legacy body (minus routing fields) is the payload.
    let payload = serde_json::to_value(&incident.rest).unwrap_or(serde_json::Value::Null);
    match admit(
        &state,
        &incident.project_key,
        payload,
        incident.source.unwrap_or_else(|| "legacy".to_string()),
        severity,
        incident.alert_name.as_deref(),
    )
    .await
    {
        Ok(Admission::Queued { event_id, task_id }) => (
            StatusCode::ACCEPTED,
            Json(IncidentResponse {
                incident_id: event_id,
                task_id: Some(task_id),
                status: "queued",
            }),
        )
            .into_response(),
        Ok(Admission::Deduplicated { event_id }) => (
            StatusCode::OK,
            Json(IncidentResponse {
                incident_id: event_id,
                task_id: None,
                status: "deduplicated",
            }),
        )
            .into_response(),
        Ok(Admission::Filtered) => (
            StatusCode::OK,
            Json(IncidentResponse {
                incident_id: String::new(),
                task_id: None,
                status: "filtered",
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title_prefers_provided() {
        let payload = serde_json::json!({"error_msg": "from payload"});
        assert_eq!(extract_title(Some("given"), &payload), "given");
        assert_eq!(extract_title(Some("  "), &payload), "from payload");
        assert_eq!(extract_title(None, &payload), "from payload");
    }

    #[test]
    fn test_extract_title_probe_order() {
        let payload = serde_json::json!({"msg": "later", "alert_name": "earlier"});
        assert_eq!(extract_title(None, &payload), "earlier");
    }

    #[test]
    fn test_extract_title_scrubs_and_bounds() {
        let payload = serde_json::json!({"message": "bad\u{0007}chars\nhere"});
        assert_eq!(extract_title(None, &payload), "badcharshere");

        let long = "t".repeat(300);
        let payload = serde_json::json!({ "message": long });
        assert_eq!(
            crate::entities::grapheme_len(&extract_title(None, &payload)),
            TITLE_MAX_GRAPHEMES
        );
    }

    #[test]
    fn test_extract_title_skips_non_strings() {
        let payload = serde_json::json!({"title": 42, "message": "real"});
        assert_eq!(extract_title(None, &payload), "real");
    }

    #[test]
    fn test_decode_event_envelope() {
        let body = serde_json::json!({
            "project_key": "svc-a",
            "payload": {"error_msg": "boom"},
            "severity": "critical",
            "title": "t"
        });
        let decoded =
            decode_event(body.to_string().as_bytes(), &IntakeQuery::default()).unwrap();
        assert_eq!(decoded.project_key, "svc-a");
        assert_eq!(decoded.severity, Severity::Critical);
        assert_eq!(decoded.payload["error_msg"], "boom");
    }

    #[test]
    fn test_decode_event_query_form_treats_body_as_payload() {
        let query = IntakeQuery {
            project: Some("svc-a".to_string()),
            severity: Some("info".to_string()),
        };
        let decoded = decode_event(br#"{"anything": true}"#, &query).unwrap();
        assert_eq!(decoded.project_key, "svc-a");
        assert_eq!(decoded.severity, Severity::Info);
        assert_eq!(decoded.payload["anything"], true);
    }

    #[test]
    fn test_decode_event_rejects_bad_severity_and_missing_project() {
        let body = serde_json::json!({"project_key": "svc-a", "severity": "fatal"});
        let err = decode_event(body.to_string().as_bytes(), &IntakeQuery::default()).unwrap_err();
        assert_eq!(err.kind(), "invalid_severity");

        let err =
            decode_event(br#"{"payload": {}}"#, &IntakeQuery::default()).unwrap_err();
        assert_eq!(err.kind(), "invalid_payload");
    }

    #[test]
    fn test_default_severity_is_warning() {
        let body = serde_json::json!({"project_key": "svc-a", "payload": {}});
        let decoded =
            decode_event(body.to_string().as_bytes(), &IntakeQuery::default()).unwrap();
        assert_eq!(decoded.severity, Severity::Warning);
    }
}
