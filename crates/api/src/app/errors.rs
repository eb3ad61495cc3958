use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use journalflow_accounting::JournalStatus;
use journalflow_core::JournalEntryId;
use journalflow_infra::WorkflowError;

pub fn workflow_error_to_response(err: WorkflowError) -> axum::response::Response {
    match err {
        WorkflowError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        WorkflowError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        WorkflowError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        WorkflowError::External(e) => {
            tracing::warn!(service = %e.service, kind = %e.kind, error = %e.message, "external service call failed");
            json_error(StatusCode::BAD_GATEWAY, "external_service_error", e.to_string())
        }
        WorkflowError::Store(msg) => {
            tracing::error!(error = %msg, "store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_entry_id(raw: &str) -> Result<JournalEntryId, axum::response::Response> {
    raw.parse()
        .map_err(|e: journalflow_core::DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

pub fn parse_status(raw: &str) -> Result<JournalStatus, axum::response::Response> {
    raw.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: Draft, Pending, Approved, Rejected",
        )
    })
}

/// Unwrap a JSON body, answering a malformed or missing one with a 400 validation error.
pub fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    body.map(|Json(value)| value).map_err(|rejection| {
        json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("invalid request body: {}", rejection.body_text()),
        )
    })
}
