//! Approval-engine callbacks.
//!
//! Always 200 for a known instance, including redeliveries, so the engine
//! stops retrying. 404 for an unknown instance, 500 for anything else.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde_json::{Value, json};

use journalflow_infra::{CallbackOutcome, PostingOutcome, WorkflowError};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/approval", post(approval))
        .route("/complete", post(complete))
        .route("/error", post(error))
}

pub async fn approval(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let payload = match errors::json_body(body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    respond(services.workflow.on_approval_callback(payload).await)
}

pub async fn complete(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let payload = match errors::json_body(body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    respond(services.workflow.on_completion_callback(payload).await)
}

pub async fn error(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let payload = match errors::json_body(body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    respond(services.workflow.on_error_callback(payload).await)
}

fn respond(result: Result<CallbackOutcome, WorkflowError>) -> axum::response::Response {
    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome_to_json(&outcome))).into_response(),
        Err(WorkflowError::NotFound(msg)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", msg),
        Err(WorkflowError::Validation(msg)) => {
            errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        Err(e) => {
            tracing::error!(error = %e, "approval callback failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

fn outcome_to_json(outcome: &CallbackOutcome) -> Value {
    match outcome {
        CallbackOutcome::Applied {
            entry_id,
            status,
            posting,
        } => {
            let (posting, document_number) = match posting {
                PostingOutcome::NotAttempted => ("not_attempted", None),
                PostingOutcome::Posted(number) => ("posted", Some(number.as_str())),
                PostingOutcome::Failed(_) => ("failed", None),
                PostingOutcome::TimedOut => ("pending", None),
            };
            json!({
                "success": true,
                "outcome": "applied",
                "entryId": entry_id.to_string(),
                "status": status,
                "posting": posting,
                "accountingDocumentNumber": document_number,
            })
        }
        CallbackOutcome::InstanceClosed => json!({ "success": true, "outcome": "instance_closed" }),
        CallbackOutcome::Duplicate => json!({ "success": true, "outcome": "duplicate" }),
    }
}
