use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use journalflow_accounting::JournalEntryDraft;

use crate::app::routes::common::require;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_entries).post(create_entry))
        .route("/stats", get(dashboard_stats))
        .route("/:id", get(get_entry).put(update_entry).delete(delete_entry))
        .route("/:id/logs", get(workflow_logs))
        .route("/:id/payload", get(preview_payload))
        .route("/:id/submit", post(submit))
        .route("/:id/approve", post(approve))
        .route("/:id/reject", post(reject))
        .route("/:id/send-to-external-approval", post(send_to_external_approval))
        .route("/:id/post-to-erp", post(post_to_erp))
}

/// Unwrap a `Result<_, Response>` or return the response from the handler.
macro_rules! try_resp {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    };
}

pub async fn list_entries(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListEntriesQuery>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_READ));
    let status = match query.status.as_deref() {
        Some(raw) => Some(try_resp!(errors::parse_status(raw))),
        None => None,
    };

    match services.workflow.list_entries(status).await {
        Ok(entries) => {
            let items = entries.iter().map(dto::entry_summary_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(json!({ "items": items }))).into_response()
        }
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn create_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<JournalEntryDraft>, JsonRejection>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_WRITE));
    let body = try_resp!(errors::json_body(body));
    match services.workflow.create_entry(body).await {
        Ok(entry) => (StatusCode::CREATED, Json(dto::entry_to_json(&entry))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn get_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_READ));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.get_entry(id).await {
        Ok(entry) => (StatusCode::OK, Json(dto::entry_to_json(&entry))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn update_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Result<Json<JournalEntryDraft>, JsonRejection>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_WRITE));
    let id = try_resp!(errors::parse_entry_id(&id));
    let body = try_resp!(errors::json_body(body));
    match services.workflow.update_entry(id, body).await {
        Ok(entry) => (StatusCode::OK, Json(dto::entry_to_json(&entry))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn delete_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_WRITE));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.delete_entry(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn workflow_logs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_READ));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.workflow_logs(id).await {
        Ok(logs) => {
            let items = logs.iter().map(dto::log_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(json!({ "items": items }))).into_response()
        }
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn preview_payload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_READ));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.preview_payload(id).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn dashboard_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_READ));
    match services.workflow.dashboard_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_SUBMIT));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.submit(id, principal.actor()).await {
        Ok(status) => (StatusCode::OK, Json(json!({ "status": status }))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn approve(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::CommentRequest>>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_APPROVE));
    let id = try_resp!(errors::parse_entry_id(&id));
    let comment = body.and_then(|Json(b)| b.comment);
    match services.workflow.approve(id, principal.actor(), comment).await {
        Ok(status) => (StatusCode::OK, Json(json!({ "status": status }))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn reject(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::CommentRequest>>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_APPROVE));
    let id = try_resp!(errors::parse_entry_id(&id));
    let comment = body.and_then(|Json(b)| b.comment);
    match services.workflow.reject(id, principal.actor(), comment).await {
        Ok(status) => (StatusCode::OK, Json(json!({ "status": status }))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn send_to_external_approval(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_SEND));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.send_to_external_approval(id, principal.actor()).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn post_to_erp(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    try_resp!(require(&principal, authz::JOURNAL_POST));
    let id = try_resp!(errors::parse_entry_id(&id));
    match services.workflow.post_to_erp(id, principal.actor()).await {
        Ok(number) => (StatusCode::OK, Json(json!({ "value": number }))).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}
