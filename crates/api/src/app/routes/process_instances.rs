use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use crate::app::errors;
use crate::app::routes::common::require;
use crate::app::services::AppServices;
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new().route("/:external_id", get(process_status).delete(cancel_process))
}

pub async fn process_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(external_id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require(&principal, authz::PROCESS_READ) {
        return resp;
    }
    match services.workflow.process_status(&external_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}

pub async fn cancel_process(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(external_id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require(&principal, authz::PROCESS_CANCEL) {
        return resp;
    }
    match services.workflow.cancel_process(&external_id).await {
        Ok(instance) => (StatusCode::OK, Json(instance)).into_response(),
        Err(e) => errors::workflow_error_to_response(e),
    }
}
