use axum::{Router, routing::get};

pub mod common;
pub mod journal_entries;
pub mod process_instances;
pub mod system;
pub mod webhooks;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/journal-entries", journal_entries::router())
        .nest("/process-instances", process_instances::router())
}
