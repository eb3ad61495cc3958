//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: repository and outbound client wiring from configuration
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use journalflow_infra::AppConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, ServicesError};

/// Build the full HTTP router from configuration (public entrypoint used by `main.rs`).
pub async fn build_app(config: &AppConfig) -> Result<Router, ServicesError> {
    let services = services::build_services(config).await?;
    Ok(build_app_with(config.jwt_secret.clone(), services))
}

/// Build the router around already wired services.
pub fn build_app_with(jwt_secret: String, services: AppServices) -> Router {
    let jwt = Arc::new(journalflow_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };
    let webhook_state = middleware::WebhookState {
        secret: services.webhook_secret.as_deref().map(Arc::from),
    };

    let services = Arc::new(services);

    // Protected routes: require a valid bearer token.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // Callbacks from the approval engine: shared secret instead of a JWT.
    let webhooks = routes::webhooks::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            webhook_state,
            middleware::webhook_secret_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks/approval-engine", webhooks)
        .merge(protected)
}
