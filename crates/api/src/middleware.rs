use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use journalflow_auth::JwtValidator;

use crate::app::errors;
use crate::context::PrincipalContext;

/// Header carrying the shared secret on approval-engine callbacks.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(req.headers())?;

    let claims = state.jwt.validate(token, Utc::now()).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(PrincipalContext::new(
        claims.sub,
        claims.actor(),
        claims.roles.clone(),
    ));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

#[derive(Clone)]
pub struct WebhookState {
    /// `None` accepts every callback.
    pub secret: Option<Arc<str>>,
}

pub async fn webhook_secret_middleware(
    State(state): State<WebhookState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state.secret.as_deref() {
        let presented = req
            .headers()
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            tracing::warn!(path = %req.uri().path(), "webhook rejected: bad or missing secret");
            return errors::json_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid webhook secret",
            );
        }
    }
    next.run(req).await
}
