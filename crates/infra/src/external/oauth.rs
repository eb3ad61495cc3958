//! OAuth 2.0 client-credentials tokens with an in-process cache.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::error::{ExternalErrorKind, ExternalServiceError};
use super::http::HttpClient;

/// Tokens are refreshed this long before the issuer says they expire.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Anything that can hand out a bearer token for outbound calls.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ExternalServiceError>;

    /// Forget the cached token after the service rejected it.
    async fn invalidate(&self) {}
}

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

/// Client-credentials grant against `token_url`. One token is cached and
/// reused until `refresh_margin` before it expires; concurrent callers wait
/// on the same refresh.
#[derive(Debug)]
pub struct ClientCredentialsTokenProvider {
    http: HttpClient,
    credentials: ClientCredentials,
    refresh_margin: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(http: HttpClient, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            cached: Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(service = %self.http.service(), token_url = %self.credentials.token_url))]
    async fn fetch(&self) -> Result<CachedToken, ExternalServiceError> {
        let service = self.http.service();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        let response = self
            .http
            .send_checked(self.http.request(Method::POST, &self.credentials.token_url).form(&form))
            .await
            .map_err(|e| ExternalServiceError::new(service, ExternalErrorKind::Authentication, e.message))?;

        let token: TokenResponse = response.json().await.map_err(|e| {
            ExternalServiceError::new(
                service,
                ExternalErrorKind::Authentication,
                format!("malformed token response: {e}"),
            )
        })?;

        let lifetime = chrono::Duration::seconds(token.expires_in.unwrap_or(0));
        let margin = chrono::Duration::from_std(self.refresh_margin).unwrap_or_else(|_| chrono::Duration::zero());
        info!(expires_in = token.expires_in, "obtained access token");

        Ok(CachedToken {
            value: token.access_token,
            refresh_at: Utc::now() + lifetime - margin,
        })
    }
}

#[async_trait]
impl AccessTokenProvider for ClientCredentialsTokenProvider {
    async fn access_token(&self) -> Result<String, ExternalServiceError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            info!("cached access token dropped");
        }
    }
}
