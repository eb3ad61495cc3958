use std::time::Duration;

use reqwest::{Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use super::error::{ExternalErrorKind, ExternalService, ExternalServiceError};

/// HTTP client with built-in retry and timeout support.
///
/// Transport failures, 5xx, 408 and 429 are retried with exponential
/// backoff; every other response is returned to the caller as is.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: ReqwestClient,
    service: ExternalService,
    max_attempts: usize,
    base_backoff: Duration,
}

impl HttpClient {
    /// Start building a client for calls to `service`.
    pub fn builder(service: ExternalService) -> HttpClientBuilder {
        HttpClientBuilder::new(service)
    }

    pub fn service(&self) -> ExternalService {
        self.service
    }

    /// Create a request builder using the underlying reqwest client.
    pub fn request<U>(&self, method: Method, url: U) -> RequestBuilder
    where
        U: reqwest::IntoUrl,
    {
        self.client.request(method, url)
    }

    /// Execute the provided request builder with retry semantics.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ExternalServiceError> {
        let attempts = self.max_attempts.max(1);

        for attempt in 0..attempts {
            let cloned_builder = builder.try_clone().ok_or_else(|| {
                ExternalServiceError::configuration(
                    self.service,
                    "request body cannot be cloned; buffer the body to enable retries",
                )
            })?;

            let request = cloned_builder
                .build()
                .map_err(|err| ExternalServiceError::from_transport(self.service, &err))?;

            let method = request.method().clone();
            let url = request.url().clone();
            debug!(attempt = attempt + 1, %method, %url, "sending HTTP request");

            match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    debug!(attempt = attempt + 1, %method, %url, %status, "received HTTP response");

                    if is_retryable_status(status) && attempt + 1 < attempts {
                        warn!(service = %self.service, %status, attempt = attempt + 1, "retrying after transient status");
                        self.sleep_with_backoff(attempt + 1).await;
                        continue;
                    }

                    return Ok(response);
                }
                Err(err) => {
                    debug!(attempt = attempt + 1, %method, %url, error = %err, "HTTP request failed");

                    if attempt + 1 < attempts && should_retry_error(&err) {
                        warn!(service = %self.service, error = %err, attempt = attempt + 1, "retrying after transport failure");
                        self.sleep_with_backoff(attempt + 1).await;
                        continue;
                    }

                    return Err(ExternalServiceError::from_transport(self.service, &err));
                }
            }
        }

        Err(ExternalServiceError::new(
            self.service,
            ExternalErrorKind::Transient,
            "http client exhausted retries without producing a result",
        ))
    }

    /// `send`, then turn any non-success status into a classified error.
    pub async fn send_checked(
        &self,
        builder: RequestBuilder,
    ) -> Result<Response, ExternalServiceError> {
        let response = self.send(builder).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExternalServiceError::from_status(self.service, status, &body))
    }

    fn backoff_delay(&self, retry_number: usize) -> Duration {
        let shift = retry_number.saturating_sub(1).min(8) as u32;
        let multiplier = 1u32 << shift;
        self.base_backoff.saturating_mul(multiplier)
    }

    async fn sleep_with_backoff(&self, retry_number: usize) {
        let delay = self.backoff_delay(retry_number);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Builder for [`HttpClient`].
#[derive(Debug)]
pub struct HttpClientBuilder {
    service: ExternalService,
    timeout: Duration,
    max_attempts: usize,
    base_backoff: Duration,
    user_agent: Option<String>,
}

impl HttpClientBuilder {
    fn new(service: ExternalService) -> Self {
        Self {
            service,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            user_agent: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configure the total number of attempts (initial try + retries).
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn build(self) -> Result<HttpClient, ExternalServiceError> {
        let mut builder = ReqwestClient::builder().timeout(self.timeout);

        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        let client = builder.build().map_err(|err| {
            ExternalServiceError::configuration(self.service, format!("http client: {err}"))
        })?;

        Ok(HttpClient {
            client,
            service: self.service,
            max_attempts: self.max_attempts.max(1),
            base_backoff: self.base_backoff,
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    !status.is_success() && ExternalErrorKind::from_status(status) == ExternalErrorKind::Transient
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_request() || err.is_connect()
}
