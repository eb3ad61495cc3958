//! Client for the external approval-workflow engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use super::error::{ExternalErrorKind, ExternalService, ExternalServiceError};
use super::http::HttpClient;
use super::oauth::AccessTokenProvider;

const INSTANCES_PATH: &str = "/workflow/rest/v1/workflow-instances";

#[async_trait]
pub trait ApprovalEngine: Send + Sync {
    /// Start a workflow instance and return the engine's instance id.
    async fn trigger_process(
        &self,
        definition_id: &str,
        context: Value,
    ) -> Result<String, ExternalServiceError>;

    /// Live instance document as reported by the engine.
    async fn get_status(&self, instance_id: &str) -> Result<Value, ExternalServiceError>;

    async fn cancel(&self, instance_id: &str) -> Result<(), ExternalServiceError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest<'a> {
    definition_id: &'a str,
    context: Value,
}

/// REST client authenticated with a bearer token per request.
pub struct HttpApprovalEngine {
    http: HttpClient,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpApprovalEngine {
    pub fn new(http: HttpClient, base_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn instances_url(&self) -> String {
        format!("{}{INSTANCES_PATH}", self.base_url)
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}{INSTANCES_PATH}/{instance_id}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ExternalServiceError> {
        let result = self.http.send_checked(request).await;
        if matches!(&result, Err(err) if err.kind == ExternalErrorKind::Authentication) {
            self.tokens.invalidate().await;
        }
        result
    }
}

#[async_trait]
impl ApprovalEngine for HttpApprovalEngine {
    #[instrument(skip(self, context), err)]
    async fn trigger_process(
        &self,
        definition_id: &str,
        context: Value,
    ) -> Result<String, ExternalServiceError> {
        let token = self.tokens.access_token().await?;
        let request = self
            .http
            .request(Method::POST, self.instances_url())
            .bearer_auth(token)
            .json(&TriggerRequest {
                definition_id,
                context,
            });

        let body: Value = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ExternalServiceError::invalid_response(ExternalService::ApprovalEngine, e.to_string()))?;

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ExternalServiceError::invalid_response(
                    ExternalService::ApprovalEngine,
                    "workflow instance response has no id",
                )
            })?;

        info!(instance_id = id, "workflow instance started");
        Ok(id.to_string())
    }

    #[instrument(skip(self), err)]
    async fn get_status(&self, instance_id: &str) -> Result<Value, ExternalServiceError> {
        let token = self.tokens.access_token().await?;
        let request = self
            .http
            .request(Method::GET, self.instance_url(instance_id))
            .bearer_auth(token);

        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ExternalServiceError::invalid_response(ExternalService::ApprovalEngine, e.to_string()))
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, instance_id: &str) -> Result<(), ExternalServiceError> {
        let token = self.tokens.access_token().await?;
        let request = self
            .http
            .request(Method::DELETE, self.instance_url(instance_id))
            .bearer_auth(token);

        self.send(request).await?;
        info!(instance_id, "workflow instance cancelled");
        Ok(())
    }
}

/// In-process engine for development and tests.
///
/// Instance ids are `mock-{n}` from a counter starting at the seed. Every
/// triggered context is kept so tests can inspect it.
#[derive(Debug)]
pub struct MockApprovalEngine {
    next: AtomicU64,
    triggered: Mutex<Vec<(String, Value)>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockApprovalEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
            triggered: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// `(definition_id, context)` of every trigger so far.
    pub fn triggered(&self) -> Vec<(String, Value)> {
        self.triggered.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockApprovalEngine {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ApprovalEngine for MockApprovalEngine {
    async fn trigger_process(
        &self,
        definition_id: &str,
        context: Value,
    ) -> Result<String, ExternalServiceError> {
        let id = format!("mock-{}", self.next.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut triggered) = self.triggered.lock() {
            triggered.push((definition_id.to_string(), context));
        }
        info!(instance_id = %id, definition_id, "mock workflow instance started");
        Ok(id)
    }

    async fn get_status(&self, instance_id: &str) -> Result<Value, ExternalServiceError> {
        let cancelled = self
            .cancelled
            .lock()
            .map(|c| c.iter().any(|id| id == instance_id))
            .unwrap_or(false);
        Ok(serde_json::json!({
            "id": instance_id,
            "status": if cancelled { "CANCELED" } else { "RUNNING" },
        }))
    }

    async fn cancel(&self, instance_id: &str) -> Result<(), ExternalServiceError> {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(instance_id.to_string());
        }
        Ok(())
    }
}
