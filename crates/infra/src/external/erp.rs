//! ERP posting gateway: wire payload mapping plus HTTP and mock clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use journalflow_accounting::JournalEntry;

use super::error::{ExternalErrorKind, ExternalService, ExternalServiceError};
use super::http::HttpClient;
use super::oauth::AccessTokenProvider;

/// Document type for manual journal entries.
pub const DOCUMENT_TYPE: &str = "SA";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErpJournalEntryPayload {
    pub company_code: String,
    pub document_date: NaiveDate,
    pub posting_date: NaiveDate,
    pub document_header_text: String,
    pub document_type: String,
    #[serde(rename = "DocumentReferenceID")]
    pub document_reference_id: String,
    #[serde(rename = "to_JournalEntryItem")]
    pub items: Vec<ErpJournalEntryItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErpJournalEntryItem {
    pub reference_document_item: String,
    #[serde(rename = "GLAccount")]
    pub gl_account: String,
    pub amount_in_transaction_currency: f64,
    pub debit_credit_code: String,
    pub cost_center: Option<String>,
    pub profit_center: Option<String>,
    pub item_text: Option<String>,
    pub transaction_currency: String,
}

/// Map an entry to the gateway's wire format. Debit lines become `S`,
/// credit lines `H`; item references are 1-based.
pub fn transform_to_payload(entry: &JournalEntry) -> ErpJournalEntryPayload {
    ErpJournalEntryPayload {
        company_code: entry.company_code().to_string(),
        document_date: entry.document_date(),
        posting_date: entry.posting_date(),
        document_header_text: entry.header_text().to_string(),
        document_type: DOCUMENT_TYPE.to_string(),
        document_reference_id: entry.id_typed().to_string(),
        items: entry
            .items()
            .iter()
            .enumerate()
            .map(|(index, item)| ErpJournalEntryItem {
                reference_document_item: (index + 1).to_string(),
                gl_account: item.gl_account.clone(),
                amount_in_transaction_currency: item.amount,
                debit_credit_code: item.dc_indicator.erp_code().to_string(),
                cost_center: item.cost_center.clone(),
                profit_center: item.profit_center.clone(),
                item_text: item.item_text.clone(),
                transaction_currency: entry.currency().to_string(),
            })
            .collect(),
    }
}

#[async_trait]
pub trait ErpGateway: Send + Sync {
    /// Post the entry and return the accounting document number.
    async fn post_entry(&self, entry: &JournalEntry) -> Result<String, ExternalServiceError>;
}

/// How requests to the gateway authenticate.
pub enum ErpAuth {
    OAuth(Arc<dyn AccessTokenProvider>),
    Basic { username: String, password: String },
    ApiKey(String),
    None,
}

impl std::fmt::Debug for ErpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OAuth(_) => write!(f, "OAuth"),
            Self::Basic { username, .. } => write!(f, "Basic({username})"),
            Self::ApiKey(_) => write!(f, "ApiKey"),
            Self::None => write!(f, "None"),
        }
    }
}

#[derive(Debug)]
pub struct HttpErpGateway {
    http: HttpClient,
    base_url: String,
    auth: ErpAuth,
}

impl HttpErpGateway {
    pub fn new(http: HttpClient, base_url: impl Into<String>, auth: ErpAuth) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }
}

/// `AccountingDocument`, `documentNumber` or OData v2 `d.AccountingDocument`.
fn document_number(body: &Value) -> Option<String> {
    body.get("AccountingDocument")
        .or_else(|| body.get("documentNumber"))
        .or_else(|| body.pointer("/d/AccountingDocument"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
impl ErpGateway for HttpErpGateway {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id_typed()), err)]
    async fn post_entry(&self, entry: &JournalEntry) -> Result<String, ExternalServiceError> {
        let payload = transform_to_payload(entry);
        let mut request = self
            .http
            .request(Method::POST, format!("{}/JournalEntry", self.base_url))
            .json(&payload);

        request = match &self.auth {
            ErpAuth::OAuth(tokens) => request.bearer_auth(tokens.access_token().await?),
            ErpAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            ErpAuth::ApiKey(key) => request.header("X-API-Key", key),
            ErpAuth::None => request,
        };

        let response = match self.http.send_checked(request).await {
            Ok(response) => response,
            Err(err) => {
                if let (ErpAuth::OAuth(tokens), ExternalErrorKind::Authentication) = (&self.auth, err.kind) {
                    tokens.invalidate().await;
                }
                return Err(err);
            }
        };

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExternalServiceError::invalid_response(ExternalService::ErpGateway, e.to_string()))?;

        let number = document_number(&body).ok_or_else(|| {
            ExternalServiceError::invalid_response(
                ExternalService::ErpGateway,
                "response carries no accounting document number",
            )
        })?;

        info!(document_number = %number, "journal entry posted");
        Ok(number)
    }
}

/// Deterministic gateway for development and tests: 10-digit document
/// numbers starting with `5`, drawn from a counter.
#[derive(Debug)]
pub struct MockErpGateway {
    next: AtomicU64,
    calls: AtomicU64,
}

impl MockErpGateway {
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed % 1_000_000_000),
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `post_entry` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockErpGateway {
    fn default() -> Self {
        Self::new(100_000_000)
    }
}

#[async_trait]
impl ErpGateway for MockErpGateway {
    async fn post_entry(&self, entry: &JournalEntry) -> Result<String, ExternalServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = self.next.fetch_add(1, Ordering::SeqCst) % 1_000_000_000;
        let number = format!("5{n:09}");
        info!(entry_id = %entry.id_typed(), document_number = %number, "mock posting");
        Ok(number)
    }
}
