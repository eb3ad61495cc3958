//! Outbound collaborators: the approval-workflow engine and the ERP posting gateway.

pub mod approval_engine;
pub mod erp;
pub mod error;
pub mod http;
pub mod oauth;

pub use approval_engine::{ApprovalEngine, HttpApprovalEngine, MockApprovalEngine};
pub use erp::{
    ErpAuth, ErpGateway, ErpJournalEntryItem, ErpJournalEntryPayload, HttpErpGateway,
    MockErpGateway, transform_to_payload,
};
pub use error::{ExternalErrorKind, ExternalService, ExternalServiceError};
pub use http::HttpClient;
pub use oauth::{AccessTokenProvider, ClientCredentials, ClientCredentialsTokenProvider};
