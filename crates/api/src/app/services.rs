//! Service wiring: pick the repository and the outbound clients from configuration.
//!
//! Unset collaborator URLs select the deterministic in-process mocks, so a
//! development server runs without any external system.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use journalflow_infra::config::{AppConfig, ErpAuthConfig, HttpSettings, OAuthSettings};
use journalflow_infra::external::{
    AccessTokenProvider, ApprovalEngine, ClientCredentials, ClientCredentialsTokenProvider,
    ErpAuth, ErpGateway, ExternalService, ExternalServiceError, HttpApprovalEngine, HttpClient,
    HttpErpGateway, MockApprovalEngine, MockErpGateway,
};
use journalflow_infra::repository::RepositoryError;
use journalflow_infra::{
    InMemoryJournalRepository, JournalRepository, JournalWorkflow, PostgresJournalRepository,
    WorkflowSettings,
};

/// Sent with every outbound request.
pub const USER_AGENT: &str = concat!("journalflow/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("database setup failed: {0}")]
    Database(#[from] RepositoryError),

    #[error(transparent)]
    External(#[from] ExternalServiceError),
}

/// Everything the handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub workflow: JournalWorkflow,
    pub webhook_secret: Option<String>,
}

impl AppServices {
    pub fn new(workflow: JournalWorkflow, webhook_secret: Option<String>) -> Self {
        Self {
            workflow,
            webhook_secret,
        }
    }

    /// In-memory store with mock collaborators; the development default.
    pub fn in_memory(settings: WorkflowSettings) -> Self {
        let workflow = JournalWorkflow::new(
            Arc::new(InMemoryJournalRepository::new()),
            Arc::new(MockApprovalEngine::default()),
            Arc::new(MockErpGateway::default()),
            settings,
        );
        Self::new(workflow, None)
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let repo: Arc<dyn JournalRepository> = match (config.use_persistent_stores, &config.database_url) {
        (true, Some(url)) => {
            info!("using Postgres journal repository");
            Arc::new(PostgresJournalRepository::connect(url).await?)
        }
        (true, None) => {
            return Err(RepositoryError::Backend("DATABASE_URL is not set".to_string()).into());
        }
        (false, _) => {
            info!("using in-memory journal repository");
            Arc::new(InMemoryJournalRepository::new())
        }
    };

    let approval = approval_engine(config)?;
    let erp = erp_gateway(config)?;

    let settings = WorkflowSettings {
        process_definition_id: config.approval_engine.process_definition_id.clone(),
        allow_mock_approval_fallback: config.allow_mock_approval_fallback(),
        auto_post_timeout: config.auto_post_timeout,
    };

    Ok(AppServices::new(
        JournalWorkflow::new(repo, approval, erp, settings),
        config.webhook_secret.clone(),
    ))
}

fn http_client(service: ExternalService, settings: &HttpSettings) -> Result<HttpClient, ExternalServiceError> {
    HttpClient::builder(service)
        .timeout(settings.timeout)
        .max_attempts(settings.max_attempts)
        .base_backoff(settings.base_backoff)
        .user_agent(USER_AGENT)
        .build()
}

fn token_provider(http: HttpClient, oauth: &OAuthSettings) -> Arc<dyn AccessTokenProvider> {
    Arc::new(ClientCredentialsTokenProvider::new(
        http,
        ClientCredentials {
            token_url: oauth.token_url.clone(),
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
        },
    ))
}

fn approval_engine(config: &AppConfig) -> Result<Arc<dyn ApprovalEngine>, ExternalServiceError> {
    let engine = &config.approval_engine;
    let Some(url) = engine.api_url.as_deref() else {
        warn!("APPROVAL_ENGINE_URL not set; using mock approval engine");
        return Ok(Arc::new(MockApprovalEngine::default()));
    };
    let oauth = engine.oauth.as_ref().ok_or_else(|| {
        ExternalServiceError::configuration(
            ExternalService::ApprovalEngine,
            "OAuth credentials are required for the approval engine",
        )
    })?;

    let http = http_client(ExternalService::ApprovalEngine, &config.http)?;
    let tokens = token_provider(http.clone(), oauth);
    info!(url, "using approval engine");
    Ok(Arc::new(HttpApprovalEngine::new(http, url, tokens)))
}

fn erp_gateway(config: &AppConfig) -> Result<Arc<dyn ErpGateway>, ExternalServiceError> {
    let Some(url) = config.erp.api_url.as_deref() else {
        warn!("ERP_API_URL not set; using mock ERP gateway");
        return Ok(Arc::new(MockErpGateway::default()));
    };

    let http = http_client(ExternalService::ErpGateway, &config.http)?;
    let auth = match &config.erp.auth {
        Some(ErpAuthConfig::OAuth(oauth)) => ErpAuth::OAuth(token_provider(http.clone(), oauth)),
        Some(ErpAuthConfig::Basic { username, password }) => ErpAuth::Basic {
            username: username.clone(),
            password: password.clone(),
        },
        Some(ErpAuthConfig::ApiKey(key)) => ErpAuth::ApiKey(key.clone()),
        None => ErpAuth::None,
    };
    info!(url, auth = ?auth, "using ERP gateway");
    Ok(Arc::new(HttpErpGateway::new(http, url, auth)))
}
