//! Configuration loading and representation.
//!
//! Everything comes from environment variables; an optional `.env` file is
//! loaded first by [`AppConfig::from_env`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Retry and timeout policy for outbound HTTP calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalEngineConfig {
    /// `None` selects the in-process mock engine.
    pub api_url: Option<String>,
    pub oauth: Option<OAuthSettings>,
    pub process_definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErpAuthConfig {
    OAuth(OAuthSettings),
    Basic { username: String, password: String },
    ApiKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErpConfig {
    /// `None` selects the in-process mock gateway.
    pub api_url: Option<String>,
    pub auth: Option<ErpAuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    /// Shared secret expected in `X-Webhook-Secret`; unchecked when `None`.
    pub webhook_secret: Option<String>,
    pub approval_engine: ApprovalEngineConfig,
    pub erp: ErpConfig,
    pub http: HttpSettings,
    pub auto_post_timeout: Duration,
}

pub const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);
pub const DEFAULT_PROCESS_DEFINITION_ID: &str = "mje.approval";
pub const DEV_JWT_SECRET: &str = "dev-secret";

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));

        let environment = parse_or(&get, "APP_ENV", Environment::Development)?;

        let jwt_secret = match get("JWT_SECRET") {
            Some(secret) => secret,
            None if environment.is_production() => {
                return Err(ConfigError::Missing("JWT_SECRET".to_string()));
            }
            None => {
                tracing::warn!("JWT_SECRET not set; using insecure dev default");
                DEV_JWT_SECRET.to_string()
            }
        };

        let use_persistent_stores = parse_or(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }

        let approval_url = get("APPROVAL_ENGINE_URL");
        let approval_oauth = match &approval_url {
            Some(_) => Some(OAuthSettings {
                token_url: require("APPROVAL_ENGINE_AUTH_URL")?,
                client_id: require("APPROVAL_ENGINE_CLIENT_ID")?,
                client_secret: require("APPROVAL_ENGINE_CLIENT_SECRET")?,
            }),
            None => None,
        };

        let erp_url = get("ERP_API_URL");
        let erp_auth = match &erp_url {
            Some(_) => Some(parse_erp_auth(&get, &require)?),
            None => None,
        };

        if environment.is_production() {
            if approval_url.is_none() {
                return Err(ConfigError::Missing("APPROVAL_ENGINE_URL".to_string()));
            }
            if erp_url.is_none() {
                return Err(ConfigError::Missing("ERP_API_URL".to_string()));
            }
        }

        let defaults = HttpSettings::default();
        let http = HttpSettings {
            max_attempts: parse_or(&get, "HTTP_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            base_backoff: Duration::from_millis(parse_or(
                &get,
                "HTTP_BASE_BACKOFF_MS",
                defaults.base_backoff.as_millis() as u64,
            )?),
            timeout: Duration::from_secs(parse_or(
                &get,
                "HTTP_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
        };

        Ok(Self {
            environment,
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(DEFAULT_BIND_ADDR))?,
            jwt_secret,
            use_persistent_stores,
            database_url,
            webhook_secret: get("WEBHOOK_SECRET"),
            approval_engine: ApprovalEngineConfig {
                api_url: approval_url,
                oauth: approval_oauth,
                process_definition_id: get("APPROVAL_ENGINE_PROCESS_DEFINITION_ID")
                    .unwrap_or_else(|| DEFAULT_PROCESS_DEFINITION_ID.to_string()),
            },
            erp: ErpConfig {
                api_url: erp_url,
                auth: erp_auth,
            },
            http,
            auto_post_timeout: Duration::from_secs(parse_or(&get, "AUTO_POST_TIMEOUT_SECS", 30u64)?),
        })
    }

    /// Whether a failed approval trigger may fall back to a synthetic instance id.
    pub fn allow_mock_approval_fallback(&self) -> bool {
        !self.environment.is_production()
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_erp_auth<G, R>(get: &G, require: &R) -> Result<ErpAuthConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    R: Fn(&str) -> Result<String, ConfigError>,
{
    let auth_type = get("ERP_AUTH_TYPE").unwrap_or_else(|| "oauth".to_string());
    match auth_type.to_ascii_lowercase().as_str() {
        "oauth" => Ok(ErpAuthConfig::OAuth(OAuthSettings {
            token_url: require("ERP_TOKEN_URL")?,
            client_id: require("ERP_CLIENT_ID")?,
            client_secret: require("ERP_CLIENT_SECRET")?,
        })),
        "basic" => Ok(ErpAuthConfig::Basic {
            username: require("ERP_USERNAME")?,
            password: require("ERP_PASSWORD")?,
        }),
        "apikey" => Ok(ErpAuthConfig::ApiKey(require("ERP_API_KEY")?)),
        _ => Err(ConfigError::Invalid {
            key: "ERP_AUTH_TYPE".to_string(),
            value: auth_type,
            reason: "expected oauth, basic or apikey".to_string(),
        }),
    }
}
