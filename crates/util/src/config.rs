use std::{env, fmt, net::SocketAddr};

use super::server_bind_address;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Shared secret for webhook signature verification. Absence disables
    /// verification entirely, which is acceptable only outside production.
    pub webhook_secret: Option<String>,
    /// Pre-shared secret the scheduler presents when invoking the worker.
    pub worker_secret: String,
    pub nudges_enabled: bool,
    pub max_retries: u32,
    /// Name of the delivery provider implementation to wire in.
    pub delivery_provider: String,
}

const DEFAULT_DATABASE_URL: &str = "sqlite://everly.db?mode=rwc";
const DEFAULT_MAX_RETRIES: u32 = 3;

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("EVERLY_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("EVERLY_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let webhook_secret = env::var("EVERLY_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty());
        if webhook_secret.is_none() && environment == Environment::Production {
            return Err(ConfigError::MissingWebhookSecret);
        }

        let worker_secret = match env::var("EVERLY_WORKER_SECRET") {
            Ok(value) if !value.is_empty() => value,
            _ if environment == Environment::Production => {
                return Err(ConfigError::MissingWorkerSecret)
            }
            _ => "dev-worker-secret".to_string(),
        };

        let nudges_enabled = match env::var("EVERLY_NUDGES_ENABLED") {
            Ok(value) => parse_bool(&value).ok_or(ConfigError::InvalidFlag(value))?,
            Err(_) => true,
        };

        let max_retries = match env::var("EVERLY_MAX_RETRIES") {
            Ok(value) => value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidMaxRetries(value))?,
            Err(_) => DEFAULT_MAX_RETRIES,
        };

        let delivery_provider =
            env::var("EVERLY_DELIVERY_PROVIDER").unwrap_or_else(|_| "log".to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook_secret,
            worker_secret,
            nudges_enabled,
            max_retries,
            delivery_provider,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingWebhookSecret,
    MissingWorkerSecret,
    InvalidFlag(String),
    InvalidMaxRetries(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "EVERLY_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid EVERLY_BIND_ADDR value: {err}"),
            Self::MissingWebhookSecret => {
                write!(f, "EVERLY_WEBHOOK_SECRET is required in production")
            }
            Self::MissingWorkerSecret => {
                write!(f, "EVERLY_WORKER_SECRET is required in production")
            }
            Self::InvalidFlag(value) => {
                write!(f, "EVERLY_NUDGES_ENABLED must be a boolean (got {value})")
            }
            Self::InvalidMaxRetries(value) => {
                write!(f, "EVERLY_MAX_RETRIES must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
