//! Configuration management for the lending engine
//!
//! Loads and validates configuration from environment variables, with
//! support for different environments (development, staging, production).

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::repayment::{LateFeePolicy, MissedInstallmentsPolicy};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid environment value: {0}")]
    InvalidValue(String),
}

/// Application environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Parse environment from string
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue(format!(
                "Invalid environment: '{}'. Expected: dev, staging, or prod",
                s
            ))),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// Tunables of the ledger and loan lifecycle
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Late fee computation applied at settlement time
    pub late_fee: LateFeePolicy,

    /// Active -> Defaulted trigger used by the default sweep
    pub default_policy: MissedInstallmentsPolicy,

    /// Attempts per operation on serialization failure / deadlock
    pub max_tx_retries: u32,

    /// Move a loan straight from Funded to Active when the last
    /// contribution lands
    pub activate_on_full_funding: bool,

    /// Cron expression for the overdue / default sweep
    pub sweep_cron: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            late_fee: LateFeePolicy::default(),
            default_policy: MissedInstallmentsPolicy::default(),
            max_tx_retries: 3,
            activate_on_full_funding: true,
            sweep_cron: "0 15 0 * * *".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Current environment
    pub environment: Environment,

    /// Maximum database connections
    pub db_max_connections: u32,

    /// Log level (RUST_LOG)
    pub log_level: String,

    /// Engine tunables
    pub engine: EngineSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors)
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .map(|s| Environment::parse(&s))
            .unwrap_or(Ok(Environment::Development))?;

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .unwrap_or(10);

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let defaults = EngineSettings::default();

        let late_fee = LateFeePolicy {
            daily_rate: decimal_var("LATE_FEE_DAILY_RATE", defaults.late_fee.daily_rate)?,
            minimum_fee: decimal_var("LATE_FEE_MINIMUM", defaults.late_fee.minimum_fee)?,
            max_ratio: decimal_var("LATE_FEE_MAX_RATIO", defaults.late_fee.max_ratio)?,
        };
        late_fee.validate().map_err(ConfigError::InvalidValue)?;

        let default_policy = MissedInstallmentsPolicy {
            max_missed: parsed_var(
                "DEFAULT_MAX_MISSED_INSTALLMENTS",
                defaults.default_policy.max_missed,
            )?,
            grace_days: parsed_var("DEFAULT_GRACE_DAYS", defaults.default_policy.grace_days)?,
        };
        default_policy.validate().map_err(ConfigError::InvalidValue)?;

        let max_tx_retries = parsed_var("ENGINE_MAX_TX_RETRIES", defaults.max_tx_retries)?;

        let activate_on_full_funding =
            parsed_var("ACTIVATE_ON_FULL_FUNDING", defaults.activate_on_full_funding)?;

        let sweep_cron = env::var("SWEEP_CRON").unwrap_or(defaults.sweep_cron);

        Ok(Config {
            database_url,
            environment,
            db_max_connections,
            log_level,
            engine: EngineSettings {
                late_fee,
                default_policy,
                max_tx_retries,
                activate_on_full_funding,
                sweep_cron,
            },
        })
    }

    /// Get database URL with the password masked, for logging
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let prefix = &self.database_url[..colon_pos + 1];
                let suffix = &self.database_url[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        self.database_url.clone()
    }
}

fn decimal_var(name: &str, default: Decimal) -> Result<Decimal, ConfigError> {
    match env::var(name) {
        Ok(raw) => Decimal::from_str(raw.trim())
            .map_err(|_| ConfigError::InvalidValue(format!("{} must be a decimal, got '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}
