//! services/billing/src/config.rs
//!
//! Defines the worker's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use freelance_core::policy::{BillingPolicy, HourRounding};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub log_level: Level,
    pub evaluator_cron: String,
    pub sweep_cron: String,
    pub documents_path: PathBuf,
    pub chrome_bin: String,
    pub render_timeout: Duration,
    pub smtp: SmtpConfig,
    /// Base64 encoded 256-bit key for data encrypted at rest.
    pub ip_encryption_key: String,
    pub policy: BillingPolicy,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Source(lookup);

        // --- Database and logging ---
        let database_url = env.required("DATABASE_URL")?;
        let database_max_connections = env.parsed("DATABASE_MAX_CONNECTIONS", 5u32)?;

        let log_level_str = env.or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Scheduling ---
        let evaluator_cron = env.or("EVALUATOR_CRON", "0 */5 * * * *");
        let sweep_cron = env.or("SWEEP_CRON", "0 0 6 * * *");

        // --- Documents ---
        let documents_path = PathBuf::from(env.or("DOCUMENTS_PATH", "./documents"));
        let chrome_bin = env.or("CHROME_BIN", "chromium");
        let render_timeout = Duration::from_secs(env.parsed("RENDER_TIMEOUT_SECS", 60u64)?);

        // --- Mail ---
        let smtp = SmtpConfig {
            host: env.required("SMTP_HOST")?,
            port: env.parsed("SMTP_PORT", 587u16)?,
            username: env.optional("SMTP_USERNAME"),
            password: env.optional("SMTP_PASSWORD"),
            from: env.required("MAIL_FROM")?,
        };

        let ip_encryption_key = env.required("IP_ENCRYPTION_KEY")?;

        // --- Billing policy ---
        let rounding_str = env.or("HOUR_ROUNDING", "nearest");
        let hour_rounding = HourRounding::parse(&rounding_str).ok_or_else(|| {
            ConfigError::InvalidValue(
                "HOUR_ROUNDING".to_string(),
                format!("'{}' is not one of nearest, up, down", rounding_str),
            )
        })?;
        let defaults = BillingPolicy::default();
        let policy = BillingPolicy {
            hour_rounding,
            max_reminders: env.parsed("MAX_REMINDERS", defaults.max_reminders)?,
            max_auto_generation_failures: env
                .parsed("MAX_AUTO_GENERATION_FAILURES", defaults.max_auto_generation_failures)?,
            evaluator_concurrency: env
                .parsed("EVALUATOR_CONCURRENCY", defaults.evaluator_concurrency)?,
            ..defaults
        };

        Ok(Self {
            database_url,
            database_max_connections,
            log_level,
            evaluator_cron,
            sweep_cron,
            documents_path,
            chrome_bin,
            render_timeout,
            smtp,
            ip_encryption_key,
            policy,
        })
    }
}

struct Source<F>(F);

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        }
    }
}
