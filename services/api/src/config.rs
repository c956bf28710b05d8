//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use tutor_core::{EngineConfig, QuotaLimits};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub cors_origin: String,
    pub openai_api_key: Option<String>,
    pub explanation_model: String,
    pub quiz_model: String,
    pub explanation_quota_limit: u32,
    pub quiz_quota_limit: u32,
    pub generation_timeout: Duration,
    pub context_idle_ttl: Duration,
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
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server and Database Settings ---
        let bind_address: SocketAddr = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;
        let cors_origin =
            lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        // --- Generation Settings ---
        let openai_api_key = lookup("OPENAI_API_KEY");
        let explanation_model =
            lookup("EXPLANATION_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let quiz_model = lookup("QUIZ_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        // --- Quota and Timing Settings ---
        let explanation_quota_limit = parse_or(&lookup, "EXPLANATION_QUOTA_LIMIT", "200")?;
        let quiz_quota_limit = parse_or(&lookup, "QUIZ_QUOTA_LIMIT", "100")?;
        let generation_timeout =
            Duration::from_secs(parse_or(&lookup, "GENERATION_TIMEOUT_SECS", "180")?);
        let context_idle_ttl =
            Duration::from_secs(parse_or(&lookup, "CONTEXT_IDLE_TTL_SECS", "1800")?);

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            cors_origin,
            openai_api_key,
            explanation_model,
            quiz_model,
            explanation_quota_limit,
            quiz_quota_limit,
            generation_timeout,
            context_idle_ttl,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            quota_limits: QuotaLimits {
                explanation: self.explanation_quota_limit,
                quiz: self.quiz_quota_limit,
            },
            generation_timeout: self.generation_timeout,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name).unwrap_or_else(|| default.to_string());
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/tutor")]))
                .unwrap();

        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.explanation_quota_limit, 200);
        assert_eq!(config.quiz_quota_limit, 100);
        assert_eq!(config.generation_timeout, Duration::from_secs(180));
        assert_eq!(config.context_idle_ttl, Duration::from_secs(1800));
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "DATABASE_URL"));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/tutor"),
            ("QUIZ_QUOTA_LIMIT", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "QUIZ_QUOTA_LIMIT"));
    }

    #[test]
    fn engine_config_carries_limits_and_timeout() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/tutor"),
            ("EXPLANATION_QUOTA_LIMIT", "7"),
            ("GENERATION_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.quota_limits.explanation, 7);
        assert_eq!(engine.generation_timeout, Duration::from_secs(30));
    }
}
