//! Engine configuration.
//!
//! Scheduler timing, storage and policy sources, read from the environment
//! with defaults for everything except the provider credentials.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the engine and scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    // Storage settings
    /// PostgreSQL connection URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Pool size for the PostgreSQL store.
    pub db_max_connections: u32,

    // Policy settings
    /// YAML file with policy layers.
    pub policy_file: Option<PathBuf>,
    /// YAML file with per-model rate limits.
    pub rate_limits_file: Option<PathBuf>,
    /// Team whose policy layer applies to new processes.
    pub team: Option<String>,

    // Scheduler settings
    /// How long a tick may hold the global lock.
    pub scheduler_lock_ms: u64,
    /// Lower bound on the delay between ticks.
    pub scheduler_min_delay_ms: u64,
    /// How long a submit or poll may hold a batch lock.
    pub batch_lock_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,

            policy_file: None,
            rate_limits_file: None,
            team: None,

            scheduler_lock_ms: 30_000,
            scheduler_min_delay_ms: 500,
            batch_lock_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (default: in-memory store)
    /// - `EVAL_FORGE_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `EVAL_FORGE_POLICY_FILE`: YAML policy layers
    /// - `EVAL_FORGE_RATE_LIMITS_FILE`: YAML rate limits per model
    /// - `EVAL_FORGE_TEAM`: team policy layer to apply
    /// - `EVAL_FORGE_SCHEDULER_LOCK_MS`: tick lock duration (default: 30000)
    /// - `EVAL_FORGE_SCHEDULER_MIN_DELAY_MS`: minimum tick delay (default: 500)
    /// - `EVAL_FORGE_BATCH_LOCK_MS`: batch lock duration (default: 60000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = Some(val);
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_DB_MAX_CONNECTIONS") {
            config.db_max_connections = parse_env_value(&val, "EVAL_FORGE_DB_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_POLICY_FILE") {
            config.policy_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_RATE_LIMITS_FILE") {
            config.rate_limits_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_TEAM") {
            config.team = Some(val);
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_SCHEDULER_LOCK_MS") {
            config.scheduler_lock_ms = parse_env_value(&val, "EVAL_FORGE_SCHEDULER_LOCK_MS")?;
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_SCHEDULER_MIN_DELAY_MS") {
            config.scheduler_min_delay_ms =
                parse_env_value(&val, "EVAL_FORGE_SCHEDULER_MIN_DELAY_MS")?;
        }

        if let Ok(val) = std::env::var("EVAL_FORGE_BATCH_LOCK_MS") {
            config.batch_lock_ms = parse_env_value(&val, "EVAL_FORGE_BATCH_LOCK_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "db_max_connections must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_lock_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler_lock_ms must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_min_delay_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler_min_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_min_delay_ms > self.scheduler_lock_ms {
            return Err(ConfigError::ValidationFailed(
                "scheduler_min_delay_ms cannot exceed scheduler_lock_ms".to_string(),
            ));
        }

        if self.batch_lock_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_lock_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_db_max_connections(mut self, max: u32) -> Self {
        self.db_max_connections = max;
        self
    }

    pub fn with_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_file = Some(path.into());
        self
    }

    pub fn with_rate_limits_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rate_limits_file = Some(path.into());
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_scheduler_lock_ms(mut self, ms: u64) -> Self {
        self.scheduler_lock_ms = ms;
        self
    }

    pub fn with_scheduler_min_delay_ms(mut self, ms: u64) -> Self {
        self.scheduler_min_delay_ms = ms;
        self
    }

    pub fn with_batch_lock_ms(mut self, ms: u64) -> Self {
        self.batch_lock_ms = ms;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.scheduler_lock_ms, 30_000);
        assert_eq!(config.scheduler_min_delay_ms, 500);
        assert_eq!(config.batch_lock_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_database_url("postgres://test/db")
            .with_db_max_connections(4)
            .with_team("research")
            .with_policy_file("/etc/eval-forge/policy.yaml")
            .with_scheduler_lock_ms(10_000)
            .with_scheduler_min_delay_ms(250)
            .with_batch_lock_ms(5_000);

        assert_eq!(config.database_url.as_deref(), Some("postgres://test/db"));
        assert_eq!(config.db_max_connections, 4);
        assert_eq!(config.team.as_deref(), Some("research"));
        assert_eq!(
            config.policy_file,
            Some(PathBuf::from("/etc/eval-forge/policy.yaml"))
        );
        assert_eq!(config.scheduler_lock_ms, 10_000);
        assert_eq!(config.scheduler_min_delay_ms, 250);
        assert_eq!(config.batch_lock_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_database_url() {
        let result = EngineConfig::default().with_database_url("").validate();
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_validation_zero_lock() {
        let result = EngineConfig::default().with_scheduler_lock_ms(0).validate();
        assert!(result.unwrap_err().to_string().contains("scheduler_lock_ms"));
    }

    #[test]
    fn test_validation_delay_exceeds_lock() {
        let result = EngineConfig::default()
            .with_scheduler_lock_ms(100)
            .with_scheduler_min_delay_ms(500)
            .validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot exceed scheduler_lock_ms"));
    }

    #[test]
    fn test_validation_zero_batch_lock() {
        let result = EngineConfig::default().with_batch_lock_ms(0).validate();
        assert!(result.unwrap_err().to_string().contains("batch_lock_ms"));
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value::<u64>("42", "K").unwrap(), 42);
        let err = parse_env_value::<u64>("nope", "K").unwrap_err();
        assert!(err.to_string().contains("K"));
        assert!(err.to_string().contains("nope"));
    }
}
