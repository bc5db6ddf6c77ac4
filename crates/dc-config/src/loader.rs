//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "dialcast.toml",
    "./config/config.toml",
    "/etc/dialcast/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("DIALCAST_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Database: DATABASE_URL wins, otherwise assemble from POSTGRES_* parts
        if let Ok(val) = env::var("DATABASE_URL") {
            config.database.url = val;
        } else if let Some(url) = Self::postgres_url_from_parts() {
            config.database.url = url;
        }

        // Coordination store
        if let Ok(val) = env::var("REDIS_URL") {
            config.redis.url = val;
        }

        // Scheduler
        if let Ok(val) = env::var("CHECK_INTERVAL") {
            if let Ok(secs) = val.parse() {
                config.scheduler.check_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("MAX_CONCURRENT_CAMPAIGNS") {
            if let Ok(count) = val.parse() {
                config.scheduler.max_concurrent_campaigns = count;
            }
        }
        if let Ok(val) = env::var("DEFAULT_RETRY_INTERVAL") {
            if let Ok(secs) = val.parse() {
                config.scheduler.default_retry_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("MAX_RETRY_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.scheduler.max_retry_attempts = attempts;
            }
        }

        // HTTP
        if let Ok(val) = env::var("HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
    }

    /// Assemble a connection URL from POSTGRES_HOST/USER/PASSWORD/DB/PORT.
    /// Only kicks in when POSTGRES_HOST is set.
    fn postgres_url_from_parts() -> Option<String> {
        let host = env::var("POSTGRES_HOST").ok()?;
        let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
        let password = env::var("POSTGRES_PASSWORD").unwrap_or_default();
        let db = env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string());
        let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
        Some(format!("postgresql://{user}:{password}@{host}:{port}/{db}"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
