use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{AppError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Longest session lifetime accepted, ten years.
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365 * 10;
/// Longest gap between session purges, one week.
pub const MAX_PURGE_INTERVAL_MINUTES: u64 = 60 * 24 * 7;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            static_dir: PathBuf::from("static"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("members.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: i64,
    pub cookie_secure: bool,
    pub purge_interval_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24 * 7,
            cookie_secure: false,
            purge_interval_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "unique_meal.log".to_string(),
        }
    }
}

impl Config {
    /// Loads the TOML file (if any) and layers environment overrides on top.
    ///
    /// An explicitly requested file must exist; the default `config.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                info!("No {} found, using defaults", DEFAULT_CONFIG_PATH);
                Self::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        info!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Applies `UNIQUE_MEAL_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("UNIQUE_MEAL_HOST") {
            self.server.host = host;
        }

        let port = lookup("UNIQUE_MEAL_PORT").or_else(|| lookup("PORT"));
        if let Some(port) = port {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => warn!("Invalid port override '{}': {}", port, e),
            }
        }

        if let Some(path) = lookup("UNIQUE_MEAL_DATABASE") {
            self.database.path = PathBuf::from(path);
        }

        if let Some(secure) = lookup("UNIQUE_MEAL_COOKIE_SECURE") {
            match secure.parse() {
                Ok(secure) => self.session.cookie_secure = secure,
                Err(e) => warn!("Invalid cookie_secure override '{}': {}", secure, e),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.session.ttl_hours) {
            return Err(AppError::Config(format!(
                "session.ttl_hours must be between 1 and {MAX_SESSION_TTL_HOURS}"
            )));
        }
        if !(1..=MAX_PURGE_INTERVAL_MINUTES).contains(&self.session.purge_interval_minutes) {
            return Err(AppError::Config(format!(
                "session.purge_interval_minutes must be between 1 and {MAX_PURGE_INTERVAL_MINUTES}"
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
