//! Configuration handling for schema_stride

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::schema::rename::{DEFAULT_FIELD_MIN_SCORE, DEFAULT_MODEL_THRESHOLD};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "schema_stride.toml";

/// Replaces `database.url`
pub const DATABASE_URL_ENV: &str = "SCHEMA_STRIDE_DATABASE_URL";

/// Replaces `migrations.directory`
pub const LOCATION_ENV: &str = "SCHEMA_STRIDE_LOCATION";

/// Load configuration from a TOML file and apply environment overrides
pub fn load_from_file(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("Failed to read config file {}: {}", path, e)))?;

    let mut config = parse(&config_str)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Load the file if it exists, otherwise start from defaults
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        return load_from_file(path);
    }
    tracing::debug!(path = path, "No config file, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Parse configuration text without touching the environment
pub fn parse(config_str: &str) -> Result<Config> {
    toml::from_str(config_str)
        .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))
}

/// Represents the complete schema_stride configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub rename: RenameConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Overlay environment values; `lookup` is injected so tests stay hermetic
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|v| !v.is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(location) = lookup(LOCATION_ENV).filter(|v| !v.is_empty()) {
            self.migrations.directory = location;
        }
    }

    /// The database URL, which has no default
    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "No database URL configured; set database.url or {}",
                    DATABASE_URL_ENV
                ))
            })
    }
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_pool_size() -> u32 {
    5
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Migration settings configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MigrationsConfig {
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_history_table")]
    pub history_table: String,
}

fn default_directory() -> String {
    "migrations".to_string()
}

fn default_history_table() -> String {
    "schema_stride_applied_migrations".to_string()
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            history_table: default_history_table(),
        }
    }
}

/// Model discovery configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_model_paths")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub recursive_scan: bool,
    #[serde(default = "default_derive_macros")]
    pub derive_macros: Vec<String>,
}

fn default_model_paths() -> Vec<String> {
    vec!["src".to_string()]
}

fn default_derive_macros() -> Vec<String> {
    vec!["Model".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            paths: default_model_paths(),
            exclude_paths: Vec::new(),
            recursive_scan: true,
            derive_macros: default_derive_macros(),
        }
    }
}

/// Naming conventions configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NamingConfig {
    #[serde(default = "default_table_style")]
    pub table_style: String,
    #[serde(default)]
    pub pluralize_tables: bool,
}

fn default_table_style() -> String {
    "snake_case".to_string()
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            table_style: default_table_style(),
            pluralize_tables: false,
        }
    }
}

/// Rename detection thresholds
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RenameConfig {
    #[serde(default = "default_model_threshold")]
    pub model_threshold: f64,
    #[serde(default = "default_field_min_score")]
    pub field_min_score: f64,
}

fn default_model_threshold() -> f64 {
    DEFAULT_MODEL_THRESHOLD
}

fn default_field_min_score() -> f64 {
    DEFAULT_FIELD_MIN_SCORE
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            model_threshold: DEFAULT_MODEL_THRESHOLD,
            field_min_score: DEFAULT_FIELD_MIN_SCORE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub file: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            format: default_format(),
            stdout: true,
        }
    }
}
