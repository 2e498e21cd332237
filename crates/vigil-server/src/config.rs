//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use vigil_engine::{EngineSettings, SettingsError};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file shared with the application.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// How long a connection waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "vigil_engine=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// The `[engine]` section. Missing keys take the engine defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub throttle_ms: u64,
    pub workers: usize,
    pub executor_cache_capacity: usize,
    pub warn_threshold_ms: u64,
    pub kill_threshold_ms: u64,
    pub max_result_length: usize,
    pub lease_ttl_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub batch_window_ms: u64,
    pub index_refresh_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let d = EngineSettings::default();
        Self {
            throttle_ms: d.throttle_ms,
            workers: d.workers,
            executor_cache_capacity: d.executor_cache_capacity,
            warn_threshold_ms: d.warn_threshold_ms,
            kill_threshold_ms: d.kill_threshold_ms,
            max_result_length: d.max_result_length,
            lease_ttl_ms: d.lease_ttl_ms,
            retry_attempts: d.retry_attempts,
            retry_base_ms: d.retry_base_ms,
            batch_window_ms: d.batch_window_ms,
            index_refresh_ms: d.index_refresh_ms,
        }
    }
}

impl EngineConfig {
    /// Converts to engine settings. A worker count of zero is raised to one.
    pub fn to_settings(&self) -> EngineSettings {
        EngineSettings {
            throttle_ms: self.throttle_ms,
            workers: self.workers.max(1),
            executor_cache_capacity: self.executor_cache_capacity,
            warn_threshold_ms: self.warn_threshold_ms,
            kill_threshold_ms: self.kill_threshold_ms,
            max_result_length: self.max_result_length,
            lease_ttl_ms: self.lease_ttl_ms,
            retry_attempts: self.retry_attempts,
            retry_base_ms: self.retry_base_ms,
            batch_window_ms: self.batch_window_ms,
            index_refresh_ms: self.index_refresh_ms,
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "vigil.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The `[engine]` section is inconsistent.
    #[error("invalid engine configuration: {0}")]
    Engine(#[from] SettingsError),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VIGIL_HOST` overrides `server.host`
/// - `VIGIL_PORT` overrides `server.port`
/// - `VIGIL_DB_PATH` overrides `database.path`
/// - `VIGIL_LOG_LEVEL` overrides `logging.level`
/// - `VIGIL_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VIGIL_THROTTLE_MS` overrides `engine.throttle_ms`
/// - `VIGIL_WORKERS` overrides `engine.workers`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting engine settings are inconsistent.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.engine.to_settings().validate()?;
    Ok(config)
}

/// Applies `VIGIL_*` overrides read through `lookup`. Unparseable values
/// are ignored.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("VIGIL_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("VIGIL_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = lookup("VIGIL_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("VIGIL_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("VIGIL_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(throttle) = lookup("VIGIL_THROTTLE_MS") {
        if let Ok(parsed) = throttle.parse() {
            config.engine.throttle_ms = parsed;
        }
    }
    if let Some(workers) = lookup("VIGIL_WORKERS") {
        if let Ok(parsed) = workers.parse() {
            config.engine.workers = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_engine_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, "vigil.db");
        assert_eq!(config.engine.to_settings(), EngineSettings::default());
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/var/lib/app.db"

            [engine]
            throttle_ms = 500
            batch_window_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, "/var/lib/app.db");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        let settings = config.engine.to_settings();
        assert_eq!(settings.throttle_ms, 500);
        assert_eq!(settings.batch_window_ms, 50);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.kill_threshold_ms, 20_000);
    }

    #[test]
    fn unknown_values_fail_to_parse() {
        assert!(toml::from_str::<Config>("[engine]\nworkers = \"many\"").is_err());
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("VIGIL_PORT", "8080"),
            ("VIGIL_HOST", "not-an-ip"),
            ("VIGIL_LOG_JSON", "1"),
            ("VIGIL_THROTTLE_MS", "250"),
            ("VIGIL_WORKERS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, default_host());
        assert!(config.logging.json);
        assert_eq!(config.engine.throttle_ms, 250);
        assert_eq!(config.engine.to_settings().workers, 1);
    }

    #[test]
    fn lease_shorter_than_kill_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "[engine]\nkill_threshold_ms = 5000\nlease_ttl_ms = 4000\n").unwrap();

        let err = load_config(path.to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Engine(_)));
        assert!(err.to_string().contains("lease_ttl_ms"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
