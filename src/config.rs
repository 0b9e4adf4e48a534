//! Configuration management for the RAX fax client
//!
//! Settings are read from `config.toml` (when present) and overridden by
//! `RAX_FAX__<SECTION>__<KEY>` environment variables, e.g.
//! `RAX_FAX__POOL__HOST=fax.example.com`.

use config::{Config, Environment, File};
use log::{debug, info};
use serde::Deserialize;
use std::time::Duration;

use crate::protocol::Timezone;
use crate::session::SessionOptions;

/// Default control port of the fax server.
pub const DEFAULT_PORT: u16 = 4559;

/// Complete client configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub pool: ClientPoolConfiguration,

    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// Connection pool settings. Immutable for the lifetime of a pool run.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientPoolConfiguration {
    // ═══ SERVER ═══
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Sent with `admin` after login when set
    pub admin_password: Option<String>,
    pub timezone: Timezone,

    // ═══ SIZING ═══
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// When false every released session is closed instead of pooled
    pub pooling_enabled: bool,

    // ═══ ACQUIRE ═══
    pub blocking_timeout_ms: u64,
    pub retry_interval_ms: u64,

    // ═══ HEALTH ═══
    /// Idle sessions older than this are reopened
    pub max_idle_time_secs: u64,
    /// Idle sessions are probed with `noop` at least this often
    pub max_noop_interval_secs: u64,
    pub health_check_interval_ms: u64,
    pub reopen_backoff_secs: u64,

    // ═══ SESSION ═══
    pub socket_timeout_secs: u64,
    pub data_timeout_secs: u64,
    pub passive: bool,
}

impl Default for ClientPoolConfiguration {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: "anonymous".to_string(),
            password: None,
            admin_password: None,
            timezone: Timezone::Local,
            min_pool_size: 1,
            max_pool_size: 5,
            pooling_enabled: true,
            blocking_timeout_ms: 10_000,
            retry_interval_ms: 100,
            max_idle_time_secs: 300,
            max_noop_interval_secs: 60,
            health_check_interval_ms: 1_000,
            reopen_backoff_secs: 5,
            socket_timeout_secs: 10,
            data_timeout_secs: 30,
            passive: true,
        }
    }
}

/// Status watcher settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    /// Register a logging listener from the binary at startup
    pub enabled: bool,
    /// Local address the shared event socket binds to
    pub bind_address: String,
    /// 0 picks an ephemeral port
    pub listen_port: u16,
    /// Upper bound on listener callbacks running at once across all hosts
    pub dispatch_workers: usize,
    pub socket_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0".to_string(),
            listen_port: 0,
            dispatch_workers: 8,
            socket_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Load configuration from config.toml with environment overrides
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_paths = ["rax-fax-client/config", "config"];

        for config_path in &config_paths {
            match Self::load_from(config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {}", config_path);
                    return Ok(config);
                }
                Err(config::ConfigError::NotFound(_)) | Err(config::ConfigError::Foreign(_)) => {
                    debug!("No configuration file at {}", config_path);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        info!("No configuration file found, using defaults and environment");
        let settings = Config::builder().add_source(environment()).build()?;
        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file (extension optional)
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?;
        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.pool.validate()?;

        if self.watcher.dispatch_workers == 0 {
            return Err(config::ConfigError::Message(
                "watcher.dispatch_workers must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix("RAX_FAX").separator("__")
}

impl ClientPoolConfiguration {
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.host.trim().is_empty() {
            return Err(config::ConfigError::Message("pool.host cannot be empty".into()));
        }

        if self.port == 0 {
            return Err(config::ConfigError::Message("pool.port cannot be 0".into()));
        }

        if self.user.trim().is_empty() {
            return Err(config::ConfigError::Message("pool.user cannot be empty".into()));
        }

        if self.max_pool_size == 0 {
            return Err(config::ConfigError::Message(
                "pool.max_pool_size must be greater than 0".into(),
            ));
        }

        if self.min_pool_size > self.max_pool_size {
            return Err(config::ConfigError::Message(
                "pool.min_pool_size must not exceed pool.max_pool_size".into(),
            ));
        }

        if self.retry_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "pool.retry_interval_ms must be greater than 0".into(),
            ));
        }

        if self.health_check_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "pool.health_check_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Socket address string of the fax server
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn max_noop_interval(&self) -> Duration {
        Duration::from_secs(self.max_noop_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_secs(self.reopen_backoff_secs)
    }

    /// Per-session options derived from the pool settings
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            control_timeout: Duration::from_secs(self.socket_timeout_secs),
            data_timeout: Duration::from_secs(self.data_timeout_secs),
            passive: self.passive,
            ..SessionOptions::default()
        }
    }
}

impl WatcherConfig {
    /// Address the shared event socket binds to
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.bind_address, self.listen_port)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.port, DEFAULT_PORT);
        assert_eq!(config.pool.session_options().control_timeout, Duration::from_secs(10));
        assert_eq!(config.pool.session_options().data_timeout, Duration::from_secs(30));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut config = ClientConfig::default();
        config.pool.min_pool_size = 4;
        config.pool.max_pool_size = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_dispatch_workers_is_rejected() {
        let mut config = ClientConfig::default();
        config.watcher.dispatch_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_sections_deserialize() {
        let settings = Config::builder()
            .add_source(config::File::from_str(
                "[pool]\nhost = \"fax.example.com\"\nmax_pool_size = 3\ntimezone = \"gmt\"\n\n[watcher]\nlisten_port = 4600\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: ClientConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.pool.host, "fax.example.com");
        assert_eq!(config.pool.max_pool_size, 3);
        assert_eq!(config.pool.timezone, Timezone::Gmt);
        assert_eq!(config.pool.port, DEFAULT_PORT);
        assert_eq!(config.watcher.listen_port, 4600);
    }
}
