//! Configuration loading: env-resolved file path, TOML file, per-field env overlay.
//!
//! Env vars win over the file, mirroring the `SOAR_ENV`/file precedence used
//! elsewhere in this family of services.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_stale_threshold_ms() -> u64 {
    30_000
}

/// Resolved, validated configuration for a single `dronewatch` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub max_ports: usize,
    pub thread_pool_size: usize,
    pub idle_threshold_ms: u64,
    pub scanner_timeout_ms: u64,
    pub buffer_size: usize,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default = "default_web_bind")]
    pub web_bind: String,
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
}

fn default_web_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_bind() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port_range_min: 14550,
            port_range_max: 14750,
            max_ports: 64,
            thread_pool_size: 4,
            idle_threshold_ms: 30_000,
            scanner_timeout_ms: 2_000,
            buffer_size: 4096,
            stale_threshold_ms: default_stale_threshold_ms(),
            web_bind: default_web_bind(),
            metrics_bind: default_metrics_bind(),
        }
    }
}

impl AppConfig {
    /// Load from the resolved config file path (if present), then overlay
    /// individual environment variables, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            _ => AppConfig::default(),
        };

        config.apply_env_overlay()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overlay(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_u16("DRONEWATCH_PORT_RANGE_MIN")? {
            self.port_range_min = v;
        }
        if let Some(v) = env_u16("DRONEWATCH_PORT_RANGE_MAX")? {
            self.port_range_max = v;
        }
        if let Some(v) = env_usize("DRONEWATCH_MAX_PORTS")? {
            self.max_ports = v;
        }
        if let Some(v) = env_usize("DRONEWATCH_THREAD_POOL_SIZE")? {
            self.thread_pool_size = v;
        }
        if let Some(v) = env_u64("DRONEWATCH_IDLE_THRESHOLD_MS")? {
            self.idle_threshold_ms = v;
        }
        if let Some(v) = env_u64("DRONEWATCH_SCANNER_TIMEOUT_MS")? {
            self.scanner_timeout_ms = v;
        }
        if let Some(v) = env_usize("DRONEWATCH_BUFFER_SIZE")? {
            self.buffer_size = v;
        }
        if let Some(v) = env_u64("DRONEWATCH_STALE_THRESHOLD_MS")? {
            self.stale_threshold_ms = v;
        }
        if let Ok(v) = std::env::var("DRONEWATCH_WEB_BIND") {
            self.web_bind = v;
        }
        if let Ok(v) = std::env::var("DRONEWATCH_METRICS_BIND") {
            self.metrics_bind = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_min == 0
            || self.port_range_min > self.port_range_max
            || self.port_range_max > 65535
        {
            return Err(ConfigError::InvalidPortRange {
                min: self.port_range_min,
                max: self.port_range_max,
            });
        }
        if self.max_ports == 0 {
            return Err(ConfigError::InvalidMaxPorts);
        }
        if self.thread_pool_size == 0 {
            return Err(ConfigError::InvalidThreadPoolSize);
        }
        if self.idle_threshold_ms < 1000 {
            return Err(ConfigError::InvalidIdleThreshold(self.idle_threshold_ms));
        }
        if self.scanner_timeout_ms < 1000 {
            return Err(ConfigError::InvalidScannerTimeout(self.scanner_timeout_ms));
        }
        if self.buffer_size < 265 {
            return Err(ConfigError::InvalidBufferSize(self.buffer_size));
        }
        Ok(())
    }
}

fn env_u16(name: &str) -> Result<Option<u16>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `DRONEWATCH_CONFIG` env var
/// 2. `/etc/dronewatch/config.toml` (production/staging)
/// 3. `./dronewatch.toml` (development)
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("DRONEWATCH_CONFIG") {
        return Some(PathBuf::from(path));
    }

    Some(match std::env::var("DRONEWATCH_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/dronewatch/config.toml"),
        _ => PathBuf::from("./dronewatch.toml"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = AppConfig::default();
        config.port_range_min = 20000;
        config.port_range_max = 10000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange { .. })
        ));
    }

    #[test]
    fn rejects_zero_max_ports() {
        let mut config = AppConfig::default();
        config.max_ports = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxPorts)));
    }

    #[test]
    fn rejects_zero_thread_pool_size() {
        let mut config = AppConfig::default();
        config.thread_pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThreadPoolSize)
        ));
    }

    #[test]
    fn rejects_small_idle_threshold() {
        let mut config = AppConfig::default();
        config.idle_threshold_ms = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdleThreshold(500))
        ));
    }

    #[test]
    #[serial]
    fn env_overlay_wins_over_file_defaults() {
        unsafe {
            std::env::set_var("DRONEWATCH_PORT_RANGE_MIN", "15000");
        }
        let mut config = AppConfig::default();
        config.apply_env_overlay().unwrap();
        assert_eq!(config.port_range_min, 15000);
        unsafe {
            std::env::remove_var("DRONEWATCH_PORT_RANGE_MIN");
        }
    }

    #[test]
    #[serial]
    fn config_path_defaults_to_dev_file() {
        unsafe {
            std::env::remove_var("DRONEWATCH_CONFIG");
            std::env::remove_var("DRONEWATCH_ENV");
        }
        assert_eq!(config_path(), Some(PathBuf::from("./dronewatch.toml")));
    }

    #[test]
    #[serial]
    fn config_path_uses_etc_in_production() {
        unsafe {
            std::env::remove_var("DRONEWATCH_CONFIG");
            std::env::set_var("DRONEWATCH_ENV", "production");
        }
        assert_eq!(
            config_path(),
            Some(PathBuf::from("/etc/dronewatch/config.toml"))
        );
        unsafe {
            std::env::remove_var("DRONEWATCH_ENV");
        }
    }
}
