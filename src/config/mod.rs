use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "UC_";

/// Upper bound for any per-message handling wait, in seconds.
pub const MAX_MESSAGE_HANDLING_WAIT_SECS: f64 = 10.0;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub config_home: PathBuf,
    pub driver_metadata_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_home: PathBuf::new(),
            driver_metadata_path: PathBuf::from("driver.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub disable_entity_id_prefixing: bool,
    pub max_message_handling_wait_secs: f64,
    pub broadcast_lock_timeout_ms: u64,
    pub repeat_command_timeout_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            disable_entity_id_prefixing: false,
            max_message_handling_wait_secs: 9.5,
            broadcast_lock_timeout_ms: 1000,
            repeat_command_timeout_secs: 60,
        }
    }
}

impl ProtocolConfig {
    pub fn max_message_handling_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_message_handling_wait_secs)
    }

    pub fn broadcast_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_lock_timeout_ms)
    }

    pub fn repeat_command_timeout(&self) -> Duration {
        Duration::from_secs(self.repeat_command_timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Server settings
        if let Ok(val) = env::var(format!("{}INTEGRATION_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}INTEGRATION_URLS", ENV_PREFIX)) {
            if let Some(port) = port_from_urls(&val) {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}INTEGRATION_HTTP_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}INTEGRATION_PATH", ENV_PREFIX)) {
            self.server.path = val;
        }

        // Storage settings
        if let Ok(val) = env::var(format!("{}CONFIG_HOME", ENV_PREFIX)) {
            self.storage.config_home = PathBuf::from(val);
        }
        if let Ok(val) = env::var(format!("{}DRIVER_METADATA_PATH", ENV_PREFIX)) {
            self.storage.driver_metadata_path = PathBuf::from(val);
        }

        // Protocol settings
        if let Ok(val) = env::var(format!("{}DISABLE_ENTITY_ID_PREFIXING", ENV_PREFIX)) {
            self.protocol.disable_entity_id_prefixing = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}MAX_MESSAGE_HANDLING_WAIT_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.protocol.max_message_handling_wait_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if !self.server.path.starts_with('/') {
            return Err("server.path must start with '/'".into());
        }
        let wait = self.protocol.max_message_handling_wait_secs;
        if !(wait > 0.0 && wait <= MAX_MESSAGE_HANDLING_WAIT_SECS) {
            return Err("protocol.max_message_handling_wait_secs must be in (0, 10]".into());
        }
        if self.protocol.broadcast_lock_timeout_ms == 0 {
            return Err("protocol.broadcast_lock_timeout_ms must be non-zero".into());
        }
        if self.protocol.repeat_command_timeout_secs == 0 {
            return Err("protocol.repeat_command_timeout_secs must be non-zero".into());
        }
        Ok(())
    }
}

/// Port of the last entry in a `;`-separated url list such as
/// `http://+:9001;http://localhost:9002`.
fn port_from_urls(urls: &str) -> Option<u16> {
    urls.split(';')
        .filter(|u| !u.trim().is_empty())
        .last()
        .and_then(|u| u.trim().trim_end_matches('/').rsplit(':').next())
        .and_then(|port| port.parse().ok())
}

fn active_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_FILE", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.server.port, 9001);
        assert_eq!(parsed.protocol.max_message_handling_wait(), Duration::from_millis(9500));
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let parsed: Config = toml::from_str("[protocol]\nrepeat_command_timeout_secs = 5\n").unwrap();
        assert_eq!(parsed.protocol.repeat_command_timeout_secs, 5);
        assert_eq!(parsed.protocol.broadcast_lock_timeout_ms, 1000);
        assert_eq!(parsed.server.path, "/");
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_bounds_message_wait() {
        let mut cfg = Config::default();
        cfg.protocol.max_message_handling_wait_secs = 0.0;
        assert!(cfg.validate().is_err());
        cfg.protocol.max_message_handling_wait_secs = 10.5;
        assert!(cfg.validate().is_err());
        cfg.protocol.max_message_handling_wait_secs = 10.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn port_is_taken_from_last_url() {
        assert_eq!(port_from_urls("http://+:9001"), Some(9001));
        assert_eq!(port_from_urls("http://+:8080;http://localhost:9002/"), Some(9002));
        assert_eq!(port_from_urls("http://localhost"), None);
    }
}
