// Configuration management for the skein CLI
//
// Stored as JSON in the platform config directory:
// - Linux:   ~/.config/skein/config.json
// - macOS:   ~/Library/Application Support/skein/config.json
// - Windows: %APPDATA%\skein\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skein_core::ProtocolConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage path for blocks, acks and device keys
    pub storage_path: Option<String>,

    /// Default log filter when RUST_LOG is unset
    pub log_filter: String,

    /// Also write logs to this file
    pub log_file: Option<String>,

    /// Protocol engine tunables
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: None,
            log_filter: "warn".to_string(),
            log_file: None,
            protocol: ProtocolConfig::default(),
        }
    }
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid {}: {}", what, value))
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("skein");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("skein");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .protocol
                .validate()
                .context("Invalid protocol settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the node keeps its store
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Update one value in memory. Protocol values are validated.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut protocol = self.protocol.clone();
        match key {
            "storage_path" => self.storage_path = optional(value),
            "log_filter" => self.log_filter = value.to_string(),
            "log_file" => self.log_file = optional(value),
            "payload_size" => protocol.payload_size = parse(value, "payload size")?,
            "compression_level" => {
                protocol.compression_level = parse(value, "compression level")?
            }
            "encryption" => protocol.encryption = parse(value, "boolean value")?,
            "persistence_window_secs" => {
                protocol.persistence_window_secs = parse(value, "number of seconds")?
            }
            "max_replay_blocks" => protocol.max_replay_blocks = parse(value, "number")?,
            "incompatibility_timeout_ms" => {
                protocol.incompatibility_timeout_ms = parse(value, "number of milliseconds")?
            }
            "exchange_key_bits" => protocol.exchange_key_bits = parse(value, "key size")?,
            "sender_idle_wait_ms" => {
                protocol.sender_idle_wait_ms = parse(value, "number of milliseconds")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        protocol.validate()?;
        self.protocol = protocol;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let p = &self.protocol;
        vec![
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log_filter".to_string(), self.log_filter.clone()),
            (
                "log_file".to_string(),
                self.log_file.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("payload_size".to_string(), p.payload_size.to_string()),
            ("compression_level".to_string(), p.compression_level.to_string()),
            ("encryption".to_string(), p.encryption.to_string()),
            (
                "persistence_window_secs".to_string(),
                p.persistence_window_secs.to_string(),
            ),
            ("max_replay_blocks".to_string(), p.max_replay_blocks.to_string()),
            (
                "incompatibility_timeout_ms".to_string(),
                p.incompatibility_timeout_ms.to_string(),
            ),
            ("exchange_key_bits".to_string(), p.exchange_key_bits.to_string()),
            ("sender_idle_wait_ms".to_string(), p.sender_idle_wait_ms.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.protocol.payload_size, 495);
        assert_eq!(config.get("storage_path").as_deref(), Some("(auto)"));
    }

    #[test]
    fn test_set_validates_protocol_values() {
        let mut config = Config::default();
        config.set("payload_size", "200").unwrap();
        assert_eq!(config.protocol.payload_size, 200);

        assert!(config.set("payload_size", "4").is_err());
        assert!(config.set("compression_level", "eleven").is_err());
        assert!(config.set("nope", "1").is_err());
        assert_eq!(config.protocol.payload_size, 200);

        config.set("log_file", "").unwrap();
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        config.set("encryption", "false").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
        assert!(!reloaded.protocol.encryption);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"protocol":{"payload_size":300}}"#).unwrap();
        assert_eq!(config.protocol.payload_size, 300);
        assert_eq!(config.protocol.compression_level, 9);
        assert_eq!(config.log_filter, "warn");
    }
}
