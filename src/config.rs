//! Konfiguration
//!
//! Wird aus `config.json` im Konfigurationsverzeichnis der Plattform gelesen
//! und danach durch Umgebungsvariablen überschrieben:
//!
//! - `PEERCALL_STORE_URL` - URL des Store-Relays
//! - `PEERCALL_LISTEN` - Adresse, auf der das Relay lauscht
//! - `PEERCALL_LOG` - Log-Filter (`RUST_LOG` hat Vorrang)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "peercall=debug,webrtc=warn";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// WebSocket-URL des Store-Relays
    pub store_url: String,
    /// Listen-Adresse für `peercall-relay`
    pub listen_addr: String,
    pub request_timeout_secs: u64,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            ice_candidate_pool_size: 10,
            store_url: "ws://127.0.0.1:8787".to_string(),
            listen_addr: "127.0.0.1:8787".to_string(),
            request_timeout_secs: 10,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Lädt die Konfiguration (Datei falls vorhanden, dann Umgebung)
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Liest eine Konfigurationsdatei; fehlt sie, gelten die Standardwerte
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Überschreibt Werte aus der Umgebung
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PEERCALL_STORE_URL") {
            self.store_url = url;
        }
        if let Some(addr) = lookup("PEERCALL_LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(filter) = lookup("PEERCALL_LOG") {
            self.log_filter = filter;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "peercall", "peercall")
            .ok_or(ConfigError::NoConfigDir)?;

        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("config.json");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(
            config.ice_servers[0].urls,
            vec![
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302"
            ]
        );
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("peercall-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"store_url": "ws://relay.local:9000"}"#).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.store_url, "ws://relay.local:9000");
        assert_eq!(config.ice_candidate_pool_size, 10);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            AppConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("peercall-does-not-exist.json");
        assert_eq!(AppConfig::from_file(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PEERCALL_STORE_URL", "ws://10.0.0.2:8787"),
            ("PEERCALL_LOG", "peercall=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.store_url, "ws://10.0.0.2:8787");
        assert_eq!(config.log_filter, "peercall=trace");
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
    }
}
