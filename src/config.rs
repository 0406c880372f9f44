//! Configuration loading and persistence.
//!
//! The config file is JSON. Lookup order is an explicit path, then
//! `<config_dir>/labrelay/config.json`, then built-in defaults; environment
//! variables are applied last.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::{DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PACKET, DEFAULT_MAX_QUEUE, DEFAULT_PORT};
use crate::device::{AsyncDevice, DeviceEvent, EvictionPolicy, QueueOptions, VirtualDevice};
use crate::server::DeviceRegistry;

const CONFIG_FILE: &str = "config.json";

/// Command server settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// TCP port; 0 picks a free one.
    pub port: u16,
    /// Connections served at the same time.
    pub max_connections: usize,
    /// Maximum bytes per read.
    pub max_packet: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_packet: DEFAULT_MAX_PACKET,
        }
    }
}

/// Per-device queue settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum pending calls per device.
    pub max_queue: usize,
    /// Drop stale calls instead of rejecting new ones when full.
    pub eviction: bool,
    /// Evict calls older than this; without it the older half is dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_age_ms: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            eviction: false,
            eviction_age_ms: None,
        }
    }
}

impl QueueSettings {
    /// Queue options for spawning devices.
    pub fn to_options(&self) -> QueueOptions {
        if !self.eviction {
            return QueueOptions {
                max_queue: self.max_queue,
                eviction: None,
            };
        }
        match self.eviction_age_ms {
            Some(ms) => QueueOptions {
                max_queue: self.max_queue,
                eviction: Some(EvictionPolicy::OlderThan(Duration::from_millis(ms))),
            },
            None => QueueOptions::evicting(self.max_queue),
        }
    }
}

/// A simulated instrument served by `labrelay serve`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VirtualDeviceConfig {
    /// Name clients address the device by.
    pub name: String,
    /// Answer to `idn`.
    #[serde(default)]
    pub identity: String,
    /// Parameter names and initial values.
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    /// Simulated time per call.
    #[serde(default)]
    pub latency_ms: u64,
    /// Register the device as not connected when `false`.
    #[serde(default = "default_true")]
    pub connected: bool,
}

fn default_true() -> bool {
    true
}

impl VirtualDeviceConfig {
    fn build(&self) -> VirtualDevice {
        let identity = if self.identity.is_empty() {
            format!("labrelay virtual {}", self.name)
        } else {
            self.identity.clone()
        };
        self.parameters
            .iter()
            .fold(VirtualDevice::new(identity), |dev, (name, value)| {
                dev.with_parameter(name.clone(), *value)
            })
            .with_latency(Duration::from_millis(self.latency_ms))
    }
}

/// Configuration for labrelay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Command server settings.
    pub server: ServerSettings,
    /// Queue limits applied to every device.
    pub queue: QueueSettings,
    /// Devices to serve.
    pub devices: Vec<VirtualDeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            queue: QueueSettings::default(),
            devices: vec![VirtualDeviceConfig {
                name: "LASER".to_string(),
                identity: String::new(),
                parameters: BTreeMap::from([("rf".to_string(), 0.0), ("rr".to_string(), 1.0)]),
                latency_ms: 0,
                connected: true,
            }],
        }
    }
}

impl Config {
    /// Directory holding the config file.
    ///
    /// `LABRELAY_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("LABRELAY_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("labrelay"))
    }

    /// Load from `path`, or from the default location, with env overrides.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = Self::config_dir()?.join(CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from(&default_path)?
                } else {
                    log::debug!("[Config] {} not found, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Apply `LABRELAY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("LABRELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("LABRELAY_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(max) = var("LABRELAY_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.server.max_connections = max;
        }
        if let Some(max) = var("LABRELAY_MAX_QUEUE").and_then(|v| v.parse().ok()) {
            self.queue.max_queue = max;
        }
    }

    /// Write the config as pretty JSON to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Spawn every configured device and collect them in a registry.
    pub fn build_registry(&self, events: &UnboundedSender<DeviceEvent>) -> Result<DeviceRegistry> {
        let registry = DeviceRegistry::new();
        let options = self.queue.to_options();
        for device in &self.devices {
            let handle = if device.connected {
                AsyncDevice::spawn_with_events(device.name.clone(), device.build(), options, events.clone())
                    .with_context(|| format!("Failed to start worker for {}", device.name))?
            } else {
                AsyncDevice::disconnected(device.name.clone())
            };
            if let Some(previous) = registry.insert(handle) {
                registry.close_all();
                let _ = previous.close();
                anyhow::bail!("Device {} is configured twice", device.name);
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"server": {"port": 4000}, "devices": [{"name": "GAUGE"}]}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.queue, QueueSettings::default());
        assert_eq!(config.devices.len(), 1);
        assert!(config.devices[0].connected);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.queue.eviction = true;
        config.save(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "LABRELAY_HOST" => Some("0.0.0.0".to_string()),
            "LABRELAY_PORT" => Some("9000".to_string()),
            "LABRELAY_MAX_QUEUE" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.queue.max_queue, DEFAULT_MAX_QUEUE);
    }

    #[test]
    fn test_queue_settings_to_options() {
        let mut settings = QueueSettings::default();
        assert_eq!(settings.to_options().eviction, None);

        settings.eviction = true;
        assert_eq!(settings.to_options().eviction, Some(EvictionPolicy::Oldest(50)));

        settings.eviction_age_ms = Some(250);
        assert_eq!(
            settings.to_options().eviction,
            Some(EvictionPolicy::OlderThan(Duration::from_millis(250)))
        );
    }

    #[test]
    fn test_build_registry() {
        let mut config = Config::default();
        config.devices.push(VirtualDeviceConfig {
            name: "GAUGE".into(),
            identity: String::new(),
            parameters: BTreeMap::new(),
            latency_ms: 0,
            connected: false,
        });
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = config.build_registry(&tx).unwrap();

        assert_eq!(registry.names(), vec!["GAUGE", "LASER"]);
        assert!(registry.get("GAUGE").unwrap().is_dummy());
        let laser = registry.get("LASER").unwrap();
        assert!(laser.has_method("rfSet"));
        registry.close_all();
    }
}
