//! Daemon configuration (spec §6 "Configuration").
//!
//! TOML on disk, `serde(default)` per-section so a config missing a whole
//! section (or a brand-new install with no file at all) still loads with
//! sane defaults — same structure as the teacher's `Config`/`*Config`
//! section split, with the sections themselves replaced: the teacher's
//! `AggregationConfig`/`PrivacyConfig` (ML training concerns, out of scope
//! here) are gone, `TransportConfig`/`ProximityConfig`/`PersistenceConfig`/
//! `CoordinatorConfig` (spec §6) take their place.

use pulsemesh_core::consensus::ConsensusMethod;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Returns `~/.pulsemesh`, creating it if needed, falling back to a local
/// `.pulsemesh` directory if the home directory cannot be determined.
pub fn pulsemesh_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".pulsemesh");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(error = %e, "could not create ~/.pulsemesh, falling back to local .pulsemesh");
                let fallback = PathBuf::from(".pulsemesh");
                let _ = fs::create_dir_all(&fallback);
                return fallback;
            }
            path
        }
        None => {
            warn!("could not determine home directory, falling back to local .pulsemesh");
            let fallback = PathBuf::from(".pulsemesh");
            let _ = fs::create_dir_all(&fallback);
            fallback
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackendKind {
    Broker,
    Websocket,
    Udp,
}

impl Default for TransportBackendKind {
    fn default() -> Self {
        TransportBackendKind::Broker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub backend: TransportBackendKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_websockets: bool,
    pub encryption_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackendKind::default(),
            host: "0.0.0.0".to_string(),
            port: 4001,
            use_websockets: false,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityConfig {
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_secs: f64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: f64,
    pub device_name: Option<String>,
}

fn default_advertise_interval() -> f64 {
    1.0
}

fn default_scan_interval() -> f64 {
    5.0
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            advertise_interval_secs: default_advertise_interval(),
            scan_interval_secs: default_scan_interval(),
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub base_path: PathBuf,
    #[serde(default = "default_record_kinds")]
    pub record_kinds: Vec<String>,
}

fn default_record_kinds() -> Vec<String> {
    vec!["experience", "dream", "reflection", "fold"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_path: pulsemesh_data_dir().join("records"),
            record_kinds: default_record_kinds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: f64,
    #[serde(default = "default_min_participants")]
    pub default_min_participants: usize,
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: f64,
    #[serde(default = "default_method")]
    pub default_method: ConsensusMethod,
}

fn default_broadcast_interval() -> f64 {
    5.0
}
fn default_min_participants() -> usize {
    1
}
fn default_timeout() -> f64 {
    5.0
}
fn default_method() -> ConsensusMethod {
    ConsensusMethod::WeightedConfidence
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: default_broadcast_interval(),
            default_min_participants: default_min_participants(),
            default_timeout_secs: default_timeout(),
            default_method: default_method(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub require_signatures: bool,
    pub key_path: Option<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub trusted_pubkeys: Vec<String>,
    #[serde(default)]
    pub reputation_path: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            key_path: None,
            trusted_peers: Vec::new(),
            trusted_pubkeys: Vec::new(),
            reputation_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            enabled: true,
        }
    }
}

impl Config {
    pub fn get_config_path() -> PathBuf {
        let mut path = pulsemesh_data_dir();
        path.push("config.toml");
        path
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::get_config_path();

        if !path.exists() {
            let config = Config::default();
            config.save()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::get_config_path();
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.transport.port, config.transport.port);
        assert_eq!(reparsed.coordinator.default_method, config.coordinator.default_method);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let partial = "[transport]\nhost = \"127.0.0.1\"\nport = 5000\nbackend = \"udp\"\n";
        let config: Config = toml::from_str(partial).unwrap();
        assert_eq!(config.transport.host, "127.0.0.1");
        assert_eq!(config.coordinator.default_min_participants, 1);
    }
}
