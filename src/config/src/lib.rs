//! Configuration model for the BFS processes.
//!
//! One JSON file describes the whole deployment; the daemon, the file server
//! and the client each read the sections they need. Section and field names
//! follow the deployment config layout:
//!
//! ```json
//! {
//!   "bfsDeviceLayer": {
//!     "user_id": 1,
//!     "devices": [
//!       { "type": "remote", "did": 0, "ip": "10.0.0.5", "port": 9001,
//!         "num_blocks": 1024, "path": "/var/lib/bfs/dev0.img",
//!         "sa": { "initiator": "server", "responder": "dev0",
//!                 "key_b64": "..." } }
//!     ]
//!   },
//!   "bfsBlockLayer": { "allocation_discipline": "linear", ... },
//!   "bfsClientLayer": { "do_mkfs": false, "direct_io": false, ... }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SA_KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no device with id {0} in configuration")]
    UnknownDevice(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaConfig {
    pub initiator: String,
    pub responder: String,
    pub key_b64: String,
}

impl SaConfig {
    /// Decode and validate the configured key material.
    pub fn key(&self) -> Result<Vec<u8>, ConfigError> {
        let raw = BASE64
            .decode(self.key_b64.trim())
            .map_err(|e| ConfigError::Invalid(format!("sa key for {}: {e}", self.responder)))?;
        if raw.len() != SA_KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "sa key for {}: expected {} bytes, got {}",
                self.responder,
                SA_KEY_LEN,
                raw.len()
            )));
        }
        Ok(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub did: u32,
    /// Geometry in 4 KiB blocks. Authoritative for local devices and for the
    /// daemon serving this entry; remote clients re-learn it from GET_TOPO.
    pub num_blocks: u64,
    /// Backing image path (local devices and the owning daemon).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Daemon address (remote devices). The daemon itself listens on `port`.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub sa: Option<SaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLayerConfig {
    /// Identity the file server presents in device-protocol headers; each
    /// daemon accepts requests only from this peer.
    #[serde(default = "default_user_id")]
    pub user_id: u64,
    pub devices: Vec<DeviceConfig>,
}

fn default_user_id() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationDiscipline {
    Linear,
    Interleave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLayerConfig {
    pub allocation_discipline: AllocationDiscipline,
    /// Expected cluster size; validated against the device sum when present.
    #[serde(default)]
    pub num_blocks: Option<u64>,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_blocks")]
    pub cache_max_blocks: usize,
    #[serde(default = "default_true")]
    pub log_enabled: bool,
    #[serde(default)]
    pub log_verbose: bool,
}

fn default_true() -> bool {
    true
}

fn default_cache_blocks() -> usize {
    // 64 MiB of 4 KiB blocks
    16384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLayerConfig {
    #[serde(default)]
    pub do_mkfs: bool,
    #[serde(default)]
    pub direct_io: bool,
    pub bfs_server_ip: String,
    pub bfs_server_port: u16,
    pub cl_serv_sa: SaConfig,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/bfs_client_cache")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BfsConfig {
    #[serde(rename = "bfsDeviceLayer")]
    pub device_layer: DeviceLayerConfig,
    #[serde(rename = "bfsBlockLayer")]
    pub block_layer: BlockLayerConfig,
    #[serde(rename = "bfsClientLayer", default)]
    pub client_layer: Option<ClientLayerConfig>,
}

impl BfsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn device(&self, did: u32) -> Result<&DeviceConfig, ConfigError> {
        self.device_layer
            .devices
            .iter()
            .find(|d| d.did == did)
            .ok_or(ConfigError::UnknownDevice(did))
    }

    pub fn total_blocks(&self) -> u64 {
        self.device_layer.devices.iter().map(|d| d.num_blocks).sum()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device_layer.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".into()));
        }
        let mut seen = Vec::new();
        for dev in &self.device_layer.devices {
            if seen.contains(&dev.did) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id {}",
                    dev.did
                )));
            }
            seen.push(dev.did);

            if dev.num_blocks == 0 {
                return Err(ConfigError::Invalid(format!(
                    "device {} has zero blocks",
                    dev.did
                )));
            }
            match dev.kind {
                DeviceKind::Local => {
                    if dev.path.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "local device {} needs a path",
                            dev.did
                        )));
                    }
                }
                DeviceKind::Remote => {
                    if dev.ip.is_none() || dev.port.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "remote device {} needs ip and port",
                            dev.did
                        )));
                    }
                    match &dev.sa {
                        None => {
                            return Err(ConfigError::Invalid(format!(
                                "remote device {} needs a security association",
                                dev.did
                            )))
                        }
                        Some(sa) => {
                            sa.key()?;
                        }
                    }
                }
            }
        }

        if let Some(expected) = self.block_layer.num_blocks {
            let got = self.total_blocks();
            if expected != got {
                return Err(ConfigError::Invalid(format!(
                    "bfsBlockLayer.num_blocks = {expected} but devices sum to {got}"
                )));
            }
        }
        if self.block_layer.cache_enabled && self.block_layer.cache_max_blocks == 0 {
            return Err(ConfigError::Invalid(
                "cache enabled with zero capacity".into(),
            ));
        }

        if let Some(client) = &self.client_layer {
            client.cl_serv_sa.key()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "bfsDeviceLayer": {
            "user_id": 1,
            "devices": [
                { "type": "remote", "did": 0, "ip": "127.0.0.1", "port": 9001,
                  "num_blocks": 16, "path": "/tmp/dev0.img",
                  "sa": { "initiator": "server", "responder": "dev0",
                          "key_b64": "MDEyMzQ1Njc4OWFiY2RlZg==" } },
                { "type": "local", "did": 1, "num_blocks": 16,
                  "path": "/tmp/dev1.img" }
            ]
        },
        "bfsBlockLayer": {
            "allocation_discipline": "linear",
            "num_blocks": 32,
            "cache_enabled": true,
            "cache_max_blocks": 8,
            "log_enabled": true,
            "log_verbose": false
        },
        "bfsClientLayer": {
            "do_mkfs": true,
            "direct_io": false,
            "bfs_server_ip": "127.0.0.1",
            "bfs_server_port": 9000,
            "cl_serv_sa": { "initiator": "client", "responder": "server",
                            "key_b64": "MDEyMzQ1Njc4OWFiY2RlZg==" }
        }
    }"#;

    #[test]
    fn parses_sample() {
        let cfg = BfsConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.device_layer.devices.len(), 2);
        assert_eq!(cfg.total_blocks(), 32);
        assert_eq!(
            cfg.block_layer.allocation_discipline,
            AllocationDiscipline::Linear
        );
        let dev = cfg.device(0).unwrap();
        assert_eq!(dev.kind, DeviceKind::Remote);
        assert_eq!(dev.sa.as_ref().unwrap().key().unwrap().len(), SA_KEY_LEN);
        assert!(cfg.client_layer.is_some());
    }

    #[test]
    fn unknown_discipline_fails() {
        let raw = SAMPLE.replace("linear", "striped");
        assert!(matches!(
            BfsConfig::parse(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn block_count_mismatch_fails() {
        let raw = SAMPLE.replace("\"num_blocks\": 32", "\"num_blocks\": 48");
        assert!(matches!(
            BfsConfig::parse(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn duplicate_device_id_fails() {
        let raw = SAMPLE.replace("\"did\": 1", "\"did\": 0");
        assert!(matches!(
            BfsConfig::parse(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn short_key_fails() {
        let raw = SAMPLE.replace("MDEyMzQ1Njc4OWFiY2RlZg==", "c2hvcnQ=");
        assert!(matches!(
            BfsConfig::parse(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_device_is_reported() {
        let cfg = BfsConfig::parse(SAMPLE).unwrap();
        assert!(matches!(cfg.device(9), Err(ConfigError::UnknownDevice(9))));
    }
}
