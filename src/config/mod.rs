//! Device configuration
//!
//! A device is described by a single TOML file holding its identity, DMA
//! transfer parameters, the topology of processing nodes and the tuning of
//! the simulated transfer engine.
//!
//! # Example
//!
//! ```no_run
//! use evpipe::config::DeviceConfig;
//!
//! let config = DeviceConfig::load_or_default(DeviceConfig::default_config_path());
//! println!("{} ports", config.topology.ports.len());
//! ```

mod topology;

pub use topology::{DmaPortConfig, EndpointConfig, NodeConfig, TopologyConfig};

use crate::dma::{BUS_WORD_BYTES, DEFAULT_TRANSFER_SIZE};
use crate::error::{EvPipeError, Result};
use crate::graph::FwnodeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier used for config directories
pub const APP_ID: &str = "dev.evpipe";

/// Name of the device configuration file
pub const CONFIG_FILE: &str = "device.toml";

/// Smallest register bank that still holds the packetizer registers.
pub const MIN_REGISTER_BANK_SIZE: u32 = 0xc;

/// Get the configuration directory for the application
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Tuning of the simulated transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Delay between submission and completion.
    pub latency_us: u64,
    /// Bytes left untransferred on every completion.
    pub residue: usize,
    /// Maximum descriptors accepted per channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Buffers queued per channel by the demo binary.
    pub buffers_per_channel: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_us: 1000,
            residue: 0,
            capacity: None,
            buffers_per_channel: 4,
        }
    }
}

impl SimulationConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }
}

fn default_name() -> String {
    "evpipe".to_string()
}

fn default_model() -> String {
    "Event-based camera pipeline".to_string()
}

fn default_transfer_size() -> usize {
    DEFAULT_TRANSFER_SIZE
}

fn default_register_bank_size() -> u32 {
    0x100
}

/// Configuration of one composite device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, used as prefix of channel names.
    #[serde(default = "default_name")]
    pub name: String,
    /// Model string reported by the media graph.
    #[serde(default = "default_model")]
    pub model: String,
    /// Bytes moved per buffer.
    #[serde(default = "default_transfer_size")]
    pub transfer_size: usize,
    /// Size in bytes of each port's packetizer register bank.
    #[serde(default = "default_register_bank_size")]
    pub register_bank_size: u32,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            model: default_model(),
            transfer_size: default_transfer_size(),
            register_bank_size: default_register_bank_size(),
            topology: TopologyConfig::demo(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Default location: `<config dir>/dev.evpipe/device.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvPipeError::Config(format!("Failed to read config from {:?}: {}", path, e))
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("Loaded device config from {:?}", path);
        Ok(config)
    }

    /// Parse and validate a configuration string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EvPipeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to the built-in configuration if the
    /// path is missing or invalid.
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EvPipeError::Config(format!(
                    "Failed to create config directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| EvPipeError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            EvPipeError::Config(format!("Failed to write config to {:?}: {}", path, e))
        })?;

        tracing::info!("Saved device config to {:?}", path);
        Ok(())
    }

    /// Check values a device cannot be probed with.
    ///
    /// Endpoint contents are not checked here; malformed endpoints surface
    /// during graph discovery.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EvPipeError::Config("device name is empty".to_string()));
        }
        if self.transfer_size == 0 || self.transfer_size % BUS_WORD_BYTES != 0 {
            return Err(EvPipeError::Config(format!(
                "transfer_size {} is not a non-zero multiple of {}",
                self.transfer_size, BUS_WORD_BYTES
            )));
        }
        if self.register_bank_size < MIN_REGISTER_BANK_SIZE || self.register_bank_size % 4 != 0 {
            return Err(EvPipeError::Config(format!(
                "register_bank_size 0x{:x} cannot hold the packetizer registers",
                self.register_bank_size
            )));
        }

        let mut ports = HashSet::new();
        for port in &self.topology.ports {
            if !ports.insert(port.index) {
                return Err(EvPipeError::Config(format!(
                    "duplicate DMA port {}",
                    port.index
                )));
            }
        }

        let mut nodes = HashSet::new();
        for node in &self.topology.nodes {
            if node.id == self.topology.root {
                return Err(EvPipeError::Config(format!(
                    "node {} has the same id as the device",
                    node.id
                )));
            }
            if !nodes.insert(node.id.as_str()) {
                return Err(EvPipeError::Config(format!("duplicate node {}", node.id)));
            }
        }
        Ok(())
    }

    pub fn root(&self) -> FwnodeRef {
        FwnodeRef::new(self.topology.root.as_str())
    }
}
