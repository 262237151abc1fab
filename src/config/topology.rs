//! Topology description stored in the device configuration.
//!
//! ```toml
//! [topology]
//! root = "evcam"
//!
//! [[topology.ports]]
//! index = 0
//! remote = "filter"
//! remote_port = 1
//!
//! [[topology.nodes]]
//! id = "filter"
//! pads = ["sink", "source"]
//! endpoints = [
//!     { local_port = 0, remote = "sensor", remote_port = 0 },
//!     { local_port = 1, remote = "evcam", remote_port = 0 },
//! ]
//! ```
//!
//! Endpoints are checked lazily: a missing `remote` or `remote_port` is
//! reported by [`TopologySource::endpoints`] as a parse error for that entry.

use crate::dma::DmaDirection;
use crate::graph::{
    DmaPortDesc, Endpoint, EndpointParseError, FwnodeRef, MediaBusFormat, PadDescriptor,
    PadDirection, TopologySource,
};
use serde::{Deserialize, Serialize};

/// One outbound endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub local_port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u32>,
}

impl EndpointConfig {
    pub fn new(local_port: u32, remote: &str, remote_port: u32) -> Self {
        Self {
            local_port,
            remote: Some(remote.to_string()),
            remote_port: Some(remote_port),
        }
    }

    fn parse(&self, index: usize) -> Result<Endpoint, EndpointParseError> {
        let remote = self.remote.as_ref().ok_or_else(|| EndpointParseError {
            index,
            reason: "missing remote".to_string(),
        })?;
        let remote_port = self.remote_port.ok_or_else(|| EndpointParseError {
            index,
            reason: "missing remote_port".to_string(),
        })?;
        Ok(Endpoint {
            local_port: self.local_port,
            remote: FwnodeRef::new(remote.as_str()),
            remote_port,
        })
    }
}

/// A DMA port of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaPortConfig {
    pub index: u32,
    /// Defaults to capture for port 0 and output for the others.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<DmaDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u32>,
}

impl DmaPortConfig {
    pub fn direction(&self) -> DmaDirection {
        self.direction
            .unwrap_or_else(|| DmaDirection::default_for_port(self.index))
    }

    fn endpoint(&self) -> Option<EndpointConfig> {
        if self.remote.is_none() && self.remote_port.is_none() {
            return None;
        }
        Some(EndpointConfig {
            local_port: self.index,
            remote: self.remote.clone(),
            remote_port: self.remote_port,
        })
    }
}

/// A processing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Pad layout, used when binding simulated nodes.
    #[serde(default)]
    pub pads: Vec<PadDirection>,
    /// Format reported by a simulated node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MediaBusFormat>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl NodeConfig {
    pub fn pad_descriptors(&self) -> Vec<PadDescriptor> {
        self.pads
            .iter()
            .map(|d| match d {
                PadDirection::Sink => PadDescriptor::sink("sink"),
                PadDirection::Source => PadDescriptor::source("source"),
            })
            .collect()
    }
}

/// The whole topology of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Identity of the device itself.
    pub root: String,
    #[serde(default)]
    pub ports: Vec<DmaPortConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl TopologyConfig {
    /// `sensor.0 -> filter.0`, `filter.1 -> dma port 0`.
    pub fn demo() -> Self {
        Self {
            root: "evcam".to_string(),
            ports: vec![DmaPortConfig {
                index: 0,
                direction: Some(DmaDirection::Capture),
                remote: Some("filter".to_string()),
                remote_port: Some(1),
            }],
            nodes: vec![
                NodeConfig {
                    id: "sensor".to_string(),
                    pads: vec![PadDirection::Source],
                    format: Some(MediaBusFormat::default()),
                    endpoints: vec![EndpointConfig::new(0, "filter", 0)],
                },
                NodeConfig {
                    id: "filter".to_string(),
                    pads: vec![PadDirection::Sink, PadDirection::Source],
                    format: Some(MediaBusFormat::default()),
                    endpoints: vec![
                        EndpointConfig::new(0, "sensor", 0),
                        EndpointConfig::new(1, "evcam", 0),
                    ],
                },
            ],
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

impl TopologySource for TopologyConfig {
    fn root(&self) -> FwnodeRef {
        FwnodeRef::new(self.root.as_str())
    }

    fn endpoints(&self, node: &FwnodeRef) -> Vec<Result<Endpoint, EndpointParseError>> {
        if node.as_str() == self.root {
            return self
                .ports
                .iter()
                .filter_map(DmaPortConfig::endpoint)
                .enumerate()
                .map(|(i, ep)| ep.parse(i))
                .collect();
        }
        match self.node(node.as_str()) {
            Some(n) => n
                .endpoints
                .iter()
                .enumerate()
                .map(|(i, ep)| ep.parse(i))
                .collect(),
            None => Vec::new(),
        }
    }

    fn dma_ports(&self) -> Vec<DmaPortDesc> {
        self.ports
            .iter()
            .map(|p| DmaPortDesc {
                index: p.index,
                direction: p.direction(),
            })
            .collect()
    }
}
