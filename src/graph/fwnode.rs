//! Boundary to the external topology description.
//!
//! The graph builder never parses a description format itself. It asks a
//! [`TopologySource`] for the outbound endpoints of a node and for the list of
//! DMA ports of the device. Nodes are identified by an opaque [`FwnodeRef`].

use crate::dma::DmaDirection;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a node in the topology description.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FwnodeRef(String);

impl FwnodeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FwnodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FwnodeRef({})", self.0)
    }
}

impl fmt::Display for FwnodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FwnodeRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A parsed outbound endpoint: `local_port` of the owning node is connected to
/// `remote_port` of `remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub local_port: u32,
    pub remote: FwnodeRef,
    pub remote_port: u32,
}

/// Why an endpoint could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointParseError {
    /// Position of the endpoint in the node's endpoint list.
    pub index: usize,
    pub reason: String,
}

/// One DMA port of the device as declared by the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaPortDesc {
    pub index: u32,
    pub direction: DmaDirection,
}

/// Source of topology information consumed by the graph builder.
pub trait TopologySource: Send + Sync {
    /// Identity of the device itself. Endpoints pointing back at it are the
    /// DMA ports.
    fn root(&self) -> FwnodeRef;

    /// Outbound endpoints of `node`, each parsed independently.
    ///
    /// For the root node, `local_port` is the DMA port index.
    fn endpoints(&self, node: &FwnodeRef) -> Vec<Result<Endpoint, EndpointParseError>>;

    /// DMA ports of the device, in declaration order.
    fn dma_ports(&self) -> Vec<DmaPortDesc>;
}
