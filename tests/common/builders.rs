//! Test data builders for topologies and buffers

use evpipe::config::{DmaPortConfig, EndpointConfig, NodeConfig, TopologyConfig};
use evpipe::dma::DmaDirection;
use evpipe::graph::PadDirection;
use evpipe::{Buffer, BufferHandle};

/// Builder for topology descriptions
pub struct TopologyBuilder {
    topology: TopologyConfig,
}

impl TopologyBuilder {
    pub fn new(root: &str) -> Self {
        Self {
            topology: TopologyConfig {
                root: root.to_string(),
                ports: Vec::new(),
                nodes: Vec::new(),
            },
        }
    }

    pub fn node(mut self, id: &str, pads: &[PadDirection]) -> Self {
        self.topology.nodes.push(NodeConfig {
            id: id.to_string(),
            pads: pads.to_vec(),
            format: None,
            endpoints: Vec::new(),
        });
        self
    }

    fn endpoint(&mut self, node: &str, endpoint: EndpointConfig) {
        let node = self
            .topology
            .nodes
            .iter_mut()
            .find(|n| n.id == node)
            .unwrap_or_else(|| panic!("unknown node {}", node));
        node.endpoints.push(endpoint);
    }

    /// Connect `from.from_port` to `to.to_port`, declared on both ends.
    pub fn link(mut self, from: &str, from_port: u32, to: &str, to_port: u32) -> Self {
        self.endpoint(from, EndpointConfig::new(from_port, to, to_port));
        self.endpoint(to, EndpointConfig::new(to_port, from, from_port));
        self
    }

    /// Add DMA port `index` connected to `node.node_port`.
    pub fn dma(mut self, index: u32, direction: DmaDirection, node: &str, node_port: u32) -> Self {
        self.topology.ports.push(DmaPortConfig {
            index,
            direction: Some(direction),
            remote: Some(node.to_string()),
            remote_port: Some(node_port),
        });
        let root = self.topology.root.clone();
        self.endpoint(node, EndpointConfig::new(node_port, &root, index));
        self
    }

    /// Break endpoint `index` of `node` by dropping its remote port.
    pub fn broken(mut self, node: &str, index: usize) -> Self {
        if let Some(n) = self.topology.nodes.iter_mut().find(|n| n.id == node) {
            n.endpoints[index].remote_port = None;
        }
        self
    }

    pub fn build(self) -> TopologyConfig {
        self.topology
    }
}

/// `sensor.0 -> filter.0`, `filter.1 -> capture port 0`
pub fn sensor_filter_topology() -> TopologyConfig {
    TopologyBuilder::new("evcam")
        .node("sensor", &[PadDirection::Source])
        .node("filter", &[PadDirection::Sink, PadDirection::Source])
        .link("sensor", 0, "filter", 0)
        .dma(0, DmaDirection::Capture, "filter", 1)
        .build()
}

/// `output port 1 -> isp.0`, `isp.1 -> capture port 0`: one component with
/// two DMA endpoints.
pub fn loopback_topology() -> TopologyConfig {
    TopologyBuilder::new("evcam")
        .node("isp", &[PadDirection::Sink, PadDirection::Source])
        .dma(0, DmaDirection::Capture, "isp", 1)
        .dma(1, DmaDirection::Output, "isp", 0)
        .build()
}

/// `sensor.0 -> capture port 0`, `sensor.1 -> capture port 2`
pub fn dual_capture_topology() -> TopologyConfig {
    TopologyBuilder::new("evcam")
        .node("sensor", &[PadDirection::Source, PadDirection::Source])
        .dma(0, DmaDirection::Capture, "sensor", 0)
        .dma(2, DmaDirection::Capture, "sensor", 1)
        .build()
}

/// `count` buffers of `len` bytes at distinct addresses
pub fn buffers(count: u32, len: usize) -> Vec<Buffer> {
    (0..count)
        .map(|index| {
            Buffer::new(BufferHandle {
                index,
                dma_addr: 0x8000_0000 + index as u64 * len as u64,
                len,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_declares_both_ends() {
        let topo = sensor_filter_topology();
        assert_eq!(topo.node("sensor").unwrap().endpoints.len(), 1);
        assert_eq!(topo.node("filter").unwrap().endpoints.len(), 2);
        assert_eq!(topo.ports.len(), 1);
    }
}
