//! Mock construction helpers

use super::TEST_TRANSFER_SIZE;
use evpipe::config::{DeviceConfig, TopologyConfig};
use evpipe::dma::{MemoryRegisterMap, MockTransferEngine};
use evpipe::graph::SimulatedNode;
use evpipe::CompositeDevice;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Device config around `topology` with test-sized transfers
pub fn config_with(topology: TopologyConfig) -> DeviceConfig {
    DeviceConfig {
        name: "evcam".to_string(),
        transfer_size: TEST_TRANSFER_SIZE,
        topology,
        ..DeviceConfig::default()
    }
}

/// Probe a device against `engine` and in-memory registers
pub fn probe(
    config: &DeviceConfig,
    engine: Arc<MockTransferEngine>,
) -> evpipe::Result<CompositeDevice> {
    CompositeDevice::probe(
        config,
        Arc::new(config.topology.clone()),
        engine,
        Arc::new(MemoryRegisterMap::new(config.register_bank_size)),
    )
}

/// A probed device with a simulated node bound to every topology node
pub struct TestDevice {
    pub device: CompositeDevice,
    pub engine: Arc<MockTransferEngine>,
    pub nodes: HashMap<String, Arc<SimulatedNode>>,
}

impl TestDevice {
    pub fn node(&self, id: &str) -> &Arc<SimulatedNode> {
        &self.nodes[id]
    }

    pub fn engine_channel(&self, port: u32) -> Arc<evpipe::dma::MockChannel> {
        self.engine
            .channel(&format!("port{}", port))
            .expect("engine channel requested at probe")
    }
}

/// Probe and bind everything; panics if the graph does not complete.
pub fn bound_device(config: &DeviceConfig, engine: Arc<MockTransferEngine>) -> TestDevice {
    let device = probe(config, engine.clone()).expect("probe");
    let mut nodes = HashMap::new();
    for node in &config.topology.nodes {
        let sim = Arc::new(SimulatedNode::new().with_format(node.format.unwrap_or_default()));
        device
            .bind(sim.subdevice(&node.id, node.pad_descriptors()))
            .expect("bind");
        nodes.insert(node.id.clone(), sim);
    }
    assert!(device.wait_complete(Duration::from_millis(100)));
    TestDevice {
        device,
        engine,
        nodes,
    }
}

/// Manual engine: completions are fired by the test
pub fn manual_engine() -> Arc<MockTransferEngine> {
    Arc::new(MockTransferEngine::manual())
}

/// Automatic engine completing after `latency`
pub fn auto_engine(latency: Duration) -> Arc<MockTransferEngine> {
    Arc::new(MockTransferEngine::new(latency))
}
