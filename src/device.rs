//! Composite device: the DMA channels of one device plus the graph linking
//! them to the processing nodes around it.
//!
//! Probing creates one [`DmaChannel`] per declared port, then discovers the
//! processing nodes referenced by the topology. The device is usable once
//! every discovered node has been bound; [`CompositeDevice::wait_complete`]
//! blocks until then.
//!
//! ```text
//! probe ─► channels ─► discover ─► bind … bind ─► graph registered
//!                                                   │
//!                                         stream on channels
//! ```

use crate::config::DeviceConfig;
use crate::dma::{DmaChannel, RegisterMap, TransferEngine};
use crate::error::{EvPipeError, GraphError, Result};
use crate::graph::{
    BuilderState, GraphBuilder, GraphSnapshot, MediaGraph, Subdevice, TopologySource,
};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One probed device.
pub struct CompositeDevice {
    name: String,
    graph: Arc<MediaGraph>,
    engine: Arc<dyn TransferEngine>,
    channels: Vec<Arc<DmaChannel>>,
    builder: Mutex<GraphBuilder>,
    completed: Receiver<()>,
}

impl CompositeDevice {
    /// Create the channels for every DMA port of `topology` and start graph
    /// discovery.
    ///
    /// An engine channel that is not available yet fails the probe with a
    /// retryable error (see [`EvPipeError::is_retryable`]).
    pub fn probe(
        config: &DeviceConfig,
        topology: Arc<dyn TopologySource>,
        engine: Arc<dyn TransferEngine>,
        registers: Arc<dyn RegisterMap>,
    ) -> Result<Self> {
        config.validate()?;

        let graph = Arc::new(MediaGraph::new(config.model.clone()));
        let mut channels: Vec<Arc<DmaChannel>> = Vec::new();

        for port in topology.dma_ports() {
            let created = registers
                .bank(port.index)
                .ok_or_else(|| {
                    EvPipeError::Config(format!("no packetizer registers for port {}", port.index))
                })
                .and_then(|bank| {
                    DmaChannel::new(
                        &config.name,
                        port.index,
                        port.direction,
                        config.transfer_size,
                        graph.clone(),
                        engine.as_ref(),
                        bank,
                    )
                    .map_err(EvPipeError::from)
                });
            match created {
                Ok(channel) => channels.push(Arc::new(channel)),
                Err(e) => {
                    release_channels(engine.as_ref(), &channels);
                    return Err(e);
                }
            }
        }

        let (tx, completed) = bounded(1);
        let mut builder = GraphBuilder::new(topology, graph.clone());
        for channel in &channels {
            builder.add_dma_port(channel.port(), channel.entity());
        }
        let name = config.name.clone();
        builder.on_complete(Box::new(move |graph: &MediaGraph| {
            tracing::info!(
                "{}: graph complete ({} entities, {} links)",
                name,
                graph.entity_count(),
                graph.link_count()
            );
            let _ = tx.try_send(());
        }));

        if let Err(e) = builder.discover() {
            release_channels(engine.as_ref(), &channels);
            graph.clear();
            return Err(e.into());
        }

        tracing::info!(
            "Probed {} with {} DMA channel(s), {} node(s) pending",
            config.name,
            channels.len(),
            builder.pending()
        );
        Ok(Self {
            name: config.name.clone(),
            graph,
            engine,
            channels,
            builder: Mutex::new(builder),
            completed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind an implementation to its discovered node.
    pub fn bind(&self, subdev: Arc<Subdevice>) -> std::result::Result<(), GraphError> {
        self.builder.lock().bind(subdev)
    }

    pub fn state(&self) -> BuilderState {
        self.builder.lock().state()
    }

    /// Number of discovered nodes still unbound.
    pub fn pending(&self) -> usize {
        self.builder.lock().pending()
    }

    /// Block until the graph is complete. Returns `false` on timeout.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        if self.state() == BuilderState::Complete {
            return true;
        }
        self.completed.recv_timeout(timeout).is_ok() || self.state() == BuilderState::Complete
    }

    /// Channel serving DMA port `port`.
    pub fn channel(&self, port: u32) -> Option<&Arc<DmaChannel>> {
        self.channels.iter().find(|c| c.port() == port)
    }

    pub fn channels(&self) -> &[Arc<DmaChannel>] {
        &self.channels
    }

    pub fn graph(&self) -> &Arc<MediaGraph> {
        &self.graph
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Graph snapshot as pretty-printed JSON.
    pub fn snapshot_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| EvPipeError::Serialization(format!("Failed to serialize graph: {}", e)))
    }

    /// Stop every channel, release the engine channels and clear the graph.
    pub fn remove(self) {
        drop(self);
    }

    fn teardown(&mut self) {
        for channel in &self.channels {
            if channel.is_streaming() {
                channel.stop_streaming();
            }
        }
        release_channels(self.engine.as_ref(), &self.channels);
        self.channels.clear();
        self.graph.clear();
        tracing::info!("Removed {}", self.name);
    }
}

impl Drop for CompositeDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for CompositeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeDevice")
            .field("name", &self.name)
            .field("channels", &self.channels.len())
            .field("entities", &self.graph.entity_count())
            .finish()
    }
}

fn release_channels(engine: &dyn TransferEngine, channels: &[Arc<DmaChannel>]) {
    for channel in channels {
        tracing::debug!("Releasing engine channel of {}", channel.name());
        engine.release_channel(channel.engine_channel());
    }
}

#[cfg(all(test, feature = "mock-hardware"))]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::dma::{MemoryRegisterMap, MockTransferEngine};
    use crate::error::{ChannelError, EngineError};
    use crate::graph::{PadDescriptor, SimulatedNode};

    struct NoRegisters;

    impl RegisterMap for NoRegisters {
        fn bank(&self, _port: u32) -> Option<crate::dma::RegisterBank> {
            None
        }
    }

    fn probe_with(engine: Arc<MockTransferEngine>) -> Result<CompositeDevice> {
        let config = DeviceConfig::default();
        CompositeDevice::probe(
            &config,
            Arc::new(config.topology.clone()),
            engine,
            Arc::new(MemoryRegisterMap::new(0x100)),
        )
    }

    fn bind_demo(device: &CompositeDevice) {
        let sensor = Arc::new(SimulatedNode::new());
        let filter = Arc::new(SimulatedNode::new());
        device
            .bind(sensor.subdevice("sensor", vec![PadDescriptor::source("out")]))
            .unwrap();
        device
            .bind(filter.subdevice(
                "filter",
                vec![PadDescriptor::sink("in"), PadDescriptor::source("out")],
            ))
            .unwrap();
    }

    #[test]
    fn test_probe_and_complete() {
        let engine = Arc::new(MockTransferEngine::manual());
        let device = probe_with(engine.clone()).unwrap();

        assert_eq!(device.channels().len(), 1);
        assert_eq!(device.channel(0).unwrap().name(), "evpipe output 0");
        assert_eq!(device.pending(), 2);
        assert!(!device.wait_complete(Duration::from_millis(1)));

        bind_demo(&device);
        assert!(device.wait_complete(Duration::from_millis(100)));
        assert_eq!(device.state(), BuilderState::Complete);
        assert_eq!(device.graph().link_count(), 2);
        assert!(device.graph().is_registered());
    }

    #[test]
    fn test_deferred_engine_is_retryable() {
        let engine = Arc::new(MockTransferEngine::manual().with_deferred("port0"));
        let err = probe_with(engine.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            EvPipeError::Channel(ChannelError::EngineUnavailable(EngineError::Deferred(_)))
        ));

        engine.set_ready("port0");
        assert!(probe_with(engine).is_ok());
    }

    #[test]
    fn test_missing_registers_fail_probe() {
        let config = DeviceConfig::default();
        let engine = Arc::new(MockTransferEngine::manual());
        let err = CompositeDevice::probe(
            &config,
            Arc::new(config.topology.clone()),
            engine.clone(),
            Arc::new(NoRegisters),
        )
        .unwrap_err();
        assert!(matches!(err, EvPipeError::Config(_)));
        assert_eq!(engine.channel_count(), 0);
    }

    #[test]
    fn test_empty_topology_releases_channels() {
        let mut config = DeviceConfig::default();
        config.topology = TopologyConfig {
            root: "evcam".to_string(),
            ports: config.topology.ports.clone(),
            nodes: Vec::new(),
        };
        config.topology.ports[0].remote = None;
        config.topology.ports[0].remote_port = None;

        let engine = Arc::new(MockTransferEngine::manual());
        let err = CompositeDevice::probe(
            &config,
            Arc::new(config.topology.clone()),
            engine.clone(),
            Arc::new(MemoryRegisterMap::new(0x100)),
        )
        .unwrap_err();
        assert!(matches!(err, EvPipeError::Graph(GraphError::NoSubdevices)));
        assert_eq!(engine.channel_count(), 0);
    }

    #[test]
    fn test_remove_releases_everything() {
        let engine = Arc::new(MockTransferEngine::manual());
        let device = probe_with(engine.clone()).unwrap();
        bind_demo(&device);
        let graph = device.graph().clone();
        assert_eq!(engine.channel_count(), 1);

        device.remove();
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(graph.entity_count(), 0);
    }

    #[test]
    fn test_snapshot_json() {
        let device = probe_with(Arc::new(MockTransferEngine::manual())).unwrap();
        bind_demo(&device);
        let json = device.snapshot_json().unwrap();
        let snapshot: GraphSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.entities.len(), 3);
        assert_eq!(snapshot.links.len(), 2);
    }
}
