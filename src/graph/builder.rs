//! Two-phase graph resolution: discover, bind, complete.
//!
//! Discovery walks the topology description from the device root and records
//! one unbound node per referenced processing stage. Implementations then bind
//! to their nodes as they become available, in any order. When the last node
//! binds, completion materializes every link in one atomic commit, registers
//! the graph and fires the completion handler exactly once.
//!
//! ```text
//! Idle ──discover──► WaitingForBind ──last bind──► Complete
//!   │                      │
//!   └───────error──────────┴──────────────────────► Failed
//! ```

use crate::error::GraphError;
use crate::graph::fwnode::{FwnodeRef, TopologySource};
use crate::graph::id::EntityId;
use crate::graph::media::{BatchPad, BatchRef, EntityKind, GraphBatch, MediaGraph, NewEntity};
use crate::graph::subdev::Subdevice;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Callback fired once the graph is fully wired and registered.
pub type CompletionHandler = Box<dyn FnOnce(&MediaGraph) + Send>;

/// Progress of the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Idle,
    WaitingForBind,
    Complete,
    Failed,
}

impl BuilderState {
    fn describe(self) -> &'static str {
        match self {
            BuilderState::Idle => "not discovered",
            BuilderState::WaitingForBind => "waiting for bind",
            BuilderState::Complete => "complete",
            BuilderState::Failed => "failed",
        }
    }
}

enum NodeBinding {
    Unbound,
    Bound(Arc<Subdevice>),
}

struct GraphNode {
    fwnode: FwnodeRef,
    binding: NodeBinding,
}

/// Resolves a topology description into a [`MediaGraph`].
pub struct GraphBuilder {
    topology: Arc<dyn TopologySource>,
    graph: Arc<MediaGraph>,
    nodes: Vec<GraphNode>,
    index: HashMap<FwnodeRef, usize>,
    dma_ports: HashMap<u32, EntityId>,
    state: BuilderState,
    on_complete: Option<CompletionHandler>,
}

impl GraphBuilder {
    pub fn new(topology: Arc<dyn TopologySource>, graph: Arc<MediaGraph>) -> Self {
        Self {
            topology,
            graph,
            nodes: Vec::new(),
            index: HashMap::new(),
            dma_ports: HashMap::new(),
            state: BuilderState::Idle,
            on_complete: None,
        }
    }

    /// Register the graph entity of the DMA channel serving `port`.
    pub fn add_dma_port(&mut self, port: u32, entity: EntityId) {
        self.dma_ports.insert(port, entity);
    }

    /// Set the handler fired when completion succeeds.
    pub fn on_complete(&mut self, handler: CompletionHandler) {
        self.on_complete = Some(handler);
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// Number of discovered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of discovered nodes still waiting for an implementation.
    pub fn pending(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.binding, NodeBinding::Unbound))
            .count()
    }

    /// Topology identities of every discovered node, in discovery order.
    pub fn discovered(&self) -> Vec<FwnodeRef> {
        self.nodes.iter().map(|n| n.fwnode.clone()).collect()
    }

    pub fn graph(&self) -> &Arc<MediaGraph> {
        &self.graph
    }

    /// Walk the topology from the device root and record every referenced
    /// node. Returns the number of nodes discovered.
    pub fn discover(&mut self) -> Result<usize, GraphError> {
        if self.state != BuilderState::Idle {
            return Err(GraphError::InvalidState(self.state.describe()));
        }

        let root = self.topology.root();
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(node) = queue.pop_front() {
            for endpoint in self.topology.endpoints(&node) {
                let endpoint = match endpoint {
                    Ok(ep) => ep,
                    Err(e) => {
                        tracing::error!(
                            "Failed to parse endpoint {} of {}: {}",
                            e.index,
                            node,
                            e.reason
                        );
                        self.release();
                        self.state = BuilderState::Failed;
                        return Err(GraphError::LinkParseFailed {
                            node,
                            index: e.index,
                            reason: e.reason,
                        });
                    }
                };

                if endpoint.remote == root || self.index.contains_key(&endpoint.remote) {
                    continue;
                }

                tracing::debug!("Discovered node {}", endpoint.remote);
                self.index
                    .insert(endpoint.remote.clone(), self.nodes.len());
                self.nodes.push(GraphNode {
                    fwnode: endpoint.remote.clone(),
                    binding: NodeBinding::Unbound,
                });
                queue.push_back(endpoint.remote);
            }
        }

        if self.nodes.is_empty() {
            tracing::error!("No processing node found under {}", root);
            self.state = BuilderState::Failed;
            return Err(GraphError::NoSubdevices);
        }

        self.state = BuilderState::WaitingForBind;
        Ok(self.nodes.len())
    }

    /// Attach an implementation to its discovered node. Binding the last
    /// pending node runs completion.
    pub fn bind(&mut self, subdev: Arc<Subdevice>) -> Result<(), GraphError> {
        if self.state != BuilderState::WaitingForBind {
            return Err(GraphError::InvalidState(self.state.describe()));
        }

        let node = self
            .index
            .get(subdev.fwnode())
            .map(|&i| &mut self.nodes[i])
            .ok_or_else(|| {
                tracing::error!("No entity for bound subdevice {}", subdev.name());
                GraphError::NoMatchingEntity {
                    node: subdev.fwnode().clone(),
                }
            })?;

        if let NodeBinding::Bound(existing) = &node.binding {
            tracing::error!("Duplicate subdevice for node {}", existing.fwnode());
            return Err(GraphError::DuplicateBinding {
                node: node.fwnode.clone(),
            });
        }

        tracing::info!("Subdevice {} bound", subdev.name());
        node.binding = NodeBinding::Bound(subdev);

        if self.pending() == 0 {
            self.complete()?;
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), GraphError> {
        tracing::debug!("All subdevices bound, building graph");

        let result = self
            .plan()
            .and_then(|batch| self.graph.commit(batch).map_err(GraphError::from));
        match result {
            Ok(ids) => {
                tracing::debug!("Created {} entities", ids.len());
                self.graph.register();
                self.state = BuilderState::Complete;
                if let Some(handler) = self.on_complete.take() {
                    handler(&self.graph);
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to build graph: {}", e);
                self.state = BuilderState::Failed;
                Err(e)
            }
        }
    }

    /// Collect every entity and link without touching the graph.
    fn plan(&self) -> Result<GraphBatch, GraphError> {
        let root = self.topology.root();
        let mut batch = GraphBatch::new();
        let mut bound = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let subdev = match &node.binding {
                NodeBinding::Bound(sd) => sd.clone(),
                NodeBinding::Unbound => {
                    return Err(GraphError::InvalidState("waiting for bind"))
                }
            };
            batch.add_entity(NewEntity {
                name: subdev.name().to_string(),
                kind: EntityKind::Subdevice(subdev.clone()),
                pads: subdev.pads().to_vec(),
            });
            bound.push(subdev);
        }

        for (i, local) in bound.iter().enumerate() {
            tracing::debug!("Creating links for {}", local.name());
            for endpoint in self.topology.endpoints(local.fwnode()) {
                let endpoint = match endpoint {
                    Ok(ep) => ep,
                    Err(e) => {
                        tracing::warn!(
                            "Skipping unparsable endpoint {} of {}: {}",
                            e.index,
                            local.name(),
                            e.reason
                        );
                        continue;
                    }
                };

                let local_pad = local
                    .pads()
                    .get(endpoint.local_port as usize)
                    .ok_or_else(|| GraphError::InvalidPort {
                        entity: local.name().to_string(),
                        port: endpoint.local_port,
                    })?;

                // Sink pads are wired from the other end.
                if local_pad.is_sink() || endpoint.remote == root {
                    continue;
                }

                let j = *self.index.get(&endpoint.remote).ok_or_else(|| {
                    GraphError::NoMatchingEntity {
                        node: endpoint.remote.clone(),
                    }
                })?;
                let remote = &bound[j];
                if endpoint.remote_port as usize >= remote.pads().len() {
                    return Err(GraphError::InvalidPort {
                        entity: remote.name().to_string(),
                        port: endpoint.remote_port,
                    });
                }

                tracing::debug!(
                    "Creating {}:{} -> {}:{} link",
                    local.name(),
                    endpoint.local_port,
                    remote.name(),
                    endpoint.remote_port
                );
                batch.add_link(
                    BatchPad {
                        entity: BatchRef::New(i),
                        pad: endpoint.local_port as u16,
                    },
                    BatchPad {
                        entity: BatchRef::New(j),
                        pad: endpoint.remote_port as u16,
                    },
                );
            }
        }

        self.plan_dma_links(&root, &bound, &mut batch)?;
        Ok(batch)
    }

    fn plan_dma_links(
        &self,
        root: &FwnodeRef,
        bound: &[Arc<Subdevice>],
        batch: &mut GraphBatch,
    ) -> Result<(), GraphError> {
        for endpoint in self.topology.endpoints(root) {
            let endpoint = match endpoint {
                Ok(ep) => ep,
                Err(e) => {
                    tracing::warn!("Skipping unparsable DMA endpoint {}: {}", e.index, e.reason);
                    continue;
                }
            };

            let port = endpoint.local_port;
            let dma_id = *self
                .dma_ports
                .get(&port)
                .ok_or(GraphError::NoDmaChannel { port })?;
            let dma = self
                .graph
                .entity(dma_id)
                .ok_or(GraphError::NoDmaChannel { port })?;

            let j = *self.index.get(&endpoint.remote).ok_or_else(|| {
                GraphError::NoMatchingEntity {
                    node: endpoint.remote.clone(),
                }
            })?;
            let remote = &bound[j];
            if endpoint.remote_port as usize >= remote.pads().len() {
                return Err(GraphError::InvalidPort {
                    entity: remote.name().to_string(),
                    port: endpoint.remote_port,
                });
            }

            let dma_pad = BatchPad {
                entity: BatchRef::Existing(dma_id),
                pad: 0,
            };
            let remote_pad = BatchPad {
                entity: BatchRef::New(j),
                pad: endpoint.remote_port as u16,
            };
            let dma_is_sink = dma.pads().first().map(|p| p.is_sink()).unwrap_or(true);
            if dma_is_sink {
                tracing::debug!(
                    "Creating {}:{} -> {}:0 link",
                    remote.name(),
                    endpoint.remote_port,
                    dma.name()
                );
                batch.add_link(remote_pad, dma_pad);
            } else {
                tracing::debug!(
                    "Creating {}:0 -> {}:{} link",
                    dma.name(),
                    remote.name(),
                    endpoint.remote_port
                );
                batch.add_link(dma_pad, remote_pad);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaDirection;
    use crate::error::SubdeviceError;
    use crate::graph::fwnode::{DmaPortDesc, Endpoint, EndpointParseError};
    use crate::graph::pad::PadDescriptor;
    use crate::graph::subdev::{MediaBusFormat, SubdeviceOps};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Inert;

    impl SubdeviceOps for Inert {
        fn start_stream(&self, _enable: bool) -> Result<(), SubdeviceError> {
            Ok(())
        }

        fn active_format(&self, _pad: u16) -> Result<MediaBusFormat, SubdeviceError> {
            Ok(MediaBusFormat::default())
        }
    }

    /// Topology held in a map: node id -> endpoints.
    #[derive(Default)]
    struct MapTopology {
        endpoints: HashMap<String, Vec<Result<Endpoint, EndpointParseError>>>,
    }

    impl MapTopology {
        fn link(mut self, from: &str, local: u32, to: &str, remote: u32) -> Self {
            self.endpoints
                .entry(from.to_string())
                .or_default()
                .push(Ok(Endpoint {
                    local_port: local,
                    remote: FwnodeRef::new(to),
                    remote_port: remote,
                }));
            self
        }

        fn broken(mut self, from: &str) -> Self {
            let list = self.endpoints.entry(from.to_string()).or_default();
            let index = list.len();
            list.push(Err(EndpointParseError {
                index,
                reason: "missing remote-endpoint".to_string(),
            }));
            self
        }
    }

    impl TopologySource for MapTopology {
        fn root(&self) -> FwnodeRef {
            FwnodeRef::new("root")
        }

        fn endpoints(&self, node: &FwnodeRef) -> Vec<Result<Endpoint, EndpointParseError>> {
            self.endpoints.get(node.as_str()).cloned().unwrap_or_default()
        }

        fn dma_ports(&self) -> Vec<DmaPortDesc> {
            vec![DmaPortDesc {
                index: 0,
                direction: DmaDirection::Capture,
            }]
        }
    }

    /// sensor.0 -> filter.0, filter.1 -> dma port 0
    fn scenario() -> MapTopology {
        MapTopology::default()
            .link("root", 0, "filter", 1)
            .link("sensor", 0, "filter", 0)
            .link("filter", 0, "sensor", 0)
            .link("filter", 1, "root", 0)
    }

    fn subdev(name: &str, pads: Vec<PadDescriptor>) -> Arc<Subdevice> {
        Arc::new(Subdevice::new(name, FwnodeRef::new(name), pads, Arc::new(Inert)))
    }

    fn sensor() -> Arc<Subdevice> {
        subdev("sensor", vec![PadDescriptor::source("out")])
    }

    fn filter() -> Arc<Subdevice> {
        subdev(
            "filter",
            vec![PadDescriptor::sink("in"), PadDescriptor::source("out")],
        )
    }

    fn builder(topology: MapTopology) -> GraphBuilder {
        let graph = Arc::new(MediaGraph::new("test"));
        let dma = graph
            .add_entity(NewEntity {
                name: "dma0".to_string(),
                kind: EntityKind::DmaPort {
                    port: 0,
                    direction: DmaDirection::Capture,
                },
                pads: vec![PadDescriptor::sink("dma")],
            })
            .unwrap();
        let mut builder = GraphBuilder::new(Arc::new(topology), graph);
        builder.add_dma_port(0, dma);
        builder
    }

    #[test]
    fn test_discover_skips_root_and_duplicates() {
        let mut builder = builder(scenario());
        assert_eq!(builder.discover().unwrap(), 2);
        assert_eq!(
            builder.discovered(),
            vec![FwnodeRef::new("filter"), FwnodeRef::new("sensor")]
        );
        assert!(!builder.discovered().contains(&FwnodeRef::new("root")));
        assert_eq!(builder.state(), BuilderState::WaitingForBind);
    }

    #[test]
    fn test_discover_parse_error_releases_nodes() {
        let topology = scenario().broken("sensor");
        let mut builder = builder(topology);
        let err = builder.discover().unwrap_err();
        assert!(matches!(err, GraphError::LinkParseFailed { index: 1, .. }));
        assert_eq!(builder.node_count(), 0);
        assert_eq!(builder.state(), BuilderState::Failed);
    }

    #[test]
    fn test_discover_empty_topology() {
        let mut builder = builder(MapTopology::default());
        assert_eq!(builder.discover(), Err(GraphError::NoSubdevices));
    }

    #[test]
    fn test_scenario_completes_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut builder = builder(scenario());
        let counter = fired.clone();
        builder.on_complete(Box::new(move |graph| {
            assert!(graph.is_registered());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        builder.discover().unwrap();
        builder.bind(sensor()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        builder.bind(filter()).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(builder.state(), BuilderState::Complete);
        // Entities: dma0, filter, sensor. Links: sensor->filter, filter->dma0.
        assert_eq!(builder.graph().entity_count(), 3);
        assert_eq!(builder.graph().link_count(), 2);

        // Completion does not run again.
        assert!(matches!(
            builder.bind(filter()),
            Err(GraphError::InvalidState(_))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_bind() {
        let mut builder = builder(scenario());
        builder.discover().unwrap();
        builder.bind(sensor()).unwrap();
        assert_eq!(
            builder.bind(sensor()),
            Err(GraphError::DuplicateBinding {
                node: FwnodeRef::new("sensor")
            })
        );
    }

    #[test]
    fn test_bind_unknown_node() {
        let mut builder = builder(scenario());
        builder.discover().unwrap();
        let stranger = subdev("lens", vec![]);
        assert_eq!(
            builder.bind(stranger),
            Err(GraphError::NoMatchingEntity {
                node: FwnodeRef::new("lens")
            })
        );
    }

    #[test]
    fn test_complete_skips_unparsable_endpoint() {
        let mut builder = builder(scenario());
        builder.discover().unwrap();
        // The endpoint turns unparsable after discovery has visited the node.
        builder.topology = Arc::new(scenario().broken("filter"));
        builder.bind(sensor()).unwrap();
        builder.bind(filter()).unwrap();
        assert_eq!(builder.state(), BuilderState::Complete);
        assert_eq!(builder.graph().link_count(), 2);
    }

    #[test]
    fn test_invalid_local_port_fails_completion() {
        let topology = scenario().link("sensor", 3, "filter", 0);
        let mut builder = builder(topology);
        builder.discover().unwrap();
        builder.bind(sensor()).unwrap();
        let err = builder.bind(filter()).unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidPort {
                entity: "sensor".to_string(),
                port: 3
            }
        );
        assert_eq!(builder.state(), BuilderState::Failed);
        // No partial wiring survives.
        assert_eq!(builder.graph().link_count(), 0);
        assert_eq!(builder.graph().entity_count(), 1);
        assert!(!builder.graph().is_registered());
    }

    #[test]
    fn test_invalid_remote_port_fails_completion() {
        let topology = MapTopology::default()
            .link("root", 0, "filter", 1)
            .link("sensor", 0, "filter", 5)
            .link("filter", 0, "sensor", 0)
            .link("filter", 1, "root", 0);
        let mut builder = builder(topology);
        builder.discover().unwrap();
        builder.bind(filter()).unwrap();
        let err = builder.bind(sensor()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidPort { port: 5, .. }));
    }

    #[test]
    fn test_missing_dma_channel() {
        let topology = scenario().link("root", 2, "filter", 1);
        let mut builder = builder(topology);
        builder.discover().unwrap();
        builder.bind(sensor()).unwrap();
        assert_eq!(
            builder.bind(filter()),
            Err(GraphError::NoDmaChannel { port: 2 })
        );
    }
}
