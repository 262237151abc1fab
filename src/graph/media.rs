//! Media graph: entities, pads and links
//!
//! The graph is an arena of entities (bound processing stages and DMA ports)
//! and a table of directed links between their pads. Identifiers are plain
//! indices into these tables.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ src:1 ──► sink:0 ┌────────────┐ src:1 ──► sink:0 ┌───────────┐
//! │  sensor    │ ───────────────► │  filter    │ ───────────────► │ dma port0 │
//! └────────────┘                  └────────────┘                  └───────────┘
//! ```
//!
//! Topology mutation (new entities, new links, enabling/disabling links) is
//! refused while a [`TopologyReservation`] is alive or while any entity is
//! part of a started media pipeline. Pipelines take a reservation when they
//! validate and drop it when they return to empty.

use crate::dma::DmaDirection;
use crate::error::TopologyError;
use crate::graph::fwnode::FwnodeRef;
use crate::graph::id::{EntityId, LinkId, PadId};
use crate::graph::pad::{PadDescriptor, PadDirection};
use crate::graph::subdev::Subdevice;
use crate::pipeline::Pipeline;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// What an entity represents.
#[derive(Clone)]
pub enum EntityKind {
    /// A bound processing stage.
    Subdevice(Arc<Subdevice>),
    /// The graph side of a DMA channel.
    DmaPort { port: u32, direction: DmaDirection },
}

impl fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Subdevice(sd) => write!(f, "Subdevice({})", sd.name()),
            EntityKind::DmaPort { port, direction } => {
                write!(f, "DmaPort({}, {:?})", port, direction)
            }
        }
    }
}

/// A node of the media graph.
#[derive(Clone)]
pub struct Entity {
    id: EntityId,
    name: String,
    kind: EntityKind,
    pads: Vec<PadDescriptor>,
    pipeline: Option<Arc<Pipeline>>,
    stream_count: u32,
}

impl Entity {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn pads(&self) -> &[PadDescriptor] {
        &self.pads
    }

    pub fn subdevice(&self) -> Option<&Arc<Subdevice>> {
        match &self.kind {
            EntityKind::Subdevice(sd) => Some(sd),
            EntityKind::DmaPort { .. } => None,
        }
    }

    pub fn is_dma_port(&self) -> bool {
        matches!(self.kind, EntityKind::DmaPort { .. })
    }

    /// Number of started media pipelines this entity takes part in.
    pub fn stream_count(&self) -> u32 {
        self.stream_count
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pads", &self.pads.len())
            .field("stream_count", &self.stream_count)
            .finish()
    }
}

/// A directed pad-to-pad connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub id: LinkId,
    pub source: PadId,
    pub sink: PadId,
    pub enabled: bool,
}

/// Description of an entity to be added to the graph.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub kind: EntityKind,
    pub pads: Vec<PadDescriptor>,
}

/// Reference to an entity inside a [`GraphBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRef {
    /// An entity already in the graph.
    Existing(EntityId),
    /// The n-th entity of the batch.
    New(usize),
}

/// A pad inside a [`GraphBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPad {
    pub entity: BatchRef,
    pub pad: u16,
}

/// A set of entities and links applied atomically by [`MediaGraph::commit`].
#[derive(Debug, Clone, Default)]
pub struct GraphBatch {
    pub entities: Vec<NewEntity>,
    pub links: Vec<(BatchPad, BatchPad)>,
}

impl GraphBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, entity: NewEntity) -> BatchRef {
        self.entities.push(entity);
        BatchRef::New(self.entities.len() - 1)
    }

    pub fn add_link(&mut self, source: BatchPad, sink: BatchPad) {
        self.links.push((source, sink));
    }
}

/// Guard that keeps the topology frozen while alive.
pub struct TopologyReservation {
    counter: Arc<AtomicUsize>,
}

impl Drop for TopologyReservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for TopologyReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TopologyReservation(active={})",
            self.counter.load(Ordering::Acquire)
        )
    }
}

/// Serializable view of a pad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadSnapshot {
    pub index: u16,
    pub name: String,
    pub direction: PadDirection,
}

/// Serializable view of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub pads: Vec<PadSnapshot>,
    pub streaming: bool,
}

/// Serializable view of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub source: String,
    pub source_pad: u16,
    pub sink: String,
    pub sink_pad: u16,
    pub enabled: bool,
}

/// Serializable listing of the whole graph, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub model: String,
    pub registered: bool,
    pub entities: Vec<EntitySnapshot>,
    pub links: Vec<LinkSnapshot>,
}

#[derive(Default)]
struct GraphInner {
    entities: Vec<Entity>,
    links: Vec<Link>,
}

impl GraphInner {
    fn entity(&self, id: EntityId) -> Result<&Entity, TopologyError> {
        self.entities
            .get(id.index())
            .ok_or(TopologyError::UnknownEntity(id.0))
    }

    fn pad(&self, pad: PadId) -> Result<&PadDescriptor, TopologyError> {
        let entity = self.entity(pad.entity())?;
        entity
            .pads
            .get(pad.pad_index() as usize)
            .ok_or_else(|| TopologyError::InvalidPad {
                entity: entity.name.clone(),
                pad: pad.pad_index() as u32,
            })
    }

    fn check_link(&self, source: PadId, sink: PadId) -> Result<(), TopologyError> {
        for (pad, expected) in [(source, PadDirection::Source), (sink, PadDirection::Sink)] {
            let name = &self.entity(pad.entity())?.name;
            check_direction(self.pad(pad)?, name, pad, expected)?;
        }
        Ok(())
    }

    fn is_frozen(&self, reservations: usize) -> bool {
        reservations > 0 || self.entities.iter().any(|e| e.stream_count > 0)
    }

    fn remote_pad(&self, pad: PadId) -> Option<PadId> {
        self.links.iter().filter(|l| l.enabled).find_map(|l| {
            if l.source == pad {
                Some(l.sink)
            } else if l.sink == pad {
                Some(l.source)
            } else {
                None
            }
        })
    }

    /// Entities reachable from `start` through enabled links, ignoring link
    /// direction. `start` is always first.
    fn component(&self, start: EntityId) -> Vec<usize> {
        let n = self.entities.len();
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for link in self.links.iter().filter(|l| l.enabled) {
            let (a, b) = (link.source.entity().index(), link.sink.entity().index());
            if a < n && b < n {
                adj[a].push(b);
                adj[b].push(a);
            }
        }

        let mut visited = vec![false; n];
        let mut order = Vec::new();
        let mut stack = vec![start.index()];
        visited[start.index()] = true;

        while let Some(node) = stack.pop() {
            order.push(node);
            for &neighbor in &adj[node] {
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }
        order
    }
}

fn check_direction(
    desc: &PadDescriptor,
    entity: &str,
    pad: PadId,
    expected: PadDirection,
) -> Result<(), TopologyError> {
    if desc.direction != expected {
        return Err(TopologyError::InvalidPad {
            entity: entity.to_string(),
            pad: pad.pad_index() as u32,
        });
    }
    Ok(())
}

/// The media graph of one composite device.
pub struct MediaGraph {
    model: String,
    inner: RwLock<GraphInner>,
    registered: AtomicBool,
    reservations: Arc<AtomicUsize>,
}

impl MediaGraph {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            inner: RwLock::new(GraphInner::default()),
            registered: AtomicBool::new(false),
            reservations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn ensure_mutable(&self, inner: &GraphInner) -> Result<(), TopologyError> {
        if inner.is_frozen(self.reservations.load(Ordering::Acquire)) {
            return Err(TopologyError::Busy);
        }
        Ok(())
    }

    /// Add a single entity.
    pub fn add_entity(&self, entity: NewEntity) -> Result<EntityId, TopologyError> {
        let mut inner = self.inner.write();
        self.ensure_mutable(&inner)?;
        if entity.pads.len() > PadId::MAX_PAD as usize + 1 {
            return Err(TopologyError::InvalidPad {
                entity: entity.name,
                pad: PadId::MAX_PAD as u32 + 1,
            });
        }
        let id = EntityId(inner.entities.len() as u32);
        tracing::debug!("Adding entity {} as {}", entity.name, id);
        inner.entities.push(Entity {
            id,
            name: entity.name,
            kind: entity.kind,
            pads: entity.pads,
            pipeline: None,
            stream_count: 0,
        });
        Ok(id)
    }

    /// Create an enabled link from a source pad to a sink pad.
    pub fn create_link(&self, source: PadId, sink: PadId) -> Result<LinkId, TopologyError> {
        let mut inner = self.inner.write();
        self.ensure_mutable(&inner)?;
        inner.check_link(source, sink)?;
        let id = LinkId(inner.links.len() as u32);
        inner.links.push(Link {
            id,
            source,
            sink,
            enabled: true,
        });
        Ok(id)
    }

    pub fn set_link_enabled(&self, link: LinkId, enabled: bool) -> Result<(), TopologyError> {
        let mut inner = self.inner.write();
        self.ensure_mutable(&inner)?;
        let link = inner
            .links
            .get_mut(link.index())
            .ok_or(TopologyError::UnknownLink(link.0))?;
        link.enabled = enabled;
        Ok(())
    }

    /// Apply a batch of entities and links. Everything is validated before the
    /// graph is touched, so a failed commit leaves no partial wiring.
    pub fn commit(&self, batch: GraphBatch) -> Result<Vec<EntityId>, TopologyError> {
        let mut inner = self.inner.write();
        self.ensure_mutable(&inner)?;

        let base = inner.entities.len();
        let resolve = |r: BatchRef| -> Result<EntityId, TopologyError> {
            match r {
                BatchRef::Existing(id) if id.index() < base => Ok(id),
                BatchRef::Existing(id) => Err(TopologyError::UnknownEntity(id.0)),
                BatchRef::New(i) if i < batch.entities.len() => Ok(EntityId((base + i) as u32)),
                BatchRef::New(i) => Err(TopologyError::UnknownEntity((base + i) as u32)),
            }
        };
        let pad_desc = |r: BatchRef, pad: u16| -> Option<(&str, &PadDescriptor)> {
            match r {
                BatchRef::Existing(id) => inner
                    .entities
                    .get(id.index())
                    .and_then(|e| e.pads.get(pad as usize).map(|p| (e.name.as_str(), p))),
                BatchRef::New(i) => batch
                    .entities
                    .get(i)
                    .and_then(|e| e.pads.get(pad as usize).map(|p| (e.name.as_str(), p))),
            }
        };

        let mut links = Vec::with_capacity(batch.links.len());
        for (source, sink) in &batch.links {
            let source_id = PadId::new(resolve(source.entity)?, source.pad);
            let sink_id = PadId::new(resolve(sink.entity)?, sink.pad);
            for (end, id, expected) in [
                (source, source_id, PadDirection::Source),
                (sink, sink_id, PadDirection::Sink),
            ] {
                let (name, desc) =
                    pad_desc(end.entity, end.pad).ok_or(TopologyError::InvalidPad {
                        entity: format!("{:?}", end.entity),
                        pad: end.pad as u32,
                    })?;
                check_direction(desc, name, id, expected)?;
            }
            links.push((source_id, sink_id));
        }

        let mut ids = Vec::with_capacity(batch.entities.len());
        for entity in batch.entities {
            let id = EntityId(inner.entities.len() as u32);
            inner.entities.push(Entity {
                id,
                name: entity.name,
                kind: entity.kind,
                pads: entity.pads,
                pipeline: None,
                stream_count: 0,
            });
            ids.push(id);
        }
        for (source, sink) in links {
            let id = LinkId(inner.links.len() as u32);
            inner.links.push(Link {
                id,
                source,
                sink,
                enabled: true,
            });
        }
        tracing::debug!(
            "Committed {} entities, graph now has {} links",
            ids.len(),
            inner.links.len()
        );
        Ok(ids)
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        self.inner.read().entities.get(id.index()).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn links(&self) -> Vec<Link> {
        self.inner.read().links.clone()
    }

    pub fn link_count(&self) -> usize {
        self.inner.read().links.len()
    }

    /// Entity holding the bound implementation of `node`.
    pub fn find_by_fwnode(&self, node: &FwnodeRef) -> Option<EntityId> {
        self.inner.read().entities.iter().find_map(|e| match &e.kind {
            EntityKind::Subdevice(sd) if sd.fwnode() == node => Some(e.id),
            _ => None,
        })
    }

    /// Entity of the DMA channel on `port`.
    pub fn find_dma_port(&self, port: u32) -> Option<EntityId> {
        self.inner.read().entities.iter().find_map(|e| match e.kind {
            EntityKind::DmaPort { port: p, .. } if p == port => Some(e.id),
            _ => None,
        })
    }

    /// Pad at the other end of the first enabled link touching `pad`.
    pub fn remote_pad(&self, pad: PadId) -> Option<PadId> {
        self.inner.read().remote_pad(pad)
    }

    /// Entities connected to `start` through enabled links, `start` first.
    pub fn walk_component(&self, start: EntityId) -> Result<Vec<Entity>, TopologyError> {
        let inner = self.inner.read();
        inner.entity(start)?;
        Ok(inner
            .component(start)
            .into_iter()
            .map(|i| inner.entities[i].clone())
            .collect())
    }

    /// Processing stages feeding `from`, nearest first.
    ///
    /// Starting at `from`, follows pad 0 upstream for as long as it is a sink
    /// connected to a bound processing stage.
    pub fn upstream_chain(&self, from: EntityId) -> Vec<Arc<Subdevice>> {
        let inner = self.inner.read();
        let mut chain = Vec::new();
        let mut current = match inner.entities.get(from.index()) {
            Some(e) => e,
            None => return chain,
        };

        // A malformed graph could loop back on itself.
        for _ in 0..inner.entities.len() {
            match current.pads.first() {
                Some(pad) if pad.is_sink() => {}
                _ => break,
            }
            let remote = match inner.remote_pad(PadId::new(current.id, 0)) {
                Some(r) => r,
                None => break,
            };
            let next = match inner.entities.get(remote.entity().index()) {
                Some(e) => e,
                None => break,
            };
            match &next.kind {
                EntityKind::Subdevice(sd) => chain.push(sd.clone()),
                EntityKind::DmaPort { .. } => break,
            }
            current = next;
        }
        chain
    }

    pub fn pipeline_of(&self, entity: EntityId) -> Option<Arc<Pipeline>> {
        self.inner
            .read()
            .entities
            .get(entity.index())
            .and_then(|e| e.pipeline.clone())
    }

    /// Mark every entity of the component of `entity` as streaming in a shared
    /// pipeline.
    ///
    /// The pipeline already attached to `entity` is reused; otherwise
    /// `candidate` becomes the pipeline of the component.
    pub fn start_pipeline(
        &self,
        entity: EntityId,
        candidate: &Arc<Pipeline>,
    ) -> Result<Arc<Pipeline>, TopologyError> {
        let mut inner = self.inner.write();
        let pipe = inner
            .entity(entity)?
            .pipeline
            .clone()
            .unwrap_or_else(|| candidate.clone());

        let members = inner.component(entity);
        for &i in &members {
            if let Some(existing) = &inner.entities[i].pipeline {
                if !Arc::ptr_eq(existing, &pipe) {
                    return Err(TopologyError::PipelineConflict(
                        inner.entities[i].name.clone(),
                    ));
                }
            }
        }
        for &i in &members {
            let e = &mut inner.entities[i];
            e.pipeline = Some(pipe.clone());
            e.stream_count += 1;
        }
        tracing::debug!(
            "Media pipeline started from {} across {} entities",
            entity,
            members.len()
        );
        Ok(pipe)
    }

    /// Undo one [`start_pipeline`](Self::start_pipeline) from `entity`.
    pub fn stop_pipeline(&self, entity: EntityId) {
        let mut inner = self.inner.write();
        if inner.entity(entity).is_err() {
            return;
        }
        for i in inner.component(entity) {
            let e = &mut inner.entities[i];
            e.stream_count = e.stream_count.saturating_sub(1);
            if e.stream_count == 0 {
                e.pipeline = None;
            }
        }
        tracing::debug!("Media pipeline stopped from {}", entity);
    }

    /// Freeze the topology until the returned guard is dropped.
    pub fn reserve(&self) -> TopologyReservation {
        // Serializes with in-progress mutations.
        let _inner = self.inner.write();
        self.reservations.fetch_add(1, Ordering::AcqRel);
        TopologyReservation {
            counter: self.reservations.clone(),
        }
    }

    /// Whether topology mutation is currently refused.
    pub fn is_frozen(&self) -> bool {
        self.inner
            .read()
            .is_frozen(self.reservations.load(Ordering::Acquire))
    }

    /// Publish the graph once it is fully wired.
    pub fn register(&self) {
        self.registered.store(true, Ordering::Release);
        let inner = self.inner.read();
        tracing::info!(
            "Media graph {} registered: {} entities, {} links",
            self.model,
            inner.entities.len(),
            inner.links.len()
        );
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Drop every entity and link.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entities.clear();
        inner.links.clear();
        self.registered.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        let name_of = |id: EntityId| {
            inner
                .entities
                .get(id.index())
                .map(|e| e.name.clone())
                .unwrap_or_default()
        };

        let entities = inner
            .entities
            .iter()
            .map(|e| EntitySnapshot {
                id: e.id.0,
                name: e.name.clone(),
                kind: match e.kind {
                    EntityKind::Subdevice(_) => "subdev".to_string(),
                    EntityKind::DmaPort { .. } => "dma".to_string(),
                },
                pads: e
                    .pads
                    .iter()
                    .enumerate()
                    .map(|(i, p)| PadSnapshot {
                        index: i as u16,
                        name: p.name.to_string(),
                        direction: p.direction,
                    })
                    .collect(),
                streaming: e.stream_count > 0,
            })
            .collect();

        let links = inner
            .links
            .iter()
            .map(|l| LinkSnapshot {
                source: name_of(l.source.entity()),
                source_pad: l.source.pad_index(),
                sink: name_of(l.sink.entity()),
                sink_pad: l.sink.pad_index(),
                enabled: l.enabled,
            })
            .collect();

        GraphSnapshot {
            model: self.model.clone(),
            registered: self.is_registered(),
            entities,
            links,
        }
    }
}

impl fmt::Debug for MediaGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MediaGraph")
            .field("model", &self.model)
            .field("entities", &inner.entities.len())
            .field("links", &inner.links.len())
            .finish()
    }
}
