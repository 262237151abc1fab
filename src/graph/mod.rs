//! Processing graph of a composite capture device.
//!
//! Processing stages ("subdevices") and DMA ports are entities of a
//! [`MediaGraph`], connected pad to pad by links. The [`GraphBuilder`] resolves
//! the topology description into that graph.
//!
//! # Architecture
//!
//! ```text
//! TopologySource ──discover──► GraphBuilder ◄──bind── Subdevice implementations
//!                                   │
//!                               complete
//!                                   ▼
//!                              MediaGraph ◄── DMA channels / Pipelines
//! ```
//!
//! # Design
//!
//! - **Arena storage**: entities and links live in vectors indexed by
//!   [`EntityId`] and [`LinkId`].
//! - **Owning maps**: the builder keeps a `FwnodeRef -> node` map instead of
//!   recovering owners from embedded structures.
//! - **Atomic wiring**: links are validated before any is committed.

pub mod builder;
pub mod fwnode;
pub mod id;
pub mod media;
pub mod pad;
#[cfg(feature = "mock-hardware")]
pub mod sim_node;
pub mod subdev;

pub use builder::{BuilderState, CompletionHandler, GraphBuilder};
pub use fwnode::{DmaPortDesc, Endpoint, EndpointParseError, FwnodeRef, TopologySource};
pub use id::{EntityId, LinkId, PadId};
pub use media::{
    BatchPad, BatchRef, Entity, EntityKind, GraphBatch, GraphSnapshot, Link, MediaGraph,
    NewEntity, TopologyReservation,
};
pub use pad::{PadDescriptor, PadDirection};
#[cfg(feature = "mock-hardware")]
pub use sim_node::SimulatedNode;
pub use subdev::{BusCode, MediaBusFormat, PixelFormat, Subdevice, SubdeviceOps};
