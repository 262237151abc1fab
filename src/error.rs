//! Error handling for evpipe
//!
//! Each concern has its own error enum so callers can match on the failure
//! they care about:
//!
//! - [`GraphError`] - fatal while the graph is being discovered and wired
//! - [`TopologyError`] - pipeline validation and topology mutation refusals
//! - [`ChannelError`] - returned to the caller starting a DMA channel
//! - [`EngineError`] - transfer engine refusals; `Deferred` is retryable
//! - [`RegisterError`] - diagnostic register access
//! - [`SubdeviceError`] - reported by neighboring pipeline nodes
//!
//! [`EvPipeError`] wraps all of them for the device-level API.

use crate::graph::FwnodeRef;
use thiserror::Error;

/// Errors raised while discovering, binding or wiring the processing graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An endpoint of a topology node could not be parsed.
    #[error("failed to parse link for endpoint {index} of {node}: {reason}")]
    LinkParseFailed {
        node: FwnodeRef,
        index: usize,
        reason: String,
    },

    /// A node implementation attached twice for the same topology node.
    #[error("duplicate implementation for node {node}")]
    DuplicateBinding { node: FwnodeRef },

    /// A port number does not exist on the entity it refers to.
    #[error("invalid port number {port} on {entity}")]
    InvalidPort { entity: String, port: u32 },

    /// No graph node exists for the referenced topology identity.
    #[error("no entity found for {node}")]
    NoMatchingEntity { node: FwnodeRef },

    /// No DMA channel is configured for a port referenced by the topology.
    #[error("no DMA channel found for port {port}")]
    NoDmaChannel { port: u32 },

    /// Discovery found no processing nodes at all.
    #[error("no processing node found in graph")]
    NoSubdevices,

    /// Bind or complete was called in the wrong builder state.
    #[error("graph builder is {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Errors raised by pipeline validation and topology mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The connected component does not have exactly one output and at most
    /// one input DMA endpoint.
    #[error("invalid pipeline shape: {outputs} output(s), {inputs} input(s)")]
    InvalidShape { inputs: u32, outputs: u32 },

    /// The topology is reserved by a validated or streaming pipeline.
    #[error("topology is reserved by an active pipeline")]
    Busy,

    /// An entity id does not exist in the graph.
    #[error("unknown entity {0}")]
    UnknownEntity(u32),

    /// A link id does not exist in the graph.
    #[error("unknown link {0}")]
    UnknownLink(u32),

    /// The entity is already part of a different started pipeline.
    #[error("{0} is part of another pipeline")]
    PipelineConflict(String),

    /// A pad index or direction is invalid for the requested operation.
    #[error("invalid pad {pad} on {entity}")]
    InvalidPad { entity: String, pad: u32 },
}

/// Errors returned to the caller of DMA channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is not backed by a live link to a neighboring node.
    #[error("{channel}: no connected peer")]
    NoPeer { channel: String },

    /// The transfer engine could not provide a channel.
    #[error("transfer engine unavailable: {0}")]
    EngineUnavailable(#[from] EngineError),

    /// A host buffer is smaller than the configured transfer size.
    #[error("buffer of {size} bytes is smaller than the transfer size {required}")]
    BufferTooSmall { size: usize, required: usize },

    /// The operation is not allowed while the queue is streaming.
    #[error("{channel}: busy streaming")]
    Busy { channel: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A neighboring node failed to start.
    #[error("pipeline start failed: {0}")]
    Subdevice(#[from] SubdeviceError),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Errors reported by the transfer engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused a descriptor.
    #[error("submit failed: {0}")]
    SubmitFailed(String),

    /// The resource is not available yet; the caller may retry later.
    #[error("engine channel {0} not available yet")]
    Deferred(String),
}

impl EngineError {
    /// Whether the failure is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Deferred(_))
    }
}

/// Errors from the diagnostic register interface.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("register offset 0x{offset:x} is not 32-bit aligned")]
    Misaligned { offset: u32 },

    #[error("register offset 0x{offset:x} is outside the 0x{size:x} byte bank")]
    OutOfRange { offset: u32, size: u32 },
}

/// Errors reported by a neighboring pipeline node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubdeviceError {
    /// The node does not implement the requested operation.
    #[error("operation not supported by {0}")]
    NotSupported(String),

    /// The pad index is out of range.
    #[error("invalid pad {0}")]
    InvalidPad(u16),

    /// Hardware reported a failure.
    #[error("{node}: {message}")]
    Hardware { node: String, message: String },
}

/// Main error type for device-level operations
#[derive(Error, Debug)]
pub enum EvPipeError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Register error: {0}")]
    Register(#[from] RegisterError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EvPipeError>,
    },
}

impl EvPipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EvPipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EvPipeError::Engine(e) => e.is_retryable(),
            EvPipeError::Channel(ChannelError::EngineUnavailable(e)) => e.is_retryable(),
            EvPipeError::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for evpipe operations
pub type Result<T> = std::result::Result<T, EvPipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<EvPipeError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
