//! Transfer engine boundary.
//!
//! The engine performs the actual copies. A channel is requested by name,
//! descriptors are prepared for one buffer each, submitted with a completion
//! callback and started with `issue_pending`. Completions arrive on an engine
//! context, never on the submitting thread's stack while it holds queue locks.

use crate::error::EngineError;
use std::fmt;
use std::sync::Arc;

/// Direction of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    DevToMem,
    MemToDev,
}

/// Outcome reported by the engine for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferResult {
    /// Bytes left untransferred.
    pub residue: usize,
}

/// Invoked once when a submitted descriptor completes.
pub type CompletionCallback = Box<dyn FnOnce(TransferResult) + Send>;

/// A prepared transfer, ready to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub size: usize,
    pub direction: TransferDirection,
}

/// One engine channel.
pub trait EngineChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Build a descriptor. `None` if the engine cannot describe the transfer.
    fn prepare_transfer(
        &self,
        addr: u64,
        size: usize,
        direction: TransferDirection,
    ) -> Option<Descriptor>;

    /// Queue a descriptor. The callback runs when it completes, or never if
    /// the transfer is terminated first.
    fn submit(&self, desc: Descriptor, on_complete: CompletionCallback) -> Result<(), EngineError>;

    /// Start processing queued descriptors.
    fn issue_pending(&self);

    /// Abort every queued and running descriptor without completing them.
    fn terminate_all(&self);
}

/// Source of engine channels.
pub trait TransferEngine: Send + Sync {
    /// Request the channel called `name`. [`EngineError::Deferred`] means the
    /// engine is not ready yet.
    fn request_channel(&self, name: &str) -> Result<Arc<dyn EngineChannel>, EngineError>;

    /// Hand a channel back.
    fn release_channel(&self, _channel: &Arc<dyn EngineChannel>) {}
}

impl fmt::Debug for dyn EngineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineChannel({})", self.name())
    }
}
