//! DMA endpoints and buffer management
//!
//! A DMA channel moves captured data between the device and host buffers.
//! Each channel owns a [`BufferQueue`] of in-flight buffers and a handle on
//! the transfer engine that performs the copies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌──────────────┐  submit   ┌────────────────┐
//! │    caller    │ ─────────► │ BufferQueue  │ ────────► │ EngineChannel  │
//! │ (control)    │ ◄───────── │ (in-flight)  │ ◄──────── │ (completion)   │
//! └──────────────┘  dequeue   └──────────────┘ callback  └────────────────┘
//! ```
//!
//! Submission happens in the caller's context. Completion arrives in the
//! engine's context and only touches the in-flight list under a short lock.

pub mod buffer;
pub mod channel;
pub mod engine;
#[cfg(feature = "mock-hardware")]
pub mod mock_engine;
pub mod queue;
pub mod registers;

pub use buffer::{Buffer, BufferHandle, BufferState, InFlightKey, InFlightList};
pub use channel::{DmaChannel, PixFormat};
pub use engine::{
    CompletionCallback, Descriptor, EngineChannel, TransferDirection, TransferEngine,
    TransferResult,
};
#[cfg(feature = "mock-hardware")]
pub use mock_engine::{MockChannel, MockTransferEngine};
pub use queue::{BufferQueue, QueueStats};
pub use registers::{MemoryRegisterMap, MemoryRegisters, RegisterBank, RegisterIo, RegisterMap};

use crate::graph::PadDirection;
use serde::{Deserialize, Serialize};

/// Default number of bytes moved per buffer.
pub const DEFAULT_TRANSFER_SIZE: usize = 1 << 20;

/// Width of one bus word. Transfer sizes are multiples of this.
pub const BUS_WORD_BYTES: usize = 8;

/// Direction of a DMA port as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmaDirection {
    /// Device to host memory.
    Capture,
    /// Host memory to device.
    Output,
}

impl DmaDirection {
    /// Direction used when the topology does not declare one: port 0 captures,
    /// every other port outputs.
    pub fn default_for_port(index: u32) -> Self {
        if index == 0 {
            DmaDirection::Capture
        } else {
            DmaDirection::Output
        }
    }

    /// Type of the pad the channel exposes in the graph. A capture channel
    /// receives data, so its pad is a sink.
    pub fn pad_direction(self) -> PadDirection {
        match self {
            DmaDirection::Capture => PadDirection::Sink,
            DmaDirection::Output => PadDirection::Source,
        }
    }

    pub fn transfer_direction(self) -> TransferDirection {
        match self {
            DmaDirection::Capture => TransferDirection::DevToMem,
            DmaDirection::Output => TransferDirection::MemToDev,
        }
    }
}
