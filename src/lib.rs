//! # evpipe: capture pipeline for event-based camera devices
//!
//! A composite capture device is a set of DMA channels connected to a chain of
//! processing nodes (sensor, filters, ...) that together form a media graph.
//! This crate resolves that graph from a topology description, validates and
//! streams pipelines through it, and manages the buffers moving over each DMA
//! channel.
//!
//! ## Architecture
//!
//! - **Graph**: discovery of processing nodes, binding of their
//!   implementations and atomic wiring of the media graph
//! - **Pipeline**: shape validation and reference-counted start/stop of the
//!   node chain shared by all DMA endpoints of a component
//! - **DMA**: per-channel buffer queues submitted to a transfer engine, with
//!   completions handed back over crossbeam channels
//! - **Device**: probe and teardown of one composite device
//!
//! ## Configuration
//!
//! The device configuration is stored in the platform-appropriate config
//! directory under `dev.evpipe`:
//!
//! - **Linux**: `~/.config/dev.evpipe/device.toml`
//! - **macOS**: `~/Library/Application Support/dev.evpipe/device.toml`
//! - **Windows**: `%APPDATA%\dev.evpipe\device.toml`
//!
//! ## Example
//!
//! ```ignore
//! use evpipe::{
//!     config::DeviceConfig,
//!     dma::{MemoryRegisterMap, MockTransferEngine},
//!     CompositeDevice,
//! };
//! use std::sync::Arc;
//!
//! let config = DeviceConfig::default();
//! let device = CompositeDevice::probe(
//!     &config,
//!     Arc::new(config.topology.clone()),
//!     Arc::new(MockTransferEngine::default()),
//!     Arc::new(MemoryRegisterMap::new(config.register_bank_size)),
//! )?;
//! // bind node implementations, then stream on device.channel(0)
//! ```

pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod graph;
pub mod pipeline;

// Re-export commonly used types
pub use config::{DeviceConfig, TopologyConfig};
pub use device::CompositeDevice;
pub use dma::{Buffer, BufferHandle, BufferState, DmaChannel, DmaDirection};
pub use error::{EvPipeError, Result, ResultExt};
pub use graph::{GraphBuilder, MediaGraph, Subdevice, SubdeviceOps};
pub use pipeline::{Pipeline, PipelineState};
