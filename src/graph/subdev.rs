//! Processing-stage implementations attached to graph nodes.
//!
//! A [`Subdevice`] carries the identity of a node implementation (name,
//! topology reference, pads) plus its operations. The operations are the
//! neighbor contract used by pipelines and DMA channels:
//!
//! - `start_stream(enable)` toggles streaming on the stage
//! - `active_format(pad)` reports the negotiated bus format on a pad

use crate::error::SubdeviceError;
use crate::graph::fwnode::FwnodeRef;
use crate::graph::pad::PadDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Media bus codes produced by event-camera sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusCode {
    Evt2,
    Evt21,
    /// EVT 2.1 with middle-endian word order.
    Evt21Me,
    Evt3,
    Unknown(u32),
}

/// Memory layouts a DMA channel can report for captured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Evt2,
    Evt21,
    Evt21Me,
    Evt3,
}

impl BusCode {
    /// Memory format matching this bus code. The DMA writes bus words to
    /// memory unchanged, so the mapping is one to one.
    pub fn to_pixel_format(self) -> Option<PixelFormat> {
        match self {
            BusCode::Evt2 => Some(PixelFormat::Evt2),
            BusCode::Evt21 => Some(PixelFormat::Evt21),
            BusCode::Evt21Me => Some(PixelFormat::Evt21Me),
            BusCode::Evt3 => Some(PixelFormat::Evt3),
            BusCode::Unknown(_) => None,
        }
    }
}

/// Format of the data flowing over a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBusFormat {
    pub code: BusCode,
    pub width: u32,
    pub height: u32,
}

impl Default for MediaBusFormat {
    fn default() -> Self {
        Self {
            code: BusCode::Evt3,
            width: 1280,
            height: 720,
        }
    }
}

/// Operations a processing stage exposes to the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait SubdeviceOps: Send + Sync {
    /// Enable or disable streaming on the stage.
    fn start_stream(&self, enable: bool) -> Result<(), SubdeviceError>;

    /// Active format on `pad`.
    fn active_format(&self, pad: u16) -> Result<MediaBusFormat, SubdeviceError>;
}

/// A node implementation ready to be bound to the graph.
#[derive(Clone)]
pub struct Subdevice {
    name: String,
    fwnode: FwnodeRef,
    pads: Vec<PadDescriptor>,
    ops: Arc<dyn SubdeviceOps>,
}

impl Subdevice {
    pub fn new(
        name: impl Into<String>,
        fwnode: FwnodeRef,
        pads: Vec<PadDescriptor>,
        ops: Arc<dyn SubdeviceOps>,
    ) -> Self {
        Self {
            name: name.into(),
            fwnode,
            pads,
            ops,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fwnode(&self) -> &FwnodeRef {
        &self.fwnode
    }

    pub fn pads(&self) -> &[PadDescriptor] {
        &self.pads
    }

    pub fn start_stream(&self, enable: bool) -> Result<(), SubdeviceError> {
        self.ops.start_stream(enable)
    }

    pub fn active_format(&self, pad: u16) -> Result<MediaBusFormat, SubdeviceError> {
        if pad as usize >= self.pads.len() {
            return Err(SubdeviceError::InvalidPad(pad));
        }
        self.ops.active_format(pad)
    }
}

impl fmt::Debug for Subdevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subdevice")
            .field("name", &self.name)
            .field("fwnode", &self.fwnode)
            .field("pads", &self.pads.len())
            .finish()
    }
}
