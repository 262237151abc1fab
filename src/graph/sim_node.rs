//! Simulated processing stage for running without hardware.
//!
//! # Example
//!
//! ```ignore
//! let node = Arc::new(SimulatedNode::new()
//!     .with_format(MediaBusFormat { code: BusCode::Evt21, width: 640, height: 480 }));
//! let subdev = node.subdevice("filter", pads);
//! ```

use crate::error::SubdeviceError;
use crate::graph::fwnode::FwnodeRef;
use crate::graph::pad::PadDescriptor;
use crate::graph::subdev::{MediaBusFormat, Subdevice, SubdeviceOps};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A processing stage that records start/stop calls.
#[derive(Debug)]
pub struct SimulatedNode {
    format: MediaBusFormat,
    streaming: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
    fail_start: AtomicBool,
    supports_stream: bool,
}

impl SimulatedNode {
    pub fn new() -> Self {
        Self {
            format: MediaBusFormat::default(),
            streaming: AtomicBool::new(false),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            fail_start: AtomicBool::new(false),
            supports_stream: true,
        }
    }

    /// Set the format reported on every pad.
    pub fn with_format(mut self, format: MediaBusFormat) -> Self {
        self.format = format;
        self
    }

    /// Report `NotSupported` for start/stop, like a passive stage.
    pub fn passive(mut self) -> Self {
        self.supports_stream = false;
        self
    }

    /// Make the next start calls fail until cleared.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Number of successful start calls.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of stop calls.
    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Wrap a shared node into a bindable subdevice named after its topology
    /// node.
    pub fn subdevice(self: &Arc<Self>, name: &str, pads: Vec<PadDescriptor>) -> Arc<Subdevice> {
        Arc::new(Subdevice::new(
            name,
            FwnodeRef::new(name),
            pads,
            self.clone() as Arc<dyn SubdeviceOps>,
        ))
    }
}

impl Default for SimulatedNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SubdeviceOps for SimulatedNode {
    fn start_stream(&self, enable: bool) -> Result<(), SubdeviceError> {
        if !self.supports_stream {
            return Err(SubdeviceError::NotSupported("simulated node".to_string()));
        }
        if enable {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SubdeviceError::Hardware {
                    node: "simulated node".to_string(),
                    message: "start failure injected".to_string(),
                });
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.streaming.store(enable, Ordering::SeqCst);
        Ok(())
    }

    fn active_format(&self, _pad: u16) -> Result<MediaBusFormat, SubdeviceError> {
        Ok(self.format)
    }
}
