//! Shared streaming state of a connected subgraph.
//!
//! Every DMA channel in a connected component of the media graph shares one
//! [`Pipeline`]. The pipeline counts its users, validates the component shape
//! on first use and turns the processing stages on and off exactly once.
//!
//! # Lifecycle
//!
//! ```text
//! Empty ──prepare──► Validating ──ok──► Prepared(n) ──set_stream(on)──► Streaming(n, k)
//!   ▲                    │                   │                               │
//!   └────InvalidShape────┘                   └──────last cleanup─────────────┘
//! ```
//!
//! - `prepare` on an empty pipeline walks the component, requires exactly one
//!   output endpoint and at most one input endpoint, and reserves the topology.
//! - `set_stream(true)` starts the chain of stages feeding the output endpoint
//!   on the call that brings the stream count to `n`.
//! - `set_stream(false)` stops the chain on the call that brings it back to 0.
//!
//! The pipeline lock is held across neighbor start/stop calls, so two
//! channels racing to start never both see the full count.

use crate::error::{SubdeviceError, TopologyError};
use crate::graph::{EntityId, MediaGraph, TopologyReservation};
use parking_lot::Mutex;
use std::fmt;

/// Observable state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No user holds the pipeline.
    Empty,
    /// The first user is walking the component. Only seen in transition logs
    /// since the walk runs under the pipeline lock.
    Validating,
    /// Validated with `endpoints` DMA endpoints, nothing streaming.
    Prepared { endpoints: u32 },
    /// `streaming` of `endpoints` endpoints have turned streaming on.
    Streaming { endpoints: u32, streaming: u32 },
}

#[derive(Default)]
struct PipelineInner {
    use_count: u32,
    stream_count: u32,
    num_endpoints: u32,
    output: Option<EntityId>,
    reservation: Option<TopologyReservation>,
}

impl PipelineInner {
    fn state(&self) -> PipelineState {
        if self.use_count == 0 {
            PipelineState::Empty
        } else if self.stream_count == 0 {
            PipelineState::Prepared {
                endpoints: self.num_endpoints,
            }
        } else {
            PipelineState::Streaming {
                endpoints: self.num_endpoints,
                streaming: self.stream_count,
            }
        }
    }

    fn reset(&mut self) {
        self.num_endpoints = 0;
        self.output = None;
        self.reservation = None;
    }

    fn validate(&mut self, graph: &MediaGraph, from: EntityId) -> Result<(), TopologyError> {
        let mut inputs = 0u32;
        let mut outputs = 0u32;
        let mut output = None;

        for entity in graph.walk_component(from)? {
            if !entity.is_dma_port() {
                continue;
            }
            match entity.pads().first() {
                Some(pad) if pad.is_sink() => {
                    outputs += 1;
                    output = Some(entity.id());
                }
                Some(_) => inputs += 1,
                None => {}
            }
        }

        if outputs != 1 || inputs > 1 {
            return Err(TopologyError::InvalidShape { inputs, outputs });
        }

        self.num_endpoints = inputs + outputs;
        self.output = output;
        Ok(())
    }
}

/// Streaming state shared by every DMA channel of a connected component.
pub struct Pipeline {
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PipelineInner::default()),
        }
    }

    /// Take a reference on the pipeline, validating it on first use.
    pub fn prepare(&self, graph: &MediaGraph, from: EntityId) -> Result<(), TopologyError> {
        let mut inner = self.inner.lock();

        if inner.use_count == 0 {
            tracing::debug!(
                "Pipeline {:?} -> {:?} from {}",
                PipelineState::Empty,
                PipelineState::Validating,
                from
            );
            inner.reservation = Some(graph.reserve());
            if let Err(e) = inner.validate(graph, from) {
                inner.reset();
                tracing::debug!("Pipeline validation failed: {}", e);
                return Err(e);
            }
        }

        inner.use_count += 1;
        tracing::debug!("Pipeline now {:?}", inner.state());
        Ok(())
    }

    /// Drop a reference taken by [`prepare`](Self::prepare).
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        if inner.use_count == 0 {
            tracing::warn!("Pipeline cleanup without matching prepare");
            return;
        }
        inner.use_count -= 1;
        if inner.use_count == 0 {
            inner.reset();
        }
        tracing::debug!("Pipeline now {:?}", inner.state());
    }

    /// Turn streaming on or off for one endpoint.
    ///
    /// Turning on fails only when starting the chain fails, in which case the
    /// stream count is left unchanged. Turning off never fails.
    pub fn set_stream(&self, graph: &MediaGraph, on: bool) -> Result<(), SubdeviceError> {
        let mut inner = self.inner.lock();

        if on {
            if inner.num_endpoints.checked_sub(1) == Some(inner.stream_count) {
                if let Some(output) = inner.output {
                    start_stop_chain(graph, output, true)?;
                }
            }
            inner.stream_count += 1;
        } else {
            if inner.stream_count == 0 {
                tracing::warn!("Pipeline stream off while not streaming");
                return Ok(());
            }
            inner.stream_count -= 1;
            if inner.stream_count == 0 {
                if let Some(output) = inner.output {
                    // Stop never fails.
                    let _ = start_stop_chain(graph, output, false);
                }
            }
        }

        tracing::debug!("Pipeline now {:?}", inner.state());
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.inner.lock().state()
    }

    pub fn use_count(&self) -> u32 {
        self.inner.lock().use_count
    }

    pub fn stream_count(&self) -> u32 {
        self.inner.lock().stream_count
    }

    pub fn num_endpoints(&self) -> u32 {
        self.inner.lock().num_endpoints
    }

    /// Entity of the output DMA endpoint, once validated.
    pub fn output(&self) -> Option<EntityId> {
        self.inner.lock().output
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pipeline").field(&self.state()).finish()
    }
}

/// Walk from the output endpoint upstream and toggle every stage.
fn start_stop_chain(
    graph: &MediaGraph,
    output: EntityId,
    start: bool,
) -> Result<(), SubdeviceError> {
    for subdev in graph.upstream_chain(output) {
        match subdev.start_stream(start) {
            Ok(()) | Err(SubdeviceError::NotSupported(_)) => {}
            Err(e) if start => {
                tracing::error!("Failed to start {}: {}", subdev.name(), e);
                return Err(e);
            }
            Err(e) => tracing::warn!("Failed to stop {}: {}", subdev.name(), e),
        }
    }
    Ok(())
}
