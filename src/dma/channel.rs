//! DMA channel: one directional endpoint of the device.
//!
//! A channel ties together a graph entity (one pad, sink for capture and
//! source for output), an engine channel, a [`BufferQueue`] and the packetizer
//! register bank of its port.
//!
//! # Streaming
//!
//! `start_streaming` brings the channel's share of the pipeline up:
//!
//! 1. reset the sequence counter
//! 2. start the media pipeline (freezes the topology of the component)
//! 3. check the channel pad is linked to a processing stage
//! 4. prepare the shared [`Pipeline`]
//! 5. kick the engine, then turn the pipeline stream on
//!
//! A failure at any step unwinds what was done and hands every queued buffer
//! back as [`BufferState::Reclaimed`]. `stop_streaming` reverses the sequence
//! and cannot fail; leftover buffers come back as [`BufferState::Errored`].
//! A buffer enqueued while a stop is flushing the engine waits for the flush
//! and then stays queued for the next start.

use crate::dma::buffer::{Buffer, BufferState};
use crate::dma::engine::{EngineChannel, TransferEngine};
use crate::dma::queue::{BufferQueue, QueueStats};
use crate::dma::registers::RegisterBank;
use crate::dma::DmaDirection;
use crate::error::{ChannelError, RegisterError};
use crate::graph::{
    EntityId, EntityKind, MediaGraph, NewEntity, PadDescriptor, PadId, PixelFormat, Subdevice,
};
use crate::pipeline::Pipeline;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Memory format reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixFormat {
    /// `None` when the upstream bus code has no memory equivalent.
    pub pixel_format: Option<PixelFormat>,
    pub width: u32,
    pub height: u32,
    /// The packetizer cuts the stream into fixed-size transfers.
    pub size_image: usize,
    pub bytes_per_line: u32,
}

/// One DMA endpoint.
pub struct DmaChannel {
    name: String,
    port: u32,
    direction: DmaDirection,
    transfer_size: usize,
    entity: EntityId,
    graph: Arc<MediaGraph>,
    engine: Arc<dyn EngineChannel>,
    queue: BufferQueue,
    registers: RegisterBank,
    own_pipeline: Arc<Pipeline>,
    active_pipeline: Mutex<Option<Arc<Pipeline>>>,
    /// Serializes start, stop and format changes.
    control: Mutex<()>,
    /// Held across a submission, and across stop's terminate and flush, so a
    /// buffer is never submitted between the two.
    submission: Mutex<()>,
}

impl DmaChannel {
    /// Create the channel for `port`, add its entity to the graph and program
    /// the packetizer.
    pub fn new(
        device: &str,
        port: u32,
        direction: DmaDirection,
        transfer_size: usize,
        graph: Arc<MediaGraph>,
        engine: &dyn TransferEngine,
        registers: RegisterBank,
    ) -> Result<Self, ChannelError> {
        let name = format!(
            "{} {} {}",
            device,
            match direction {
                DmaDirection::Capture => "output",
                DmaDirection::Output => "input",
            },
            port
        );

        let engine_name = format!("port{}", port);
        let engine = engine.request_channel(&engine_name).map_err(|e| {
            if e.is_retryable() {
                tracing::debug!("{}: engine channel {} deferred", name, engine_name);
            } else {
                tracing::error!("{}: no DMA channel found: {}", name, e);
            }
            ChannelError::EngineUnavailable(e)
        })?;

        let entity = graph.add_entity(NewEntity {
            name: name.clone(),
            kind: EntityKind::DmaPort { port, direction },
            pads: vec![PadDescriptor {
                name: "dma",
                direction: direction.pad_direction(),
            }],
        })?;

        registers.configure_packetizer(transfer_size)?;

        tracing::info!(
            "Created {} ({:?}, {} byte transfers)",
            name,
            direction,
            transfer_size
        );
        Ok(Self {
            queue: BufferQueue::new(name.clone(), transfer_size),
            name,
            port,
            direction,
            transfer_size,
            entity,
            graph,
            engine,
            registers,
            own_pipeline: Arc::new(Pipeline::new()),
            active_pipeline: Mutex::new(None),
            control: Mutex::new(()),
            submission: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn engine_channel(&self) -> &Arc<dyn EngineChannel> {
        &self.engine
    }

    pub fn is_streaming(&self) -> bool {
        self.queue.is_streaming()
    }

    /// Pipeline the channel streams in, while streaming.
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.active_pipeline.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn try_dequeue(&self) -> Option<Buffer> {
        self.queue.try_dequeue()
    }

    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Buffer> {
        self.queue.dequeue_timeout(timeout)
    }

    /// Hand a buffer to the engine. Only waits for a stop that is flushing
    /// the engine.
    ///
    /// A buffer the engine cannot describe is handed back as errored and
    /// `Ok` is returned. A buffer the engine refuses is handed back as errored
    /// and the refusal is returned.
    pub fn enqueue(&self, buffer: Buffer) -> Result<(), ChannelError> {
        if buffer.handle.len < self.transfer_size {
            return Err(ChannelError::BufferTooSmall {
                size: buffer.handle.len,
                required: self.transfer_size,
            });
        }

        let _submission = self.submission.lock();
        let desc = match self.engine.prepare_transfer(
            buffer.handle.dma_addr,
            self.transfer_size,
            self.direction.transfer_direction(),
        ) {
            Some(d) => d,
            None => {
                tracing::error!("{}: failed to prepare DMA transfer", self.name);
                self.queue.reject(buffer);
                return Ok(());
            }
        };

        let key = self.queue.track(buffer);
        if let Err(e) = self.engine.submit(desc, self.queue.completion_handler(key)) {
            tracing::warn!("{}: submit refused: {}", self.name, e);
            self.queue.fail(key);
            return Err(ChannelError::EngineUnavailable(e));
        }

        if self.queue.is_streaming() {
            self.engine.issue_pending();
        }
        Ok(())
    }

    /// Processing stage linked to the channel pad, and the pad it is linked on.
    fn remote_subdev(&self) -> Result<(Arc<Subdevice>, u16), ChannelError> {
        let no_peer = || ChannelError::NoPeer {
            channel: self.name.clone(),
        };
        let remote = self
            .graph
            .remote_pad(PadId::new(self.entity, 0))
            .ok_or_else(no_peer)?;
        let entity = self.graph.entity(remote.entity()).ok_or_else(no_peer)?;
        let subdev = entity.subdevice().cloned().ok_or_else(no_peer)?;
        Ok((subdev, remote.pad_index()))
    }

    pub fn start_streaming(&self) -> Result<(), ChannelError> {
        let _control = self.control.lock();
        if self.queue.is_streaming() {
            return Err(ChannelError::Busy {
                channel: self.name.clone(),
            });
        }

        self.queue.reset_sequence();

        let pipe = match self.graph.start_pipeline(self.entity, &self.own_pipeline) {
            Ok(p) => p,
            Err(e) => return Err(self.abort_start(e.into())),
        };

        if let Err(e) = self.remote_subdev() {
            self.graph.stop_pipeline(self.entity);
            return Err(self.abort_start(e));
        }

        if let Err(e) = pipe.prepare(&self.graph, self.entity) {
            self.graph.stop_pipeline(self.entity);
            return Err(self.abort_start(e.into()));
        }

        // The engine runs before the stages so no data is produced into an
        // idle channel.
        {
            let _submission = self.submission.lock();
            self.queue.set_streaming(true);
            self.engine.issue_pending();
        }

        if let Err(e) = pipe.set_stream(&self.graph, true) {
            pipe.cleanup();
            self.graph.stop_pipeline(self.entity);
            return Err(self.abort_start(e.into()));
        }

        *self.active_pipeline.lock() = Some(pipe);
        tracing::info!("{}: streaming", self.name);
        Ok(())
    }

    fn abort_start(&self, error: ChannelError) -> ChannelError {
        tracing::warn!("{}: failed to start streaming: {}", self.name, error);
        let _submission = self.submission.lock();
        self.queue.set_streaming(false);
        self.engine.terminate_all();
        self.queue.reclaim_all(BufferState::Reclaimed);
        error
    }

    /// Stop streaming. Leftover buffers come back errored.
    pub fn stop_streaming(&self) {
        let _control = self.control.lock();
        let pipe = self.active_pipeline.lock().take();

        match &pipe {
            // Turning the stream off never fails.
            Some(pipe) => {
                let _ = pipe.set_stream(&self.graph, false);
            }
            None => tracing::debug!("{}: stop while not streaming", self.name),
        }

        // An enqueue arriving from here on stays queued until the next start.
        let flushed = {
            let _submission = self.submission.lock();
            self.queue.set_streaming(false);
            self.engine.terminate_all();
            self.queue.reclaim_all(BufferState::Errored)
        };

        if let Some(pipe) = pipe {
            pipe.cleanup();
            self.graph.stop_pipeline(self.entity);
        }
        tracing::info!("{}: stopped, {} buffers returned", self.name, flushed);
    }

    /// Current memory format, derived from the linked stage's bus format.
    pub fn format(&self) -> Result<PixFormat, ChannelError> {
        let (subdev, pad) = self.remote_subdev()?;
        let bus = subdev.active_format(pad)?;
        let pixel_format = bus.code.to_pixel_format();
        if pixel_format.is_none() {
            tracing::warn!(
                "{}: could not translate bus code {:?} to a pixel format",
                self.name,
                bus.code
            );
        }
        Ok(PixFormat {
            pixel_format,
            width: bus.width,
            height: bus.height,
            size_image: self.transfer_size,
            bytes_per_line: 0,
        })
    }

    /// Reprogram the packetizer and report the resulting format.
    pub fn set_format(&self) -> Result<PixFormat, ChannelError> {
        let _control = self.control.lock();
        if self.queue.is_streaming() {
            return Err(ChannelError::Busy {
                channel: self.name.clone(),
            });
        }
        self.registers.configure_packetizer(self.transfer_size)?;
        self.format()
    }

    pub fn read_register(&self, offset: u32) -> Result<u32, RegisterError> {
        self.registers.read_register(offset)
    }

    pub fn write_register(&self, offset: u32, value: u32) -> Result<(), RegisterError> {
        self.registers.write_register(offset, value)
    }
}

impl std::fmt::Debug for DmaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaChannel")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("direction", &self.direction)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}
