//! Mock Transfer Engine for Testing
//!
//! This module provides a transfer engine that completes descriptors without
//! hardware, either on its own worker threads or on demand.
//!
//! # Features
//!
//! - **Automatic mode**: each channel runs a worker thread that completes
//!   issued descriptors after a configurable latency
//! - **Manual mode**: issued descriptors wait until a test calls
//!   [`MockChannel::complete_next`], from whatever thread it likes
//! - **Deferral**: channels can be reported as not ready yet
//! - **Failure injection**: descriptor preparation can be made to fail
//! - **Backpressure**: a channel can refuse submissions beyond a capacity
//!
//! # Example
//!
//! ```ignore
//! use evpipe::dma::MockTransferEngine;
//!
//! let engine = MockTransferEngine::manual().with_capacity(4);
//! let channel = engine.request_channel("port0")?;
//! // ... enqueue buffers through a DmaChannel ...
//! engine.channel("port0").unwrap().complete_next(0);
//! ```

use crate::dma::engine::{
    CompletionCallback, Descriptor, EngineChannel, TransferDirection, TransferEngine,
    TransferResult,
};
use crate::error::EngineError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Pending {
    desc: Descriptor,
    callback: CompletionCallback,
    epoch: u64,
}

enum Mode {
    Auto { tx: Sender<Pending> },
    Manual { issued: Mutex<VecDeque<Pending>> },
}

struct ChannelCore {
    epoch: AtomicU64,
    outstanding: AtomicUsize,
    completed: AtomicU64,
    residue: usize,
}

impl ChannelCore {
    fn is_current(&self, pending: &Pending) -> bool {
        pending.epoch == self.epoch.load(Ordering::Acquire)
    }

    fn finish(&self, pending: Pending, residue: usize) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.completed.fetch_add(1, Ordering::Relaxed);
        let residue = residue.min(pending.desc.size);
        (pending.callback)(TransferResult { residue });
    }
}

/// A channel of the [`MockTransferEngine`].
pub struct MockChannel {
    name: String,
    core: Arc<ChannelCore>,
    capacity: Option<usize>,
    fail_prepare: Arc<AtomicBool>,
    queued: Mutex<VecDeque<Pending>>,
    mode: Mode,
    submitted: AtomicU64,
    terminations: AtomicU64,
}

impl MockChannel {
    fn new(
        name: &str,
        latency: Option<Duration>,
        residue: usize,
        capacity: Option<usize>,
        fail_prepare: Arc<AtomicBool>,
    ) -> Self {
        let core = Arc::new(ChannelCore {
            epoch: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            residue,
        });

        let mode = match latency {
            Some(latency) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let worker_core = core.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("mock-dma-{}", name))
                    .spawn(move || run_worker(rx, worker_core, latency));
                if let Err(e) = spawned {
                    tracing::error!("Failed to spawn mock DMA worker for {}: {}", name, e);
                }
                Mode::Auto { tx }
            }
            None => Mode::Manual {
                issued: Mutex::new(VecDeque::new()),
            },
        };

        Self {
            name: name.to_string(),
            core,
            capacity,
            fail_prepare,
            queued: Mutex::new(VecDeque::new()),
            mode,
            submitted: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
        }
    }

    /// Complete the oldest issued descriptor with `residue` bytes left over.
    /// Returns false if nothing was issued. Manual mode only.
    pub fn complete_next(&self, residue: usize) -> bool {
        let issued = match &self.mode {
            Mode::Manual { issued } => issued,
            Mode::Auto { .. } => return false,
        };
        let pending = issued.lock().pop_front();
        match pending {
            Some(p) if self.core.is_current(&p) => {
                self.core.finish(p, residue);
                true
            }
            _ => false,
        }
    }

    /// Complete every issued descriptor. Returns how many completed.
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next(self.core.residue) {
            count += 1;
        }
        count
    }

    /// Descriptors submitted and not yet completed or terminated.
    pub fn outstanding(&self) -> usize {
        self.core.outstanding.load(Ordering::Acquire)
    }

    /// Descriptors waiting for [`issue_pending`](EngineChannel::issue_pending).
    pub fn queued(&self) -> usize {
        self.queued.lock().len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.core.completed.load(Ordering::Relaxed)
    }

    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::Relaxed)
    }
}

fn run_worker(rx: Receiver<Pending>, core: Arc<ChannelCore>, latency: Duration) {
    tracing::debug!("Mock DMA worker started");
    // Ends when the channel is dropped.
    while let Ok(pending) = rx.recv() {
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if core.is_current(&pending) {
            core.finish(pending, core.residue);
        }
    }
    tracing::debug!("Mock DMA worker stopped");
}

impl EngineChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_transfer(
        &self,
        addr: u64,
        size: usize,
        direction: TransferDirection,
    ) -> Option<Descriptor> {
        if self.fail_prepare.load(Ordering::Acquire) || size == 0 {
            return None;
        }
        Some(Descriptor {
            addr,
            size,
            direction,
        })
    }

    fn submit(&self, desc: Descriptor, on_complete: CompletionCallback) -> Result<(), EngineError> {
        let mut queued = self.queued.lock();
        if let Some(capacity) = self.capacity {
            if self.core.outstanding.load(Ordering::Acquire) >= capacity {
                return Err(EngineError::SubmitFailed(format!(
                    "{}: {} descriptors outstanding",
                    self.name, capacity
                )));
            }
        }
        self.core.outstanding.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        queued.push_back(Pending {
            desc,
            callback: on_complete,
            epoch: self.core.epoch.load(Ordering::Acquire),
        });
        Ok(())
    }

    fn issue_pending(&self) {
        let batch: Vec<Pending> = self.queued.lock().drain(..).collect();
        match &self.mode {
            Mode::Auto { tx } => {
                for pending in batch {
                    if tx.send(pending).is_err() {
                        tracing::warn!("{}: mock DMA worker is gone", self.name);
                        break;
                    }
                }
            }
            Mode::Manual { issued } => issued.lock().extend(batch),
        }
    }

    fn terminate_all(&self) {
        self.core.epoch.fetch_add(1, Ordering::AcqRel);
        self.terminations.fetch_add(1, Ordering::Relaxed);
        let dropped = self.queued.lock().drain(..).count()
            + match &self.mode {
                Mode::Manual { issued } => issued.lock().drain(..).count(),
                Mode::Auto { .. } => 0,
            };
        self.core.outstanding.store(0, Ordering::Release);
        tracing::debug!("{}: terminated, {} descriptors dropped", self.name, dropped);
    }
}

/// Transfer engine that needs no hardware.
pub struct MockTransferEngine {
    latency: Option<Duration>,
    residue: usize,
    capacity: Option<usize>,
    deferred: Mutex<HashSet<String>>,
    fail_prepare: Arc<AtomicBool>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockTransferEngine {
    /// Engine whose channels complete descriptors on worker threads after
    /// `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            residue: 0,
            capacity: None,
            deferred: Mutex::new(HashSet::new()),
            fail_prepare: Arc::new(AtomicBool::new(false)),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Engine whose channels complete descriptors only on request.
    pub fn manual() -> Self {
        Self {
            latency: None,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Report `residue` untransferred bytes on every automatic completion.
    pub fn with_residue(mut self, residue: usize) -> Self {
        self.residue = residue;
        self
    }

    /// Refuse submissions once `capacity` descriptors are outstanding.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Report `name` as not ready until [`set_ready`](Self::set_ready).
    pub fn with_deferred(self, name: impl Into<String>) -> Self {
        self.deferred.lock().insert(name.into());
        self
    }

    pub fn set_ready(&self, name: &str) {
        self.deferred.lock().remove(name);
    }

    /// Make descriptor preparation fail on every channel.
    pub fn set_fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::Release);
    }

    /// Channel previously handed out under `name`.
    pub fn channel(&self, name: &str) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Number of channels currently handed out.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for MockTransferEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl TransferEngine for MockTransferEngine {
    fn request_channel(&self, name: &str) -> Result<Arc<dyn EngineChannel>, EngineError> {
        if self.deferred.lock().contains(name) {
            return Err(EngineError::Deferred(name.to_string()));
        }
        if let Some(existing) = self.channel(name) {
            return Ok(existing);
        }

        let channel = Arc::new(MockChannel::new(
            name,
            self.latency,
            self.residue,
            self.capacity,
            self.fail_prepare.clone(),
        ));
        self.channels.lock().push(channel.clone());
        tracing::info!("Mock DMA channel {} ready", name);
        Ok(channel)
    }

    fn release_channel(&self, channel: &Arc<dyn EngineChannel>) {
        channel.terminate_all();
        self.channels.lock().retain(|c| c.name != channel.name());
    }
}
