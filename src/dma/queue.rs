//! Buffer queue of one DMA channel.
//!
//! The queue bridges synchronous submission with asynchronous completion:
//!
//! - the control path [`track`](BufferQueue::track)s a buffer before submitting
//!   it and gets a completion callback bound to the list entry;
//! - the engine invokes the callback from its own context, which unlinks the
//!   entry under the list lock and stamps the buffer outside it;
//! - finished buffers are handed to the consumer over a channel.
//!
//! Whoever removes an entry from the in-flight list owns its completion, so a
//! buffer flushed by `stop` is never also completed by a late callback.

use crate::dma::buffer::{Buffer, BufferState, InFlightKey, InFlightList};
use crate::dma::engine::{CompletionCallback, TransferResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Size of the rolling window for completion intervals
const RECENT_WINDOW_SIZE: usize = 100;

/// Statistics for a buffer queue
///
/// Tracks completion counts, throughput and the spacing between completions.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Buffers completed with data
    pub completed: u64,
    /// Buffers completed in the error state
    pub errored: u64,
    /// Buffers handed back unused
    pub reclaimed: u64,
    /// Total bytes transferred
    pub total_bytes: u64,
    /// Timestamp of the last completion
    pub last_completion: Option<Duration>,
    /// Minimum interval between completions (microseconds)
    pub min_interval_us: u64,
    /// Maximum interval between completions (microseconds)
    pub max_interval_us: u64,
    /// Rolling window of recent completion intervals
    pub recent_intervals_us: VecDeque<u64>,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            completed: 0,
            errored: 0,
            reclaimed: 0,
            total_bytes: 0,
            last_completion: None,
            min_interval_us: u64::MAX,
            max_interval_us: 0,
            recent_intervals_us: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl QueueStats {
    /// Record a buffer completed with data
    pub fn record_done(&mut self, bytes: usize, timestamp: Duration) {
        self.completed += 1;
        self.total_bytes += bytes as u64;

        if let Some(last) = self.last_completion {
            let interval = timestamp.saturating_sub(last).as_micros() as u64;
            self.min_interval_us = self.min_interval_us.min(interval);
            self.max_interval_us = self.max_interval_us.max(interval);
            self.recent_intervals_us.push_back(interval);
            if self.recent_intervals_us.len() > RECENT_WINDOW_SIZE {
                self.recent_intervals_us.pop_front();
            }
        }
        self.last_completion = Some(timestamp);
    }

    /// Record a buffer finished without data
    pub fn record_unfinished(&mut self, state: BufferState) {
        match state {
            BufferState::Reclaimed => self.reclaimed += 1,
            _ => self.errored += 1,
        }
    }

    /// Average interval between completions in microseconds
    pub fn avg_interval_us(&self) -> f64 {
        if self.recent_intervals_us.is_empty() {
            return 0.0;
        }
        self.recent_intervals_us.iter().sum::<u64>() as f64
            / self.recent_intervals_us.len() as f64
    }

    /// Jitter (max - min) over the recent window in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_intervals_us.iter().min().copied().unwrap_or(0);
        let max = self.recent_intervals_us.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// Standard deviation of recent completion intervals in microseconds
    pub fn stddev_us(&self) -> f64 {
        if self.recent_intervals_us.len() < 2 {
            return 0.0;
        }
        let mean = self.avg_interval_us();
        let variance = self
            .recent_intervals_us
            .iter()
            .map(|&t| (t as f64 - mean).powi(2))
            .sum::<f64>()
            / (self.recent_intervals_us.len() - 1) as f64;
        variance.sqrt()
    }

    /// Share of finished buffers that completed with data, as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.errored;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }
}

struct QueueShared {
    name: String,
    in_flight: Mutex<InFlightList>,
    sequence: AtomicU32,
    streaming: AtomicBool,
    epoch: Instant,
    transfer_size: usize,
    done_tx: Sender<Buffer>,
    stats: Mutex<QueueStats>,
}

impl QueueShared {
    fn complete(&self, key: InFlightKey, result: TransferResult) {
        let buffer = self.in_flight.lock().remove(key);
        let mut buffer = match buffer {
            Some(b) => b,
            // Flushed by stop before the engine got here.
            None => return,
        };

        buffer.sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        buffer.timestamp = self.epoch.elapsed();
        buffer.bytes_used = self.transfer_size.saturating_sub(result.residue);
        buffer.state = BufferState::Done;
        self.stats
            .lock()
            .record_done(buffer.bytes_used, buffer.timestamp);
        self.hand_back(buffer);
    }

    fn finish(&self, mut buffer: Buffer, state: BufferState) {
        buffer.state = state;
        buffer.timestamp = self.epoch.elapsed();
        self.stats.lock().record_unfinished(state);
        self.hand_back(buffer);
    }

    fn hand_back(&self, buffer: Buffer) {
        // The receiver lives as long as the queue; a send can only fail while
        // the queue is being dropped.
        if self.done_tx.send(buffer).is_err() {
            tracing::debug!("{}: dropping completion, queue is gone", self.name);
        }
    }
}

/// In-flight buffers of one DMA channel.
pub struct BufferQueue {
    shared: Arc<QueueShared>,
    done_rx: Receiver<Buffer>,
}

impl BufferQueue {
    pub fn new(name: impl Into<String>, transfer_size: usize) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(QueueShared {
                name: name.into(),
                in_flight: Mutex::new(InFlightList::new()),
                sequence: AtomicU32::new(0),
                streaming: AtomicBool::new(false),
                epoch: Instant::now(),
                transfer_size,
                done_tx,
                stats: Mutex::new(QueueStats::default()),
            }),
            done_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn transfer_size(&self) -> usize {
        self.shared.transfer_size
    }

    /// Append a buffer to the in-flight list and mark it submitted.
    pub fn track(&self, mut buffer: Buffer) -> InFlightKey {
        buffer.state = BufferState::Submitted;
        self.shared.in_flight.lock().push_back(buffer)
    }

    /// Callback completing the entry for `key`. Holds only a weak reference
    /// so an engine outliving the queue does not keep it alive.
    pub fn completion_handler(&self, key: InFlightKey) -> CompletionCallback {
        let shared: Weak<QueueShared> = Arc::downgrade(&self.shared);
        Box::new(move |result| {
            if let Some(shared) = shared.upgrade() {
                shared.complete(key, result);
            }
        })
    }

    /// Fail a tracked buffer immediately. Returns false if it already left the
    /// list.
    pub fn fail(&self, key: InFlightKey) -> bool {
        let buffer = self.shared.in_flight.lock().remove(key);
        match buffer {
            Some(b) => {
                self.shared.finish(b, BufferState::Errored);
                true
            }
            None => false,
        }
    }

    /// Finish a buffer that never entered the list.
    pub fn reject(&self, buffer: Buffer) {
        self.shared.finish(buffer, BufferState::Errored);
    }

    /// Hand back every in-flight buffer in `state`. Returns how many.
    ///
    /// A non-terminal `state` is handed back as [`BufferState::Errored`].
    pub fn reclaim_all(&self, state: BufferState) -> usize {
        let state = if state.is_terminal() {
            state
        } else {
            tracing::warn!("{}: cannot hand buffers back as {:?}", self.name(), state);
            BufferState::Errored
        };
        let drained = self.shared.in_flight.lock().drain();
        let count = drained.len();
        for buffer in drained {
            self.shared.finish(buffer, state);
        }
        if count > 0 {
            tracing::debug!("{}: handed back {} buffers as {:?}", self.name(), count, state);
        }
        count
    }

    pub fn reset_sequence(&self) {
        self.shared.sequence.store(0, Ordering::Release);
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.shared.streaming.store(streaming, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Number of buffers owned by the engine.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Next finished buffer, if any.
    pub fn try_dequeue(&self) -> Option<Buffer> {
        self.done_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next finished buffer.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Buffer> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats.lock().clone()
    }
}
