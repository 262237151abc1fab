//! Host buffers and the in-flight list.
//!
//! The in-flight list is an arena of slots linked in submission order.
//! Inserting returns an [`InFlightKey`]; the key is the only way to take a
//! buffer back out, and a slot's generation changes on removal, so a key can
//! complete its buffer at most once.

use std::time::Duration;

/// Host memory handed to a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    /// Caller-chosen buffer index.
    pub index: u32,
    /// Bus address of the buffer memory.
    pub dma_addr: u64,
    /// Capacity in bytes.
    pub len: usize,
}

/// Lifecycle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Queued,
    Submitted,
    Done,
    Errored,
    /// Handed back unused because streaming failed to start.
    Reclaimed,
}

impl BufferState {
    /// Whether a buffer in this state has left the engine for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BufferState::Done | BufferState::Errored | BufferState::Reclaimed
        )
    }
}

/// A buffer together with its completion metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub handle: BufferHandle,
    pub state: BufferState,
    /// Per-channel sequence number, stamped on completion.
    pub sequence: u32,
    /// Completion time relative to the queue epoch.
    pub timestamp: Duration,
    /// Bytes actually transferred.
    pub bytes_used: usize,
}

impl Buffer {
    pub fn new(handle: BufferHandle) -> Self {
        Self {
            handle,
            state: BufferState::Queued,
            sequence: 0,
            timestamp: Duration::ZERO,
            bytes_used: 0,
        }
    }
}

/// Token identifying one entry of an [`InFlightList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InFlightKey {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
struct Entry {
    buffer: Buffer,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Submission-ordered list of buffers owned by the transfer engine.
#[derive(Debug, Default)]
pub struct InFlightList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl InFlightList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a buffer at the tail.
    pub fn push_back(&mut self, buffer: Buffer) -> InFlightKey {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let entry = Entry {
            buffer,
            prev: self.tail,
            next: None,
        };
        if let Some(tail) = self.tail {
            if let Some(e) = self.slots[tail as usize].entry.as_mut() {
                e.next = Some(slot);
            }
        } else {
            self.head = Some(slot);
        }
        self.tail = Some(slot);
        self.len += 1;

        let s = &mut self.slots[slot as usize];
        s.entry = Some(entry);
        InFlightKey {
            slot,
            generation: s.generation,
        }
    }

    pub fn contains(&self, key: InFlightKey) -> bool {
        self.slots
            .get(key.slot as usize)
            .map(|s| s.generation == key.generation && s.entry.is_some())
            .unwrap_or(false)
    }

    /// Unlink the entry for `key`. Returns `None` if it was already removed.
    pub fn remove(&mut self, key: InFlightKey) -> Option<Buffer> {
        if !self.contains(key) {
            return None;
        }
        let slot = &mut self.slots[key.slot as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        match entry.prev {
            Some(prev) => {
                if let Some(e) = self.slots[prev as usize].entry.as_mut() {
                    e.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(e) = self.slots[next as usize].entry.as_mut() {
                    e.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }

        self.free.push(key.slot);
        self.len -= 1;
        Some(entry.buffer)
    }

    /// Take every buffer out, oldest first.
    pub fn drain(&mut self) -> Vec<Buffer> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(head) = self.head {
            let key = InFlightKey {
                slot: head,
                generation: self.slots[head as usize].generation,
            };
            match self.remove(key) {
                Some(buffer) => out.push(buffer),
                None => break,
            }
        }
        out
    }

    /// Buffers in submission order, without removing them.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let entry = self.slots.get(cursor? as usize)?.entry.as_ref()?;
            cursor = entry.next;
            Some(&entry.buffer)
        })
    }
}
