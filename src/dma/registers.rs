//! Packetizer register bank of a DMA port.
//!
//! Each DMA port sits behind a small packetizer that slices the event stream
//! into transfers. Its registers are 32-bit words; diagnostic access goes
//! through [`RegisterBank`], which rejects misaligned offsets and offsets
//! beyond the mapped bank.

use crate::error::RegisterError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Packetizer version word.
pub const REG_VERSION: u32 = 0x0;
/// Packetizer control word.
pub const REG_CONTROL: u32 = 0x4;
/// Packet length in bus words.
pub const REG_PACKET_LENGTH: u32 = 0x8;

/// Test pattern generator enable bit of [`REG_CONTROL`].
pub const CONTROL_TEST_PATTERN: u32 = 1 << 0;

/// Raw 32-bit register access. Offsets are validated by [`RegisterBank`].
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Register words kept in memory.
#[derive(Debug)]
pub struct MemoryRegisters {
    words: Mutex<Vec<u32>>,
}

impl MemoryRegisters {
    pub fn new(size: u32) -> Self {
        Self {
            words: Mutex::new(vec![0; (size as usize).div_ceil(4)]),
        }
    }

    /// Preset a word, e.g. the version register.
    pub fn with_word(self, offset: u32, value: u32) -> Self {
        self.write32(offset, value);
        self
    }
}

impl RegisterIo for MemoryRegisters {
    fn read32(&self, offset: u32) -> u32 {
        self.words
            .lock()
            .get((offset / 4) as usize)
            .copied()
            .unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        if let Some(word) = self.words.lock().get_mut((offset / 4) as usize) {
            *word = value;
        }
    }
}

/// Bounds-checked view of one register bank.
#[derive(Clone)]
pub struct RegisterBank {
    io: Arc<dyn RegisterIo>,
    size: u32,
}

impl RegisterBank {
    pub fn new(io: Arc<dyn RegisterIo>, size: u32) -> Self {
        Self { io, size }
    }

    /// Size of the bank in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    fn check(&self, offset: u32) -> Result<(), RegisterError> {
        if offset % 4 != 0 {
            return Err(RegisterError::Misaligned { offset });
        }
        if offset >= self.size {
            return Err(RegisterError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        Ok(())
    }

    pub fn read_register(&self, offset: u32) -> Result<u32, RegisterError> {
        self.check(offset)?;
        Ok(self.io.read32(offset))
    }

    pub fn write_register(&self, offset: u32, value: u32) -> Result<(), RegisterError> {
        self.check(offset)?;
        self.io.write32(offset, value);
        Ok(())
    }

    /// Disable the test pattern and program the packet length for
    /// `transfer_size` bytes.
    pub fn configure_packetizer(&self, transfer_size: usize) -> Result<(), RegisterError> {
        self.write_register(REG_CONTROL, 0)?;
        self.write_register(REG_PACKET_LENGTH, (transfer_size / 8) as u32)
    }
}

impl std::fmt::Debug for RegisterBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterBank(size=0x{:x})", self.size)
    }
}

/// Provides the register bank of each DMA port.
pub trait RegisterMap: Send + Sync {
    /// Bank of `port`, or `None` if the port has no packetizer.
    fn bank(&self, port: u32) -> Option<RegisterBank>;
}

/// In-memory banks for every port, created on first use.
#[derive(Debug)]
pub struct MemoryRegisterMap {
    size: u32,
    banks: Mutex<Vec<(u32, RegisterBank)>>,
}

impl MemoryRegisterMap {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            banks: Mutex::new(Vec::new()),
        }
    }
}

impl RegisterMap for MemoryRegisterMap {
    fn bank(&self, port: u32) -> Option<RegisterBank> {
        let mut banks = self.banks.lock();
        if let Some((_, bank)) = banks.iter().find(|(p, _)| *p == port) {
            return Some(bank.clone());
        }
        let bank = RegisterBank::new(Arc::new(MemoryRegisters::new(self.size)), self.size);
        banks.push((port, bank.clone()));
        Some(bank)
    }
}
