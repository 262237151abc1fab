//! Identity types for the media graph.
//!
//! All IDs are newtypes over `u32` that serve as direct array indices
//! into their respective storage vectors, providing O(1) lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into the media graph entity table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const INVALID: EntityId = EntityId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "EntityId(INVALID)")
        } else {
            write!(f, "EntityId({})", self.0)
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Compact pad identifier. High 20 bits = entity index, low 12 bits = pad index.
/// Supports up to ~1M entities with 4096 pads each.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadId(pub u32);

impl PadId {
    const PAD_BITS: u32 = 12;
    const PAD_MASK: u32 = (1 << Self::PAD_BITS) - 1;

    /// Largest pad index representable in a `PadId`.
    pub const MAX_PAD: u16 = (1 << Self::PAD_BITS) as u16 - 1;

    pub fn new(entity: EntityId, pad_index: u16) -> Self {
        debug_assert!(pad_index <= Self::MAX_PAD);
        Self((entity.0 << Self::PAD_BITS) | (pad_index as u32 & Self::PAD_MASK))
    }

    #[inline]
    pub fn entity(self) -> EntityId {
        EntityId(self.0 >> Self::PAD_BITS)
    }

    #[inline]
    pub fn pad_index(self) -> u16 {
        (self.0 & Self::PAD_MASK) as u16
    }
}

impl fmt::Debug for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PadId(entity={}, pad={})",
            self.entity().0,
            self.pad_index()
        )
    }
}

/// Index into the media graph link table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl LinkId {
    pub const INVALID: LinkId = LinkId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "LinkId(INVALID)")
        } else {
            write!(f, "LinkId({})", self.0)
        }
    }
}
