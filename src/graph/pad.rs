//! Pad descriptors for graph entities.
//!
//! Each entity declares its pads (sinks/sources) as `PadDescriptor` lists.
//! The media graph uses these to validate link endpoints.

use serde::{Deserialize, Serialize};

/// Whether data enters (sink) or leaves (source) an entity through a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadDirection {
    Sink,
    Source,
}

impl PadDirection {
    /// The direction a pad on the other end of a link must have.
    pub fn opposite(self) -> Self {
        match self {
            PadDirection::Sink => PadDirection::Source,
            PadDirection::Source => PadDirection::Sink,
        }
    }
}

/// Static descriptor for an entity pad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PadDescriptor {
    pub name: &'static str,
    pub direction: PadDirection,
}

impl PadDescriptor {
    pub const fn sink(name: &'static str) -> Self {
        Self {
            name,
            direction: PadDirection::Sink,
        }
    }

    pub const fn source(name: &'static str) -> Self {
        Self {
            name,
            direction: PadDirection::Source,
        }
    }

    #[inline]
    pub fn is_sink(&self) -> bool {
        self.direction == PadDirection::Sink
    }
}
