//! Trait seams to the layers above and below the protocol engine
//!
//! The radio/MAC hardware below and the generic network stack above are
//! external collaborators; the engine only ever talks to them through these
//! traits. Implementations must not block: `transmit` confirms handoff,
//! not delivery, and channel changes take effect asynchronously.

use bytes::Bytes;
use uuid::Uuid;

use crate::Result;

/// Identifier for one link, used to key process-wide registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The lower (radio/MAC) layer consumed by the engine
pub trait RadioDevice: Send + Sync {
    /// Hand one fully framed 802.11 frame to the hardware for transmission.
    ///
    /// Best-effort: a returned `Ok` confirms handoff only.
    fn transmit(&self, frame: Bytes) -> Result<()>;

    /// Ask the radio to retune to the given channel. Effected
    /// asynchronously; the engine does not assume immediate effect.
    fn request_channel_change(&self, channel: u8) -> Result<()>;
}

/// The upper layer receiving decapsulated data-frame payloads
pub trait PayloadSink: Send + Sync {
    /// Deliver one payload with its recovered upper-layer protocol number.
    fn deliver(&self, protocol: u16, payload: Bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_are_unique() {
        assert_ne!(LinkId::new(), LinkId::new());
    }
}
