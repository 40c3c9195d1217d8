//! Transmit sequence allocation and receive duplicate detection
//!
//! The transmit side hands out monotonically increasing 12-bit sequence
//! numbers, atomically with respect to concurrent senders on the same link.
//! The receive side tracks the last sequence number accepted from each
//! transmitter so retransmitted frames can be dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

/// The sequence-number field width is 12 bits
pub const SEQUENCE_MODULUS: u16 = 1 << 12;

/// Per-link allocator of outbound sequence numbers
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counter: AtomicU16,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self { counter: AtomicU16::new(0) }
    }

    /// Return the next sequence number, wrapping at the field width.
    ///
    /// Two concurrent callers never observe the same value.
    pub fn next(&self) -> u16 {
        self.counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + 1) % SEQUENCE_MODULUS)
            })
            .map(|previous| (previous + 1) % SEQUENCE_MODULUS)
            .unwrap_or(0)
    }
}

/// Per-transmitter duplicate detector for the receive path
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    last_accepted: HashMap<[u8; 6], u16>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the sequence number of a frame from the given transmitter and
    /// report whether it duplicates the previously accepted one.
    pub fn is_duplicate(&mut self, transmitter: [u8; 6], sequence: u16) -> bool {
        match self.last_accepted.insert(transmitter, sequence) {
            Some(previous) => previous == sequence,
            None => false,
        }
    }

    /// Forget all tracked transmitters (used when the BSS changes)
    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }
}
