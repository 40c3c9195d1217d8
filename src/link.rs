//! Per-link state
//!
//! One [`Link`] exists per radio interface bound to the protocol engine.
//! It owns the join state variable, the snapshot of the BSS being joined
//! or associated, the session keys, and the receive-side duplicate
//! tracker, all guarded by the link's exclusive lock. Transmit sequence
//! numbers are allocated lock-free by the embedded allocator.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::device::LinkId;
use crate::sequence::{DuplicateDetector, SequenceAllocator};
use crate::wire::{self, CipherSuite};
use crate::{Result, StationError};

/// Encryption negotiated for a BSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionType {
    None,
    Wep,
    WpaPsk,
    Wpa2Psk,
}

impl EncryptionType {
    /// Whether joining a BSS of this type requires key material up front
    pub fn requires_passphrase(&self) -> bool {
        !matches!(self, EncryptionType::None)
    }
}

/// Position in the join/association state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Initial state; no BSS
    Idle,
    /// Probing for the requested SSID
    Scanning,
    /// Authentication exchange in progress
    Authenticating,
    /// Association exchange in progress
    Associating,
    /// 4-way handshake in progress
    KeyExchanging,
    /// Joined; the data path accepts traffic
    Associated,
    /// Lost the BSS; transitions back to Idle
    Disassociated,
    /// A join attempt failed; terminal until the next join
    Failed,
}

impl LinkState {
    /// Only `Associated` admits data traffic
    pub fn allows_data(&self) -> bool {
        matches!(self, LinkState::Associated)
    }

    /// States during which a join sequence owns the link
    pub fn is_joining(&self) -> bool {
        matches!(
            self,
            LinkState::Scanning
                | LinkState::Authenticating
                | LinkState::Associating
                | LinkState::KeyExchanging
        )
    }
}

/// Immutable-for-lifetime link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkProperties {
    /// Station MAC address
    pub address: [u8; 6],
    /// Channels the radio supports
    pub channels: Vec<u8>,
    /// Supported rates in 500 kbit/s units, basic rates flagged with 0x80
    pub rates: Vec<u8>,
    /// Capability bits advertised in association requests
    pub capabilities: u16,
    /// Listen interval advertised in association requests
    pub listen_interval: u16,
}

impl Default for LinkProperties {
    fn default() -> Self {
        Self {
            address: [0; 6],
            channels: (1..=11).collect(),
            rates: vec![0x82, 0x84, 0x8b, 0x96, 0x0c, 0x12, 0x18, 0x24],
            capabilities: wire::CAP_ESS,
            listen_interval: 10,
        }
    }
}

impl LinkProperties {
    pub fn with_address(address: [u8; 6]) -> Self {
        Self { address, ..Default::default() }
    }
}

/// Snapshot of the BSS this link is joining or joined to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BssDescription {
    pub bssid: [u8; 6],
    pub ssid: Vec<u8>,
    pub channel: u8,
    pub beacon_interval: u16,
    pub capabilities: u16,
    pub rates: Vec<u8>,
    pub encryption: EncryptionType,
    pub pairwise: CipherSuite,
    pub group: CipherSuite,
    pub association_id: u16,
    pub last_seen: DateTime<Utc>,
}

/// Per-key CCMP state: the temporal key plus packet-number counters
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct CcmpKeyState {
    pub temporal_key: [u8; 16],
    pub tx_packet_number: u64,
    pub rx_packet_number: u64,
}

impl CcmpKeyState {
    pub fn new(temporal_key: [u8; 16]) -> Self {
        Self { temporal_key, tx_packet_number: 0, rx_packet_number: 0 }
    }
}

/// Cipher keys installed for the data path; destroyed (and zeroized) on
/// every disassociation or join failure
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub enum SessionKeys {
    Wep {
        key: Vec<u8>,
    },
    Ccmp {
        pairwise: CcmpKeyState,
        group: CcmpKeyState,
        group_key_id: u8,
    },
}

struct LinkInner {
    state: LinkState,
    bss: Option<BssDescription>,
    keys: Option<SessionKeys>,
    duplicates: DuplicateDetector,
    joining: bool,
}

/// One 802.11 link
pub struct Link {
    id: LinkId,
    properties: LinkProperties,
    sequence: SequenceAllocator,
    inner: Mutex<LinkInner>,
}

impl Link {
    pub fn new(properties: LinkProperties) -> Self {
        Self {
            id: LinkId::new(),
            properties,
            sequence: SequenceAllocator::new(),
            inner: Mutex::new(LinkInner {
                state: LinkState::Idle,
                bss: None,
                keys: None,
                duplicates: DuplicateDetector::new(),
                joining: false,
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn properties(&self) -> &LinkProperties {
        &self.properties
    }

    /// Station MAC address
    pub fn address(&self) -> [u8; 6] {
        self.properties.address
    }

    /// Next outbound sequence number for this link
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence.next()
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().expect("link lock poisoned").state
    }

    /// The single mutation point for the link state.
    ///
    /// Entering `Idle` or `Failed` from a joined state destroys the BSS
    /// snapshot, the session keys, and the duplicate tracker.
    pub fn set_state(&self, state: LinkState) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        if inner.state == state {
            return;
        }
        log::info!("link state transition: {:?} -> {:?}", inner.state, state);
        inner.state = state;
        if matches!(state, LinkState::Idle | LinkState::Failed) {
            inner.bss = None;
            inner.keys = None;
            inner.duplicates.clear();
        }
    }

    /// Snapshot of the current BSS, if any
    pub fn bss(&self) -> Option<BssDescription> {
        self.inner.lock().expect("link lock poisoned").bss.clone()
    }

    /// BSSID of the current BSS, if any
    pub fn bssid(&self) -> Option<[u8; 6]> {
        self.inner.lock().expect("link lock poisoned").bss.as_ref().map(|bss| bss.bssid)
    }

    /// Claim the link for a join sequence. Exactly one join may be in
    /// progress; a second concurrent attempt is rejected.
    pub fn begin_join(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        if inner.joining || inner.state.is_joining() {
            return Err(StationError::AlreadyJoining);
        }
        inner.joining = true;
        Ok(())
    }

    /// Release the join claim taken by [`Link::begin_join`]
    pub fn end_join(&self) {
        self.inner.lock().expect("link lock poisoned").joining = false;
    }

    /// Replace the BSS snapshot wholesale (a new BSS is being joined)
    pub(crate) fn set_bss(&self, bss: BssDescription) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        log::info!(
            "joining BSS {} on channel {}",
            wire::format_address(&bss.bssid),
            bss.channel
        );
        inner.bss = Some(bss);
        inner.duplicates.clear();
    }

    /// Record the association id assigned by the AP
    pub(crate) fn set_association_id(&self, association_id: u16) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        if let Some(bss) = inner.bss.as_mut() {
            bss.association_id = association_id;
        }
    }

    /// Refresh the BSS `last_seen` timestamp (beacon received)
    pub(crate) fn touch_bss(&self, bssid: [u8; 6]) {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        if let Some(bss) = inner.bss.as_mut() {
            if bss.bssid == bssid {
                bss.last_seen = Utc::now();
            }
        }
    }

    /// Install session keys derived by the key exchange
    pub(crate) fn install_keys(&self, keys: SessionKeys) {
        self.inner.lock().expect("link lock poisoned").keys = Some(keys);
    }

    /// Run a closure against the installed session keys under the lock
    pub(crate) fn with_keys<R>(&self, f: impl FnOnce(Option<&mut SessionKeys>) -> R) -> R {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        f(inner.keys.as_mut())
    }

    /// Receive-side duplicate check, ordered by the link lock
    pub(crate) fn is_duplicate(&self, transmitter: [u8; 6], sequence: u16) -> bool {
        let mut inner = self.inner.lock().expect("link lock poisoned");
        inner.duplicates.is_duplicate(transmitter, sequence)
    }

    /// Validate a channel against the link's channel plan
    pub fn validate_channel(&self, channel: u8) -> Result<()> {
        if self.properties.channels.contains(&channel) {
            Ok(())
        } else {
            Err(StationError::UnsupportedChannel(channel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bss() -> BssDescription {
        BssDescription {
            bssid: [2; 6],
            ssid: b"HomeNet".to_vec(),
            channel: 6,
            beacon_interval: 100,
            capabilities: wire::CAP_ESS,
            rates: vec![0x82, 0x84],
            encryption: EncryptionType::None,
            pairwise: CipherSuite::Open,
            group: CipherSuite::Open,
            association_id: 0,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_initial_state() {
        let link = Link::new(LinkProperties::with_address([1; 6]));
        assert_eq!(link.state(), LinkState::Idle);
        assert!(link.bss().is_none());
        assert_eq!(link.address(), [1; 6]);
    }

    #[test]
    fn test_failed_entry_clears_bss_and_keys() {
        let link = Link::new(LinkProperties::default());
        link.set_bss(test_bss());
        link.install_keys(SessionKeys::Wep { key: vec![1, 2, 3, 4, 5] });
        link.set_state(LinkState::Scanning);
        link.set_state(LinkState::Failed);
        assert!(link.bss().is_none());
        assert!(link.with_keys(|keys| keys.is_none()));
    }

    #[test]
    fn test_join_claim_is_exclusive() {
        let link = Link::new(LinkProperties::default());
        link.begin_join().unwrap();
        assert!(matches!(link.begin_join(), Err(StationError::AlreadyJoining)));
        link.end_join();
        assert!(link.begin_join().is_ok());
    }

    #[test]
    fn test_channel_validation() {
        let link = Link::new(LinkProperties::default());
        assert!(link.validate_channel(6).is_ok());
        assert!(matches!(
            link.validate_channel(14),
            Err(StationError::UnsupportedChannel(14))
        ));
    }

    #[test]
    fn test_only_associated_allows_data() {
        assert!(LinkState::Associated.allows_data());
        for state in [
            LinkState::Idle,
            LinkState::Scanning,
            LinkState::Authenticating,
            LinkState::Associating,
            LinkState::KeyExchanging,
            LinkState::Disassociated,
            LinkState::Failed,
        ] {
            assert!(!state.allows_data());
        }
    }
}
