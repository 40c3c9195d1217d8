//! # station80211
//!
//! An IEEE 802.11 client-station protocol engine. It drives a link through
//! scanning, authentication, association and (for protected networks) the
//! EAPOL 4-way key exchange, and thereafter classifies, encapsulates and
//! decapsulates every management, control and data frame crossing the link.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `wire`: 802.11/802.2 wire-format constants and the LLC/SNAP codec
//! - `frame`: MAC header and management-frame body codec
//! - `sequence`: transmit sequence allocation and duplicate detection
//! - `config`: station configuration
//! - `device`: trait seams to the radio below and the network stack above
//! - `router`: management-frame routing to waiters and indication queues
//! - `link`: per-link state, BSS snapshot and session keys
//! - `join`: the typed join-sequence state machine
//! - `eapol`: the WPA/WPA2-PSK 4-way handshake engine
//! - `cipher`: CCMP/WEP data-frame protection
//! - `data`: the data-frame encapsulation/decapsulation path
//! - `station`: the engine facade tying the pieces together
//! - `sim`: a simulated access point for demos and scenario tests

pub mod cipher;
pub mod config;
pub mod data;
pub mod device;
pub mod eapol;
pub mod frame;
pub mod join;
pub mod link;
pub mod router;
pub mod sequence;
pub mod sim;
pub mod station;
pub mod wire;

// Re-export commonly used types
pub use crate::{
    config::StationConfig,
    device::{LinkId, PayloadSink, RadioDevice},
    eapol::EapolEngine,
    frame::{Frame, ManagementFrame, ManagementSubtype},
    link::{BssDescription, EncryptionType, LinkProperties, LinkState},
    station::{Station, StationStats},
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("no network found for the requested SSID")]
    NoSuchNetwork,

    #[error("authentication rejected by the access point (status {0})")]
    AuthenticationFailed(u16),

    #[error("association rejected by the access point (status {0})")]
    AssociationFailed(u16),

    #[error("key exchange timed out")]
    HandshakeTimeout,

    #[error("key exchange integrity check failed")]
    HandshakeIntegrityFailure,

    #[error("a join is already in progress on this link")]
    AlreadyJoining,

    #[error("link is not associated")]
    LinkNotAssociated,

    #[error("unsupported channel: {0}")]
    UnsupportedChannel(u8),

    #[error("the BSS offers no encryption suite this station supports")]
    UnsupportedEncryption,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for station operations
pub type Result<T> = std::result::Result<T, StationError>;
