//! The join-sequence state machine
//!
//! The control flow of the join handshake is expressed as data: each phase
//! evaluates an event (a matching management frame, or the expiry of the
//! step's wait) with a pure transition function returning the next action.
//! The async driver in `station.rs` supplies transmission and the bounded
//! waits; everything here is testable without real timing.
//!
//! The frame builders for each join step live alongside the machine so a
//! phase and the request it transmits stay together.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::frame::{
    self, BeaconFields, FrameControl, MacHeader, ManagementBody, ManagementFrame,
    SequenceControl,
};
use crate::link::{BssDescription, EncryptionType, LinkProperties};
use crate::wire::{self, CipherSuite};
use crate::{Result, StationError};

/// Phases of the join sequence that wait for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Probing,
    Authenticating,
    Associating,
}

/// Event fed to a phase evaluation
#[derive(Debug)]
pub enum JoinEvent<'a> {
    /// A management frame the router matched for this phase
    Frame(&'a ManagementFrame),
    /// The phase's bounded wait expired
    TimedOut,
}

/// Result of evaluating one event in one phase
#[derive(Debug)]
pub enum PhaseOutcome {
    /// The event does not conclude this phase; keep waiting
    Continue,
    /// The phase succeeded; move on
    Advance,
    /// The join fails
    Reject(StationError),
}

/// Pure transition function of the join machine
pub fn evaluate(phase: JoinPhase, event: JoinEvent<'_>) -> PhaseOutcome {
    match (phase, event) {
        (JoinPhase::Probing, JoinEvent::Frame(_)) => PhaseOutcome::Advance,
        (JoinPhase::Probing, JoinEvent::TimedOut) => {
            PhaseOutcome::Reject(StationError::NoSuchNetwork)
        }
        (JoinPhase::Authenticating, JoinEvent::Frame(frame)) => match &frame.body {
            ManagementBody::Authentication(fields) => {
                if fields.algorithm != wire::AUTH_ALGORITHM_OPEN || fields.transaction != 2 {
                    PhaseOutcome::Continue
                } else if fields.status == wire::STATUS_SUCCESS {
                    PhaseOutcome::Advance
                } else {
                    PhaseOutcome::Reject(StationError::AuthenticationFailed(fields.status))
                }
            }
            _ => PhaseOutcome::Continue,
        },
        (JoinPhase::Associating, JoinEvent::Frame(frame)) => match &frame.body {
            ManagementBody::AssociationResponse(fields) => {
                if fields.status == wire::STATUS_SUCCESS {
                    PhaseOutcome::Advance
                } else {
                    PhaseOutcome::Reject(StationError::AssociationFailed(fields.status))
                }
            }
            _ => PhaseOutcome::Continue,
        },
        (JoinPhase::Authenticating | JoinPhase::Associating, JoinEvent::TimedOut) => {
            PhaseOutcome::Reject(StationError::Timeout)
        }
    }
}

/// Validate caller inputs before any frame is transmitted
pub fn validate_inputs(ssid: &[u8], passphrase: Option<&[u8]>) -> Result<()> {
    if ssid.is_empty() || ssid.len() > wire::MAX_SSID_LEN {
        return Err(StationError::InvalidParameter(format!(
            "SSID must be 1..={} bytes",
            wire::MAX_SSID_LEN
        )));
    }
    if let Some(passphrase) = passphrase {
        if passphrase.len() < wire::WEP40_KEY_LEN
            || passphrase.len() > wire::MAX_PASSPHRASE_LEN
        {
            return Err(StationError::InvalidParameter(format!(
                "passphrase must be {}..={} bytes",
                wire::WEP40_KEY_LEN,
                wire::MAX_PASSPHRASE_LEN
            )));
        }
    }
    Ok(())
}

/// Validate the passphrase against the security the target BSS advertises
pub fn validate_security(bss: &BssDescription, passphrase: Option<&[u8]>) -> Result<()> {
    match bss.encryption {
        EncryptionType::None => Ok(()),
        EncryptionType::Wep => match passphrase {
            Some(key)
                if key.len() == wire::WEP40_KEY_LEN || key.len() == wire::WEP104_KEY_LEN =>
            {
                Ok(())
            }
            Some(_) => Err(StationError::InvalidParameter(format!(
                "WEP keys must be {} or {} bytes",
                wire::WEP40_KEY_LEN,
                wire::WEP104_KEY_LEN
            ))),
            None => Err(StationError::InvalidParameter(
                "a passphrase is required for a protected BSS".to_string(),
            )),
        },
        EncryptionType::WpaPsk | EncryptionType::Wpa2Psk => {
            if bss.pairwise != CipherSuite::Ccmp {
                return Err(StationError::UnsupportedEncryption);
            }
            match passphrase {
                Some(passphrase)
                    if passphrase.len() >= wire::MIN_PASSPHRASE_LEN
                        && passphrase.len() <= wire::MAX_PASSPHRASE_LEN =>
                {
                    Ok(())
                }
                Some(_) => Err(StationError::InvalidParameter(format!(
                    "WPA passphrases must be {}..={} bytes",
                    wire::MIN_PASSPHRASE_LEN,
                    wire::MAX_PASSPHRASE_LEN
                ))),
                None => Err(StationError::InvalidParameter(
                    "a passphrase is required for a protected BSS".to_string(),
                )),
            }
        }
    }
}

/// Build the BSS snapshot from a matching beacon or probe response.
///
/// Returns `None` when the advertisement is missing the fields a join
/// needs (it is then ignored and the scan keeps waiting).
pub fn bss_from_advertisement(
    frame: &ManagementFrame,
    fallback_channel: u8,
) -> Option<BssDescription> {
    let fields: &BeaconFields = match &frame.body {
        ManagementBody::Beacon(fields) | ManagementBody::ProbeResponse(fields) => fields,
        _ => return None,
    };
    let ssid = fields.elements.ssid.clone()?;
    let security = fields.elements.security(fields.capabilities);
    Some(BssDescription {
        bssid: frame.bssid(),
        ssid,
        channel: fields.elements.channel.unwrap_or(fallback_channel),
        beacon_interval: fields.beacon_interval,
        capabilities: fields.capabilities,
        rates: fields.elements.rates.clone(),
        encryption: security.encryption,
        pairwise: security.pairwise,
        group: security.group,
        association_id: 0,
        last_seen: Utc::now(),
    })
}

fn management_header(
    subtype: u8,
    addr1: [u8; 6],
    addr2: [u8; 6],
    addr3: [u8; 6],
    sequence: u16,
) -> MacHeader {
    MacHeader {
        frame_control: FrameControl::management(subtype),
        duration: 0,
        addr1,
        addr2,
        addr3,
        sequence_control: SequenceControl::new(sequence),
    }
}

/// Build a directed probe request for the given SSID
pub fn probe_request(properties: &LinkProperties, ssid: &[u8], sequence: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 64);
    management_header(
        wire::SUBTYPE_PROBE_REQUEST,
        wire::BROADCAST_ADDRESS,
        properties.address,
        wire::BROADCAST_ADDRESS,
        sequence,
    )
    .serialize(&mut buf);
    frame::write_element(&mut buf, wire::ELEMENT_SSID, ssid);
    frame::write_element(&mut buf, wire::ELEMENT_SUPPORTED_RATES, &properties.rates);
    buf.freeze()
}

/// Build an open-system authentication request (transaction 1)
pub fn authentication_request(station: [u8; 6], bssid: [u8; 6], sequence: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 6);
    management_header(wire::SUBTYPE_AUTHENTICATION, bssid, station, bssid, sequence)
        .serialize(&mut buf);
    buf.put_u16_le(wire::AUTH_ALGORITHM_OPEN);
    buf.put_u16_le(1);
    buf.put_u16_le(wire::STATUS_SUCCESS);
    buf.freeze()
}

/// Build an association request carrying the link's capabilities
pub fn association_request(
    properties: &LinkProperties,
    bss: &BssDescription,
    sequence: u16,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 96);
    management_header(
        wire::SUBTYPE_ASSOC_REQUEST,
        bss.bssid,
        properties.address,
        bss.bssid,
        sequence,
    )
    .serialize(&mut buf);

    let mut capabilities = properties.capabilities | wire::CAP_ESS;
    if bss.encryption.requires_passphrase() {
        capabilities |= wire::CAP_PRIVACY;
    }
    buf.put_u16_le(capabilities);
    buf.put_u16_le(properties.listen_interval);
    frame::write_element(&mut buf, wire::ELEMENT_SSID, &bss.ssid);
    frame::write_element(&mut buf, wire::ELEMENT_SUPPORTED_RATES, &properties.rates);
    match bss.encryption {
        EncryptionType::Wpa2Psk => {
            frame::write_element(&mut buf, wire::ELEMENT_RSN, &rsn_element());
        }
        EncryptionType::WpaPsk => {
            frame::write_element(&mut buf, wire::ELEMENT_VENDOR, &wpa_element());
        }
        _ => {}
    }
    buf.freeze()
}

/// RSN element body advertising CCMP pairwise/group and PSK key management
pub(crate) fn rsn_element() -> Vec<u8> {
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::RSN_OUI);
    body.push(wire::RSN_CIPHER_CCMP);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::RSN_OUI);
    body.push(wire::RSN_CIPHER_CCMP);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::RSN_OUI);
    body.push(wire::RSN_AKM_PSK);
    body.extend_from_slice(&0u16.to_le_bytes());
    body
}

/// Legacy WPA vendor element body (CCMP pairwise, PSK key management)
pub(crate) fn wpa_element() -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(&wire::WPA_OUI);
    body.push(wire::WPA_VENDOR_TYPE);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::WPA_OUI);
    body.push(wire::WPA_CIPHER_CCMP);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::WPA_OUI);
    body.push(wire::WPA_CIPHER_CCMP);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&wire::WPA_OUI);
    body.push(wire::WPA_AKM_PSK);
    body
}
