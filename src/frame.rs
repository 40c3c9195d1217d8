//! 802.11 frame codec
//!
//! Decoding produces a typed view discriminating management, control and
//! data frames (with the specific management subtype and a parsed body);
//! encoding is the inverse. Every length is checked before use; malformed
//! input yields an error, never a panic.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::link::EncryptionType;
use crate::wire::{self, CipherSuite};
use crate::{Result, StationError};

/// Frame-control field of a MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameControl(pub u16);

impl FrameControl {
    /// Build a frame-control field for a management frame
    pub fn management(subtype: u8) -> Self {
        Self(((wire::TYPE_MANAGEMENT as u16) << 2) | ((subtype as u16) << 4))
    }

    /// Build a frame-control field for a control frame
    pub fn control(subtype: u8) -> Self {
        Self(((wire::TYPE_CONTROL as u16) << 2) | ((subtype as u16) << 4))
    }

    /// Build a frame-control field for a station-to-AP data frame
    pub fn data_to_ds(protected: bool) -> Self {
        let mut value = ((wire::TYPE_DATA as u16) << 2) | wire::FC_TO_DS;
        if protected {
            value |= wire::FC_PROTECTED;
        }
        Self(value)
    }

    /// Protocol version (must be zero)
    pub fn version(&self) -> u8 {
        (self.0 & 0x3) as u8
    }

    /// Frame type bits
    pub fn frame_type(&self) -> u8 {
        ((self.0 >> 2) & 0x3) as u8
    }

    /// Frame subtype bits
    pub fn subtype(&self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    pub fn to_ds(&self) -> bool {
        self.0 & wire::FC_TO_DS != 0
    }

    pub fn from_ds(&self) -> bool {
        self.0 & wire::FC_FROM_DS != 0
    }

    pub fn retry(&self) -> bool {
        self.0 & wire::FC_RETRY != 0
    }

    pub fn protected(&self) -> bool {
        self.0 & wire::FC_PROTECTED != 0
    }
}

/// Sequence-control field: a 12-bit sequence number and 4-bit fragment number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceControl {
    pub sequence: u16,
    pub fragment: u8,
}

impl SequenceControl {
    pub fn new(sequence: u16) -> Self {
        Self { sequence: sequence & 0x0fff, fragment: 0 }
    }

    fn from_raw(raw: u16) -> Self {
        Self { sequence: (raw >> 4) & 0x0fff, fragment: (raw & 0xf) as u8 }
    }

    fn to_raw(self) -> u16 {
        (self.sequence << 4) | (self.fragment as u16 & 0xf)
    }
}

/// Fixed 24-byte MAC header shared by management and data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacHeader {
    pub frame_control: FrameControl,
    pub duration: u16,
    pub addr1: [u8; 6],
    pub addr2: [u8; 6],
    pub addr3: [u8; 6],
    pub sequence_control: SequenceControl,
}

impl MacHeader {
    /// Parse a MAC header from the front of a frame
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < wire::MAC_HEADER_LEN {
            return Err(StationError::MalformedFrame(
                "frame too short for MAC header".to_string(),
            ));
        }
        let frame_control = FrameControl(buf.get_u16_le());
        let duration = buf.get_u16_le();
        let mut addr1 = [0u8; 6];
        let mut addr2 = [0u8; 6];
        let mut addr3 = [0u8; 6];
        buf.copy_to_slice(&mut addr1);
        buf.copy_to_slice(&mut addr2);
        buf.copy_to_slice(&mut addr3);
        let sequence_control = SequenceControl::from_raw(buf.get_u16_le());
        Ok(Self { frame_control, duration, addr1, addr2, addr3, sequence_control })
    }

    /// Serialize the MAC header
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.frame_control.0);
        buf.put_u16_le(self.duration);
        buf.put_slice(&self.addr1);
        buf.put_slice(&self.addr2);
        buf.put_slice(&self.addr3);
        buf.put_u16_le(self.sequence_control.to_raw());
    }
}

/// Management frame subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementSubtype {
    AssociationRequest,
    AssociationResponse,
    ProbeRequest,
    ProbeResponse,
    Beacon,
    Disassociation,
    Authentication,
    Deauthentication,
    Unknown(u8),
}

impl From<u8> for ManagementSubtype {
    fn from(value: u8) -> Self {
        match value {
            wire::SUBTYPE_ASSOC_REQUEST => Self::AssociationRequest,
            wire::SUBTYPE_ASSOC_RESPONSE => Self::AssociationResponse,
            wire::SUBTYPE_PROBE_REQUEST => Self::ProbeRequest,
            wire::SUBTYPE_PROBE_RESPONSE => Self::ProbeResponse,
            wire::SUBTYPE_BEACON => Self::Beacon,
            wire::SUBTYPE_DISASSOCIATION => Self::Disassociation,
            wire::SUBTYPE_AUTHENTICATION => Self::Authentication,
            wire::SUBTYPE_DEAUTHENTICATION => Self::Deauthentication,
            other => Self::Unknown(other),
        }
    }
}

impl From<ManagementSubtype> for u8 {
    fn from(subtype: ManagementSubtype) -> Self {
        match subtype {
            ManagementSubtype::AssociationRequest => wire::SUBTYPE_ASSOC_REQUEST,
            ManagementSubtype::AssociationResponse => wire::SUBTYPE_ASSOC_RESPONSE,
            ManagementSubtype::ProbeRequest => wire::SUBTYPE_PROBE_REQUEST,
            ManagementSubtype::ProbeResponse => wire::SUBTYPE_PROBE_RESPONSE,
            ManagementSubtype::Beacon => wire::SUBTYPE_BEACON,
            ManagementSubtype::Disassociation => wire::SUBTYPE_DISASSOCIATION,
            ManagementSubtype::Authentication => wire::SUBTYPE_AUTHENTICATION,
            ManagementSubtype::Deauthentication => wire::SUBTYPE_DEAUTHENTICATION,
            ManagementSubtype::Unknown(value) => value,
        }
    }
}

/// Control frame subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSubtype {
    PsPoll,
    Rts,
    Cts,
    Ack,
    Unknown(u8),
}

impl From<u8> for ControlSubtype {
    fn from(value: u8) -> Self {
        match value {
            wire::SUBTYPE_PS_POLL => Self::PsPoll,
            wire::SUBTYPE_RTS => Self::Rts,
            wire::SUBTYPE_CTS => Self::Cts,
            wire::SUBTYPE_ACK => Self::Ack,
            other => Self::Unknown(other),
        }
    }
}

/// Information elements collected from a management-frame body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Elements {
    pub ssid: Option<Vec<u8>>,
    pub rates: Vec<u8>,
    pub channel: Option<u8>,
    pub rsn: Option<Vec<u8>>,
    pub wpa: Option<Vec<u8>>,
}

impl Elements {
    /// Parse the element list trailing a management-frame body.
    ///
    /// Unknown elements are skipped; a truncated element is an error.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let mut elements = Elements::default();
        while !data.is_empty() {
            if data.len() < 2 {
                return Err(StationError::MalformedFrame(
                    "truncated information element header".to_string(),
                ));
            }
            let id = data[0];
            let len = data[1] as usize;
            if data.len() < 2 + len {
                return Err(StationError::MalformedFrame(format!(
                    "information element {id} overruns frame body"
                )));
            }
            let value = &data[2..2 + len];
            match id {
                wire::ELEMENT_SSID => {
                    if len <= wire::MAX_SSID_LEN {
                        elements.ssid = Some(value.to_vec());
                    }
                }
                wire::ELEMENT_SUPPORTED_RATES | wire::ELEMENT_EXTENDED_RATES => {
                    elements.rates.extend_from_slice(value);
                }
                wire::ELEMENT_DS_PARAMS => {
                    if len == 1 {
                        elements.channel = Some(value[0]);
                    }
                }
                wire::ELEMENT_RSN => {
                    elements.rsn = Some(value.to_vec());
                }
                wire::ELEMENT_VENDOR => {
                    if len >= 4 && value[..3] == wire::WPA_OUI && value[3] == wire::WPA_VENDOR_TYPE
                    {
                        elements.wpa = Some(value[4..].to_vec());
                    }
                }
                _ => {}
            }
            data = &data[2 + len..];
        }
        Ok(elements)
    }

    /// Classify the security parameters advertised by a beacon or probe
    /// response with the given capability field.
    pub fn security(&self, capabilities: u16) -> SecurityInfo {
        if let Some(rsn) = &self.rsn {
            if let Ok(info) = parse_cipher_body(rsn, CipherSuite::from_rsn_selector) {
                return SecurityInfo {
                    encryption: EncryptionType::Wpa2Psk,
                    pairwise: info.0,
                    group: info.1,
                };
            }
        }
        if let Some(wpa) = &self.wpa {
            if let Ok(info) = parse_cipher_body(wpa, CipherSuite::from_wpa_selector) {
                return SecurityInfo {
                    encryption: EncryptionType::WpaPsk,
                    pairwise: info.0,
                    group: info.1,
                };
            }
        }
        if capabilities & wire::CAP_PRIVACY != 0 {
            return SecurityInfo {
                encryption: EncryptionType::Wep,
                pairwise: CipherSuite::Wep,
                group: CipherSuite::Wep,
            };
        }
        SecurityInfo {
            encryption: EncryptionType::None,
            pairwise: CipherSuite::Open,
            group: CipherSuite::Open,
        }
    }
}

/// Security parameters recovered from advertisement elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityInfo {
    pub encryption: EncryptionType,
    pub pairwise: CipherSuite,
    pub group: CipherSuite,
}

/// Parse the shared RSN/WPA body shape: version, group suite, pairwise list.
///
/// The station only needs the strongest pairwise suite and the group suite;
/// AKM and capability fields beyond them are ignored.
fn parse_cipher_body(
    body: &[u8],
    selector: fn(&[u8]) -> Option<CipherSuite>,
) -> Result<(CipherSuite, CipherSuite)> {
    let mut buf = body;
    if buf.remaining() < 2 + 4 + 2 {
        return Err(StationError::MalformedFrame(
            "truncated cipher suite body".to_string(),
        ));
    }
    let version = buf.get_u16_le();
    if version != 1 {
        return Err(StationError::MalformedFrame(format!(
            "unsupported RSN/WPA version {version}"
        )));
    }
    let mut group_selector = [0u8; 4];
    buf.copy_to_slice(&mut group_selector);
    let group = selector(&group_selector).unwrap_or(CipherSuite::Open);
    let pairwise_count = buf.get_u16_le() as usize;
    if buf.remaining() < pairwise_count * 4 {
        return Err(StationError::MalformedFrame(
            "pairwise suite list overruns element".to_string(),
        ));
    }
    let mut pairwise = CipherSuite::Open;
    for _ in 0..pairwise_count {
        let mut suite = [0u8; 4];
        buf.copy_to_slice(&mut suite);
        match selector(&suite) {
            // Prefer CCMP whenever it is offered.
            Some(CipherSuite::Ccmp) => pairwise = CipherSuite::Ccmp,
            Some(suite) if pairwise == CipherSuite::Open => pairwise = suite,
            _ => {}
        }
    }
    Ok((pairwise, group))
}

/// Append one information element to a frame body under construction
pub fn write_element(buf: &mut impl BufMut, id: u8, value: &[u8]) {
    debug_assert!(value.len() <= u8::MAX as usize);
    buf.put_u8(id);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

/// Fixed fields + elements of a beacon or probe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconFields {
    pub timestamp: u64,
    pub beacon_interval: u16,
    pub capabilities: u16,
    pub elements: Elements,
}

/// Body of an authentication frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationFields {
    pub algorithm: u16,
    pub transaction: u16,
    pub status: u16,
}

/// Body of an association response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationResponseFields {
    pub capabilities: u16,
    pub status: u16,
    pub association_id: u16,
    pub elements: Elements,
}

/// Typed management-frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementBody {
    Beacon(BeaconFields),
    ProbeResponse(BeaconFields),
    ProbeRequest(Elements),
    Authentication(AuthenticationFields),
    AssociationResponse(AssociationResponseFields),
    Disassociation { reason: u16 },
    Deauthentication { reason: u16 },
    Other(Bytes),
}

/// Decoded management frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementFrame {
    pub header: MacHeader,
    pub subtype: ManagementSubtype,
    pub body: ManagementBody,
}

impl ManagementFrame {
    /// BSSID of the frame (address 3 for infrastructure management frames)
    pub fn bssid(&self) -> [u8; 6] {
        self.header.addr3
    }

    /// Transmitter address
    pub fn transmitter(&self) -> [u8; 6] {
        self.header.addr2
    }

    /// SSID carried by the frame's elements, if any
    pub fn ssid(&self) -> Option<&[u8]> {
        match &self.body {
            ManagementBody::Beacon(fields) | ManagementBody::ProbeResponse(fields) => {
                fields.elements.ssid.as_deref()
            }
            ManagementBody::ProbeRequest(elements) => elements.ssid.as_deref(),
            _ => None,
        }
    }

    fn parse_body(
        subtype: ManagementSubtype,
        header: MacHeader,
        body: &[u8],
    ) -> Result<Self> {
        let mut buf = body;
        let parsed = match subtype {
            ManagementSubtype::Beacon | ManagementSubtype::ProbeResponse => {
                if buf.remaining() < 12 {
                    return Err(StationError::MalformedFrame(
                        "truncated beacon body".to_string(),
                    ));
                }
                let timestamp = buf.get_u64_le();
                let beacon_interval = buf.get_u16_le();
                let capabilities = buf.get_u16_le();
                let elements = Elements::parse(buf)?;
                let fields = BeaconFields { timestamp, beacon_interval, capabilities, elements };
                if subtype == ManagementSubtype::Beacon {
                    ManagementBody::Beacon(fields)
                } else {
                    ManagementBody::ProbeResponse(fields)
                }
            }
            ManagementSubtype::ProbeRequest => ManagementBody::ProbeRequest(Elements::parse(buf)?),
            ManagementSubtype::Authentication => {
                if buf.remaining() < 6 {
                    return Err(StationError::MalformedFrame(
                        "truncated authentication body".to_string(),
                    ));
                }
                ManagementBody::Authentication(AuthenticationFields {
                    algorithm: buf.get_u16_le(),
                    transaction: buf.get_u16_le(),
                    status: buf.get_u16_le(),
                })
            }
            ManagementSubtype::AssociationResponse => {
                if buf.remaining() < 6 {
                    return Err(StationError::MalformedFrame(
                        "truncated association response body".to_string(),
                    ));
                }
                let capabilities = buf.get_u16_le();
                let status = buf.get_u16_le();
                let association_id = buf.get_u16_le() & 0x3fff;
                let elements = Elements::parse(buf)?;
                ManagementBody::AssociationResponse(AssociationResponseFields {
                    capabilities,
                    status,
                    association_id,
                    elements,
                })
            }
            ManagementSubtype::Disassociation | ManagementSubtype::Deauthentication => {
                if buf.remaining() < 2 {
                    return Err(StationError::MalformedFrame(
                        "truncated reason code".to_string(),
                    ));
                }
                let reason = buf.get_u16_le();
                if subtype == ManagementSubtype::Disassociation {
                    ManagementBody::Disassociation { reason }
                } else {
                    ManagementBody::Deauthentication { reason }
                }
            }
            _ => ManagementBody::Other(Bytes::copy_from_slice(body)),
        };
        Ok(Self { header, subtype, body: parsed })
    }
}

/// Decoded control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub subtype: ControlSubtype,
    pub receiver: [u8; 6],
    pub transmitter: Option<[u8; 6]>,
}

/// Decoded data frame; the body (possibly still enciphered) starts after
/// the MAC header and any QoS-control field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub header: MacHeader,
    pub body: Bytes,
}

impl DataFrame {
    /// Destination address according to the DS bits
    pub fn destination(&self) -> [u8; 6] {
        if self.header.frame_control.from_ds() {
            self.header.addr1
        } else if self.header.frame_control.to_ds() {
            self.header.addr3
        } else {
            self.header.addr1
        }
    }

    /// Source address according to the DS bits
    pub fn source(&self) -> [u8; 6] {
        if self.header.frame_control.from_ds() {
            self.header.addr3
        } else {
            self.header.addr2
        }
    }

    /// Transmitter address (always address 2)
    pub fn transmitter(&self) -> [u8; 6] {
        self.header.addr2
    }
}

/// A typed view over a received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Management(ManagementFrame),
    Control(ControlFrame),
    Data(DataFrame),
}

impl Frame {
    /// Parse a received frame into its typed view.
    ///
    /// Validates the minimum header length and the frame-control field
    /// before anything else is read.
    pub fn parse(data: &[u8]) -> Result<Frame> {
        if data.len() < 2 {
            return Err(StationError::MalformedFrame(
                "frame shorter than frame control".to_string(),
            ));
        }
        if data.len() > wire::MAX_FRAME_LEN {
            return Err(StationError::MalformedFrame(format!(
                "oversized frame of {} bytes",
                data.len()
            )));
        }
        let frame_control = FrameControl(u16::from_le_bytes([data[0], data[1]]));
        if frame_control.version() != 0 {
            return Err(StationError::MalformedFrame(format!(
                "unsupported protocol version {}",
                frame_control.version()
            )));
        }
        match frame_control.frame_type() {
            wire::TYPE_MANAGEMENT => {
                let mut buf = data;
                let header = MacHeader::parse(&mut buf)?;
                let subtype = ManagementSubtype::from(frame_control.subtype());
                Ok(Frame::Management(ManagementFrame::parse_body(subtype, header, buf)?))
            }
            wire::TYPE_CONTROL => {
                if data.len() < wire::ACK_FRAME_LEN {
                    return Err(StationError::MalformedFrame(
                        "control frame too short".to_string(),
                    ));
                }
                let mut receiver = [0u8; 6];
                receiver.copy_from_slice(&data[4..10]);
                let transmitter = if data.len() >= 16 {
                    let mut addr = [0u8; 6];
                    addr.copy_from_slice(&data[10..16]);
                    Some(addr)
                } else {
                    None
                };
                Ok(Frame::Control(ControlFrame {
                    subtype: ControlSubtype::from(frame_control.subtype()),
                    receiver,
                    transmitter,
                }))
            }
            wire::TYPE_DATA => {
                let mut buf = data;
                let header = MacHeader::parse(&mut buf)?;
                if header.frame_control.to_ds() && header.frame_control.from_ds() {
                    return Err(StationError::MalformedFrame(
                        "four-address data frames are not supported".to_string(),
                    ));
                }
                // QoS data subtypes carry a 2-byte QoS control field.
                if frame_control.subtype() & 0x8 != 0 {
                    if buf.remaining() < 2 {
                        return Err(StationError::MalformedFrame(
                            "truncated QoS control field".to_string(),
                        ));
                    }
                    buf.advance(2);
                }
                Ok(Frame::Data(DataFrame {
                    header,
                    body: Bytes::copy_from_slice(buf),
                }))
            }
            other => Err(StationError::MalformedFrame(format!(
                "unknown frame type {other}"
            ))),
        }
    }
}
