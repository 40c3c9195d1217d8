//! 802.11 and 802.2 wire-format tables
//!
//! Constants and small codecs shared by the frame codec, the data path and
//! the key-exchange engine: frame-control layout, subtype numbers, status
//! and reason codes, information-element identifiers, cipher suite
//! selectors, and the LLC/SNAP header used to tunnel upper-layer protocols
//! inside data frames.

use bytes::{Buf, BufMut};

use crate::{Result, StationError};

/// Maximum frame size accepted on the receive path
pub const MAX_FRAME_LEN: usize = 2346;

/// Length of the fixed management/data MAC header
pub const MAC_HEADER_LEN: usize = 24;

/// Length of an acknowledgment control frame
pub const ACK_FRAME_LEN: usize = 10;

/// Length of the 802.2 LLC/SNAP header
pub const LLC_SNAP_LEN: usize = 8;

/// The data-link broadcast address
pub const BROADCAST_ADDRESS: [u8; 6] = [0xff; 6];

/// Maximum SSID length in bytes
pub const MAX_SSID_LEN: usize = 32;

/// WPA/WPA2 passphrase length bounds
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 63;

/// WEP key lengths (40-bit and 104-bit)
pub const WEP40_KEY_LEN: usize = 5;
pub const WEP104_KEY_LEN: usize = 13;

/// Frame types (frame-control bits 2-3)
pub const TYPE_MANAGEMENT: u8 = 0;
pub const TYPE_CONTROL: u8 = 1;
pub const TYPE_DATA: u8 = 2;

/// Management frame subtypes
pub const SUBTYPE_ASSOC_REQUEST: u8 = 0;
pub const SUBTYPE_ASSOC_RESPONSE: u8 = 1;
pub const SUBTYPE_PROBE_REQUEST: u8 = 4;
pub const SUBTYPE_PROBE_RESPONSE: u8 = 5;
pub const SUBTYPE_BEACON: u8 = 8;
pub const SUBTYPE_DISASSOCIATION: u8 = 10;
pub const SUBTYPE_AUTHENTICATION: u8 = 11;
pub const SUBTYPE_DEAUTHENTICATION: u8 = 12;

/// Control frame subtypes
pub const SUBTYPE_PS_POLL: u8 = 10;
pub const SUBTYPE_RTS: u8 = 11;
pub const SUBTYPE_CTS: u8 = 12;
pub const SUBTYPE_ACK: u8 = 13;

/// Frame-control flag bits
pub const FC_TO_DS: u16 = 0x0100;
pub const FC_FROM_DS: u16 = 0x0200;
pub const FC_MORE_FRAGMENTS: u16 = 0x0400;
pub const FC_RETRY: u16 = 0x0800;
pub const FC_PROTECTED: u16 = 0x4000;
pub const FC_ORDER: u16 = 0x8000;

/// Capability-field bits
pub const CAP_ESS: u16 = 0x0001;
pub const CAP_IBSS: u16 = 0x0002;
pub const CAP_PRIVACY: u16 = 0x0010;
pub const CAP_SHORT_PREAMBLE: u16 = 0x0020;

/// Authentication algorithms
pub const AUTH_ALGORITHM_OPEN: u16 = 0;

/// Management status codes
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_UNSPECIFIED_FAILURE: u16 = 1;
pub const STATUS_CAPS_UNSUPPORTED: u16 = 10;
pub const STATUS_DENIED: u16 = 17;

/// Reason codes for deauthentication/disassociation
pub const REASON_UNSPECIFIED: u16 = 1;
pub const REASON_DEAUTH_LEAVING: u16 = 3;
pub const REASON_DISASSOC_LEAVING: u16 = 8;

/// Information element identifiers
pub const ELEMENT_SSID: u8 = 0;
pub const ELEMENT_SUPPORTED_RATES: u8 = 1;
pub const ELEMENT_DS_PARAMS: u8 = 3;
pub const ELEMENT_RSN: u8 = 48;
pub const ELEMENT_EXTENDED_RATES: u8 = 50;
pub const ELEMENT_VENDOR: u8 = 221;

/// Upper-layer protocol numbers carried in the SNAP header
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_EAPOL: u16 = 0x888e;

/// RSN (802.11i) suite selectors, OUI 00-0F-AC
pub const RSN_OUI: [u8; 3] = [0x00, 0x0f, 0xac];
pub const RSN_CIPHER_TKIP: u8 = 2;
pub const RSN_CIPHER_CCMP: u8 = 4;
pub const RSN_AKM_PSK: u8 = 2;

/// Legacy WPA vendor suite selectors, OUI 00-50-F2
pub const WPA_OUI: [u8; 3] = [0x00, 0x50, 0xf2];
pub const WPA_VENDOR_TYPE: u8 = 1;
pub const WPA_CIPHER_TKIP: u8 = 2;
pub const WPA_CIPHER_CCMP: u8 = 4;
pub const WPA_AKM_PSK: u8 = 2;

/// CCMP expansion sizes
pub const CCMP_HEADER_LEN: usize = 8;
pub const CCMP_MIC_LEN: usize = 8;

/// WEP expansion sizes
pub const WEP_HEADER_LEN: usize = 4;
pub const WEP_ICV_LEN: usize = 4;

/// Pairwise/group cipher negotiated for a BSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CipherSuite {
    /// No cipher
    Open,
    /// WEP (RC4 with a static key)
    Wep,
    /// TKIP (not implemented by this station)
    Tkip,
    /// CCMP (AES-CCM)
    Ccmp,
}

impl CipherSuite {
    /// Map an RSN suite selector to a cipher suite
    pub fn from_rsn_selector(selector: &[u8]) -> Option<Self> {
        if selector.len() != 4 || selector[..3] != RSN_OUI {
            return None;
        }
        match selector[3] {
            RSN_CIPHER_TKIP => Some(CipherSuite::Tkip),
            RSN_CIPHER_CCMP => Some(CipherSuite::Ccmp),
            _ => None,
        }
    }

    /// Map a legacy WPA vendor suite selector to a cipher suite
    pub fn from_wpa_selector(selector: &[u8]) -> Option<Self> {
        if selector.len() != 4 || selector[..3] != WPA_OUI {
            return None;
        }
        match selector[3] {
            WPA_CIPHER_TKIP => Some(CipherSuite::Tkip),
            WPA_CIPHER_CCMP => Some(CipherSuite::Ccmp),
            _ => None,
        }
    }
}

/// 802.2 LLC/SNAP header carrying an upper-layer protocol number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapHeader {
    pub protocol: u16,
}

impl SnapHeader {
    const DSAP_SNAP: u8 = 0xaa;
    const CONTROL_UI: u8 = 0x03;

    /// Create a SNAP header for the given protocol number
    pub fn new(protocol: u16) -> Self {
        Self { protocol }
    }

    /// Parse a SNAP header from the front of a data-frame body
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < LLC_SNAP_LEN {
            return Err(StationError::MalformedFrame(
                "insufficient data for LLC/SNAP header".to_string(),
            ));
        }
        let dsap = buf.get_u8();
        let ssap = buf.get_u8();
        let control = buf.get_u8();
        let mut oui = [0u8; 3];
        buf.copy_to_slice(&mut oui);
        let protocol = buf.get_u16();
        if dsap != Self::DSAP_SNAP || ssap != Self::DSAP_SNAP || control != Self::CONTROL_UI {
            return Err(StationError::MalformedFrame(format!(
                "unexpected LLC header {dsap:02x}/{ssap:02x}/{control:02x}"
            )));
        }
        if oui != [0, 0, 0] {
            return Err(StationError::MalformedFrame(format!(
                "unsupported SNAP OUI {oui:02x?}"
            )));
        }
        Ok(Self { protocol })
    }

    /// Serialize the SNAP header
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::DSAP_SNAP);
        buf.put_u8(Self::DSAP_SNAP);
        buf.put_u8(Self::CONTROL_UI);
        buf.put_slice(&[0, 0, 0]);
        buf.put_u16(self.protocol);
    }
}

/// Format a MAC address for log output
pub fn format_address(address: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        address[0], address[1], address[2], address[3], address[4], address[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_round_trip() {
        let mut buf = Vec::new();
        SnapHeader::new(ETHERTYPE_IPV4).serialize(&mut buf);
        assert_eq!(buf.len(), LLC_SNAP_LEN);

        let parsed = SnapHeader::parse(&mut &buf[..]).unwrap();
        assert_eq!(parsed.protocol, ETHERTYPE_IPV4);
    }

    #[test]
    fn test_snap_rejects_truncated() {
        let buf = [0xaa, 0xaa, 0x03];
        assert!(SnapHeader::parse(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_snap_rejects_non_snap_llc() {
        let buf = [0x42, 0x42, 0x03, 0, 0, 0, 0x08, 0x00];
        assert!(SnapHeader::parse(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_cipher_suite_selectors() {
        assert_eq!(
            CipherSuite::from_rsn_selector(&[0x00, 0x0f, 0xac, 4]),
            Some(CipherSuite::Ccmp)
        );
        assert_eq!(
            CipherSuite::from_rsn_selector(&[0x00, 0x0f, 0xac, 2]),
            Some(CipherSuite::Tkip)
        );
        assert_eq!(CipherSuite::from_rsn_selector(&[0x00, 0x50, 0xf2, 4]), None);
        assert_eq!(
            CipherSuite::from_wpa_selector(&[0x00, 0x50, 0xf2, 4]),
            Some(CipherSuite::Ccmp)
        );
    }

    #[test]
    fn test_format_address() {
        assert_eq!(
            format_address(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            "de:ad:be:ef:00:01"
        );
    }
}
