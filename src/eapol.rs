//! WPA/WPA2-PSK key exchange (EAPOL)
//!
//! Once a protected association completes, the [`EapolEngine`] drives the
//! supplicant side of the 4-way handshake: message 1 delivers the
//! authenticator nonce, message 2 returns the station nonce under a MIC,
//! message 3 delivers the group key (validated against the derived key),
//! and message 4 acknowledges. The derived pairwise/group temporal keys
//! are then installed for the data path.
//!
//! The engine is an explicitly constructed process-wide subsystem: its
//! registry of in-flight handshakes has its own lock, independent of any
//! link's lock, so unrelated links never serialize. Cryptographic
//! primitives (PBKDF2, HMAC, AES key wrap, RC4) come from library crates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use tokio::sync::mpsc;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::device::LinkId;
use crate::link::{CcmpKeyState, SessionKeys};
use crate::{Result, StationError};

/// EAPOL protocol version transmitted by this station
pub const EAPOL_VERSION: u8 = 2;

/// EAPOL packet type for key frames
pub const EAPOL_TYPE_KEY: u8 = 3;

/// Key descriptor types
pub const DESCRIPTOR_TYPE_RSN: u8 = 2;
pub const DESCRIPTOR_TYPE_WPA: u8 = 254;

/// Key-information descriptor versions
pub const KEY_VERSION_MD5_RC4: u16 = 1;
pub const KEY_VERSION_SHA1_AES: u16 = 2;

pub const KEY_INFO_TYPE_PAIRWISE: u16 = 1 << 3;
pub const KEY_INFO_INSTALL: u16 = 1 << 6;
pub const KEY_INFO_ACK: u16 = 1 << 7;
pub const KEY_INFO_MIC: u16 = 1 << 8;
pub const KEY_INFO_SECURE: u16 = 1 << 9;
pub const KEY_INFO_ENCRYPTED_DATA: u16 = 1 << 12;

/// Fixed part of a key descriptor, between the EAPOL header and key data
const KEY_DESCRIPTOR_LEN: usize = 95;

/// GTK key-data encapsulation type under the RSN OUI
const KDE_TYPE_GTK: u8 = 1;

/// Key-information field of an EAPOL-Key frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo(pub u16);

impl KeyInfo {
    /// Key descriptor version (bits 0-2)
    pub fn descriptor_version(&self) -> u16 {
        self.0 & 0x7
    }

    /// Pairwise (true) or group (false) key frame
    pub fn pairwise(&self) -> bool {
        self.0 & KEY_INFO_TYPE_PAIRWISE != 0
    }

    pub fn install(&self) -> bool {
        self.0 & KEY_INFO_INSTALL != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & KEY_INFO_ACK != 0
    }

    pub fn mic(&self) -> bool {
        self.0 & KEY_INFO_MIC != 0
    }

    pub fn secure(&self) -> bool {
        self.0 & KEY_INFO_SECURE != 0
    }

    pub fn encrypted_data(&self) -> bool {
        self.0 & KEY_INFO_ENCRYPTED_DATA != 0
    }
}

/// One EAPOL-Key frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFrame {
    pub descriptor_type: u8,
    pub key_info: KeyInfo,
    pub key_length: u16,
    pub replay_counter: u64,
    pub nonce: [u8; 32],
    pub key_iv: [u8; 16],
    pub key_rsc: u64,
    pub key_mic: [u8; 16],
    pub key_data: Vec<u8>,
}

impl KeyFrame {
    /// Parse an EAPOL-Key frame from a data-frame payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(StationError::MalformedFrame(
                "truncated EAPOL header".to_string(),
            ));
        }
        let _version = buf.get_u8();
        let packet_type = buf.get_u8();
        let body_length = buf.get_u16() as usize;
        if packet_type != EAPOL_TYPE_KEY {
            return Err(StationError::MalformedFrame(format!(
                "not an EAPOL-Key frame (type {packet_type})"
            )));
        }
        if buf.remaining() < body_length || body_length < KEY_DESCRIPTOR_LEN {
            return Err(StationError::MalformedFrame(
                "EAPOL body length inconsistent with frame".to_string(),
            ));
        }
        let descriptor_type = buf.get_u8();
        let key_info = KeyInfo(buf.get_u16());
        let key_length = buf.get_u16();
        let replay_counter = buf.get_u64();
        let mut nonce = [0u8; 32];
        buf.copy_to_slice(&mut nonce);
        let mut key_iv = [0u8; 16];
        buf.copy_to_slice(&mut key_iv);
        let key_rsc = buf.get_u64();
        buf.advance(8); // reserved key id
        let mut key_mic = [0u8; 16];
        buf.copy_to_slice(&mut key_mic);
        let key_data_length = buf.get_u16() as usize;
        if buf.remaining() < key_data_length {
            return Err(StationError::MalformedFrame(
                "EAPOL key data overruns frame".to_string(),
            ));
        }
        let key_data = buf[..key_data_length].to_vec();
        Ok(Self {
            descriptor_type,
            key_info,
            key_length,
            replay_counter,
            nonce,
            key_iv,
            key_rsc,
            key_mic,
            key_data,
        })
    }

    /// Serialize to a complete EAPOL frame (header + key descriptor)
    pub fn serialize(&self) -> Bytes {
        let body_length = KEY_DESCRIPTOR_LEN + self.key_data.len();
        let mut buf = BytesMut::with_capacity(4 + body_length);
        buf.put_u8(EAPOL_VERSION);
        buf.put_u8(EAPOL_TYPE_KEY);
        buf.put_u16(body_length as u16);
        buf.put_u8(self.descriptor_type);
        buf.put_u16(self.key_info.0);
        buf.put_u16(self.key_length);
        buf.put_u64(self.replay_counter);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.key_iv);
        buf.put_u64(self.key_rsc);
        buf.put_u64(0); // reserved key id
        buf.put_slice(&self.key_mic);
        buf.put_u16(self.key_data.len() as u16);
        buf.put_slice(&self.key_data);
        buf.freeze()
    }
}

/// WPA generation of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpaVariant {
    Wpa,
    Wpa2,
}

impl WpaVariant {
    pub fn descriptor_type(&self) -> u8 {
        match self {
            WpaVariant::Wpa => DESCRIPTOR_TYPE_WPA,
            WpaVariant::Wpa2 => DESCRIPTOR_TYPE_RSN,
        }
    }
}

/// Pairwise transient key split into its three parts
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ptk {
    pub kck: [u8; 16],
    pub kek: [u8; 16],
    pub tk: [u8; 16],
}

/// Derive the pairwise master key from a passphrase and SSID
/// (PBKDF2-HMAC-SHA1, 4096 rounds, 256 bits)
pub fn derive_pmk(passphrase: &[u8], ssid: &[u8]) -> [u8; 32] {
    let mut pmk = [0u8; 32];
    pbkdf2_hmac::<Sha1>(passphrase, ssid, 4096, &mut pmk);
    pmk
}

/// The 802.11i PRF: HMAC-SHA1 over label ‖ 0 ‖ data ‖ counter, iterated
fn prf(key: &[u8], label: &str, data: &[u8], output_len: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(output_len + 20);
    let mut counter: u8 = 0;
    while output.len() < output_len {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
            .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(data);
        mac.update(&[counter]);
        output.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    output.truncate(output_len);
    Ok(output)
}

/// Derive the PTK from the PMK, both addresses and both nonces.
///
/// Addresses and nonces enter in min/max order, so both sides compute the
/// same key regardless of role.
pub fn derive_ptk(
    pmk: &[u8; 32],
    address_a: [u8; 6],
    address_b: [u8; 6],
    nonce_a: &[u8; 32],
    nonce_b: &[u8; 32],
) -> Result<Ptk> {
    let (min_addr, max_addr) = if address_a <= address_b {
        (address_a, address_b)
    } else {
        (address_b, address_a)
    };
    let (min_nonce, max_nonce) =
        if nonce_a <= nonce_b { (nonce_a, nonce_b) } else { (nonce_b, nonce_a) };

    let mut data = Vec::with_capacity(12 + 64);
    data.extend_from_slice(&min_addr);
    data.extend_from_slice(&max_addr);
    data.extend_from_slice(min_nonce);
    data.extend_from_slice(max_nonce);

    let expanded = prf(pmk, "Pairwise key expansion", &data, 48)?;
    let mut ptk = Ptk { kck: [0; 16], kek: [0; 16], tk: [0; 16] };
    ptk.kck.copy_from_slice(&expanded[..16]);
    ptk.kek.copy_from_slice(&expanded[16..32]);
    ptk.tk.copy_from_slice(&expanded[32..48]);
    Ok(ptk)
}

/// Compute the key MIC over a serialized EAPOL frame with its MIC zeroed
pub fn compute_mic(descriptor_version: u16, kck: &[u8; 16], frame: &KeyFrame) -> Result<[u8; 16]> {
    let mut unsigned = frame.clone();
    unsigned.key_mic = [0; 16];
    let bytes = unsigned.serialize();
    let mut mic = [0u8; 16];
    match descriptor_version {
        KEY_VERSION_MD5_RC4 => {
            let mut mac = <Hmac<Md5> as Mac>::new_from_slice(kck)
                .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
            mac.update(&bytes);
            mic.copy_from_slice(&mac.finalize().into_bytes());
        }
        KEY_VERSION_SHA1_AES => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(kck)
                .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
            mac.update(&bytes);
            mic.copy_from_slice(&mac.finalize().into_bytes()[..16]);
        }
        other => {
            return Err(StationError::KeyDerivation(format!(
                "unsupported key descriptor version {other}"
            )))
        }
    }
    Ok(mic)
}

/// Decrypt the key-data field of message 3
pub fn unwrap_key_data(
    descriptor_version: u16,
    kek: &[u8; 16],
    key_iv: &[u8; 16],
    wrapped: &[u8],
) -> Result<Vec<u8>> {
    match descriptor_version {
        KEY_VERSION_SHA1_AES => {
            if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
                return Err(StationError::HandshakeIntegrityFailure);
            }
            let kek = aes_kw::KekAes128::try_from(&kek[..])
                .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
            let mut plain = vec![0u8; wrapped.len() - 8];
            kek.unwrap(wrapped, &mut plain)
                .map_err(|_| StationError::HandshakeIntegrityFailure)?;
            Ok(plain)
        }
        KEY_VERSION_MD5_RC4 => {
            use rc4::{consts::U32, KeyInit, Rc4, StreamCipher};
            let mut rc4_key = [0u8; 32];
            rc4_key[..16].copy_from_slice(key_iv);
            rc4_key[16..].copy_from_slice(kek);
            let mut cipher = Rc4::<U32>::new((&rc4_key).into());
            // The first 256 keystream bytes are discarded.
            let mut discard = [0u8; 256];
            cipher.apply_keystream(&mut discard);
            let mut plain = wrapped.to_vec();
            cipher.apply_keystream(&mut plain);
            Ok(plain)
        }
        _ => Err(StationError::HandshakeIntegrityFailure),
    }
}

/// Encrypt a key-data field (authenticator side; used by the simulator)
pub fn wrap_key_data(
    descriptor_version: u16,
    kek: &[u8; 16],
    key_iv: &[u8; 16],
    plain: &[u8],
) -> Result<Vec<u8>> {
    match descriptor_version {
        KEY_VERSION_SHA1_AES => {
            if plain.len() % 8 != 0 {
                return Err(StationError::KeyDerivation(
                    "key data must be a multiple of 8 bytes".to_string(),
                ));
            }
            let kek = aes_kw::KekAes128::try_from(&kek[..])
                .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
            let mut wrapped = vec![0u8; plain.len() + 8];
            kek.wrap(plain, &mut wrapped)
                .map_err(|error| StationError::KeyDerivation(error.to_string()))?;
            Ok(wrapped)
        }
        KEY_VERSION_MD5_RC4 => {
            use rc4::{consts::U32, KeyInit, Rc4, StreamCipher};
            let mut rc4_key = [0u8; 32];
            rc4_key[..16].copy_from_slice(key_iv);
            rc4_key[16..].copy_from_slice(kek);
            let mut cipher = Rc4::<U32>::new((&rc4_key).into());
            let mut discard = [0u8; 256];
            cipher.apply_keystream(&mut discard);
            let mut wrapped = plain.to_vec();
            cipher.apply_keystream(&mut wrapped);
            Ok(wrapped)
        }
        other => Err(StationError::KeyDerivation(format!(
            "unsupported key descriptor version {other}"
        ))),
    }
}

/// Build a GTK key-data encapsulation (RSN KDE)
pub fn gtk_kde(gtk: &[u8; 16], key_id: u8) -> Vec<u8> {
    let mut kde = Vec::with_capacity(8 + gtk.len());
    kde.push(0xdd);
    kde.push((4 + 2 + gtk.len()) as u8);
    kde.extend_from_slice(&crate::wire::RSN_OUI);
    kde.push(KDE_TYPE_GTK);
    kde.push(key_id & 0x3);
    kde.push(0);
    kde.extend_from_slice(gtk);
    kde
}

/// Extract the GTK and its key id from decrypted message-3 key data
fn parse_gtk(variant: WpaVariant, key_data: &[u8]) -> Result<([u8; 16], u8)> {
    match variant {
        WpaVariant::Wpa => {
            // WPA delivers the raw group key.
            if key_data.len() < 16 {
                return Err(StationError::HandshakeIntegrityFailure);
            }
            let mut gtk = [0u8; 16];
            gtk.copy_from_slice(&key_data[..16]);
            Ok((gtk, 1))
        }
        WpaVariant::Wpa2 => {
            // WPA2 wraps the group key in a KDE list.
            let mut data = key_data;
            while data.len() >= 2 {
                let id = data[0];
                let len = data[1] as usize;
                if data.len() < 2 + len {
                    break;
                }
                let value = &data[2..2 + len];
                if id == 0xdd
                    && len >= 6
                    && value[..3] == crate::wire::RSN_OUI
                    && value[3] == KDE_TYPE_GTK
                {
                    let key_id = value[4] & 0x3;
                    let gtk_bytes = &value[6..];
                    if gtk_bytes.len() < 16 {
                        return Err(StationError::HandshakeIntegrityFailure);
                    }
                    let mut gtk = [0u8; 16];
                    gtk.copy_from_slice(&gtk_bytes[..16]);
                    return Ok((gtk, key_id));
                }
                data = &data[2 + len..];
            }
            Err(StationError::HandshakeIntegrityFailure)
        }
    }
}

/// Everything the engine needs to run one supplicant handshake
pub struct HandshakeRequest<'a> {
    pub link_id: LinkId,
    pub station_address: [u8; 6],
    pub ap_address: [u8; 6],
    pub ssid: &'a [u8],
    pub passphrase: &'a [u8],
    pub variant: WpaVariant,
    pub timeout: Duration,
    /// Transmits one EAPOL payload toward the AP (unprotected data frame)
    pub transmit: &'a (dyn Fn(Bytes) -> Result<()> + Send + Sync),
}

#[derive(Default)]
struct EngineInner {
    active: HashMap<LinkId, mpsc::Sender<Bytes>>,
    shut_down: bool,
}

/// Process-wide key-exchange subsystem handle
#[derive(Default)]
pub struct EapolEngine {
    inner: Mutex<EngineInner>,
}

impl EapolEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear the subsystem down. Idempotent; aborts in-flight handshakes by
    /// closing their inboxes.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("eapol registry lock poisoned");
        inner.shut_down = true;
        inner.active.clear();
    }

    /// Hand a received EAPOL payload to the link's in-flight handshake.
    /// Returns false (payload dropped) when none is active.
    pub fn deliver(&self, link_id: LinkId, payload: Bytes) -> bool {
        let inner = self.inner.lock().expect("eapol registry lock poisoned");
        match inner.active.get(&link_id) {
            Some(sender) => sender.try_send(payload).is_ok(),
            None => false,
        }
    }

    fn register(&self, link_id: LinkId) -> Result<mpsc::Receiver<Bytes>> {
        let mut inner = self.inner.lock().expect("eapol registry lock poisoned");
        if inner.shut_down {
            return Err(StationError::InvalidParameter(
                "key exchange engine is shut down".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel(8);
        inner.active.insert(link_id, sender);
        Ok(receiver)
    }

    fn deregister(&self, link_id: LinkId) {
        let mut inner = self.inner.lock().expect("eapol registry lock poisoned");
        inner.active.remove(&link_id);
    }

    /// Run the supplicant side of the 4-way handshake to completion,
    /// returning the session keys to install.
    pub async fn run_supplicant(&self, request: HandshakeRequest<'_>) -> Result<SessionKeys> {
        let mut inbox = self.register(request.link_id)?;
        let result = self.drive(&mut inbox, &request).await;
        self.deregister(request.link_id);
        if result.is_err() {
            log::warn!("key exchange with {} failed", crate::wire::format_address(&request.ap_address));
        }
        result
    }

    async fn drive(
        &self,
        inbox: &mut mpsc::Receiver<Bytes>,
        request: &HandshakeRequest<'_>,
    ) -> Result<SessionKeys> {
        let deadline = Instant::now() + request.timeout;
        let pmk = derive_pmk(request.passphrase, request.ssid);

        // Message 1: capture the authenticator nonce.
        let (message_1, descriptor_version) = loop {
            let frame = self.next_frame(inbox, deadline).await?;
            let info = frame.key_info;
            if info.pairwise() && info.ack() && !info.mic() {
                let version = info.descriptor_version();
                if version != KEY_VERSION_MD5_RC4 && version != KEY_VERSION_SHA1_AES {
                    return Err(StationError::KeyDerivation(format!(
                        "unsupported key descriptor version {version}"
                    )));
                }
                break (frame, version);
            }
            log::debug!("ignoring unexpected EAPOL frame before message 1");
        };

        let mut snonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut snonce);
        let ptk = derive_ptk(
            &pmk,
            request.ap_address,
            request.station_address,
            &message_1.nonce,
            &snonce,
        )?;

        // Message 2: station nonce + integrity check.
        let mut message_2 = KeyFrame {
            descriptor_type: request.variant.descriptor_type(),
            key_info: KeyInfo(descriptor_version | KEY_INFO_TYPE_PAIRWISE | KEY_INFO_MIC),
            key_length: 0,
            replay_counter: message_1.replay_counter,
            nonce: snonce,
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: match request.variant {
                WpaVariant::Wpa2 => {
                    let mut element = vec![crate::wire::ELEMENT_RSN];
                    let body = crate::join::rsn_element();
                    element.push(body.len() as u8);
                    element.extend_from_slice(&body);
                    element
                }
                WpaVariant::Wpa => {
                    let mut element = vec![crate::wire::ELEMENT_VENDOR];
                    let body = crate::join::wpa_element();
                    element.push(body.len() as u8);
                    element.extend_from_slice(&body);
                    element
                }
            },
        };
        message_2.key_mic = compute_mic(descriptor_version, &ptk.kck, &message_2)?;
        (request.transmit)(message_2.serialize())?;

        // Message 3: verify and unwrap the group key.
        let message_3 = loop {
            let frame = self.next_frame(inbox, deadline).await?;
            let info = frame.key_info;
            if info.pairwise() && info.ack() && info.mic() && info.install() {
                break frame;
            }
            log::debug!("ignoring unexpected EAPOL frame before message 3");
        };
        if message_3.replay_counter <= message_1.replay_counter {
            return Err(StationError::HandshakeIntegrityFailure);
        }
        let expected = compute_mic(descriptor_version, &ptk.kck, &message_3)?;
        if expected != message_3.key_mic {
            return Err(StationError::HandshakeIntegrityFailure);
        }
        let key_data = if message_3.key_info.encrypted_data()
            || request.variant == WpaVariant::Wpa
        {
            unwrap_key_data(descriptor_version, &ptk.kek, &message_3.key_iv, &message_3.key_data)?
        } else {
            message_3.key_data.clone()
        };
        let (gtk, group_key_id) = parse_gtk(request.variant, &key_data)?;

        // Message 4: acknowledge.
        let mut message_4 = KeyFrame {
            descriptor_type: request.variant.descriptor_type(),
            key_info: KeyInfo(
                descriptor_version
                    | KEY_INFO_TYPE_PAIRWISE
                    | KEY_INFO_MIC
                    | (message_3.key_info.0 & KEY_INFO_SECURE),
            ),
            key_length: 0,
            replay_counter: message_3.replay_counter,
            nonce: [0; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: Vec::new(),
        };
        message_4.key_mic = compute_mic(descriptor_version, &ptk.kck, &message_4)?;
        (request.transmit)(message_4.serialize())?;

        log::info!(
            "key exchange with {} complete",
            crate::wire::format_address(&request.ap_address)
        );
        Ok(SessionKeys::Ccmp {
            pairwise: CcmpKeyState::new(ptk.tk),
            group: CcmpKeyState::new(gtk),
            group_key_id,
        })
    }

    /// Receive the next parseable key frame before the deadline
    async fn next_frame(
        &self,
        inbox: &mut mpsc::Receiver<Bytes>,
        deadline: Instant,
    ) -> Result<KeyFrame> {
        loop {
            let payload = tokio::time::timeout_at(deadline, inbox.recv())
                .await
                .map_err(|_| StationError::HandshakeTimeout)?
                .ok_or(StationError::HandshakeTimeout)?;
            match KeyFrame::parse(&payload) {
                Ok(frame) => return Ok(frame),
                Err(error) => log::debug!("dropping malformed EAPOL frame: {error}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmk_matches_published_vector() {
        // IEEE 802.11i Annex H test vector.
        let pmk = derive_pmk(b"password", b"IEEE");
        assert_eq!(
            hex::encode(pmk),
            "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12f"
        );
    }

    #[test]
    fn test_ptk_is_role_symmetric() {
        let pmk = derive_pmk(b"password", b"IEEE");
        let anonce = [0x11; 32];
        let snonce = [0x22; 32];
        let ap = [0x02, 0, 0, 0, 0, 1];
        let sta = [0x02, 0, 0, 0, 0, 2];
        let forward = derive_ptk(&pmk, ap, sta, &anonce, &snonce).unwrap();
        let reverse = derive_ptk(&pmk, sta, ap, &snonce, &anonce).unwrap();
        assert_eq!(forward.kck, reverse.kck);
        assert_eq!(forward.tk, reverse.tk);
    }

    #[test]
    fn test_key_frame_round_trip() {
        let frame = KeyFrame {
            descriptor_type: DESCRIPTOR_TYPE_RSN,
            key_info: KeyInfo(KEY_VERSION_SHA1_AES | KEY_INFO_TYPE_PAIRWISE | KEY_INFO_ACK),
            key_length: 16,
            replay_counter: 7,
            nonce: [0xab; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: vec![1, 2, 3],
        };
        let bytes = frame.serialize();
        let parsed = KeyFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.key_info.pairwise());
        assert!(parsed.key_info.ack());
        assert!(!parsed.key_info.mic());
    }

    #[test]
    fn test_key_frame_rejects_truncation() {
        let frame = KeyFrame {
            descriptor_type: DESCRIPTOR_TYPE_RSN,
            key_info: KeyInfo(KEY_VERSION_SHA1_AES),
            key_length: 16,
            replay_counter: 1,
            nonce: [0; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: vec![0; 24],
        };
        let bytes = frame.serialize();
        for len in 0..bytes.len() {
            assert!(KeyFrame::parse(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn test_mic_detects_tampering() {
        let kck = [0x55; 16];
        let mut frame = KeyFrame {
            descriptor_type: DESCRIPTOR_TYPE_RSN,
            key_info: KeyInfo(KEY_VERSION_SHA1_AES | KEY_INFO_TYPE_PAIRWISE | KEY_INFO_MIC),
            key_length: 0,
            replay_counter: 2,
            nonce: [9; 32],
            key_iv: [0; 16],
            key_rsc: 0,
            key_mic: [0; 16],
            key_data: vec![],
        };
        frame.key_mic = compute_mic(KEY_VERSION_SHA1_AES, &kck, &frame).unwrap();
        let valid = compute_mic(KEY_VERSION_SHA1_AES, &kck, &frame).unwrap();
        assert_eq!(valid, frame.key_mic);

        frame.nonce[0] ^= 0xff;
        let recomputed = compute_mic(KEY_VERSION_SHA1_AES, &kck, &frame).unwrap();
        assert_ne!(recomputed, frame.key_mic);
    }

    #[test]
    fn test_key_data_wrap_round_trip() {
        let kek = [0x42; 16];
        let gtk = [0x77; 16];
        let kde = gtk_kde(&gtk, 2);
        // Pad to the 8-byte multiple AES key wrap requires.
        let mut padded = kde.clone();
        padded.push(0xdd);
        while padded.len() % 8 != 0 {
            padded.push(0);
        }
        let wrapped = wrap_key_data(KEY_VERSION_SHA1_AES, &kek, &[0; 16], &padded).unwrap();
        assert_ne!(wrapped, padded);
        let unwrapped = unwrap_key_data(KEY_VERSION_SHA1_AES, &kek, &[0; 16], &wrapped).unwrap();
        assert_eq!(unwrapped, padded);
        let (parsed_gtk, key_id) = parse_gtk(WpaVariant::Wpa2, &unwrapped).unwrap();
        assert_eq!(parsed_gtk, gtk);
        assert_eq!(key_id, 2);
    }

    #[test]
    fn test_tampered_wrap_fails_integrity() {
        let kek = [0x42; 16];
        let mut padded = gtk_kde(&[0x77; 16], 1);
        padded.push(0xdd);
        while padded.len() % 8 != 0 {
            padded.push(0);
        }
        let mut wrapped = wrap_key_data(KEY_VERSION_SHA1_AES, &kek, &[0; 16], &padded).unwrap();
        wrapped[3] ^= 0x01;
        assert!(matches!(
            unwrap_key_data(KEY_VERSION_SHA1_AES, &kek, &[0; 16], &wrapped),
            Err(StationError::HandshakeIntegrityFailure)
        ));
    }

    #[test]
    fn test_rc4_wrap_round_trip() {
        let kek = [0x13; 16];
        let iv = [0x24; 16];
        let plain = [0x99u8; 16];
        let wrapped = wrap_key_data(KEY_VERSION_MD5_RC4, &kek, &iv, &plain).unwrap();
        assert_ne!(&wrapped[..], &plain[..]);
        let unwrapped = unwrap_key_data(KEY_VERSION_MD5_RC4, &kek, &iv, &wrapped).unwrap();
        assert_eq!(&unwrapped[..], &plain[..]);
    }

    #[tokio::test]
    async fn test_supplicant_times_out_without_message_1() {
        let engine = EapolEngine::new();
        let transmit = |_frame: Bytes| -> crate::Result<()> { Ok(()) };
        let result = engine
            .run_supplicant(HandshakeRequest {
                link_id: LinkId::new(),
                station_address: [1; 6],
                ap_address: [2; 6],
                ssid: b"IEEE",
                passphrase: b"password",
                variant: WpaVariant::Wpa2,
                timeout: Duration::from_millis(20),
                transmit: &transmit,
            })
            .await;
        assert!(matches!(result, Err(StationError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_blocks_new_handshakes() {
        let engine = EapolEngine::new();
        engine.shutdown();
        engine.shutdown();
        assert!(!engine.deliver(LinkId::new(), Bytes::from_static(b"x")));
        let transmit = |_frame: Bytes| -> crate::Result<()> { Ok(()) };
        let result = engine
            .run_supplicant(HandshakeRequest {
                link_id: LinkId::new(),
                station_address: [1; 6],
                ap_address: [2; 6],
                ssid: b"IEEE",
                passphrase: b"password",
                variant: WpaVariant::Wpa2,
                timeout: Duration::from_millis(20),
                transmit: &transmit,
            })
            .await;
        assert!(result.is_err());
    }
}
