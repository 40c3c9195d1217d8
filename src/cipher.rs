//! Data-frame protection
//!
//! Applies the negotiated cipher to data-frame bodies: CCMP (AES-CCM with
//! an 8-byte MIC and 13-byte nonce) for WPA/WPA2, WEP (RC4 with a CRC-32
//! ICV) for legacy networks. The AES/RC4 primitives come from library
//! crates; this module only builds the 802.11-specific nonce, AAD and
//! header layouts around them.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use rand::RngCore;

use crate::frame::MacHeader;
use crate::link::CcmpKeyState;
use crate::wire;
use crate::{Result, StationError};

/// CCMP as used by 802.11: AES-CCM, M = 8, L = 2
type Ccmp = Ccm<Aes128, U8, U13>;

/// The ExtIV bit in the CCMP header's key-id octet
const CCMP_EXT_IV: u8 = 0x20;

fn ccmp_nonce(transmitter: &[u8; 6], packet_number: u64) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    // Priority octet stays zero for non-QoS data.
    nonce[1..7].copy_from_slice(transmitter);
    let pn = packet_number.to_be_bytes();
    nonce[7..13].copy_from_slice(&pn[2..8]);
    nonce
}

/// Additional authenticated data: the MAC header with the mutable bits
/// (retry, power management, more data) masked out and the protected bit
/// set, plus the sequence-control field with the sequence number zeroed.
fn ccmp_aad(header: &MacHeader) -> [u8; 22] {
    let mut aad = [0u8; 22];
    let masked_fc = (header.frame_control.0
        & !(wire::FC_RETRY | 0x1000 | 0x2000))
        | wire::FC_PROTECTED;
    aad[0..2].copy_from_slice(&masked_fc.to_le_bytes());
    aad[2..8].copy_from_slice(&header.addr1);
    aad[8..14].copy_from_slice(&header.addr2);
    aad[14..20].copy_from_slice(&header.addr3);
    let masked_sc = (header.sequence_control.fragment as u16) & 0x000f;
    aad[20..22].copy_from_slice(&masked_sc.to_le_bytes());
    aad
}

fn ccmp_header(packet_number: u64, key_id: u8) -> [u8; 8] {
    let pn = packet_number.to_be_bytes();
    [
        pn[7],
        pn[6],
        0,
        CCMP_EXT_IV | (key_id << 6),
        pn[5],
        pn[4],
        pn[3],
        pn[2],
    ]
}

fn parse_ccmp_header(body: &[u8]) -> Result<(u64, u8)> {
    if body.len() < wire::CCMP_HEADER_LEN + wire::CCMP_MIC_LEN {
        return Err(StationError::MalformedFrame(
            "protected frame too short for CCMP".to_string(),
        ));
    }
    if body[3] & CCMP_EXT_IV == 0 {
        return Err(StationError::MalformedFrame(
            "CCMP header missing ExtIV".to_string(),
        ));
    }
    let key_id = (body[3] >> 6) & 0x3;
    let packet_number = u64::from_be_bytes([
        0, 0, body[7], body[6], body[5], body[4], body[1], body[0],
    ]);
    Ok((packet_number, key_id))
}

/// Encipher a data-frame payload under the given CCMP key, advancing its
/// transmit packet number. Returns the CCMP header plus ciphertext+MIC.
pub fn ccmp_encrypt(
    key: &mut CcmpKeyState,
    key_id: u8,
    header: &MacHeader,
    payload: &[u8],
) -> Result<Vec<u8>> {
    key.tx_packet_number += 1;
    let packet_number = key.tx_packet_number;
    let cipher = Ccmp::new(GenericArray::from_slice(&key.temporal_key));
    let nonce = ccmp_nonce(&header.addr2, packet_number);
    let aad = ccmp_aad(header);
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), Payload { msg: payload, aad: &aad })
        .map_err(|_| StationError::KeyDerivation("CCMP encryption failed".to_string()))?;
    let mut body = Vec::with_capacity(wire::CCMP_HEADER_LEN + ciphertext.len());
    body.extend_from_slice(&ccmp_header(packet_number, key_id));
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// Decipher a protected data-frame body, enforcing packet-number replay
/// ordering. Any integrity failure is reported as a malformed frame and
/// the frame is dropped by the caller.
pub fn ccmp_decrypt(
    key: &mut CcmpKeyState,
    header: &MacHeader,
    body: &[u8],
) -> Result<Vec<u8>> {
    let (packet_number, _key_id) = parse_ccmp_header(body)?;
    if packet_number <= key.rx_packet_number {
        return Err(StationError::MalformedFrame(
            "replayed CCMP packet number".to_string(),
        ));
    }
    let cipher = Ccmp::new(GenericArray::from_slice(&key.temporal_key));
    let nonce = ccmp_nonce(&header.addr2, packet_number);
    let aad = ccmp_aad(header);
    let plaintext = cipher
        .decrypt(
            GenericArray::from_slice(&nonce),
            Payload { msg: &body[wire::CCMP_HEADER_LEN..], aad: &aad },
        )
        .map_err(|_| {
            StationError::MalformedFrame("CCMP integrity check failed".to_string())
        })?;
    key.rx_packet_number = packet_number;
    Ok(plaintext)
}

fn wep_keystream(iv: &[u8; 3], key: &[u8], data: &mut [u8]) -> Result<()> {
    use rc4::{consts::U16, consts::U8 as KeyU8, KeyInit, Rc4, StreamCipher};
    match key.len() {
        wire::WEP40_KEY_LEN => {
            let mut seed = [0u8; 8];
            seed[..3].copy_from_slice(iv);
            seed[3..].copy_from_slice(key);
            let mut cipher = Rc4::<KeyU8>::new((&seed).into());
            cipher.apply_keystream(data);
            Ok(())
        }
        wire::WEP104_KEY_LEN => {
            let mut seed = [0u8; 16];
            seed[..3].copy_from_slice(iv);
            seed[3..].copy_from_slice(key);
            let mut cipher = Rc4::<U16>::new((&seed).into());
            cipher.apply_keystream(data);
            Ok(())
        }
        other => Err(StationError::KeyDerivation(format!(
            "invalid WEP key length {other}"
        ))),
    }
}

/// Encipher a payload under a static WEP key: IV + key id, then RC4 over
/// payload ‖ CRC-32 ICV.
pub fn wep_encrypt(key: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut data = Vec::with_capacity(payload.len() + wire::WEP_ICV_LEN);
    data.extend_from_slice(payload);
    data.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    wep_keystream(&iv, key, &mut data)?;
    let mut body = Vec::with_capacity(wire::WEP_HEADER_LEN + data.len());
    body.extend_from_slice(&iv);
    body.push(0); // key id 0
    body.extend_from_slice(&data);
    Ok(body)
}

/// Decipher a WEP-protected body and verify its ICV
pub fn wep_decrypt(key: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < wire::WEP_HEADER_LEN + wire::WEP_ICV_LEN {
        return Err(StationError::MalformedFrame(
            "protected frame too short for WEP".to_string(),
        ));
    }
    let mut iv = [0u8; 3];
    iv.copy_from_slice(&body[..3]);
    let mut data = body[wire::WEP_HEADER_LEN..].to_vec();
    wep_keystream(&iv, key, &mut data)?;
    let icv_offset = data.len() - wire::WEP_ICV_LEN;
    let expected = u32::from_le_bytes([
        data[icv_offset],
        data[icv_offset + 1],
        data[icv_offset + 2],
        data[icv_offset + 3],
    ]);
    data.truncate(icv_offset);
    if crc32fast::hash(&data) != expected {
        return Err(StationError::MalformedFrame(
            "WEP integrity check failed".to_string(),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameControl, SequenceControl};

    fn data_header() -> MacHeader {
        MacHeader {
            frame_control: FrameControl::data_to_ds(true),
            duration: 0,
            addr1: [2; 6],
            addr2: [1; 6],
            addr3: [3; 6],
            sequence_control: SequenceControl::new(42),
        }
    }

    #[test]
    fn test_ccmp_round_trip() {
        let mut tx_key = CcmpKeyState::new([0x44; 16]);
        let mut rx_key = CcmpKeyState::new([0x44; 16]);
        let header = data_header();
        let body = ccmp_encrypt(&mut tx_key, 0, &header, b"hello 802.11").unwrap();
        assert_eq!(
            body.len(),
            wire::CCMP_HEADER_LEN + b"hello 802.11".len() + wire::CCMP_MIC_LEN
        );
        let plain = ccmp_decrypt(&mut rx_key, &header, &body).unwrap();
        assert_eq!(plain, b"hello 802.11");
    }

    #[test]
    fn test_ccmp_detects_tampering() {
        let mut tx_key = CcmpKeyState::new([0x44; 16]);
        let mut rx_key = CcmpKeyState::new([0x44; 16]);
        let header = data_header();
        let mut body = ccmp_encrypt(&mut tx_key, 0, &header, b"payload").unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        assert!(ccmp_decrypt(&mut rx_key, &header, &body).is_err());
    }

    #[test]
    fn test_ccmp_rejects_replay() {
        let mut tx_key = CcmpKeyState::new([0x44; 16]);
        let mut rx_key = CcmpKeyState::new([0x44; 16]);
        let header = data_header();
        let body = ccmp_encrypt(&mut tx_key, 0, &header, b"payload").unwrap();
        assert!(ccmp_decrypt(&mut rx_key, &header, &body).is_ok());
        // Same packet number a second time must be refused.
        assert!(ccmp_decrypt(&mut rx_key, &header, &body).is_err());
    }

    #[test]
    fn test_ccmp_wrong_key_fails() {
        let mut tx_key = CcmpKeyState::new([0x44; 16]);
        let mut rx_key = CcmpKeyState::new([0x45; 16]);
        let header = data_header();
        let body = ccmp_encrypt(&mut tx_key, 0, &header, b"payload").unwrap();
        assert!(ccmp_decrypt(&mut rx_key, &header, &body).is_err());
    }

    #[test]
    fn test_wep_round_trip_both_key_lengths() {
        for key in [&b"abcde"[..], &b"thirteenbytes"[..]] {
            let body = wep_encrypt(key, b"legacy payload").unwrap();
            let plain = wep_decrypt(key, &body).unwrap();
            assert_eq!(plain, b"legacy payload");
        }
    }

    #[test]
    fn test_wep_detects_corruption() {
        let key = b"abcde";
        let mut body = wep_encrypt(key, b"legacy payload").unwrap();
        body[6] ^= 0x80;
        assert!(wep_decrypt(key, &body).is_err());
    }

    #[test]
    fn test_wep_rejects_bad_key_length() {
        assert!(wep_encrypt(b"toolongkey!", b"x").is_err());
    }
}
