//! Simulated access point
//!
//! An in-process AP implementing [`RadioDevice`]: frames the station
//! transmits are handled as if they had crossed the air, and the AP's
//! replies are fed straight back into the station's receive entry points.
//! It answers probe/authentication/association requests, drives the
//! authenticator side of the 4-way handshake, and echoes data payloads
//! back to the station. Fault knobs make the failure scenarios (silent
//! AP, refused authentication, tampered handshake) reproducible in tests
//! and demos.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::cipher;
use crate::eapol::{
    self, KeyFrame, KeyInfo, WpaVariant, KEY_INFO_ACK, KEY_INFO_ENCRYPTED_DATA,
    KEY_INFO_INSTALL, KEY_INFO_MIC, KEY_INFO_SECURE, KEY_INFO_TYPE_PAIRWISE,
    KEY_VERSION_MD5_RC4, KEY_VERSION_SHA1_AES,
};
use crate::frame::{
    self, DataFrame, Frame, FrameControl, MacHeader, ManagementFrame, ManagementSubtype,
    SequenceControl,
};
use crate::join;
use crate::link::CcmpKeyState;
use crate::station::Station;
use crate::wire::{self, SnapHeader};
use crate::{Result, StationError};

/// Security the simulated BSS advertises and enforces
#[derive(Debug, Clone)]
pub enum ApSecurity {
    Open,
    Wep { key: Vec<u8> },
    WpaPsk { passphrase: Vec<u8> },
    Wpa2Psk { passphrase: Vec<u8> },
}

/// Fault knobs for failure scenarios
#[derive(Debug, Clone, Default)]
pub struct ApFaults {
    /// Never answer anything (the network does not exist)
    pub silent: bool,
    /// Status code for authentication responses (0 = success)
    pub auth_status: u16,
    /// Status code for association responses (0 = success)
    pub assoc_status: u16,
    /// Never start the 4-way handshake after association
    pub skip_handshake: bool,
    /// Corrupt the MIC of handshake message 3
    pub tamper_message_3_mic: bool,
}

/// Configuration of the simulated BSS
#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub security: ApSecurity,
    pub faults: ApFaults,
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            ssid: b"HomeNet".to_vec(),
            bssid: [0x02, 0x51, 0x4d, 0x41, 0x50, 0x01],
            channel: 6,
            security: ApSecurity::Open,
            faults: ApFaults::default(),
        }
    }
}

struct ApState {
    /// Channel the station's radio is currently tuned to
    radio_channel: u8,
    sequence: u16,
    station_address: Option<[u8; 6]>,
    associated: bool,
    anonce: [u8; 32],
    gtk: [u8; 16],
    replay_counter: u64,
    ptk: Option<eapol::Ptk>,
    handshake_done: bool,
    /// AP-side transmit key (pairwise, toward the station)
    tx_key: Option<CcmpKeyState>,
    /// AP-side receive key (pairwise, from the station)
    rx_key: Option<CcmpKeyState>,
}

/// The simulated AP; hand it to [`Station::new`] as the radio device and
/// then [`SimulatedAccessPoint::attach`] the station for the reverse path.
pub struct SimulatedAccessPoint {
    config: ApConfig,
    state: Mutex<ApState>,
    station: Mutex<Option<Arc<Station>>>,
    weak: Weak<SimulatedAccessPoint>,
}

impl SimulatedAccessPoint {
    pub fn new(config: ApConfig) -> Arc<Self> {
        let mut anonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut anonce);
        let mut gtk = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut gtk);
        Arc::new_cyclic(|weak| Self {
            config,
            state: Mutex::new(ApState {
                radio_channel: 0,
                sequence: 0,
                station_address: None,
                associated: false,
                anonce,
                gtk,
                replay_counter: 0,
                ptk: None,
                handshake_done: false,
                tx_key: None,
                rx_key: None,
            }),
            station: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Wire the reverse path: AP responses are delivered into this station
    pub fn attach(&self, station: Arc<Station>) {
        *self.station.lock().expect("sim lock poisoned") = Some(station);
    }

    /// Whether the 4-way handshake completed on the AP side
    pub fn handshake_done(&self) -> bool {
        self.state.lock().expect("sim lock poisoned").handshake_done
    }

    /// Deauthenticate the station (unsolicited, AP initiated)
    pub fn send_deauthentication(&self, reason: u16) {
        let frame = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            let Some(station) = state.station_address else { return };
            state.associated = false;
            let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 2);
            self.management_header(&mut state, wire::SUBTYPE_DEAUTHENTICATION, station)
                .serialize(&mut buf);
            buf.put_u16_le(reason);
            buf.freeze()
        };
        self.deliver(frame);
    }

    fn deliver(&self, frame: Bytes) {
        let station = self.station.lock().expect("sim lock poisoned").clone();
        if let Some(station) = station {
            station.process_frame(&frame);
        }
    }

    fn variant(&self) -> Option<WpaVariant> {
        match self.config.security {
            ApSecurity::WpaPsk { .. } => Some(WpaVariant::Wpa),
            ApSecurity::Wpa2Psk { .. } => Some(WpaVariant::Wpa2),
            _ => None,
        }
    }

    fn passphrase(&self) -> Option<&[u8]> {
        match &self.config.security {
            ApSecurity::WpaPsk { passphrase } | ApSecurity::Wpa2Psk { passphrase } => {
                Some(passphrase)
            }
            _ => None,
        }
    }

    fn protected(&self) -> bool {
        !matches!(self.config.security, ApSecurity::Open)
    }

    fn handle_frame(&self, bytes: &[u8]) {
        if self.config.faults.silent {
            return;
        }
        match Frame::parse(bytes) {
            Ok(Frame::Management(frame)) => self.handle_management(frame),
            Ok(Frame::Data(frame)) => self.handle_data(frame),
            Ok(Frame::Control(_)) => {}
            Err(error) => log::debug!("sim AP ignoring unparseable frame: {error}"),
        }
    }

    fn handle_management(&self, frame: ManagementFrame) {
        match frame.subtype {
            ManagementSubtype::ProbeRequest => self.handle_probe_request(frame),
            ManagementSubtype::Authentication => self.handle_authentication(frame),
            ManagementSubtype::AssociationRequest => self.handle_association(frame),
            ManagementSubtype::Disassociation | ManagementSubtype::Deauthentication => {
                let mut state = self.state.lock().expect("sim lock poisoned");
                state.associated = false;
                state.ptk = None;
                state.tx_key = None;
                state.rx_key = None;
                state.handshake_done = false;
            }
            _ => {}
        }
    }

    fn handle_probe_request(&self, frame: ManagementFrame) {
        let wanted = frame.ssid();
        if wanted.is_some() && wanted != Some(&self.config.ssid) {
            return;
        }
        let response = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            if state.radio_channel != self.config.channel {
                return;
            }
            self.advertisement(&mut state, frame.transmitter())
        };
        self.deliver(response);
    }

    fn advertisement(&self, state: &mut ApState, destination: [u8; 6]) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.management_header(state, wire::SUBTYPE_PROBE_RESPONSE, destination)
            .serialize(&mut buf);
        buf.put_u64_le(0);
        buf.put_u16_le(100);
        let mut capabilities = wire::CAP_ESS;
        if self.protected() {
            capabilities |= wire::CAP_PRIVACY;
        }
        buf.put_u16_le(capabilities);
        frame::write_element(&mut buf, wire::ELEMENT_SSID, &self.config.ssid);
        frame::write_element(
            &mut buf,
            wire::ELEMENT_SUPPORTED_RATES,
            &[0x82, 0x84, 0x8b, 0x96],
        );
        frame::write_element(&mut buf, wire::ELEMENT_DS_PARAMS, &[self.config.channel]);
        match self.config.security {
            ApSecurity::Wpa2Psk { .. } => {
                frame::write_element(&mut buf, wire::ELEMENT_RSN, &join::rsn_element());
            }
            ApSecurity::WpaPsk { .. } => {
                frame::write_element(&mut buf, wire::ELEMENT_VENDOR, &join::wpa_element());
            }
            _ => {}
        }
        buf.freeze()
    }

    fn handle_authentication(&self, frame: ManagementFrame) {
        let response = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            state.station_address = Some(frame.transmitter());
            let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 6);
            self.management_header(&mut state, wire::SUBTYPE_AUTHENTICATION, frame.transmitter())
                .serialize(&mut buf);
            buf.put_u16_le(wire::AUTH_ALGORITHM_OPEN);
            buf.put_u16_le(2);
            buf.put_u16_le(self.config.faults.auth_status);
            buf.freeze()
        };
        self.deliver(response);
    }

    fn handle_association(&self, frame: ManagementFrame) {
        let accepted = self.config.faults.assoc_status == wire::STATUS_SUCCESS;
        let response = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            state.station_address = Some(frame.transmitter());
            state.associated = accepted;
            let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 16);
            self.management_header(
                &mut state,
                wire::SUBTYPE_ASSOC_RESPONSE,
                frame.transmitter(),
            )
            .serialize(&mut buf);
            let mut capabilities = wire::CAP_ESS;
            if self.protected() {
                capabilities |= wire::CAP_PRIVACY;
            }
            buf.put_u16_le(capabilities);
            buf.put_u16_le(self.config.faults.assoc_status);
            buf.put_u16_le(0xc001);
            frame::write_element(
                &mut buf,
                wire::ELEMENT_SUPPORTED_RATES,
                &[0x82, 0x84, 0x8b, 0x96],
            );
            buf.freeze()
        };
        self.deliver(response);
        if accepted && self.variant().is_some() && !self.config.faults.skip_handshake {
            self.start_handshake();
        }
    }

    /// Kick off the authenticator side of the 4-way handshake: message 1
    /// is sent shortly after association and retransmitted until the
    /// station answers.
    fn start_handshake(&self) {
        let Some(ap) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            for _attempt in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                {
                    let state = ap.state.lock().expect("sim lock poisoned");
                    if state.ptk.is_some() || !state.associated {
                        return;
                    }
                }
                ap.send_message_1();
            }
        });
    }

    fn send_message_1(&self) {
        let Some(variant) = self.variant() else { return };
        let frame = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            state.replay_counter += 1;
            let message_1 = KeyFrame {
                descriptor_type: variant.descriptor_type(),
                key_info: KeyInfo(
                    self.descriptor_version() | KEY_INFO_TYPE_PAIRWISE | KEY_INFO_ACK,
                ),
                key_length: 16,
                replay_counter: state.replay_counter,
                nonce: state.anonce,
                key_iv: [0; 16],
                key_rsc: 0,
                key_mic: [0; 16],
                key_data: Vec::new(),
            };
            self.data_frame_to_station(
                &mut state,
                wire::ETHERTYPE_EAPOL,
                &message_1.serialize(),
                false,
            )
        };
        if let Some(frame) = frame {
            self.deliver(frame);
        }
    }

    fn descriptor_version(&self) -> u16 {
        match self.variant() {
            Some(WpaVariant::Wpa) => KEY_VERSION_MD5_RC4,
            _ => KEY_VERSION_SHA1_AES,
        }
    }

    fn handle_data(&self, frame: DataFrame) {
        let plain = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            match self.unprotect(&mut state, &frame) {
                Ok(plain) => plain,
                Err(error) => {
                    log::debug!("sim AP dropping data frame: {error}");
                    return;
                }
            }
        };
        let mut buf = &plain[..];
        let Ok(snap) = SnapHeader::parse(&mut buf) else { return };
        if snap.protocol == wire::ETHERTYPE_EAPOL {
            self.handle_eapol(buf.to_vec());
            return;
        }
        // Echo the payload back to the station.
        let payload = buf.to_vec();
        let frame = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            self.data_frame_to_station(&mut state, snap.protocol, &payload, true)
        };
        if let Some(frame) = frame {
            self.deliver(frame);
        }
    }

    fn unprotect(&self, state: &mut ApState, frame: &DataFrame) -> Result<Vec<u8>> {
        if !frame.header.frame_control.protected() {
            return Ok(frame.body.to_vec());
        }
        match &self.config.security {
            ApSecurity::Wep { key } => cipher::wep_decrypt(key, &frame.body),
            _ => match state.rx_key.as_mut() {
                Some(key) => cipher::ccmp_decrypt(key, &frame.header, &frame.body),
                None => Err(StationError::MalformedFrame(
                    "protected frame before handshake".to_string(),
                )),
            },
        }
    }

    fn handle_eapol(&self, payload: Vec<u8>) {
        let Some(variant) = self.variant() else { return };
        let Some(passphrase) = self.passphrase() else { return };
        let Ok(frame) = KeyFrame::parse(&payload) else { return };
        let info = frame.key_info;
        if !info.mic() || info.ack() {
            return;
        }

        // Message 4 carries no nonce; message 2 carries the station nonce.
        if frame.nonce == [0u8; 32] {
            let mut state = self.state.lock().expect("sim lock poisoned");
            let version = self.descriptor_version();
            let verified_tk = match &state.ptk {
                Some(ptk)
                    if eapol::compute_mic(version, &ptk.kck, &frame)
                        .map(|mic| mic == frame.key_mic)
                        .unwrap_or(false) =>
                {
                    Some(ptk.tk)
                }
                _ => None,
            };
            if let Some(tk) = verified_tk {
                state.handshake_done = true;
                state.tx_key = Some(CcmpKeyState::new(tk));
                state.rx_key = Some(CcmpKeyState::new(tk));
                log::info!("sim AP: handshake complete");
            }
            return;
        }

        // Message 2: derive and verify, then answer with message 3.
        let message_3 = {
            let mut state = self.state.lock().expect("sim lock poisoned");
            let Some(station) = state.station_address else { return };
            let version = self.descriptor_version();
            let pmk = eapol::derive_pmk(passphrase, &self.config.ssid);
            let anonce = state.anonce;
            let Ok(ptk) =
                eapol::derive_ptk(&pmk, self.config.bssid, station, &anonce, &frame.nonce)
            else {
                return;
            };
            let Ok(expected) = eapol::compute_mic(version, &ptk.kck, &frame) else {
                return;
            };
            if expected != frame.key_mic {
                log::warn!("sim AP: message 2 MIC mismatch");
                return;
            }

            let mut key_iv = [0u8; 16];
            let key_data = match variant {
                WpaVariant::Wpa2 => {
                    let mut plain = eapol::gtk_kde(&state.gtk, 1);
                    plain.push(0xdd);
                    while plain.len() % 8 != 0 {
                        plain.push(0);
                    }
                    eapol::wrap_key_data(version, &ptk.kek, &key_iv, &plain)
                }
                WpaVariant::Wpa => {
                    rand::thread_rng().fill_bytes(&mut key_iv);
                    let gtk = state.gtk;
                    eapol::wrap_key_data(version, &ptk.kek, &key_iv, &gtk)
                }
            };
            let Ok(key_data) = key_data else { return };

            state.replay_counter += 1;
            let mut key_info = self.descriptor_version()
                | KEY_INFO_TYPE_PAIRWISE
                | KEY_INFO_ACK
                | KEY_INFO_MIC
                | KEY_INFO_INSTALL
                | KEY_INFO_SECURE;
            if variant == WpaVariant::Wpa2 {
                key_info |= KEY_INFO_ENCRYPTED_DATA;
            }
            let mut message_3 = KeyFrame {
                descriptor_type: variant.descriptor_type(),
                key_info: KeyInfo(key_info),
                key_length: 16,
                replay_counter: state.replay_counter,
                nonce: anonce,
                key_iv,
                key_rsc: 0,
                key_mic: [0; 16],
                key_data,
            };
            let Ok(mic) = eapol::compute_mic(version, &ptk.kck, &message_3) else {
                return;
            };
            message_3.key_mic = mic;
            if self.config.faults.tamper_message_3_mic {
                message_3.key_mic[0] ^= 0xff;
            }
            state.ptk = Some(ptk);
            self.data_frame_to_station(
                &mut state,
                wire::ETHERTYPE_EAPOL,
                &message_3.serialize(),
                false,
            )
        };
        if let Some(frame) = message_3 {
            self.deliver(frame);
        }
    }

    fn management_header(
        &self,
        state: &mut ApState,
        subtype: u8,
        destination: [u8; 6],
    ) -> MacHeader {
        state.sequence = (state.sequence + 1) % 4096;
        MacHeader {
            frame_control: FrameControl::management(subtype),
            duration: 0,
            addr1: destination,
            addr2: self.config.bssid,
            addr3: self.config.bssid,
            sequence_control: SequenceControl::new(state.sequence),
        }
    }

    fn data_frame_to_station(
        &self,
        state: &mut ApState,
        protocol: u16,
        payload: &[u8],
        protect: bool,
    ) -> Option<Bytes> {
        let station = state.station_address?;
        state.sequence = (state.sequence + 1) % 4096;
        let mut header = MacHeader {
            frame_control: FrameControl(((wire::TYPE_DATA as u16) << 2) | wire::FC_FROM_DS),
            duration: 0,
            addr1: station,
            addr2: self.config.bssid,
            addr3: self.config.bssid,
            sequence_control: SequenceControl::new(state.sequence),
        };
        let mut body = BytesMut::with_capacity(wire::LLC_SNAP_LEN + payload.len());
        SnapHeader::new(protocol).serialize(&mut body);
        body.extend_from_slice(payload);
        let body = body.freeze();

        let body = if protect {
            match (&self.config.security, state.tx_key.as_mut()) {
                (ApSecurity::Wep { key }, _) => {
                    header.frame_control =
                        FrameControl(header.frame_control.0 | wire::FC_PROTECTED);
                    cipher::wep_encrypt(key, &body).ok()?
                }
                (_, Some(key)) => {
                    let protected = cipher::ccmp_encrypt(key, 0, &header, &body).ok()?;
                    header.frame_control =
                        FrameControl(header.frame_control.0 | wire::FC_PROTECTED);
                    protected
                }
                (_, None) => body.to_vec(),
            }
        } else {
            body.to_vec()
        };

        let mut frame = BytesMut::with_capacity(wire::MAC_HEADER_LEN + body.len());
        header.serialize(&mut frame);
        frame.extend_from_slice(&body);
        Some(frame.freeze())
    }
}

impl crate::device::RadioDevice for SimulatedAccessPoint {
    fn transmit(&self, frame: Bytes) -> Result<()> {
        self.handle_frame(&frame);
        Ok(())
    }

    fn request_channel_change(&self, channel: u8) -> Result<()> {
        self.state.lock().expect("sim lock poisoned").radio_channel = channel;
        Ok(())
    }
}

/// A payload sink that records deliveries for tests and demos
pub struct CollectingSink {
    payloads: Mutex<Vec<(u16, Bytes)>>,
    notify: tokio::sync::Notify,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { payloads: Mutex::new(Vec::new()), notify: tokio::sync::Notify::new() })
    }

    pub fn payloads(&self) -> Vec<(u16, Bytes)> {
        self.payloads.lock().expect("sink lock poisoned").clone()
    }

    /// Wait until at least `count` payloads have been delivered
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.payloads().len() >= count {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

impl crate::device::PayloadSink for CollectingSink {
    fn deliver(&self, protocol: u16, payload: Bytes) {
        self.payloads.lock().expect("sink lock poisoned").push((protocol, payload));
        self.notify.notify_waiters();
    }
}
