//! The data path
//!
//! Encapsulates outbound payloads into 802.11 data frames (802.2 SNAP
//! header, MAC header, sequence number, negotiated cipher) and
//! decapsulates inbound data frames: integrity/decryption checks,
//! duplicate suppression, acknowledgment emission, and delivery of the
//! recovered payload to the upper layer. EAPOL payloads are diverted to
//! the key-exchange engine instead of the upper layer.
//!
//! Frames that fail any check are dropped silently (and counted); a
//! shared radio medium routinely delivers corrupt or replayed frames.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::cipher;
use crate::device::{PayloadSink, RadioDevice};
use crate::frame::{
    ControlSubtype, Frame, FrameControl, MacHeader, SequenceControl,
};
use crate::eapol::EapolEngine;
use crate::link::{Link, LinkState, SessionKeys};
use crate::station::StationStats;
use crate::wire::{self, SnapHeader};
use crate::{Result, StationError};

/// The steady-state frame pipeline for one link
pub struct DataPath {
    link: Arc<Link>,
    device: Arc<dyn RadioDevice>,
    sink: Arc<dyn PayloadSink>,
    eapol: Arc<EapolEngine>,
    stats: Arc<Mutex<StationStats>>,
}

impl DataPath {
    pub fn new(
        link: Arc<Link>,
        device: Arc<dyn RadioDevice>,
        sink: Arc<dyn PayloadSink>,
        eapol: Arc<EapolEngine>,
        stats: Arc<Mutex<StationStats>>,
    ) -> Self {
        Self { link, device, sink, eapol, stats }
    }

    /// Encapsulate and transmit a batch of payloads.
    ///
    /// Packets are consumed; callers must not reuse them. The destination
    /// defaults to the broadcast address. Fails with `LinkNotAssociated`
    /// unless the link is associated.
    pub fn send_data_frames(
        &self,
        packets: Vec<Bytes>,
        source: [u8; 6],
        destination: Option<[u8; 6]>,
        protocol: u16,
    ) -> Result<()> {
        if !self.link.state().allows_data() {
            return Err(StationError::LinkNotAssociated);
        }
        let bssid = self.link.bssid().ok_or(StationError::LinkNotAssociated)?;
        let destination = destination.unwrap_or(wire::BROADCAST_ADDRESS);
        for packet in packets {
            self.send_one(bssid, source, destination, protocol, &packet, true)?;
        }
        Ok(())
    }

    /// Transmit one EAPOL payload toward the AP.
    ///
    /// Key-exchange traffic is never protected by the session cipher and
    /// flows while the link is still in `KeyExchanging`.
    pub fn send_eapol_frame(&self, payload: Bytes) -> Result<()> {
        if !matches!(
            self.link.state(),
            LinkState::KeyExchanging | LinkState::Associated
        ) {
            return Err(StationError::LinkNotAssociated);
        }
        let bssid = self.link.bssid().ok_or(StationError::LinkNotAssociated)?;
        let source = self.link.address();
        self.send_one(bssid, source, bssid, wire::ETHERTYPE_EAPOL, &payload, false)
    }

    fn send_one(
        &self,
        bssid: [u8; 6],
        source: [u8; 6],
        destination: [u8; 6],
        protocol: u16,
        payload: &[u8],
        protect: bool,
    ) -> Result<()> {
        let mut body = BytesMut::with_capacity(wire::LLC_SNAP_LEN + payload.len());
        SnapHeader::new(protocol).serialize(&mut body);
        body.extend_from_slice(payload);
        let body = body.freeze();

        let mut header = MacHeader {
            frame_control: FrameControl::data_to_ds(false),
            duration: 0,
            addr1: bssid,
            addr2: source,
            addr3: destination,
            sequence_control: SequenceControl::new(self.link.next_sequence_number()),
        };
        let (body, protected) = if protect {
            self.protect_body(&header, &body)?
        } else {
            (body.to_vec(), false)
        };
        if protected {
            header.frame_control = FrameControl::data_to_ds(true);
        }
        let mut frame = BytesMut::with_capacity(wire::MAC_HEADER_LEN + body.len());
        header.serialize(&mut frame);
        frame.extend_from_slice(&body);
        let frame = frame.freeze();

        self.stats.lock().expect("stats lock poisoned").record_tx(frame.len());
        self.device.transmit(frame)
    }

    /// Apply the installed session cipher, if any, to an outbound body.
    /// The final header must already carry its addresses; the CCMP AAD
    /// binds them (the protected bit and sequence number are masked).
    fn protect_body(&self, header: &MacHeader, body: &[u8]) -> Result<(Vec<u8>, bool)> {
        self.link.with_keys(|keys| match keys {
            None => Ok((body.to_vec(), false)),
            Some(SessionKeys::Wep { key }) => Ok((cipher::wep_encrypt(key, body)?, true)),
            Some(SessionKeys::Ccmp { pairwise, .. }) => {
                Ok((cipher::ccmp_encrypt(pairwise, 0, header, body)?, true))
            }
        })
    }

    /// Process one received data frame. Never blocks and never reports an
    /// error to the delivery callback's caller: undecodable, duplicate or
    /// unverifiable frames are dropped at the point of detection.
    pub fn process_data_frame(&self, packet: &[u8]) {
        let frame = match Frame::parse(packet) {
            Ok(Frame::Data(frame)) => frame,
            Ok(_) | Err(_) => {
                self.drop_frame(|stats| stats.dropped_malformed += 1);
                return;
            }
        };

        let state = self.link.state();
        if !matches!(state, LinkState::Associated | LinkState::KeyExchanging) {
            self.drop_frame(|stats| stats.dropped_not_ready += 1);
            return;
        }

        let ours = self.link.address();
        let destination = frame.destination();
        let group_addressed = destination[0] & 0x01 != 0;
        if !group_addressed && destination != ours {
            self.drop_frame(|stats| stats.dropped_not_ready += 1);
            return;
        }

        let payload = match self.unprotect_body(&frame.header, &frame.body, group_addressed) {
            Ok(payload) => payload,
            Err(error) => {
                log::debug!("dropping undecryptable data frame: {error}");
                self.drop_frame(|stats| stats.dropped_decrypt += 1);
                return;
            }
        };

        // The frame verified; acknowledge directed frames even when
        // duplicate suppression discards them below (the sender
        // retransmitted because an earlier ACK was lost).
        if !group_addressed {
            let _ = self.send_acknowledge_frame(&frame.header);
        }

        let transmitter = frame.transmitter();
        let sequence = frame.header.sequence_control.sequence;
        if self.link.is_duplicate(transmitter, sequence) {
            self.drop_frame(|stats| stats.dropped_duplicate += 1);
            return;
        }

        let mut buf = &payload[..];
        let snap = match SnapHeader::parse(&mut buf) {
            Ok(snap) => snap,
            Err(_) => {
                self.drop_frame(|stats| stats.dropped_malformed += 1);
                return;
            }
        };
        let payload = Bytes::copy_from_slice(buf);
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .record_rx(packet.len());

        if snap.protocol == wire::ETHERTYPE_EAPOL {
            if !self.eapol.deliver(self.link.id(), payload) {
                log::debug!("EAPOL payload with no handshake in progress, dropped");
            }
            return;
        }
        self.sink.deliver(snap.protocol, payload);
    }

    /// Reverse the session cipher on an inbound body
    fn unprotect_body(
        &self,
        header: &MacHeader,
        body: &[u8],
        group_addressed: bool,
    ) -> Result<Vec<u8>> {
        let protected = header.frame_control.protected();
        self.link.with_keys(|keys| match keys {
            None if protected => Err(StationError::MalformedFrame(
                "protected frame but no keys installed".to_string(),
            )),
            None => Ok(body.to_vec()),
            Some(_) if !protected => {
                // Once keys are installed only EAPOL may arrive in the
                // clear; it is parsed after decapsulation, so accept the
                // body only if it carries the EAPOL protocol number.
                let mut probe = body;
                match SnapHeader::parse(&mut probe) {
                    Ok(snap) if snap.protocol == wire::ETHERTYPE_EAPOL => Ok(body.to_vec()),
                    _ => Err(StationError::MalformedFrame(
                        "unprotected data frame on a keyed link".to_string(),
                    )),
                }
            }
            Some(SessionKeys::Wep { key }) => cipher::wep_decrypt(key, body),
            Some(SessionKeys::Ccmp { pairwise, group, .. }) => {
                let key = if group_addressed { group } else { pairwise };
                cipher::ccmp_decrypt(key, header, body)
            }
        })
    }

    /// Build and transmit an ACK control frame for a received header.
    ///
    /// Uses only fields copied from the received frame; independent of
    /// link state.
    pub fn send_acknowledge_frame(&self, received: &MacHeader) -> Result<()> {
        self.transmit_ack(received.addr2)
    }

    fn transmit_ack(&self, receiver: [u8; 6]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(wire::ACK_FRAME_LEN);
        frame.extend_from_slice(
            &FrameControl::control(wire::SUBTYPE_ACK).0.to_le_bytes(),
        );
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&receiver);
        self.stats.lock().expect("stats lock poisoned").acks_sent += 1;
        self.device.transmit(frame.freeze())
    }

    /// Process one received control frame: acknowledgment-eliciting frames
    /// directed at this station are answered immediately, independent of
    /// any other state.
    pub fn process_control_frame(&self, packet: &[u8]) {
        let frame = match Frame::parse(packet) {
            Ok(Frame::Control(frame)) => frame,
            Ok(_) | Err(_) => {
                self.drop_frame(|stats| stats.dropped_malformed += 1);
                return;
            }
        };
        if frame.receiver != self.link.address() {
            return;
        }
        match (frame.subtype, frame.transmitter) {
            (ControlSubtype::PsPoll | ControlSubtype::Rts, Some(transmitter)) => {
                let _ = self.transmit_ack(transmitter);
            }
            _ => {}
        }
    }

    fn drop_frame(&self, count: impl FnOnce(&mut StationStats)) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        count(&mut stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{BssDescription, CcmpKeyState, EncryptionType, LinkProperties};
    use crate::wire::CipherSuite;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct RecordingDevice {
        frames: StdMutex<Vec<Bytes>>,
    }

    impl RecordingDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self { frames: StdMutex::new(Vec::new()) })
        }

        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl RadioDevice for RecordingDevice {
        fn transmit(&self, frame: Bytes) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn request_channel_change(&self, _channel: u8) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingSink {
        payloads: StdMutex<Vec<(u16, Bytes)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { payloads: StdMutex::new(Vec::new()) })
        }

        fn payloads(&self) -> Vec<(u16, Bytes)> {
            self.payloads.lock().unwrap().clone()
        }
    }

    impl PayloadSink for RecordingSink {
        fn deliver(&self, protocol: u16, payload: Bytes) {
            self.payloads.lock().unwrap().push((protocol, payload));
        }
    }

    const STA: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const AP: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

    fn open_bss() -> BssDescription {
        BssDescription {
            bssid: AP,
            ssid: b"HomeNet".to_vec(),
            channel: 6,
            beacon_interval: 100,
            capabilities: wire::CAP_ESS,
            rates: vec![0x82],
            encryption: EncryptionType::None,
            pairwise: CipherSuite::Open,
            group: CipherSuite::Open,
            association_id: 1,
            last_seen: Utc::now(),
        }
    }

    fn associated_path() -> (DataPath, Arc<RecordingDevice>, Arc<RecordingSink>, Arc<Link>) {
        let link = Arc::new(Link::new(LinkProperties::with_address(STA)));
        link.set_bss(open_bss());
        link.set_state(LinkState::Associated);
        let device = RecordingDevice::new();
        let sink = RecordingSink::new();
        let stats = Arc::new(Mutex::new(StationStats::default()));
        let path = DataPath::new(
            Arc::clone(&link),
            device.clone() as Arc<dyn RadioDevice>,
            sink.clone() as Arc<dyn PayloadSink>,
            Arc::new(EapolEngine::new()),
            stats,
        );
        (path, device, sink, link)
    }

    fn inbound_frame(sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        MacHeader {
            frame_control: FrameControl(((wire::TYPE_DATA as u16) << 2) | wire::FC_FROM_DS),
            duration: 0,
            addr1: STA,
            addr2: AP,
            addr3: AP,
            sequence_control: SequenceControl::new(sequence),
        }
        .serialize(&mut buf);
        SnapHeader::new(wire::ETHERTYPE_IPV4).serialize(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_send_requires_association() {
        let link = Arc::new(Link::new(LinkProperties::with_address(STA)));
        let device = RecordingDevice::new();
        let path = DataPath::new(
            Arc::clone(&link),
            device.clone() as Arc<dyn RadioDevice>,
            RecordingSink::new() as Arc<dyn PayloadSink>,
            Arc::new(EapolEngine::new()),
            Arc::new(Mutex::new(StationStats::default())),
        );
        let result = path.send_data_frames(
            vec![Bytes::from_static(b"x")],
            STA,
            None,
            wire::ETHERTYPE_IPV4,
        );
        assert!(matches!(result, Err(StationError::LinkNotAssociated)));
        assert!(device.frames().is_empty());
    }

    #[test]
    fn test_send_and_receive_round_trip() {
        let (path, device, _sink, _link) = associated_path();
        path.send_data_frames(
            vec![Bytes::from_static(b"ping")],
            STA,
            Some(AP),
            wire::ETHERTYPE_IPV4,
        )
        .unwrap();

        let frames = device.frames();
        assert_eq!(frames.len(), 1);
        let Frame::Data(sent) = Frame::parse(&frames[0]).unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(sent.source(), STA);
        assert_eq!(sent.destination(), AP);
        let mut body = &sent.body[..];
        let snap = SnapHeader::parse(&mut body).unwrap();
        assert_eq!(snap.protocol, wire::ETHERTYPE_IPV4);
        assert_eq!(body, b"ping");
    }

    #[test]
    fn test_receive_delivers_payload_and_acks() {
        let (path, device, sink, _link) = associated_path();
        path.process_data_frame(&inbound_frame(100, b"pong"));
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, wire::ETHERTYPE_IPV4);
        assert_eq!(&payloads[0].1[..], b"pong");
        // A directed frame is acknowledged.
        let frames = device.frames();
        assert_eq!(frames.len(), 1);
        let Frame::Control(ack) = Frame::parse(&frames[0]).unwrap() else {
            panic!("expected control frame");
        };
        assert_eq!(ack.subtype, ControlSubtype::Ack);
        assert_eq!(ack.receiver, AP);
    }

    #[test]
    fn test_duplicate_frame_delivered_once() {
        let (path, _device, sink, _link) = associated_path();
        let frame = inbound_frame(7, b"once");
        path.process_data_frame(&frame);
        path.process_data_frame(&frame);
        assert_eq!(sink.payloads().len(), 1);
    }

    #[test]
    fn test_receive_dropped_when_not_associated() {
        let (path, _device, sink, link) = associated_path();
        link.set_state(LinkState::Idle);
        path.process_data_frame(&inbound_frame(1, b"late"));
        assert!(sink.payloads().is_empty());
    }

    #[test]
    fn test_protected_round_trip_with_ccmp() {
        let (path, _device, sink, link) = associated_path();
        let tk = [0x5a; 16];
        let gtk = [0xa5; 16];
        link.install_keys(SessionKeys::Ccmp {
            pairwise: CcmpKeyState::new(tk),
            group: CcmpKeyState::new(gtk),
            group_key_id: 1,
        });

        // The AP side enciphers with its own counter over the same key.
        let mut ap_key = CcmpKeyState::new(tk);
        let header = MacHeader {
            frame_control: FrameControl(
                ((wire::TYPE_DATA as u16) << 2) | wire::FC_FROM_DS | wire::FC_PROTECTED,
            ),
            duration: 0,
            addr1: STA,
            addr2: AP,
            addr3: AP,
            sequence_control: SequenceControl::new(11),
        };
        let mut plain = Vec::new();
        SnapHeader::new(wire::ETHERTYPE_IPV4).serialize(&mut plain);
        plain.extend_from_slice(b"secret");
        let body = cipher::ccmp_encrypt(&mut ap_key, 0, &header, &plain).unwrap();
        let mut frame = Vec::new();
        header.serialize(&mut frame);
        frame.extend_from_slice(&body);

        path.process_data_frame(&frame);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0].1[..], b"secret");

        // A cleartext data frame must now be refused.
        path.process_data_frame(&inbound_frame(12, b"clear"));
        assert_eq!(sink.payloads().len(), 1);
    }

    #[test]
    fn test_ps_poll_is_acknowledged() {
        let (path, device, _sink, _link) = associated_path();
        let mut frame = Vec::new();
        frame.extend_from_slice(
            &FrameControl::control(wire::SUBTYPE_PS_POLL).0.to_le_bytes(),
        );
        frame.extend_from_slice(&0xc001u16.to_le_bytes());
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&AP);
        path.process_control_frame(&frame);
        let frames = device.frames();
        assert_eq!(frames.len(), 1);
        let Frame::Control(ack) = Frame::parse(&frames[0]).unwrap() else {
            panic!("expected control frame");
        };
        assert_eq!(ack.subtype, ControlSubtype::Ack);
        assert_eq!(ack.receiver, AP);
    }
}
