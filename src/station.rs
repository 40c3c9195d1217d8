//! The station engine
//!
//! Ties the link, the management frame router, the data path and the
//! key-exchange engine together behind one facade: the join driver, the
//! frame delivery entry points invoked by the radio layer, and the
//! data-transmit entry point invoked by the network stack above.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::StationConfig;
use crate::data::DataPath;
use crate::device::{PayloadSink, RadioDevice};
use crate::eapol::{EapolEngine, HandshakeRequest, WpaVariant};
use crate::frame::{
    Frame, FrameControl, MacHeader, ManagementBody, ManagementFrame, ManagementSubtype,
    SequenceControl,
};
use crate::join::{self, JoinEvent, JoinPhase, PhaseOutcome};
use crate::link::{
    BssDescription, EncryptionType, Link, LinkProperties, LinkState, SessionKeys,
};
use crate::router::{FrameWaiter, ManagementFrameRouter};
use crate::wire;
use crate::{Result, StationError};

/// Frame-pipeline counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationStats {
    /// Frames handed to the radio
    pub tx_frames: u64,
    /// Bytes handed to the radio
    pub tx_bytes: u64,
    /// Data frames delivered upward
    pub rx_frames: u64,
    /// Bytes delivered upward
    pub rx_bytes: u64,
    /// Undecodable frames dropped
    pub dropped_malformed: u64,
    /// Retransmissions suppressed by the sequence tracker
    pub dropped_duplicate: u64,
    /// Frames failing decryption or integrity checks
    pub dropped_decrypt: u64,
    /// Frames arriving in a state that does not accept them
    pub dropped_not_ready: u64,
    /// Acknowledgment frames emitted
    pub acks_sent: u64,
}

impl StationStats {
    pub fn record_tx(&mut self, bytes: usize) {
        self.tx_frames += 1;
        self.tx_bytes += bytes as u64;
    }

    pub fn record_rx(&mut self, bytes: usize) {
        self.rx_frames += 1;
        self.rx_bytes += bytes as u64;
    }
}

/// Releases the link's join claim when the driver unwinds
struct JoinGuard<'a>(&'a Link);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.end_join();
    }
}

/// One 802.11 client station
pub struct Station {
    config: StationConfig,
    link: Arc<Link>,
    router: ManagementFrameRouter,
    data: DataPath,
    eapol: Arc<EapolEngine>,
    device: Arc<dyn RadioDevice>,
    stats: Arc<Mutex<StationStats>>,
}

impl Station {
    pub fn new(
        config: StationConfig,
        properties: LinkProperties,
        device: Arc<dyn RadioDevice>,
        sink: Arc<dyn PayloadSink>,
        eapol: Arc<EapolEngine>,
    ) -> Arc<Self> {
        let link = Arc::new(Link::new(properties));
        let stats = Arc::new(Mutex::new(StationStats::default()));
        let router = ManagementFrameRouter::new(config.indication_queue_capacity);
        let data = DataPath::new(
            Arc::clone(&link),
            Arc::clone(&device),
            sink,
            Arc::clone(&eapol),
            Arc::clone(&stats),
        );
        Arc::new(Self { config, link, router, data, eapol, device, stats })
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn stats(&self) -> StationStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Request a radio channel change; no effect on link state
    pub fn set_channel(&self, channel: u8) -> Result<()> {
        self.link.validate_channel(channel)?;
        self.device.request_channel_change(channel)
    }

    /// Claim the oldest unsolicited management indication, if any
    pub fn next_indication(&self) -> Option<ManagementFrame> {
        self.router.take_indication()
    }

    /// Join the BSS advertising the given SSID.
    ///
    /// Scans the supported channels, authenticates, associates and (for a
    /// protected BSS) runs the key exchange. On success the link is
    /// `Associated`; on failure it is `Failed` and the error tells why.
    /// A concurrent second call is rejected with `AlreadyJoining`.
    pub async fn join_bss(&self, ssid: &[u8], passphrase: Option<&[u8]>) -> Result<()> {
        join::validate_inputs(ssid, passphrase)?;
        self.link.begin_join()?;
        let _guard = JoinGuard(&self.link);
        let result = self.run_join(ssid, passphrase).await;
        if result.is_err() {
            self.link.set_state(LinkState::Failed);
        }
        result
    }

    async fn run_join(&self, ssid: &[u8], passphrase: Option<&[u8]>) -> Result<()> {
        // Entering Idle destroys any previous BSS state and session keys.
        self.link.set_state(LinkState::Idle);
        self.router.clear();

        self.link.set_state(LinkState::Scanning);
        let bss = self.scan(ssid).await?;
        join::validate_security(&bss, passphrase)?;
        let bssid = bss.bssid;
        let encryption = bss.encryption;
        self.device.request_channel_change(bss.channel)?;
        self.link.set_bss(bss);

        self.link.set_state(LinkState::Authenticating);
        let mut waiter = self.router.register_waiter(
            vec![ManagementSubtype::Authentication],
            Box::new(move |frame| frame.bssid() == bssid),
        );
        self.transmit_management(join::authentication_request(
            self.link.address(),
            bssid,
            self.link.next_sequence_number(),
        ))?;
        self.await_phase(JoinPhase::Authenticating, &mut waiter).await?;
        drop(waiter);

        self.link.set_state(LinkState::Associating);
        let mut waiter = self.router.register_waiter(
            vec![ManagementSubtype::AssociationResponse],
            Box::new(move |frame| frame.bssid() == bssid),
        );
        let request = {
            let bss = self.link.bss().ok_or(StationError::LinkNotAssociated)?;
            join::association_request(
                self.link.properties(),
                &bss,
                self.link.next_sequence_number(),
            )
        };
        self.transmit_management(request)?;
        let response = self.await_phase(JoinPhase::Associating, &mut waiter).await?;
        drop(waiter);
        if let ManagementBody::AssociationResponse(fields) = &response.body {
            self.link.set_association_id(fields.association_id);
        }

        match encryption {
            EncryptionType::None => {}
            EncryptionType::Wep => {
                let key = passphrase.ok_or_else(|| {
                    StationError::InvalidParameter("WEP requires a key".to_string())
                })?;
                self.link.install_keys(SessionKeys::Wep { key: key.to_vec() });
            }
            EncryptionType::WpaPsk | EncryptionType::Wpa2Psk => {
                self.link.set_state(LinkState::KeyExchanging);
                let passphrase = passphrase.ok_or_else(|| {
                    StationError::InvalidParameter("WPA requires a passphrase".to_string())
                })?;
                let variant = if encryption == EncryptionType::Wpa2Psk {
                    WpaVariant::Wpa2
                } else {
                    WpaVariant::Wpa
                };
                let transmit = |payload: Bytes| self.data.send_eapol_frame(payload);
                let keys = self
                    .eapol
                    .run_supplicant(HandshakeRequest {
                        link_id: self.link.id(),
                        station_address: self.link.address(),
                        ap_address: bssid,
                        ssid,
                        passphrase,
                        variant,
                        timeout: self.config.handshake_timeout(),
                        transmit: &transmit,
                    })
                    .await?;
                self.link.install_keys(keys);
            }
        }

        self.link.set_state(LinkState::Associated);
        Ok(())
    }

    /// Probe each supported channel for the SSID within the scan budget
    async fn scan(&self, ssid: &[u8]) -> Result<BssDescription> {
        let properties = self.link.properties();
        let channels = properties.channels.clone();
        let dwell = self.config.probe_dwell(channels.len());
        for channel in channels {
            if let Err(error) = self.device.request_channel_change(channel) {
                log::warn!("channel change to {channel} failed: {error}");
                continue;
            }
            let wanted = ssid.to_vec();
            let mut waiter = self.router.register_waiter(
                vec![ManagementSubtype::ProbeResponse, ManagementSubtype::Beacon],
                Box::new(move |frame| frame.ssid() == Some(wanted.as_slice())),
            );
            self.transmit_management(join::probe_request(
                properties,
                ssid,
                self.link.next_sequence_number(),
            ))?;
            let deadline = Instant::now() + dwell;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match waiter.recv(remaining).await {
                    Some(frame) => {
                        if let PhaseOutcome::Advance =
                            join::evaluate(JoinPhase::Probing, JoinEvent::Frame(&frame))
                        {
                            if let Some(bss) = join::bss_from_advertisement(&frame, channel) {
                                return Ok(bss);
                            }
                        }
                    }
                    None => break,
                }
            }
        }
        match join::evaluate(JoinPhase::Probing, JoinEvent::TimedOut) {
            PhaseOutcome::Reject(error) => Err(error),
            _ => Err(StationError::NoSuchNetwork),
        }
    }

    /// Drive one waiting phase of the join machine to its outcome
    async fn await_phase(
        &self,
        phase: JoinPhase,
        waiter: &mut FrameWaiter,
    ) -> Result<ManagementFrame> {
        let deadline = Instant::now() + self.config.response_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match waiter.recv(remaining).await {
                Some(frame) => match join::evaluate(phase, JoinEvent::Frame(&frame)) {
                    PhaseOutcome::Advance => return Ok(frame),
                    PhaseOutcome::Continue => continue,
                    PhaseOutcome::Reject(error) => return Err(error),
                },
                None => {
                    return match join::evaluate(phase, JoinEvent::TimedOut) {
                        PhaseOutcome::Reject(error) => Err(error),
                        _ => Err(StationError::Timeout),
                    }
                }
            }
        }
    }

    /// Leave the current BSS: notify the AP and return the link to `Idle`
    pub fn leave_bss(&self) -> Result<()> {
        if !self.link.state().allows_data() {
            return Err(StationError::LinkNotAssociated);
        }
        let bssid = self.link.bssid().ok_or(StationError::LinkNotAssociated)?;
        let mut buf = BytesMut::with_capacity(wire::MAC_HEADER_LEN + 2);
        MacHeader {
            frame_control: FrameControl::management(wire::SUBTYPE_DISASSOCIATION),
            duration: 0,
            addr1: bssid,
            addr2: self.link.address(),
            addr3: bssid,
            sequence_control: SequenceControl::new(self.link.next_sequence_number()),
        }
        .serialize(&mut buf);
        buf.put_u16_le(wire::REASON_DISASSOC_LEAVING);
        // Best effort; the BSS state is torn down either way.
        let _ = self.transmit_management(buf.freeze());
        self.link.set_state(LinkState::Disassociated);
        self.link.set_state(LinkState::Idle);
        Ok(())
    }

    /// Encapsulate and transmit data payloads (see [`DataPath`])
    pub fn send_data_frames(
        &self,
        packets: Vec<Bytes>,
        source: [u8; 6],
        destination: Option<[u8; 6]>,
        protocol: u16,
    ) -> Result<()> {
        self.data.send_data_frames(packets, source, destination, protocol)
    }

    /// Classify and process one received frame
    pub fn process_frame(&self, packet: &[u8]) {
        if packet.len() < 2 {
            self.stats.lock().expect("stats lock poisoned").dropped_malformed += 1;
            return;
        }
        let frame_control = FrameControl(u16::from_le_bytes([packet[0], packet[1]]));
        match frame_control.frame_type() {
            wire::TYPE_MANAGEMENT => self.process_management_frame(packet),
            wire::TYPE_CONTROL => self.process_control_frame(packet),
            wire::TYPE_DATA => self.process_data_frame(packet),
            _ => {
                self.stats.lock().expect("stats lock poisoned").dropped_malformed += 1;
            }
        }
    }

    /// Process one received management frame: satisfy a waiting join step
    /// or queue the frame as an indication. Never blocks.
    pub fn process_management_frame(&self, packet: &[u8]) {
        let frame = match Frame::parse(packet) {
            Ok(Frame::Management(frame)) => frame,
            Ok(_) | Err(_) => {
                self.stats.lock().expect("stats lock poisoned").dropped_malformed += 1;
                return;
            }
        };
        let addr1 = frame.header.addr1;
        let directed = addr1 == self.link.address();
        if !directed && addr1[0] & 0x01 == 0 {
            return;
        }
        if directed {
            let _ = self.data.send_acknowledge_frame(&frame.header);
        }

        let from_current = self.link.bssid() == Some(frame.bssid());
        if from_current && frame.subtype == ManagementSubtype::Beacon {
            self.link.touch_bss(frame.bssid());
        }
        let subtype = frame.subtype;
        self.router.process(frame);

        if from_current
            && matches!(
                subtype,
                ManagementSubtype::Deauthentication | ManagementSubtype::Disassociation
            )
        {
            self.handle_disassociation(subtype);
        }
    }

    /// Process one received control frame (see [`DataPath`])
    pub fn process_control_frame(&self, packet: &[u8]) {
        self.data.process_control_frame(packet);
    }

    /// Process one received data frame (see [`DataPath`])
    pub fn process_data_frame(&self, packet: &[u8]) {
        self.data.process_data_frame(packet);
    }

    fn handle_disassociation(&self, subtype: ManagementSubtype) {
        if matches!(
            self.link.state(),
            LinkState::Associated | LinkState::KeyExchanging
        ) {
            log::warn!("link lost: received {subtype:?} from the current BSS");
            self.link.set_state(LinkState::Disassociated);
            self.link.set_state(LinkState::Idle);
        }
    }

    fn transmit_management(&self, frame: Bytes) -> Result<()> {
        self.stats.lock().expect("stats lock poisoned").record_tx(frame.len());
        self.device.transmit(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{
        ApConfig, ApFaults, ApSecurity, CollectingSink, SimulatedAccessPoint,
    };
    use std::time::Duration;

    fn test_config() -> StationConfig {
        StationConfig {
            scan_timeout_ms: 220,
            response_timeout_ms: 150,
            handshake_timeout_ms: 400,
            indication_queue_capacity: 16,
        }
    }

    fn build(ap_config: ApConfig) -> (Arc<SimulatedAccessPoint>, Arc<Station>, Arc<CollectingSink>) {
        let ap = SimulatedAccessPoint::new(ap_config);
        let sink = CollectingSink::new();
        let station = Station::new(
            test_config(),
            LinkProperties::with_address([0x02, 0, 0, 0, 0, 0x01]),
            ap.clone(),
            sink.clone(),
            Arc::new(EapolEngine::new()),
        );
        ap.attach(Arc::clone(&station));
        (ap, station, sink)
    }

    #[tokio::test]
    async fn test_open_join_reaches_associated() {
        let (_ap, station, _sink) = build(ApConfig::default());
        assert_eq!(station.state(), LinkState::Idle);
        station.join_bss(b"HomeNet", None).await.unwrap();
        assert_eq!(station.state(), LinkState::Associated);
        let bss = station.link().bss().unwrap();
        assert_eq!(bss.ssid, b"HomeNet");
        assert_eq!(bss.channel, 6);
        assert_eq!(bss.encryption, EncryptionType::None);
    }

    #[tokio::test]
    async fn test_silent_ap_times_out_with_no_such_network() {
        let (_ap, station, _sink) = build(ApConfig {
            faults: ApFaults { silent: true, ..Default::default() },
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let result = station.join_bss(b"HomeNet", None).await;
        assert!(matches!(result, Err(StationError::NoSuchNetwork)));
        assert_eq!(station.state(), LinkState::Failed);
        // The scan budget must elapse before the failure is reported.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_refused_authentication_fails_join() {
        let (_ap, station, _sink) = build(ApConfig {
            faults: ApFaults { auth_status: wire::STATUS_DENIED, ..Default::default() },
            ..Default::default()
        });
        let result = station.join_bss(b"HomeNet", None).await;
        assert!(matches!(
            result,
            Err(StationError::AuthenticationFailed(wire::STATUS_DENIED))
        ));
        assert_eq!(station.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_refused_association_fails_join() {
        let (_ap, station, _sink) = build(ApConfig {
            faults: ApFaults { assoc_status: wire::STATUS_DENIED, ..Default::default() },
            ..Default::default()
        });
        let result = station.join_bss(b"HomeNet", None).await;
        assert!(matches!(
            result,
            Err(StationError::AssociationFailed(wire::STATUS_DENIED))
        ));
        assert_eq!(station.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_wpa2_join_runs_the_key_exchange() {
        let (ap, station, _sink) = build(ApConfig {
            security: ApSecurity::Wpa2Psk { passphrase: b"correct horse".to_vec() },
            ..Default::default()
        });
        station.join_bss(b"HomeNet", Some(b"correct horse")).await.unwrap();
        assert_eq!(station.state(), LinkState::Associated);
        assert!(ap.handshake_done());
        assert!(station.link().with_keys(|keys| keys.is_some()));
    }

    #[tokio::test]
    async fn test_wpa_join_runs_the_legacy_key_exchange() {
        let (ap, station, _sink) = build(ApConfig {
            security: ApSecurity::WpaPsk { passphrase: b"correct horse".to_vec() },
            ..Default::default()
        });
        station.join_bss(b"HomeNet", Some(b"correct horse")).await.unwrap();
        assert_eq!(station.state(), LinkState::Associated);
        assert!(ap.handshake_done());
    }

    #[tokio::test]
    async fn test_missing_passphrase_is_invalid_parameter() {
        let (_ap, station, _sink) = build(ApConfig {
            security: ApSecurity::Wpa2Psk { passphrase: b"correct horse".to_vec() },
            ..Default::default()
        });
        let result = station.join_bss(b"HomeNet", None).await;
        assert!(matches!(result, Err(StationError::InvalidParameter(_))));
        assert_eq!(station.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_tampered_message_3_aborts_with_integrity_failure() {
        let (ap, station, _sink) = build(ApConfig {
            security: ApSecurity::Wpa2Psk { passphrase: b"correct horse".to_vec() },
            faults: ApFaults { tamper_message_3_mic: true, ..Default::default() },
            ..Default::default()
        });
        let result = station.join_bss(b"HomeNet", Some(b"correct horse")).await;
        assert!(matches!(result, Err(StationError::HandshakeIntegrityFailure)));
        assert_eq!(station.state(), LinkState::Failed);
        // No keys may be installed after an aborted handshake.
        assert!(station.link().with_keys(|keys| keys.is_none()));
        assert!(!ap.handshake_done());
    }

    #[tokio::test]
    async fn test_withheld_handshake_times_out() {
        let (_ap, station, _sink) = build(ApConfig {
            security: ApSecurity::Wpa2Psk { passphrase: b"correct horse".to_vec() },
            faults: ApFaults { skip_handshake: true, ..Default::default() },
            ..Default::default()
        });
        let result = station.join_bss(b"HomeNet", Some(b"correct horse")).await;
        assert!(matches!(result, Err(StationError::HandshakeTimeout)));
        assert_eq!(station.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_join_is_rejected() {
        let (_ap, station, _sink) = build(ApConfig {
            faults: ApFaults { silent: true, ..Default::default() },
            ..Default::default()
        });
        let first = {
            let station = Arc::clone(&station);
            tokio::spawn(async move { station.join_bss(b"HomeNet", None).await })
        };
        // Give the first join time to claim the link.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = station.join_bss(b"HomeNet", None).await;
        assert!(matches!(second, Err(StationError::AlreadyJoining)));
        let first = first.await.unwrap();
        assert!(matches!(first, Err(StationError::NoSuchNetwork)));
    }

    #[tokio::test]
    async fn test_open_data_echo_round_trip() {
        let (_ap, station, sink) = build(ApConfig::default());
        station.join_bss(b"HomeNet", None).await.unwrap();
        let source = station.link().address();
        station
            .send_data_frames(
                vec![Bytes::from_static(b"over the air")],
                source,
                None,
                wire::ETHERTYPE_IPV4,
            )
            .unwrap();
        assert!(sink.wait_for(1, Duration::from_millis(500)).await);
        let payloads = sink.payloads();
        assert_eq!(payloads[0].0, wire::ETHERTYPE_IPV4);
        assert_eq!(&payloads[0].1[..], b"over the air");
    }

    #[tokio::test]
    async fn test_wpa2_data_echo_is_enciphered_end_to_end() {
        let (_ap, station, sink) = build(ApConfig {
            security: ApSecurity::Wpa2Psk { passphrase: b"correct horse".to_vec() },
            ..Default::default()
        });
        station.join_bss(b"HomeNet", Some(b"correct horse")).await.unwrap();
        let source = station.link().address();
        station
            .send_data_frames(
                vec![Bytes::from_static(b"protected payload")],
                source,
                None,
                wire::ETHERTYPE_IPV4,
            )
            .unwrap();
        assert!(sink.wait_for(1, Duration::from_millis(500)).await);
        assert_eq!(&sink.payloads()[0].1[..], b"protected payload");
    }

    #[tokio::test]
    async fn test_wep_join_and_echo() {
        let (_ap, station, sink) = build(ApConfig {
            security: ApSecurity::Wep { key: b"abcde".to_vec() },
            ..Default::default()
        });
        station.join_bss(b"HomeNet", Some(b"abcde")).await.unwrap();
        assert_eq!(station.state(), LinkState::Associated);
        let source = station.link().address();
        station
            .send_data_frames(
                vec![Bytes::from_static(b"legacy payload")],
                source,
                None,
                wire::ETHERTYPE_IPV4,
            )
            .unwrap();
        assert!(sink.wait_for(1, Duration::from_millis(500)).await);
        assert_eq!(&sink.payloads()[0].1[..], b"legacy payload");
    }

    #[tokio::test]
    async fn test_unsolicited_deauthentication_returns_link_to_idle() {
        let (ap, station, _sink) = build(ApConfig::default());
        station.join_bss(b"HomeNet", None).await.unwrap();
        ap.send_deauthentication(wire::REASON_DEAUTH_LEAVING);
        assert_eq!(station.state(), LinkState::Idle);
        assert!(station.link().bss().is_none());
        // The indication remains available to asynchronous consumers.
        let indication = station.next_indication().unwrap();
        assert_eq!(indication.subtype, ManagementSubtype::Deauthentication);
        // Data traffic is refused after the loss.
        let result = station.send_data_frames(
            vec![Bytes::from_static(b"late")],
            station.link().address(),
            None,
            wire::ETHERTYPE_IPV4,
        );
        assert!(matches!(result, Err(StationError::LinkNotAssociated)));
    }

    #[tokio::test]
    async fn test_set_channel_validates_against_the_channel_plan() {
        let (_ap, station, _sink) = build(ApConfig::default());
        assert!(station.set_channel(6).is_ok());
        assert!(matches!(
            station.set_channel(14),
            Err(StationError::UnsupportedChannel(14))
        ));
        // A channel request never disturbs the link state.
        assert_eq!(station.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_rejoin_after_failure_succeeds() {
        let (ap, station, _sink) = build(ApConfig {
            faults: ApFaults { auth_status: wire::STATUS_DENIED, ..Default::default() },
            ..Default::default()
        });
        assert!(station.join_bss(b"HomeNet", None).await.is_err());
        assert_eq!(station.state(), LinkState::Failed);
        // The AP recovers; the worst outcome of a failed join is retrying.
        let _ = ap;
        let (_ap2, station2, _sink2) = build(ApConfig::default());
        station2.join_bss(b"HomeNet", None).await.unwrap();
        assert_eq!(station2.state(), LinkState::Associated);
    }
}
