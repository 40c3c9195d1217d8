//! station80211 demo daemon
//!
//! Drives the protocol engine against an in-process simulated access
//! point: joins the configured BSS (open, WEP, WPA-PSK or WPA2-PSK),
//! pushes a few data frames through the pipeline, and prints the
//! resulting statistics.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use station80211::sim::{ApConfig, ApSecurity, CollectingSink, SimulatedAccessPoint};
use station80211::{
    wire, EapolEngine, LinkProperties, Station, StationConfig,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("station80211d")
        .version(env!("CARGO_PKG_VERSION"))
        .about("802.11 client-station protocol engine demo")
        .arg(
            Arg::new("ssid")
                .short('s')
                .long("ssid")
                .value_name("SSID")
                .help("Network name to join")
                .default_value("HomeNet"),
        )
        .arg(
            Arg::new("passphrase")
                .short('p')
                .long("passphrase")
                .value_name("SECRET")
                .help("Passphrase (required unless --security open)"),
        )
        .arg(
            Arg::new("security")
                .long("security")
                .value_name("MODE")
                .help("Security mode of the simulated BSS")
                .value_parser(["open", "wep", "wpa", "wpa2"])
                .default_value("open"),
        )
        .arg(
            Arg::new("channel")
                .short('c')
                .long("channel")
                .value_name("CHANNEL")
                .help("Channel of the simulated BSS")
                .value_parser(clap::value_parser!(u8))
                .default_value("6"),
        )
        .arg(
            Arg::new("count")
                .short('n')
                .long("count")
                .value_name("FRAMES")
                .help("Number of data frames to echo through the link")
                .value_parser(clap::value_parser!(u32))
                .default_value("3"),
        )
        .get_matches();

    let ssid = matches.get_one::<String>("ssid").expect("defaulted").clone();
    let passphrase = matches.get_one::<String>("passphrase").cloned();
    let security = matches.get_one::<String>("security").expect("defaulted").clone();
    let channel = *matches.get_one::<u8>("channel").expect("defaulted");
    let count = *matches.get_one::<u32>("count").expect("defaulted");

    let ap_security = match (security.as_str(), passphrase.as_deref()) {
        ("open", _) => ApSecurity::Open,
        (_, None) => {
            error!("--security {security} requires --passphrase");
            process::exit(1);
        }
        ("wep", Some(key)) => ApSecurity::Wep { key: key.as_bytes().to_vec() },
        ("wpa", Some(secret)) => ApSecurity::WpaPsk { passphrase: secret.as_bytes().to_vec() },
        ("wpa2", Some(secret)) => {
            ApSecurity::Wpa2Psk { passphrase: secret.as_bytes().to_vec() }
        }
        _ => unreachable!("clap validated the mode"),
    };

    if let Err(error) = run(ssid, passphrase, ap_security, channel, count).await {
        error!("demo failed: {error}");
        process::exit(1);
    }
}

async fn run(
    ssid: String,
    passphrase: Option<String>,
    security: ApSecurity,
    channel: u8,
    count: u32,
) -> station80211::Result<()> {
    let ap = SimulatedAccessPoint::new(ApConfig {
        ssid: ssid.as_bytes().to_vec(),
        channel,
        security,
        ..Default::default()
    });
    let sink = CollectingSink::new();
    let eapol = Arc::new(EapolEngine::new());
    let station = Station::new(
        StationConfig::default(),
        LinkProperties::with_address([0x02, 0, 0, 0, 0, 0x01]),
        ap.clone(),
        sink.clone(),
        Arc::clone(&eapol),
    );
    ap.attach(Arc::clone(&station));

    info!(ssid = %ssid, "joining");
    station
        .join_bss(ssid.as_bytes(), passphrase.as_deref().map(str::as_bytes))
        .await?;
    info!(state = ?station.state(), "joined");

    let source = station.link().address();
    for index in 0..count {
        let payload = Bytes::from(format!("frame {index} over the air"));
        station.send_data_frames(
            vec![payload],
            source,
            None,
            wire::ETHERTYPE_IPV4,
        )?;
    }
    if !sink.wait_for(count as usize, Duration::from_secs(2)).await {
        error!("only {} of {count} echoes arrived", sink.payloads().len());
    }
    for (protocol, payload) in sink.payloads() {
        info!(protocol = %format!("{protocol:#06x}"), len = payload.len(), "echo received");
    }

    let stats = station.stats();
    info!(
        tx_frames = stats.tx_frames,
        rx_frames = stats.rx_frames,
        acks_sent = stats.acks_sent,
        "pipeline statistics"
    );
    station.leave_bss()?;
    info!(state = ?station.state(), "left BSS");
    Ok(())
}
