//! OCPP Station Node - CLI charge point
//!
//! Runs a charge point client against a CSMS.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! ocpp-station-node --station CS001
//!
//! # Connect to a specific CSMS
//! ocpp-station-node --station CS001 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Custom data directory for the transaction store
//! ocpp-station-node --station CS001 --data-dir /var/lib/ocpp
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ocpp_station::{ResetKind, Station, StationConfig, WsConfig, WsConnection};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 charge point node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OCPP station ID
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// CSMS WebSocket URL
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    csms_url: String,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-CP")]
    model: String,

    /// Number of connectors
    #[arg(long, default_value = "1")]
    connectors: u32,

    /// Data directory for the transaction operation store
    #[arg(long, default_value = "./ocpp-data")]
    data_dir: PathBuf,

    /// Engine tick interval in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = StationConfig::new(&args.station, &args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_connector_count(args.connectors)
        .with_data_dir(&args.data_dir);

    info!(
        station = %config.station_id,
        csms = %config.csms_url,
        "starting charge point node"
    );

    let connection = WsConnection::spawn(WsConfig::for_station(&config));
    let mut station = Station::new(config, connection)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(10)));
    loop {
        ticker.tick().await;
        station.tick();

        let pending_reset = station.state().lock().pending_reset.take();
        if let Some(kind) = pending_reset {
            match kind {
                ResetKind::Soft => {
                    info!("soft reset requested, exiting for supervisor restart");
                    break;
                }
                ResetKind::Hard => {
                    info!("hard reset requested, exiting for supervisor restart");
                    break;
                }
            }
        }
    }

    Ok(())
}
