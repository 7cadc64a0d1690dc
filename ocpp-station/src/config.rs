//! Station configuration
//!
//! Settings for the charge point identity, the CSMS endpoint and the
//! protocol timing knobs.

use std::path::PathBuf;
use std::time::Duration;

/// Complete charge point configuration.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// CSMS WebSocket URL (without the station id path segment).
    pub csms_url: String,

    /// Charge point identity (appended to the URL).
    pub station_id: String,

    /// Vendor name for BootNotification.
    pub vendor: String,

    /// Model name for BootNotification.
    pub model: String,

    /// Serial number (optional).
    pub serial_number: Option<String>,

    /// Firmware version (optional).
    pub firmware_version: Option<String>,

    /// Number of connectors to report.
    pub connector_count: u32,

    /// Directory for the transaction operation store.
    pub data_dir: PathBuf,

    /// Flush the operation store after every write.
    pub fsync_on_write: bool,

    /// Initial reconnect delay.
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap).
    pub max_reconnect_delay: Duration,

    /// Timeout for ordinary requests.
    pub request_timeout: Duration,

    /// BootNotification retry spacing until the CSMS accepts us. Replaced by
    /// the interval from a Pending/Rejected response once one arrives.
    pub boot_retry_interval: Duration,

    /// Retry spacing for transaction-critical requests.
    pub transaction_retry_interval: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            station_id: "EK3-001".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            model: "EK3-CP".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            connector_count: 1,
            data_dir: PathBuf::from("./ocpp-data"),
            fsync_on_write: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            boot_retry_interval: Duration::from_secs(60),
            transaction_retry_interval: Duration::from_secs(10),
        }
    }
}

impl StationConfig {
    /// Create a config with the two parameters that have no usable default.
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            csms_url: csms_url.into(),
            ..Default::default()
        }
    }

    /// Set vendor info.
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version.
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    /// Set connector count.
    pub fn with_connector_count(mut self, count: u32) -> Self {
        self.connector_count = count;
        self
    }

    /// Set the operation store directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// The full WebSocket URL including the station id.
    pub fn ws_url(&self) -> String {
        format!("{}/{}", self.csms_url.trim_end_matches('/'), self.station_id)
    }
}
