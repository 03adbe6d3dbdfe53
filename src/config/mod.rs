//! Bridge configuration, loaded from a TOML file.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Operating mode of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// UDP DFSI (RTP) on one side, FNE on the other.
    UdpDvm,
    /// Serial DFSI on one side, FNE on the other.
    SerialDvm,
    /// Serial DFSI to UDP DFSI. Reserved; not implemented.
    SerialUdp,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Console log level (`-l` enables the console sink).
    pub display_level: String,
    /// File log level.
    pub file_level: String,
    /// Directory the log files are written into.
    pub file_path: String,
    /// Log file name stem; the date and `.log` are appended.
    pub file_root: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            display_level: "info".to_string(),
            file_level: "info".to_string(),
            file_path: ".".to_string(),
            file_root: "dfsi-bridge".to_string(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// FNE ping period, seconds.
    pub ping_time: u32,
    /// Hex-dump every received and sent packet at DEBUG.
    pub raw_packet_trace: bool,
    /// Operating mode: 1 = UDP DFSI, 2 = serial DFSI, 3 = serial/UDP.
    pub mode: u8,

    // FNE connection
    pub name: String,
    pub peer_id: u32,
    pub address: String,
    pub port: u16,
    pub passphrase: String,

    /// FSC maintenance tick and heartbeat period, seconds.
    pub dfsi_heartbeat: u64,
    /// Skip the FSC control channel entirely.
    pub no_connection_establishment: bool,
    /// Select manufacturer framing instead of standard.
    pub the_manufacturer: bool,

    // UDP DFSI
    pub local_rtp_port: u16,
    pub local_control_port: u16,
    pub remote_dfsi_address: String,
    pub remote_control_port: u16,
    pub remote_rtp_port: u16,

    // Serial DFSI
    pub serial_port_name: String,
    pub serial_baudrate: u32,
    /// Jitter buffer delay ahead of the first transmit, milliseconds.
    pub serial_tx_jitter: u64,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ping_time: 5,
            raw_packet_trace: false,
            mode: 1,
            name: String::new(),
            peer_id: 0,
            address: String::new(),
            port: 62031,
            passphrase: String::new(),
            dfsi_heartbeat: 5,
            no_connection_establishment: false,
            the_manufacturer: false,
            local_rtp_port: 22000,
            local_control_port: 22001,
            remote_dfsi_address: String::new(),
            remote_control_port: 22000,
            remote_rtp_port: 22001,
            serial_port_name: String::new(),
            serial_baudrate: 115200,
            serial_tx_jitter: 200,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn mode(&self) -> Result<Mode> {
        Ok(match self.mode {
            1 => Mode::UdpDvm,
            2 => Mode::SerialDvm,
            3 => Mode::SerialUdp,
            other => bail!("Invalid mode {}", other),
        })
    }

    /// Startup validation; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            bail!("FNE address is not configured");
        }
        if self.peer_id == 0 {
            bail!("Peer id must be non-zero");
        }
        match self.mode()? {
            Mode::UdpDvm => {
                if self.remote_dfsi_address.is_empty() {
                    bail!("Remote DFSI address is not configured");
                }
            }
            Mode::SerialDvm => {
                if self.serial_port_name.is_empty() {
                    bail!("Serial port name is not configured");
                }
            }
            Mode::SerialUdp => {}
        }
        Ok(())
    }
}
