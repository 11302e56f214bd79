use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration, time::SystemTime};

use crate::error::{BmsError, Result};

/// Physical battery string served by one BMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// First track, batteries numbered from 1
    #[serde(alias = "left")]
    Primary,
    /// Second track, numbered after the primary track's cells
    #[serde(alias = "right")]
    Secondary,
}

impl Track {
    /// Both tracks in numbering order
    pub const ALL: [Self; 2] = [Self::Primary, Self::Secondary];

    /// Offset added to a local cell position to get the global battery number
    #[must_use]
    pub const fn index_offset(self, cells_per_track: u8) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Secondary => cells_per_track,
        }
    }

    /// Global battery number for a 1-based position within this track
    #[must_use]
    pub const fn global_index(self, cells_per_track: u8, position: u8) -> u8 {
        self.index_offset(cells_per_track) + position
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Health classification of a single cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Cell voltage in the normal operating band
    Normal,
    /// Cell voltage is getting low
    Warning,
    /// Cell voltage is below the safe floor
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Connection lifecycle of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing attempted yet
    Idle,
    /// Waiting for an advertisement from the device
    Scanning,
    /// Transport-level connect in flight
    Connecting,
    /// Looking up the vendor service and endpoint
    Discovering,
    /// Endpoint resolved, reads may be issued
    Ready,
    /// Link lost or attempt failed
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Power state of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    /// State not reported yet
    Unknown,
    /// Radio is on and usable
    PoweredOn,
    /// Radio is switched off
    PoweredOff,
    /// No usable adapter on this host
    Unsupported,
    /// Process lacks permission to use the radio
    Unauthorized,
}

impl AdapterState {
    /// Check whether this state rules out any further radio use
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Unsupported | Self::Unauthorized)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::PoweredOn => write!(f, "Powered On"),
            Self::PoweredOff => write!(f, "Powered Off"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

/// Normalized Bluetooth hardware address
///
/// Stored as upper-case, colon separated octets so that comparisons are
/// case-insensitive. Dashes are accepted as separators on input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse and normalize an address string
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidAddress`] unless the input is six hex octets.
    pub fn parse(address: &str) -> Result<Self> {
        let octets = Self::octets(address)?;
        Ok(Self(
            octets
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
        ))
    }

    /// Raw address bytes
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidAddress`] if the address is malformed.
    pub fn octets(address: &str) -> Result<[u8; 6]> {
        let normalized = address.trim().replace('-', ":");
        let parts: Vec<&str> = normalized.split(':').collect();
        if parts.len() != 6 {
            return Err(BmsError::InvalidAddress(format!(
                "{address}. Expected format: XX:XX:XX:XX:XX:XX"
            )));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(BmsError::InvalidAddress(format!("{address}: bad octet {part}")));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| BmsError::InvalidAddress(format!("{address}: bad octet {part}")))?;
        }

        Ok(bytes)
    }

    /// Normalized string form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against an unnormalized address
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        Self::parse(other).is_ok_and(|other| other == *self)
    }
}

impl FromStr for DeviceAddress {
    type Err = BmsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = BmsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded cell measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryReading {
    /// Global battery number across both tracks
    pub battery_number: u8,
    /// Track the cell belongs to
    pub track: Track,
    /// 1-based position within the track
    pub track_position: u8,
    /// Cell voltage in volts, 2 decimals
    pub voltage: f64,
    /// Pack current magnitude in amps, 2 decimals
    pub amperage: f64,
    /// Pack temperature in degrees Celsius
    pub temperature: i32,
    /// Estimated state of charge, 0-100
    pub charge_level: u8,
    /// Health classification
    pub status: HealthStatus,
}

/// Connected flags per track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Primary track device is Ready
    pub primary_connected: bool,
    /// Secondary track device is Ready
    pub secondary_connected: bool,
    /// At least one device is Ready
    pub any_connected: bool,
}

/// Diagnostic view of one registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusEntry {
    /// Track served by the device
    pub track: Track,
    /// Device is Ready
    pub connected: bool,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Failed connect attempts so far
    pub reconnect_attempts: u32,
    /// Time of the last successfully decoded frame
    pub last_data_timestamp: Option<SystemTime>,
    /// Most recent connect or read failure
    pub last_error: Option<String>,
}

/// Startup identity of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hardware address
    pub address: DeviceAddress,
    /// Track served by this BMS
    pub track: Track,
}

/// Largest `cells_per_track` whose global battery numbers fit in a `u8`
pub const MAX_CELLS_PER_TRACK: u8 = u8::MAX / 2;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmsConfig {
    /// Exactly two devices, one per track
    pub devices: Vec<DeviceConfig>,
    /// Poll tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// Cells decoded per track
    pub cells_per_track: u8,
    /// Transport connect and discovery timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Length of one scan session in milliseconds
    pub scan_timeout_ms: u64,
    /// Failed connects tolerated before a device is excluded
    pub max_reconnect_attempts: u32,
    /// Per-device read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay before rescanning after a failed connect
    pub connect_retry_delay_ms: u64,
    /// Delay before rescanning after a drop from Ready
    pub drop_retry_delay_ms: u64,
    /// Pause between scan sessions while a device is missing
    pub scan_restart_delay_ms: u64,
    /// How long to wait for the adapter to power on
    pub adapter_timeout_ms: u64,
    /// Wait between writing the read command and reading the endpoint
    pub response_settle_ms: u64,
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceConfig {
                    address: DeviceAddress("A4:C1:38:7C:2D:F0".to_string()),
                    track: Track::Primary,
                },
                DeviceConfig {
                    address: DeviceAddress("E0:9F:2A:E4:94:1D".to_string()),
                    track: Track::Secondary,
                },
            ],
            poll_interval_ms: 2_000,
            cells_per_track: 4,
            connection_timeout_ms: 15_000,
            scan_timeout_ms: 30_000,
            max_reconnect_attempts: 5,
            read_timeout_ms: 5_000,
            connect_retry_delay_ms: 2_000,
            drop_retry_delay_ms: 3_000,
            scan_restart_delay_ms: 5_000,
            adapter_timeout_ms: 10_000,
            response_settle_ms: 100,
        }
    }
}

impl BmsConfig {
    /// Build a configuration for two addresses with default timings
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidAddress`] if either address is malformed.
    pub fn with_addresses(primary: &str, secondary: &str) -> Result<Self> {
        Ok(Self {
            devices: vec![
                DeviceConfig {
                    address: DeviceAddress::parse(primary)?,
                    track: Track::Primary,
                },
                DeviceConfig {
                    address: DeviceAddress::parse(secondary)?,
                    track: Track::Secondary,
                },
            ],
            ..Self::default()
        })
    }

    /// Check the configuration before the engine starts
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.devices.len() != 2 {
            return Err(BmsError::InvalidConfig(format!(
                "expected exactly 2 devices, got {}",
                self.devices.len()
            )));
        }
        for track in Track::ALL {
            if !self.devices.iter().any(|d| d.track == track) {
                return Err(BmsError::InvalidConfig(format!("no device for {track} track")));
            }
        }
        if self.devices[0].address == self.devices[1].address {
            return Err(BmsError::InvalidConfig(format!(
                "both tracks use address {}",
                self.devices[0].address
            )));
        }
        if self.cells_per_track == 0 || self.cells_per_track > MAX_CELLS_PER_TRACK {
            return Err(BmsError::InvalidConfig(format!(
                "cells_per_track must be between 1 and {MAX_CELLS_PER_TRACK}, got {}",
                self.cells_per_track
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(BmsError::InvalidConfig(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll tick interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Transport connect timeout
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Per-device read timeout
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Adapter power-up timeout
    #[must_use]
    pub const fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_numbering() {
        for position in 1..=4 {
            assert_eq!(Track::Primary.global_index(4, position), position);
            assert_eq!(Track::Secondary.global_index(4, position), position + 4);
        }
    }

    #[test]
    fn test_address_normalization() {
        let lower = DeviceAddress::parse("a4:c1:38:7c:2d:f0").unwrap();
        let upper = DeviceAddress::parse("A4:C1:38:7C:2D:F0").unwrap();
        let dashed = DeviceAddress::parse(" a4-c1-38-7c-2d-f0 ").unwrap();

        assert_eq!(lower, upper);
        assert_eq!(lower, dashed);
        assert_eq!(lower.as_str(), "A4:C1:38:7C:2D:F0");
        assert!(upper.matches("a4:C1:38:7c:2D:f0"));
        assert!(!upper.matches("E0:9F:2A:E4:94:1D"));
    }

    #[test]
    fn test_address_parsing_rejects_malformed() {
        let invalid = vec![
            "12:34:56:78:9A",       // Too short
            "12:34:56:78:9A:BC:DE", // Too long
            "12:34:56:78:9A:XY",    // Invalid hex
            "",                     // Empty string
            "12:34:56:78:9A:BC::",  // Extra separator
            "123:4:56:78:9A:BC",    // Uneven octets
        ];

        for address in invalid {
            assert!(
                DeviceAddress::parse(address).is_err(),
                "address parsing should have failed for: {address}"
            );
        }

        assert_eq!(
            DeviceAddress::octets("12:34:56:78:9A:BC").unwrap(),
            [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = BmsConfig::default();

        assert_eq!(config.poll_interval_ms, 2_000);
        assert_eq!(config.cells_per_track, 4);
        assert_eq!(config.connection_timeout_ms, 15_000);
        assert_eq!(config.scan_timeout_ms, 30_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.read_timeout_ms, 5_000);
        assert_eq!(config.connect_retry_delay_ms, 2_000);
        assert_eq!(config.drop_retry_delay_ms, 3_000);
        assert_eq!(config.scan_restart_delay_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BmsConfig::default();
        config.devices.pop();
        assert!(matches!(config.validate(), Err(BmsError::InvalidConfig(_))));

        let mut config = BmsConfig::default();
        config.devices[1].track = Track::Primary;
        assert!(matches!(config.validate(), Err(BmsError::InvalidConfig(_))));

        let mut config = BmsConfig::default();
        config.devices[1].address = config.devices[0].address.clone();
        assert!(matches!(config.validate(), Err(BmsError::InvalidConfig(_))));

        let config = BmsConfig {
            cells_per_track: 0,
            ..BmsConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(BmsConfig::with_addresses("aa:bb:cc:dd:ee:ff", "11:22:33:44:55:66")
            .unwrap()
            .validate()
            .is_ok());
        assert!(BmsConfig::with_addresses("aa:bb:cc", "11:22:33:44:55:66").is_err());
    }

    #[test]
    fn test_cells_per_track_bounded_by_numbering() {
        let largest = BmsConfig {
            cells_per_track: MAX_CELLS_PER_TRACK,
            ..BmsConfig::default()
        };
        assert!(largest.validate().is_ok());
        // Highest secondary number still fits
        assert_eq!(
            Track::Secondary.global_index(MAX_CELLS_PER_TRACK, MAX_CELLS_PER_TRACK),
            254
        );

        for cells_per_track in [MAX_CELLS_PER_TRACK + 1, 200, u8::MAX] {
            let config = BmsConfig {
                cells_per_track,
                ..BmsConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(BmsError::InvalidConfig(_))),
                "{cells_per_track} cells per track should be rejected"
            );
        }
    }

    #[test]
    fn test_track_display_and_offsets() {
        assert_eq!(Track::Primary.to_string(), "primary");
        assert_eq!(Track::Secondary.to_string(), "secondary");
        assert_eq!(Track::Primary.index_offset(4), 0);
        assert_eq!(Track::Secondary.index_offset(4), 4);
        assert_eq!(HealthStatus::Critical.to_string(), "critical");
    }
}
