use thiserror::Error;

use crate::types::AdapterState;

/// Errors that can occur while talking to the battery management systems
#[derive(Error, Debug)]
pub enum BmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The radio cannot be used at all
    #[error("Bluetooth adapter unusable: {state}")]
    AdapterFatal {
        /// Adapter state that made the radio unusable
        state: AdapterState,
    },

    /// Transport-level connect did not complete in time
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Transport-level connect failed
    #[error("Failed to connect to device: {0}")]
    ConnectError(String),

    /// The vendor BMS service is not exposed by the device
    #[error("BMS service not found")]
    ServiceNotFound,

    /// The vendor read/write characteristic is missing from the service
    #[error("BMS read/write characteristic not found")]
    CharacteristicNotFound,

    /// A telemetry read did not complete in time
    #[error("Read timed out after {timeout_ms}ms")]
    ReadTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Writing the read command failed
    #[error("Failed to write command: {0}")]
    WriteError(String),

    /// Reading the response from the endpoint failed
    #[error("Failed to read response: {0}")]
    ReadError(String),

    /// Frame shorter than the fixed telemetry layout
    #[error("Frame too short: {len} bytes, expected at least {expected}", expected = crate::protocol::MIN_FRAME_LEN)]
    FrameTooShort {
        /// Received frame length
        len: usize,
    },

    /// Frame could not be decoded
    #[error("Failed to parse frame: {0}")]
    FrameParseError(String),

    /// Hardware address could not be parsed
    #[error("Invalid hardware address: {0}")]
    InvalidAddress(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No link has been established for the device
    #[error("Device not ready: {address}")]
    NotReady {
        /// Address of the device
        address: String,
    },

    /// The background coordinator is no longer running
    #[error("BMS service stopped")]
    ServiceStopped,
}

/// Result type for BMS operations
pub type Result<T> = std::result::Result<T, BmsError>;

impl BmsError {
    /// Check if this error makes the radio permanently unusable
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AdapterFatal { .. })
    }

    /// Check if this error is a failed connect attempt
    ///
    /// All of these count against the device's reconnect budget and are
    /// handled identically.
    #[must_use]
    pub const fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectError(_)
                | Self::ServiceNotFound
                | Self::CharacteristicNotFound
        )
    }

    /// Check if this error only affects a single poll cycle
    #[must_use]
    pub const fn is_cycle_error(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout { .. }
                | Self::WriteError(_)
                | Self::ReadError(_)
                | Self::FrameTooShort { .. }
                | Self::FrameParseError(_)
                | Self::NotReady { .. }
        )
    }
}
