#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # dualbms
//!
//! Telemetry engine for two LiFePO4 battery strings, each watched by its own
//! Bluetooth Low Energy BMS.
//!
//! The engine keeps a connection to both BMS units, polls them on a fixed
//! interval and turns the vendor's binary frames into per-cell readings with
//! a charge estimate and a health classification. Either device may be
//! missing or failing without affecting the other.
//!
//! ## Protocol
//!
//! Both units speak the same vendor protocol over a single read/write
//! characteristic:
//!
//! - **Request**: the fixed 7-byte frame `DD A5 03 00 FF FD 77`
//! - **Response**: at least 34 bytes; pack current, cell voltages,
//!   temperature and cell count at fixed big-endian offsets
//! - **Numbering**: cells on the secondary track are numbered after those on
//!   the primary track (1..4 and 5..8 with four cells per track)
//!
//! ## Connection policy
//!
//! - One scan session and one connect attempt at a time across the system
//! - Failed connects retry after 2 s, dropped links after 3 s
//! - A device that fails `max_reconnect_attempts` connects in a row is left
//!   alone until the process restarts
//!
//! ## Quick Start
//!
//! ```no_run
//! use dualbms::{BmsConfig, BmsService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BmsConfig::with_addresses("A4:C1:38:7C:2D:F0", "E0:9F:2A:E4:94:1D")?;
//!     let service = BmsService::start_ble(config).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!
//!     for r in service.read_battery_data().await {
//!         println!("#{} {:.2}V {}%", r.battery_number, r.voltage, r.charge_level);
//!     }
//!     println!("{:?}", service.get_connection_status());
//!
//!     Ok(())
//! }
//! ```

/// btleplug-backed radio
pub mod ble;
/// Injectable time source
pub mod clock;
/// Connection state machine and scan policy
pub mod connection;
/// Error types and handling
pub mod error;
/// Vendor frame codec
pub mod protocol;
/// Radio abstraction used by the engine
pub mod radio;
/// Registered devices and their bookkeeping
pub mod registry;
/// Fixed-interval telemetry polling
pub mod scheduler;
/// Running engine and its public operations
pub mod service;
/// Charge estimate and health classification
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

pub use ble::{BtleRadio, DiscoveredDevice};
pub use error::{BmsError, Result};
pub use radio::{Radio, RadioEvent};
pub use registry::DeviceRegistry;
pub use service::BmsService;
pub use types::{
    AdapterState, BatteryReading, BmsConfig, ConnectionState, ConnectionStatus, DeviceAddress,
    DeviceConfig, DeviceStatusEntry, HealthStatus, Track,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Vendor GATT service carrying the BMS endpoint
pub const BMS_SERVICE_UUID: &str = "0000ff00-0000-1000-8000-00805f9b34fb";

/// Characteristic used both to write the read command and to read the response
pub const BMS_CHARACTERISTIC_UUID: &str = "0000ff02-0000-1000-8000-00805f9b34fb";
