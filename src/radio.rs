use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    types::{AdapterState, DeviceAddress},
};

/// Events reported by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Adapter power state changed
    AdapterStateChanged(AdapterState),
    /// An advertisement was observed; the address is not normalized
    Advertisement {
        /// Advertised hardware address
        address: String,
    },
    /// A link was dropped by the transport
    Disconnected {
        /// Hardware address of the peer
        address: String,
    },
}

/// Operations the engine needs from the Bluetooth stack
///
/// None of these apply their own timeout; callers bound every call.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Subscribe to adapter and peripheral events
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>>;

    /// Current adapter power state
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Begin reporting advertisements
    async fn start_scan(&self) -> Result<()>;

    /// Stop reporting advertisements
    async fn stop_scan(&self) -> Result<()>;

    /// Transport-level connect
    async fn connect(&self, address: &DeviceAddress) -> Result<()>;

    /// Resolve the vendor service and its read/write endpoint
    async fn discover_endpoint(&self, address: &DeviceAddress) -> Result<()>;

    /// Drop the link
    async fn disconnect(&self, address: &DeviceAddress) -> Result<()>;

    /// Write `command` to the endpoint and read back the response
    async fn exchange(&self, address: &DeviceAddress, command: &[u8]) -> Result<Vec<u8>>;
}
