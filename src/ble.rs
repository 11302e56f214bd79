use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{BmsError, Result},
    radio::{Radio, RadioEvent},
    registry::DeviceRegistry,
    types::{AdapterState, BmsConfig, DeviceAddress, Track},
    BMS_CHARACTERISTIC_UUID, BMS_SERVICE_UUID,
};

/// A registered BMS seen during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Normalized hardware address
    pub address: DeviceAddress,
    /// Track the address is registered for
    pub track: Track,
    /// Signal strength at scan time
    pub rssi: Option<i16>,
    /// Advertised name, if any
    pub local_name: Option<String>,
}

#[derive(Clone)]
struct Link {
    peripheral: Peripheral,
    endpoint: Option<Characteristic>,
}

/// [`Radio`] backed by the host Bluetooth stack through btleplug
pub struct BtleRadio {
    _manager: Manager,
    adapter: Adapter,
    links: Arc<Mutex<HashMap<DeviceAddress, Link>>>,
    response_settle: Duration,
}

impl BtleRadio {
    /// Open the first Bluetooth adapter with default settings
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::AdapterFatal`] if no adapter is present or access
    /// is denied, or [`BmsError::Ble`] for other stack failures.
    pub async fn new() -> Result<Self> {
        Self::with_config(&BmsConfig::default()).await
    }

    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Same as [`BtleRadio::new`].
    pub async fn with_config(config: &BmsConfig) -> Result<Self> {
        let manager = Manager::new().await.map_err(map_stack_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_stack_error)?
            .into_iter()
            .next()
            .ok_or(BmsError::AdapterFatal {
                state: AdapterState::Unsupported,
            })?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            _manager: manager,
            adapter,
            links: Arc::new(Mutex::new(HashMap::new())),
            response_settle: Duration::from_millis(config.response_settle_ms),
        })
    }

    /// Scan for a fixed duration and report which registered devices are in range
    ///
    /// Unregistered peripherals are left out. Used for one-off diagnostics,
    /// not by the running service.
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::Ble`] if the scan cannot be started or stopped.
    pub async fn scan_registered(
        &self,
        registry: &DeviceRegistry,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        info!("Scanning for registered BMS devices ({}ms)...", duration.as_millis());

        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(identity) = registry.find(&peripheral.address().to_string()) else {
                continue;
            };

            let properties = peripheral.properties().await.ok().flatten();
            let device = DiscoveredDevice {
                address: identity.address().clone(),
                track: identity.track(),
                rssi: properties.as_ref().and_then(|p| p.rssi),
                local_name: properties.and_then(|p| p.local_name),
            };
            info!(
                "Found {} track BMS {} (rssi {:?})",
                device.track, device.address, device.rssi
            );
            devices.push(device);
        }

        devices.sort_by_key(|d| d.track);
        info!("Scan completed. Found {} registered device(s)", devices.len());
        Ok(devices)
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| address.matches(&p.address().to_string()))
            .ok_or_else(|| BmsError::ConnectError(format!("{address} not seen by adapter")))
    }

    async fn link(&self, address: &DeviceAddress) -> Result<Link> {
        self.links
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| BmsError::NotReady {
                address: address.to_string(),
            })
    }
}

#[async_trait]
impl Radio for BtleRadio {
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>> {
        let mut stream = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let mapped = match event {
                    CentralEvent::StateUpdate(state) => {
                        Some(RadioEvent::AdapterStateChanged(map_state(state)))
                    }
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        address_of(&adapter, &id)
                            .await
                            .map(|address| RadioEvent::Advertisement { address })
                    }
                    CentralEvent::DeviceDisconnected(id) => address_of(&adapter, &id)
                        .await
                        .map(|address| RadioEvent::Disconnected { address }),
                    _ => None,
                };

                if let Some(event) = mapped {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("Adapter event stream closed");
        });

        Ok(rx)
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(map_state(self.adapter.adapter_state().await?))
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| BmsError::ConnectError(e.to_string()))?;

        self.links.lock().await.insert(
            address.clone(),
            Link {
                peripheral,
                endpoint: None,
            },
        );
        Ok(())
    }

    async fn discover_endpoint(&self, address: &DeviceAddress) -> Result<()> {
        let link = self.link(address).await?;
        link.peripheral.discover_services().await?;

        let (service_uuid, characteristic_uuid) = endpoint_uuids()?;
        let services = link.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or(BmsError::ServiceNotFound)?;

        let endpoint = service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic_uuid)
            .ok_or(BmsError::CharacteristicNotFound)?
            .clone();

        if let Some(link) = self.links.lock().await.get_mut(address) {
            link.endpoint = Some(endpoint);
        }
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        let linked = self.links.lock().await.remove(address);
        let peripheral = match linked {
            Some(link) => link.peripheral,
            // Connect abandoned mid-flight; the stack may have finished it anyway
            None => match self.find_peripheral(address).await {
                Ok(peripheral) if peripheral.is_connected().await.unwrap_or(false) => {
                    peripheral
                }
                _ => return Ok(()),
            },
        };
        if let Err(e) = peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {}", address, e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn exchange(&self, address: &DeviceAddress, command: &[u8]) -> Result<Vec<u8>> {
        let link = self.link(address).await?;
        let endpoint = link.endpoint.ok_or_else(|| BmsError::NotReady {
            address: address.to_string(),
        })?;

        trace!("Sending command to {}: {:02X?}", address, command);
        link.peripheral
            .write(&endpoint, command, WriteType::WithoutResponse)
            .await
            .map_err(|e| BmsError::WriteError(e.to_string()))?;

        tokio::time::sleep(self.response_settle).await;

        link.peripheral
            .read(&endpoint)
            .await
            .map_err(|e| BmsError::ReadError(e.to_string()))
    }
}

async fn address_of(adapter: &Adapter, id: &PeripheralId) -> Option<String> {
    adapter
        .peripheral(id)
        .await
        .ok()
        .map(|p| p.address().to_string())
}

fn endpoint_uuids() -> Result<(Uuid, Uuid)> {
    Ok((
        parse_uuid(BMS_SERVICE_UUID, "service")?,
        parse_uuid(BMS_CHARACTERISTIC_UUID, "characteristic")?,
    ))
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| BmsError::InvalidConfig(format!("Invalid {what} UUID: {e}")))
}

fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn map_stack_error(error: btleplug::Error) -> BmsError {
    match error {
        btleplug::Error::PermissionDenied => BmsError::AdapterFatal {
            state: AdapterState::Unauthorized,
        },
        btleplug::Error::NotSupported(_) => BmsError::AdapterFatal {
            state: AdapterState::Unsupported,
        },
        other => BmsError::Ble(other),
    }
}
