//! Per-device connection state machine and scan policy.
//!
//! [`ConnectionManager`] is synchronous and owns the [`DeviceRegistry`]. It
//! consumes typed events (adapter state, advertisements, connect outcomes,
//! drops) and answers with [`RadioCommand`]s for the caller to execute. Time
//! only enters through the injected [`Clock`], so every transition can be
//! exercised without a radio or real delays.
//!
//! The radio is treated as exclusive: at most one scan session and at most
//! one connect attempt exist at any instant, and scanning is paused while an
//! attempt is outstanding.

use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{BmsError, Result},
    registry::{DeviceIdentity, DeviceRegistry, PendingTimer, RetryReason},
    types::{AdapterState, BmsConfig, ConnectionState, DeviceAddress},
};

/// Radio operation requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    /// Begin a scan session
    StartScan,
    /// End or pause the scan session
    StopScan,
    /// Connect and resolve the vendor endpoint of a device
    Connect(DeviceAddress),
    /// Tear down the link to a device
    Disconnect(DeviceAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Stopped,
    Active { ends_at: Instant },
    Paused,
    CoolingDown { restart_at: Instant },
}

/// Connection lifecycle controller for both registered devices
#[derive(Debug)]
pub struct ConnectionManager<C: Clock = SystemClock> {
    registry: DeviceRegistry,
    config: BmsConfig,
    clock: C,
    adapter: AdapterState,
    scan: ScanState,
    in_flight: Option<DeviceAddress>,
}

impl<C: Clock> ConnectionManager<C> {
    /// Create a manager with every device Idle
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidConfig`] if the configuration is rejected.
    pub fn new(config: BmsConfig, clock: C) -> Result<Self> {
        let registry = DeviceRegistry::from_config(&config)?;
        Ok(Self {
            registry,
            config,
            clock,
            adapter: AdapterState::Unknown,
            scan: ScanState::Stopped,
            in_flight: None,
        })
    }

    /// Read-only view of the registry
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Last reported adapter state
    #[must_use]
    pub const fn adapter_state(&self) -> AdapterState {
        self.adapter
    }

    /// A scan session is currently running
    #[must_use]
    pub const fn is_scanning(&self) -> bool {
        matches!(self.scan, ScanState::Active { .. })
    }

    /// Device with an outstanding connect attempt
    #[must_use]
    pub const fn in_flight(&self) -> Option<&DeviceAddress> {
        self.in_flight.as_ref()
    }

    /// Handle an adapter power-state change
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::AdapterFatal`] for unsupported or unauthorized
    /// radios. The manager issues no further commands afterwards.
    pub fn on_adapter_state(&mut self, state: AdapterState) -> Result<Vec<RadioCommand>> {
        if self.adapter.is_fatal() {
            return Ok(Vec::new());
        }

        let previous = self.adapter;
        self.adapter = state;
        if state != previous {
            info!("Adapter state: {} -> {}", previous, state);
        }

        match state {
            AdapterState::Unsupported | AdapterState::Unauthorized => {
                self.scan = ScanState::Stopped;
                Err(BmsError::AdapterFatal { state })
            }
            AdapterState::PoweredOn => {
                for device in self.registry.iter_mut() {
                    if device.state == ConnectionState::Idle {
                        transition(device, ConnectionState::Scanning);
                    }
                }
                Ok(self.ensure_scanning())
            }
            AdapterState::PoweredOff | AdapterState::Unknown => {
                // Scans end with the radio; Ready links report their own drops.
                self.scan = ScanState::Stopped;
                Ok(Vec::new())
            }
        }
    }

    /// Handle an advertisement seen during scanning
    ///
    /// Starts at most one connect attempt system-wide. Addresses outside the
    /// registry are ignored.
    pub fn on_advertisement(&mut self, address: &str) -> Vec<RadioCommand> {
        let Some(address) = self.registry.find(address).map(|d| d.address().clone()) else {
            trace!("Ignoring advertisement from unregistered {}", address);
            return Vec::new();
        };

        if self.adapter != AdapterState::PoweredOn {
            return Vec::new();
        }
        if let Some(busy) = &self.in_flight {
            debug!("Advertisement from {} while connecting to {}", address, busy);
            return Vec::new();
        }

        let max_attempts = self.config.max_reconnect_attempts;
        let Some(device) = self.registry.get_mut(&address) else {
            return Vec::new();
        };
        if device.state != ConnectionState::Scanning || device.is_exhausted(max_attempts) {
            return Vec::new();
        }

        info!(
            "Found {} track BMS {} (attempt {}/{})",
            device.track(),
            address,
            device.reconnect_attempts + 1,
            max_attempts
        );
        transition(device, ConnectionState::Connecting);
        self.in_flight = Some(address.clone());

        let mut commands = Vec::new();
        if self.is_scanning() {
            commands.push(RadioCommand::StopScan);
        }
        self.scan = ScanState::Paused;
        commands.push(RadioCommand::Connect(address));
        commands
    }

    /// Transport-level connect succeeded
    pub fn on_connected(&mut self, address: &DeviceAddress) -> Vec<RadioCommand> {
        if self.in_flight.as_ref() != Some(address) {
            return Vec::new();
        }
        if let Some(device) = self.registry.get_mut(address) {
            if device.state == ConnectionState::Connecting {
                transition(device, ConnectionState::Discovering);
            }
        }
        Vec::new()
    }

    /// Vendor service and endpoint resolved
    pub fn on_endpoint_resolved(&mut self, address: &DeviceAddress) -> Vec<RadioCommand> {
        if self.in_flight.as_ref() != Some(address) {
            return Vec::new();
        }
        if let Some(device) = self.registry.get_mut(address) {
            if device.state != ConnectionState::Discovering {
                return Vec::new();
            }
            transition(device, ConnectionState::Ready);
            device.pending = None;
            device.last_error = None;
        }
        self.in_flight = None;
        self.resume_scanning()
    }

    /// Connect or discovery attempt failed
    ///
    /// Releases any partial link and counts against the reconnect budget.
    /// The device retries after the connect backoff until the budget is used
    /// up, then stays excluded.
    pub fn on_connect_failed(
        &mut self,
        address: &DeviceAddress,
        error: &BmsError,
    ) -> Vec<RadioCommand> {
        if self.in_flight.as_ref() != Some(address) {
            return Vec::new();
        }
        self.in_flight = None;

        let mut commands = Vec::new();
        let now = self.clock.now();
        let delay = Duration::from_millis(self.config.connect_retry_delay_ms);
        let max_attempts = self.config.max_reconnect_attempts;

        if let Some(device) = self.registry.get_mut(address) {
            // A timed-out connect may still complete in the stack
            if matches!(
                device.state,
                ConnectionState::Connecting | ConnectionState::Discovering
            ) {
                commands.push(RadioCommand::Disconnect(address.clone()));
            }
            device.reconnect_attempts = (device.reconnect_attempts + 1).min(max_attempts);
            device.last_error = Some(error.to_string());
            transition(device, ConnectionState::Disconnected);

            if device.is_exhausted(max_attempts) {
                device.pending = None;
                warn!(
                    "{} track BMS {} failed {} connect attempts, giving up until restart: {}",
                    device.track(),
                    address,
                    device.reconnect_attempts,
                    error
                );
            } else {
                device.pending = Some(PendingTimer {
                    due: now + delay,
                    reason: RetryReason::ConnectFailed,
                });
                warn!(
                    "Connect to {} failed ({}/{}), retrying in {}ms: {}",
                    address, device.reconnect_attempts, max_attempts, delay.as_millis(), error
                );
            }
        }

        commands.extend(self.resume_scanning());
        commands
    }

    /// Transport link dropped
    ///
    /// Only affects Ready devices; drops during an attempt surface as a
    /// failed attempt instead. Does not touch the reconnect counter.
    pub fn on_disconnected(&mut self, address: &str) -> Vec<RadioCommand> {
        let Some(address) = self.registry.find(address).map(|d| d.address().clone()) else {
            return Vec::new();
        };

        let now = self.clock.now();
        let delay = Duration::from_millis(self.config.drop_retry_delay_ms);
        let max_attempts = self.config.max_reconnect_attempts;

        if let Some(device) = self.registry.get_mut(&address) {
            if device.state != ConnectionState::Ready {
                return Vec::new();
            }
            warn!("{} track BMS {} disconnected", device.track(), address);
            transition(device, ConnectionState::Disconnected);
            device.pending = if device.is_exhausted(max_attempts) {
                None
            } else {
                Some(PendingTimer {
                    due: now + delay,
                    reason: RetryReason::Dropped,
                })
            };
        }

        Vec::new()
    }

    /// Record a successful read for a device
    pub fn on_data_received(&mut self, address: &DeviceAddress) {
        let now = self.clock.wall_time();
        if let Some(device) = self.registry.get_mut(address) {
            device.last_data = Some(now);
        }
    }

    /// Record a failed read; the connection state is left alone
    pub fn on_read_failed(&mut self, address: &DeviceAddress, error: &BmsError) {
        if let Some(device) = self.registry.get_mut(address) {
            device.last_error = Some(error.to_string());
        }
    }

    /// Fire every timer that is due
    pub fn poll_timers(&mut self) -> Vec<RadioCommand> {
        let now = self.clock.now();
        let mut commands = Vec::new();

        for device in self.registry.iter_mut() {
            if let Some(timer) = device.pending {
                if timer.due <= now {
                    device.pending = None;
                    debug!("{} retry timer ({:?}) fired", device.address(), timer.reason);
                    transition(device, ConnectionState::Scanning);
                }
            }
        }

        match self.scan {
            ScanState::Active { ends_at } if ends_at <= now => {
                commands.push(RadioCommand::StopScan);
                self.scan = if self.wants_scan() {
                    let restart_at = now + Duration::from_millis(self.config.scan_restart_delay_ms);
                    info!(
                        "Scan session ended with devices missing, rescanning in {}ms",
                        self.config.scan_restart_delay_ms
                    );
                    ScanState::CoolingDown { restart_at }
                } else {
                    ScanState::Stopped
                };
            }
            ScanState::CoolingDown { restart_at } if restart_at <= now => {
                self.scan = ScanState::Stopped;
            }
            _ => {}
        }

        commands.extend(self.ensure_scanning());
        commands
    }

    /// Earliest instant at which [`Self::poll_timers`] has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let scan = match self.scan {
            ScanState::Active { ends_at } => Some(ends_at),
            ScanState::CoolingDown { restart_at } => Some(restart_at),
            ScanState::Stopped | ScanState::Paused => None,
        };

        self.registry
            .iter()
            .filter_map(|d| d.pending.map(|t| t.due))
            .chain(scan)
            .min()
    }

    /// Commands that release the radio on shutdown
    pub fn shutdown(&mut self) -> Vec<RadioCommand> {
        let mut commands = Vec::new();
        if self.is_scanning() {
            commands.push(RadioCommand::StopScan);
        }
        self.scan = ScanState::Stopped;

        for device in self.registry.iter_mut() {
            let linked = matches!(
                device.state,
                ConnectionState::Ready | ConnectionState::Connecting | ConnectionState::Discovering
            );
            if linked {
                commands.push(RadioCommand::Disconnect(device.address().clone()));
            }
            device.pending = None;
            if device.state != ConnectionState::Idle {
                transition(device, ConnectionState::Disconnected);
            }
        }
        self.in_flight = None;
        commands
    }

    fn wants_scan(&self) -> bool {
        self.adapter == AdapterState::PoweredOn
            && self
                .registry
                .iter()
                .any(|d| d.state == ConnectionState::Scanning)
    }

    fn ensure_scanning(&mut self) -> Vec<RadioCommand> {
        if self.scan != ScanState::Stopped || self.in_flight.is_some() || !self.wants_scan() {
            return Vec::new();
        }

        let ends_at = self.clock.now() + Duration::from_millis(self.config.scan_timeout_ms);
        self.scan = ScanState::Active { ends_at };
        info!("Starting scan session ({}ms)", self.config.scan_timeout_ms);
        vec![RadioCommand::StartScan]
    }

    fn resume_scanning(&mut self) -> Vec<RadioCommand> {
        if self.scan == ScanState::Paused {
            self.scan = ScanState::Stopped;
        }
        self.ensure_scanning()
    }
}

fn transition(device: &mut DeviceIdentity, to: ConnectionState) {
    if device.state != to {
        info!(
            "{} track BMS {}: {} -> {}",
            device.track(),
            device.address(),
            device.state,
            to
        );
        device.state = to;
    }
}
