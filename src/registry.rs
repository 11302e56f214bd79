use std::{
    collections::BTreeMap,
    time::{Instant, SystemTime},
};

use crate::{
    error::{BmsError, Result},
    types::{
        BmsConfig, ConnectionState, ConnectionStatus, DeviceAddress, DeviceStatusEntry, Track,
    },
};

/// Why a device is waiting before it may be scanned for again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// A connect or discovery attempt failed
    ConnectFailed,
    /// The link dropped while Ready
    Dropped,
}

/// The single outstanding timer of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    /// When the device returns to Scanning
    pub due: Instant,
    /// What scheduled the timer
    pub reason: RetryReason,
}

/// One registered BMS and its connection bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    address: DeviceAddress,
    track: Track,
    pub(crate) state: ConnectionState,
    pub(crate) last_data: Option<SystemTime>,
    pub(crate) reconnect_attempts: u32,
    pub(crate) pending: Option<PendingTimer>,
    pub(crate) last_error: Option<String>,
}

impl DeviceIdentity {
    fn new(address: DeviceAddress, track: Track) -> Self {
        Self {
            address,
            track,
            state: ConnectionState::Idle,
            last_data: None,
            reconnect_attempts: 0,
            pending: None,
            last_error: None,
        }
    }

    /// Normalized hardware address
    #[must_use]
    pub const fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Track served by this device
    #[must_use]
    pub const fn track(&self) -> Track {
        self.track
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed connect attempts so far
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Time of the last successful read
    #[must_use]
    pub const fn last_data(&self) -> Option<SystemTime> {
        self.last_data
    }

    /// Scheduled return to Scanning, if any
    #[must_use]
    pub const fn pending(&self) -> Option<PendingTimer> {
        self.pending
    }

    /// Device is Ready for reads
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Reconnect budget used up; the device stays excluded until restart
    #[must_use]
    pub const fn is_exhausted(&self, max_reconnect_attempts: u32) -> bool {
        self.reconnect_attempts >= max_reconnect_attempts
    }

    fn status_entry(&self) -> DeviceStatusEntry {
        DeviceStatusEntry {
            track: self.track,
            connected: self.is_ready(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            last_data_timestamp: self.last_data,
            last_error: self.last_error.clone(),
        }
    }
}

/// Fixed table of the two registered devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: [DeviceIdentity; 2],
}

impl DeviceRegistry {
    /// Build the registry from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidConfig`] if the configuration does not
    /// describe exactly one device per track.
    pub fn from_config(config: &BmsConfig) -> Result<Self> {
        config.validate()?;

        let identity = |track: Track| -> Result<DeviceIdentity> {
            config
                .devices
                .iter()
                .find(|d| d.track == track)
                .map(|d| DeviceIdentity::new(d.address.clone(), d.track))
                .ok_or_else(|| BmsError::InvalidConfig(format!("no device for {track} track")))
        };

        Ok(Self {
            devices: [identity(Track::Primary)?, identity(Track::Secondary)?],
        })
    }

    /// All devices, primary first
    pub fn iter(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.devices.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceIdentity> {
        self.devices.iter_mut()
    }

    /// Look up a device by an unnormalized address string
    #[must_use]
    pub fn find(&self, address: &str) -> Option<&DeviceIdentity> {
        let address = DeviceAddress::parse(address).ok()?;
        self.get(&address)
    }

    /// Look up a device by normalized address
    #[must_use]
    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceIdentity> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub(crate) fn get_mut(&mut self, address: &DeviceAddress) -> Option<&mut DeviceIdentity> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    /// Device serving a track
    #[must_use]
    pub fn by_track(&self, track: Track) -> &DeviceIdentity {
        match track {
            Track::Primary => &self.devices[0],
            Track::Secondary => &self.devices[1],
        }
    }

    /// Devices currently Ready
    pub fn ready(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.devices.iter().filter(|d| d.is_ready())
    }

    /// Connected flags per track
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        let primary_connected = self.by_track(Track::Primary).is_ready();
        let secondary_connected = self.by_track(Track::Secondary).is_ready();
        ConnectionStatus {
            primary_connected,
            secondary_connected,
            any_connected: primary_connected || secondary_connected,
        }
    }

    /// Diagnostic view keyed by address
    #[must_use]
    pub fn device_status(&self) -> BTreeMap<DeviceAddress, DeviceStatusEntry> {
        self.devices
            .iter()
            .map(|d| (d.address.clone(), d.status_entry()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_from_default_config() {
        let registry = DeviceRegistry::from_config(&BmsConfig::default()).unwrap();

        assert_eq!(registry.iter().count(), 2);
        assert_eq!(registry.by_track(Track::Primary).track(), Track::Primary);
        assert_eq!(registry.by_track(Track::Secondary).track(), Track::Secondary);
        assert!(registry
            .iter()
            .all(|d| d.state() == ConnectionState::Idle && d.reconnect_attempts() == 0));
    }

    #[test]
    fn test_registry_orders_by_track() {
        let mut config = BmsConfig::default();
        config.devices.reverse();
        let registry = DeviceRegistry::from_config(&config).unwrap();

        let tracks: Vec<Track> = registry.iter().map(DeviceIdentity::track).collect();
        assert_eq!(tracks, vec![Track::Primary, Track::Secondary]);
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let registry = DeviceRegistry::from_config(&BmsConfig::default()).unwrap();

        let device = registry.find("a4:c1:38:7c:2d:f0").unwrap();
        assert_eq!(device.track(), Track::Primary);
        assert!(registry.find("00:11:22:33:44:55").is_none());
        assert!(registry.find("not an address").is_none());
    }

    #[test]
    fn test_status_views() {
        let mut registry = DeviceRegistry::from_config(&BmsConfig::default()).unwrap();
        let secondary = registry.by_track(Track::Secondary).address().clone();
        registry.get_mut(&secondary).unwrap().state = ConnectionState::Ready;

        let status = registry.connection_status();
        assert!(!status.primary_connected);
        assert!(status.secondary_connected);
        assert!(status.any_connected);

        let devices = registry.device_status();
        assert_eq!(devices.len(), 2);
        let entry = &devices[&secondary];
        assert!(entry.connected);
        assert_eq!(entry.track, Track::Secondary);
        assert_eq!(entry.reconnect_attempts, 0);
        assert!(entry.last_data_timestamp.is_none());

        assert_eq!(registry.ready().count(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = BmsConfig::default();
        config.devices.truncate(1);
        assert!(DeviceRegistry::from_config(&config).is_err());
    }
}
