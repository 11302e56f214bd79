use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch, RwLock},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::BtleRadio,
    clock::SystemClock,
    connection::{ConnectionManager, RadioCommand},
    error::{BmsError, Result},
    radio::{Radio, RadioEvent},
    registry::DeviceRegistry,
    scheduler::{PollScheduler, ReadOutcome},
    types::{
        AdapterState, BatteryReading, BmsConfig, ConnectionStatus, DeviceAddress,
        DeviceStatusEntry, Track,
    },
};

/// Outcome of a connect attempt running off the coordinator task
#[derive(Debug)]
enum AttemptEvent {
    Connected(DeviceAddress),
    EndpointResolved(DeviceAddress),
    ConnectFailed(DeviceAddress, BmsError),
}

/// Running dual-BMS telemetry engine
///
/// Owns a coordinator task that feeds radio events into the connection state
/// machine and a poll task that reads Ready devices. Dropping the service
/// aborts both tasks; call [`BmsService::shutdown`] to also release links.
pub struct BmsService {
    config: BmsConfig,
    registry: watch::Receiver<DeviceRegistry>,
    readings: Arc<RwLock<Vec<BatteryReading>>>,
    shutdown: Option<oneshot::Sender<()>>,
    coordinator: Option<JoinHandle<()>>,
    poller: JoinHandle<()>,
}

impl BmsService {
    /// Start the engine on the host Bluetooth adapter
    ///
    /// # Errors
    ///
    /// See [`BmsService::start`].
    pub async fn start_ble(config: BmsConfig) -> Result<Self> {
        let radio = BtleRadio::with_config(&config).await?;
        Self::start(config, Arc::new(radio)).await
    }

    /// Start the engine on the given radio
    ///
    /// Waits up to `adapter_timeout_ms` for the adapter to power on. A radio
    /// that is still off afterwards is not an error; scanning starts once it
    /// reports power-on.
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::InvalidConfig`] for a rejected configuration,
    /// [`BmsError::AdapterFatal`] for an unsupported or unauthorized radio,
    /// or the radio's error if events cannot be subscribed.
    pub async fn start<R: Radio + ?Sized>(config: BmsConfig, radio: Arc<R>) -> Result<Self> {
        let mut manager = ConnectionManager::new(config.clone(), SystemClock)?;
        let mut radio_events = radio.events().await?;

        let initial = radio.adapter_state().await?;
        if initial.is_fatal() {
            error!("Bluetooth adapter unusable: {}", initial);
            return Err(BmsError::AdapterFatal { state: initial });
        }
        let state = await_power_on(&mut radio_events, initial, config.adapter_timeout()).await?;
        let commands = manager.on_adapter_state(state)?;

        let (registry_tx, registry_rx) = watch::channel(manager.registry().clone());
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let scheduler =
            PollScheduler::new(radio.clone(), &config, registry_rx.clone(), outcomes_tx);
        let readings = scheduler.readings();

        {
            let registry = manager.registry();
            info!(
                "Starting BMS service: primary {}, secondary {}",
                registry.by_track(Track::Primary).address(),
                registry.by_track(Track::Secondary).address()
            );
        }

        let coordinator = Coordinator {
            radio,
            manager,
            registry: registry_tx,
            attempts: attempts_tx,
            connection_timeout: config.connection_timeout(),
        };
        let coordinator = tokio::spawn(coordinator.run(
            commands,
            radio_events,
            attempts_rx,
            outcomes_rx,
            shutdown_rx,
        ));
        let poller = tokio::spawn(scheduler.run());

        Ok(Self {
            config,
            registry: registry_rx,
            readings,
            shutdown: Some(shutdown_tx),
            coordinator: Some(coordinator),
            poller,
        })
    }

    /// Most recent aggregated readings, ordered by battery number
    ///
    /// Shorter than the full count when a device was not Ready or its frame
    /// failed to decode in the last cycle.
    pub async fn read_battery_data(&self) -> Vec<BatteryReading> {
        self.readings.read().await.clone()
    }

    /// Connected flags per track
    #[must_use]
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.registry.borrow().connection_status()
    }

    /// Per-device diagnostics keyed by address
    #[must_use]
    pub fn get_device_status(&self) -> BTreeMap<DeviceAddress, DeviceStatusEntry> {
        self.registry.borrow().device_status()
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &BmsConfig {
        &self.config
    }

    /// Stop polling, end scanning and disconnect every linked device
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::ServiceStopped`] if the service was already shut
    /// down.
    pub async fn shutdown(&mut self) -> Result<()> {
        let (Some(signal), Some(coordinator)) = (self.shutdown.take(), self.coordinator.take())
        else {
            return Err(BmsError::ServiceStopped);
        };

        self.poller.abort();
        let _ = signal.send(());
        if let Err(e) = coordinator.await {
            warn!("Coordinator task ended abnormally: {}", e);
        }
        self.readings.write().await.clear();

        info!("BMS service stopped");
        Ok(())
    }
}

impl Drop for BmsService {
    fn drop(&mut self) {
        self.poller.abort();
        if let Some(coordinator) = &self.coordinator {
            coordinator.abort();
        }
    }
}

async fn await_power_on(
    events: &mut mpsc::UnboundedReceiver<RadioEvent>,
    initial: AdapterState,
    limit: Duration,
) -> Result<AdapterState> {
    if initial == AdapterState::PoweredOn {
        return Ok(initial);
    }

    info!("Waiting up to {}ms for adapter power-on ({})", limit.as_millis(), initial);
    let mut state = initial;
    let wait = async {
        while let Some(event) = events.recv().await {
            if let RadioEvent::AdapterStateChanged(next) = event {
                state = next;
                if next.is_fatal() {
                    return Err(BmsError::AdapterFatal { state: next });
                }
                if next == AdapterState::PoweredOn {
                    break;
                }
            }
        }
        Ok(())
    };

    match timeout(limit, wait).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("{}", e);
            return Err(e);
        }
        Err(_) => warn!("Adapter not powered on after {}ms, continuing", limit.as_millis()),
    }
    Ok(state)
}

struct Coordinator<R: Radio + ?Sized> {
    radio: Arc<R>,
    manager: ConnectionManager<SystemClock>,
    registry: watch::Sender<DeviceRegistry>,
    attempts: mpsc::UnboundedSender<AttemptEvent>,
    connection_timeout: Duration,
}

impl<R: Radio + ?Sized> Coordinator<R> {
    async fn run(
        mut self,
        initial: Vec<RadioCommand>,
        mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        mut attempts: mpsc::UnboundedReceiver<AttemptEvent>,
        mut outcomes: mpsc::UnboundedReceiver<ReadOutcome>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        self.execute(initial).await;
        self.publish();

        loop {
            let deadline = self.manager.next_deadline().map(Instant::from_std);
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let commands = tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = radio_events.recv() => self.on_radio_event(event),
                Some(event) = attempts.recv() => self.on_attempt(event),
                Some(outcome) = outcomes.recv() => {
                    self.on_read_outcome(outcome);
                    Vec::new()
                }
                () = timer => self.manager.poll_timers(),
            };

            self.execute(commands).await;
            self.publish();
        }

        let commands = self.manager.shutdown();
        self.execute(commands).await;
        self.publish();
    }

    fn on_radio_event(&mut self, event: RadioEvent) -> Vec<RadioCommand> {
        match event {
            RadioEvent::AdapterStateChanged(state) => {
                self.manager.on_adapter_state(state).unwrap_or_else(|e| {
                    error!("{}", e);
                    Vec::new()
                })
            }
            RadioEvent::Advertisement { address } => self.manager.on_advertisement(&address),
            RadioEvent::Disconnected { address } => self.manager.on_disconnected(&address),
        }
    }

    fn on_attempt(&mut self, event: AttemptEvent) -> Vec<RadioCommand> {
        match event {
            AttemptEvent::Connected(address) => self.manager.on_connected(&address),
            AttemptEvent::EndpointResolved(address) => self.manager.on_endpoint_resolved(&address),
            AttemptEvent::ConnectFailed(address, e) => {
                if !e.is_connect_failure() {
                    debug!("Connect to {} failed outside the usual causes: {:?}", address, e);
                }
                self.manager.on_connect_failed(&address, &e)
            }
        }
    }

    fn on_read_outcome(&mut self, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::DataReceived(address) => self.manager.on_data_received(&address),
            ReadOutcome::ReadFailed(address, e) => self.manager.on_read_failed(&address, &e),
        }
    }

    async fn execute(&self, commands: Vec<RadioCommand>) {
        for command in commands {
            debug!("Radio command: {:?}", command);
            let result = match &command {
                RadioCommand::StartScan => self.radio.start_scan().await,
                RadioCommand::StopScan => self.radio.stop_scan().await,
                RadioCommand::Disconnect(address) => self.radio.disconnect(address).await,
                RadioCommand::Connect(address) => {
                    self.spawn_attempt(address.clone());
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("{:?} failed: {}", command, e);
            }
        }
    }

    fn spawn_attempt(&self, address: DeviceAddress) {
        let radio = self.radio.clone();
        let events = self.attempts.clone();
        let limit = self.connection_timeout;

        tokio::spawn(async move {
            let event = match connect_and_discover(&*radio, &address, limit, &events).await {
                Ok(()) => AttemptEvent::EndpointResolved(address),
                Err(e) => AttemptEvent::ConnectFailed(address, e),
            };
            let _ = events.send(event);
        });
    }

    fn publish(&self) {
        self.registry.send_replace(self.manager.registry().clone());
    }
}

async fn connect_and_discover<R: Radio + ?Sized>(
    radio: &R,
    address: &DeviceAddress,
    limit: Duration,
    events: &mpsc::UnboundedSender<AttemptEvent>,
) -> Result<()> {
    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);

    timeout(limit, radio.connect(address))
        .await
        .map_err(|_| BmsError::ConnectTimeout { timeout_ms })??;
    let _ = events.send(AttemptEvent::Connected(address.clone()));

    timeout(limit, radio.discover_endpoint(address))
        .await
        .map_err(|_| BmsError::ConnectTimeout { timeout_ms })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::tests::sample_frame,
        radio::mock::{ConnectFailure, MockRadio},
        types::ConnectionState,
    };
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    const PRIMARY: &str = "A4:C1:38:7C:2D:F0";
    const SECONDARY: &str = "E0:9F:2A:E4:94:1D";

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::parse(s).unwrap()
    }

    fn advertise(radio: &MockRadio, address: &str) {
        radio.emit(RadioEvent::Advertisement {
            address: address.to_lowercase(),
        });
    }

    async fn started(radio: &Arc<MockRadio>) -> BmsService {
        assert_ok!(BmsService::start(BmsConfig::default(), radio.clone()).await)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_polls_both_tracks() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        let settle = Duration::from_millis(50);
        radio.reply(&addr(PRIMARY), settle, Some(sample_frame(&[3300; 4], 0, 250)));
        radio.reply(&addr(SECONDARY), settle, Some(sample_frame(&[2950; 4], 0, 250)));
        let service = started(&radio).await;

        advertise(&radio, PRIMARY);
        sleep(Duration::from_millis(10)).await;
        advertise(&radio, SECONDARY);
        sleep(Duration::from_millis(4_100)).await;

        let status = service.get_connection_status();
        assert!(status.primary_connected && status.secondary_connected);

        let readings = service.read_battery_data().await;
        assert_eq!(readings.len(), 8);
        assert_eq!(readings[0].battery_number, 1);
        assert_eq!(readings[7].battery_number, 8);
        assert!(readings[4..].iter().all(|r| r.track == Track::Secondary));

        let devices = service.get_device_status();
        assert!(devices.values().all(|d| d.last_data_timestamp.is_some()));
        assert!(radio.reads(&addr(PRIMARY)) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_adapter_rejected_at_start() {
        for state in [AdapterState::Unsupported, AdapterState::Unauthorized] {
            let radio = Arc::new(MockRadio::new(state));
            let result = BmsService::start(BmsConfig::default(), radio).await;
            assert!(matches!(result, Err(BmsError::AdapterFatal { state: s }) if s == state));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_power_on() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOff));
        let emitter = radio.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            emitter.emit(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));
        });

        let service = started(&radio).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(radio.scans_started(), 1);
        assert!(service
            .get_device_status()
            .values()
            .all(|d| d.state == ConnectionState::Scanning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_timeout_is_not_fatal() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOff));

        let service = started(&radio).await;

        assert_eq!(radio.scans_started(), 0);
        assert!(!service.get_connection_status().any_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_advertisement_changes_nothing() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        let service = started(&radio).await;
        sleep(Duration::from_millis(10)).await;
        let before = service.get_device_status();

        advertise(&radio, "00:11:22:33:44:55");
        sleep(Duration::from_millis(100)).await;

        assert_eq!(service.get_device_status(), before);
        assert_eq!(radio.connects(&addr("00:11:22:33:44:55")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_device_never_reconnects() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        radio.fail_connects(&addr(PRIMARY), ConnectFailure::Refused);
        let service = started(&radio).await;

        for _ in 0..5 {
            advertise(&radio, PRIMARY);
            sleep(Duration::from_millis(2_100)).await;
        }
        assert_eq!(radio.connects(&addr(PRIMARY)), 5);

        advertise(&radio, PRIMARY);
        sleep(Duration::from_millis(10_000)).await;

        assert_eq!(radio.connects(&addr(PRIMARY)), 5);
        let entry = &service.get_device_status()[&addr(PRIMARY)];
        assert_eq!(entry.reconnect_attempts, 5);
        assert_eq!(entry.state, ConnectionState::Disconnected);
        assert!(entry.last_error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_counts_as_attempt() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        radio.fail_connects(&addr(SECONDARY), ConnectFailure::NoService);
        let service = started(&radio).await;

        advertise(&radio, SECONDARY);
        sleep(Duration::from_millis(10)).await;

        let entry = &service.get_device_status()[&addr(SECONDARY)];
        assert_eq!(entry.reconnect_attempts, 1);
        assert!(!entry.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_times_out_and_frees_slot() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        radio.delay_connects(&addr(PRIMARY), Duration::from_secs(20));
        let service = started(&radio).await;

        advertise(&radio, PRIMARY);
        sleep(Duration::from_secs(1)).await;
        // Only one connect at a time
        advertise(&radio, SECONDARY);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(radio.connects(&addr(SECONDARY)), 0);
        assert!(!service.get_connection_status().any_connected);

        sleep(Duration::from_millis(14_100)).await;

        let entry = &service.get_device_status()[&addr(PRIMARY)];
        assert_eq!(entry.state, ConnectionState::Disconnected);
        assert_eq!(entry.reconnect_attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().contains("timed out after 15000ms"));
        assert_eq!(radio.disconnects(&addr(PRIMARY)), 1);

        advertise(&radio, SECONDARY);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(radio.connects(&addr(SECONDARY)), 1);
        let status = service.get_connection_status();
        assert!(status.secondary_connected);
        assert!(!status.primary_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_discovery_times_out() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        radio.delay_discovery(&addr(SECONDARY), Duration::from_secs(20));
        let service = started(&radio).await;

        advertise(&radio, SECONDARY);
        sleep(Duration::from_millis(14_900)).await;
        assert_eq!(
            service.get_device_status()[&addr(SECONDARY)].state,
            ConnectionState::Discovering
        );

        sleep(Duration::from_millis(200)).await;

        let entry = &service.get_device_status()[&addr(SECONDARY)];
        assert_eq!(entry.reconnect_attempts, 1);
        assert!(!entry.connected);
        assert!(entry.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(radio.disconnects(&addr(SECONDARY)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_from_ready_rescans() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        let service = started(&radio).await;
        advertise(&radio, PRIMARY);
        sleep(Duration::from_millis(10)).await;
        assert!(service.get_connection_status().primary_connected);

        radio.emit(RadioEvent::Disconnected {
            address: PRIMARY.to_string(),
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!service.get_connection_status().primary_connected);

        sleep(Duration::from_millis(3_000)).await;
        let entry = &service.get_device_status()[&addr(PRIMARY)];
        assert_eq!(entry.state, ConnectionState::Scanning);
        assert_eq!(entry.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_clears() {
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        radio.reply(&addr(PRIMARY), Duration::ZERO, Some(sample_frame(&[3300; 4], 0, 250)));
        let mut service = started(&radio).await;
        advertise(&radio, PRIMARY);
        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(service.read_battery_data().await.len(), 4);

        assert_ok!(service.shutdown().await);

        assert!(service.read_battery_data().await.is_empty());
        assert!(!service.get_connection_status().any_connected);
        assert_err!(service.shutdown().await);
        assert_eq!(service.config().poll_interval_ms, 2_000);
    }
}
