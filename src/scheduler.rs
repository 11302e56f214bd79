use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{BmsError, Result},
    protocol::{decode_frame, read_command},
    radio::Radio,
    registry::DeviceRegistry,
    types::{BatteryReading, BmsConfig, DeviceAddress, Track},
};

/// Outcome of one device read, reported back to the connection manager
#[derive(Debug)]
pub enum ReadOutcome {
    /// Frame decoded
    DataReceived(DeviceAddress),
    /// Read or decode failed for this cycle only
    ReadFailed(DeviceAddress, BmsError),
}

/// Fixed-interval driver for telemetry reads
///
/// Each tick reads every Ready device concurrently and replaces the
/// aggregated readings. A cycle finishes (every read completes or times out)
/// before the next one starts, so reads against one device never overlap.
pub struct PollScheduler<R: Radio + ?Sized> {
    radio: Arc<R>,
    registry: watch::Receiver<DeviceRegistry>,
    outcomes: mpsc::UnboundedSender<ReadOutcome>,
    readings: Arc<RwLock<Vec<BatteryReading>>>,
    poll_interval: Duration,
    read_timeout: Duration,
    cells_per_track: u8,
}

impl<R: Radio + ?Sized> PollScheduler<R> {
    /// Create a scheduler reading registry snapshots from `registry`
    #[must_use]
    pub fn new(
        radio: Arc<R>,
        config: &BmsConfig,
        registry: watch::Receiver<DeviceRegistry>,
        outcomes: mpsc::UnboundedSender<ReadOutcome>,
    ) -> Self {
        Self {
            radio,
            registry,
            outcomes,
            readings: Arc::new(RwLock::new(Vec::new())),
            poll_interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
            cells_per_track: config.cells_per_track,
        }
    }

    /// Shared handle to the latest aggregated readings
    #[must_use]
    pub fn readings(&self) -> Arc<RwLock<Vec<BatteryReading>>> {
        self.readings.clone()
    }

    /// Run one poll cycle and publish its readings
    ///
    /// Devices that are not Ready are skipped. A device whose read fails
    /// contributes nothing to the cycle.
    pub async fn poll_cycle(&self) -> Vec<BatteryReading> {
        let ready: Vec<(DeviceAddress, Track)> = self
            .registry
            .borrow()
            .ready()
            .map(|d| (d.address().clone(), d.track()))
            .collect();

        let reads = ready
            .into_iter()
            .map(|(address, track)| self.read_device(address, track));

        let mut readings: Vec<BatteryReading> =
            join_all(reads).await.into_iter().flatten().collect();
        readings.sort_by_key(|r| r.battery_number);

        *self.readings.write().await = readings.clone();
        readings
    }

    /// Read and decode one device's frame, bounded by the read timeout
    ///
    /// # Errors
    ///
    /// Returns [`BmsError::ReadTimeout`] if the device does not answer in
    /// time, the radio's write/read error, or the decode error.
    pub async fn fetch(
        &self,
        address: &DeviceAddress,
        track: Track,
    ) -> Result<Vec<BatteryReading>> {
        let command = read_command();
        let frame = timeout(self.read_timeout, self.radio.exchange(address, &command))
            .await
            .map_err(|_| BmsError::ReadTimeout {
                timeout_ms: u64::try_from(self.read_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        debug!("Frame from {} ({} bytes): {:02X?}", address, frame.len(), frame);
        decode_frame(&frame, track, self.cells_per_track)
    }

    async fn read_device(&self, address: DeviceAddress, track: Track) -> Vec<BatteryReading> {
        match self.fetch(&address, track).await {
            Ok(readings) => {
                let _ = self.outcomes.send(ReadOutcome::DataReceived(address));
                readings
            }
            Err(e) => {
                if e.is_cycle_error() {
                    warn!("{} track read from {} failed: {}", track, address, e);
                } else {
                    error!("{} track read from {} failed unexpectedly: {}", track, address, e);
                }
                let _ = self.outcomes.send(ReadOutcome::ReadFailed(address, e));
                Vec::new()
            }
        }
    }

    /// Poll forever at the configured interval
    pub async fn run(self) {
        info!("Polling every {}ms", self.poll_interval.as_millis());

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let readings = self.poll_cycle().await;
            debug!("Poll cycle produced {} readings", readings.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{tests::sample_frame, READ_COMMAND},
        radio::mock::MockRadio,
        types::{AdapterState, ConnectionState},
    };
    use tokio_test::assert_ok;

    struct Fixture {
        radio: Arc<MockRadio>,
        scheduler: PollScheduler<MockRadio>,
        outcomes: mpsc::UnboundedReceiver<ReadOutcome>,
        primary: DeviceAddress,
        secondary: DeviceAddress,
    }

    fn fixture(ready: &[Track]) -> Fixture {
        let config = BmsConfig::default();
        let mut registry = DeviceRegistry::from_config(&config).unwrap();
        let primary = registry.by_track(Track::Primary).address().clone();
        let secondary = registry.by_track(Track::Secondary).address().clone();
        for track in ready {
            let address = registry.by_track(*track).address().clone();
            registry.get_mut(&address).unwrap().state = ConnectionState::Ready;
        }

        let (_registry_tx, registry_rx) = watch::channel(registry);
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let radio = Arc::new(MockRadio::new(AdapterState::PoweredOn));
        let scheduler = PollScheduler::new(radio.clone(), &config, registry_rx, outcomes_tx);

        Fixture {
            radio,
            scheduler,
            outcomes,
            primary,
            secondary,
        }
    }

    fn healthy_frame() -> Vec<u8> {
        sample_frame(&[3310, 3305, 3298, 3301], -420, 215)
    }

    #[tokio::test]
    async fn test_cycle_reads_all_ready_devices() {
        let f = fixture(&[Track::Primary, Track::Secondary]);
        f.radio.reply(&f.primary, Duration::ZERO, Some(healthy_frame()));
        f.radio.reply(&f.secondary, Duration::ZERO, Some(healthy_frame()));

        let readings = f.scheduler.poll_cycle().await;

        let numbers: Vec<u8> = readings.iter().map(|r| r.battery_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(*f.scheduler.readings().read().await, readings);
        assert!(f
            .radio
            .commands()
            .iter()
            .all(|c| c.as_slice() == READ_COMMAND));
    }

    #[tokio::test]
    async fn test_not_ready_devices_skipped() {
        let mut f = fixture(&[Track::Secondary]);
        f.radio.reply(&f.primary, Duration::ZERO, Some(healthy_frame()));
        f.radio.reply(&f.secondary, Duration::ZERO, Some(healthy_frame()));

        let readings = f.scheduler.poll_cycle().await;

        assert_eq!(readings.len(), 4);
        assert!(readings.iter().all(|r| r.track == Track::Secondary));
        assert_eq!(f.radio.reads(&f.primary), 0);

        let outcome = assert_ok!(f.outcomes.try_recv());
        assert!(matches!(outcome, ReadOutcome::DataReceived(a) if a == f.secondary));
        assert!(f.outcomes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_device_does_not_block_other() {
        let mut f = fixture(&[Track::Primary, Track::Secondary]);
        f.radio.reply(&f.primary, Duration::from_millis(6_000), Some(healthy_frame()));
        f.radio.reply(&f.secondary, Duration::from_millis(200), Some(healthy_frame()));

        let started = tokio::time::Instant::now();
        let readings = f.scheduler.poll_cycle().await;

        assert_eq!(readings.len(), 4);
        assert!(readings.iter().all(|r| r.track == Track::Secondary));
        // Bounded by the read timeout, not the slow device
        assert!(started.elapsed() <= Duration::from_millis(5_000));

        let mut timed_out = false;
        while let Ok(outcome) = f.outcomes.try_recv() {
            if let ReadOutcome::ReadFailed(address, error) = outcome {
                assert_eq!(address, f.primary);
                assert!(matches!(error, BmsError::ReadTimeout { timeout_ms: 5_000 }));
                timed_out = true;
            }
        }
        assert!(timed_out);
    }

    #[tokio::test]
    async fn test_short_frame_omits_only_that_device() {
        let mut f = fixture(&[Track::Primary, Track::Secondary]);
        f.radio.reply(&f.primary, Duration::ZERO, Some(vec![0xDD; 33]));
        f.radio.reply(&f.secondary, Duration::ZERO, Some(healthy_frame()));

        let readings = f.scheduler.poll_cycle().await;

        let numbers: Vec<u8> = readings.iter().map(|r| r.battery_number).collect();
        assert_eq!(numbers, vec![5, 6, 7, 8]);

        let mut saw_short = false;
        while let Ok(outcome) = f.outcomes.try_recv() {
            if let ReadOutcome::ReadFailed(address, BmsError::FrameTooShort { len }) = outcome {
                assert_eq!(address, f.primary);
                assert_eq!(len, 33);
                saw_short = true;
            }
        }
        assert!(saw_short);
    }

    #[tokio::test]
    async fn test_fetch_surfaces_read_errors() {
        let f = fixture(&[Track::Primary]);
        f.radio.reply(&f.primary, Duration::ZERO, None);

        let result = f.scheduler.fetch(&f.primary, Track::Primary).await;
        assert!(matches!(result, Err(BmsError::ReadError(_))));
    }

    #[tokio::test]
    async fn test_readings_superseded_each_cycle() {
        let f = fixture(&[Track::Primary, Track::Secondary]);
        f.radio.reply(&f.primary, Duration::ZERO, Some(healthy_frame()));
        f.radio.reply(&f.secondary, Duration::ZERO, Some(healthy_frame()));
        assert_eq!(f.scheduler.poll_cycle().await.len(), 8);

        f.radio.reply(&f.secondary, Duration::ZERO, None);
        f.scheduler.poll_cycle().await;

        assert_eq!(f.scheduler.readings().read().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_overlaps_reads() {
        let f = fixture(&[Track::Primary, Track::Secondary]);
        // Slower than the poll interval, faster than the read timeout
        f.radio.reply(&f.primary, Duration::from_millis(3_500), Some(healthy_frame()));
        f.radio.reply(&f.secondary, Duration::from_millis(100), Some(healthy_frame()));
        let radio = f.radio.clone();
        let primary = f.primary.clone();

        let handle = tokio::spawn(f.scheduler.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        handle.abort();

        assert!(radio.reads(&primary) >= 4);
        assert_eq!(radio.overlapping_reads(), 0);
    }
}
