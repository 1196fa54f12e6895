use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};

use tl_dsp::rate::PIPELINE_BITS;

use crate::attr::{self, ClockSource, FirSpec, SampleRateChain};
use crate::backend;
use crate::buddy::BuddyCoordinator;
use crate::config::StreamConfig;
use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::{BufferHandle, HardwarePort};
use crate::registry::{DeviceRegistry, Member};
use crate::rx_worker::RxLoop;
use crate::settings::{CrossNotification, DeviceSettings, SettingKey, SharedSettings};
use crate::shared::SharedDeviceRecord;
use crate::tx_worker::TxLoop;
use crate::worker::{StreamLoop, StreamingWorker, WorkerStats};
use crate::{lock, SampleBuf, Side};

/// Messages a logical device receives from its buddies.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// The sibling changed the shared analog chain
    CrossReport(CrossNotification),
    /// The sibling calibrated its side of the front-end
    CalibrationResult { from: Side, ok: bool },
    BuddyAttached(Side),
    BuddyDetached(Side),
}

/// Queue endpoint between a streaming worker and the DSP pipeline.
pub enum SampleQueue {
    /// The Rx worker produces into this sender
    Rx(Sender<SampleBuf>),
    /// The Tx worker consumes from this receiver
    Tx(Receiver<SampleBuf>),
}

impl SampleQueue {
    pub fn side(&self) -> Side {
        match self {
            SampleQueue::Rx(_) => Side::Rx,
            SampleQueue::Tx(_) => Side::Tx,
        }
    }
}

const FIR_KEYS: [SettingKey; 4] = [
    SettingKey::FirEnable,
    SettingKey::FirBandwidth,
    SettingKey::FirLog2,
    SettingKey::FirGain,
];

const NCO_KEYS: [SettingKey; 2] = [SettingKey::NcoEnable, SettingKey::NcoFrequency];

const CLOCK_KEYS: [SettingKey; 2] = [SettingKey::ExtClock, SettingKey::ExtClockFreq];

/// Calibration runs over at least this bandwidth (Hz).
pub const MIN_CALIBRATION_BANDWIDTH: u32 = 2_500_000;

/// One independently started Rx or Tx endpoint of a physical radio.
pub struct LogicalDevice {
    side: Side,
    id: DeviceId,
    config: StreamConfig,
    coordinator: Option<BuddyCoordinator>,
    port: Arc<dyn HardwarePort>,
    buffer: Option<BufferHandle>,
    worker: Arc<StreamingWorker>,
    settings: Mutex<DeviceSettings>,
    inbox: Receiver<DeviceMessage>,
}

impl LogicalDevice {
    /// Open the side given by `queue`, choosing the backend from the
    /// identifier scheme.
    pub fn open(
        registry: &Arc<DeviceRegistry>,
        id: DeviceId,
        queue: SampleQueue,
        config: StreamConfig,
    ) -> Result<Self> {
        let port_id = id.clone();
        Self::open_with(registry, id, queue, config, move || backend::port_for(&port_id))
    }

    /// Open using `port` if this is the first side of the radio. A sibling
    /// that is already open keeps its own port.
    pub fn open_with_port(
        registry: &Arc<DeviceRegistry>,
        id: DeviceId,
        queue: SampleQueue,
        config: StreamConfig,
        port: Arc<dyn HardwarePort>,
    ) -> Result<Self> {
        Self::open_with(registry, id, queue, config, move || Ok(port))
    }

    fn open_with<F>(
        registry: &Arc<DeviceRegistry>,
        id: DeviceId,
        queue: SampleQueue,
        config: StreamConfig,
        port: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<dyn HardwarePort>>,
    {
        config.validate()?;
        let side = queue.side();
        let (inbox_tx, inbox) = unbounded();
        let member = Member {
            side,
            inbox: inbox_tx,
        };
        let (coordinator, inherited) =
            BuddyCoordinator::attach_or_open(registry, &id, member, port, config.suspend_timeout)?;

        let record = coordinator.record().clone();
        let port = record.port().clone();

        let bits = port.sample_bits(side);
        if !(1..=PIPELINE_BITS).contains(&bits) {
            coordinator.detach();
            return Err(SdrError::InvalidSetting {
                key: "sample_bits",
                reason: format!("{} bit samples, at most {} supported", bits, PIPELINE_BITS),
            });
        }

        let mut settings = DeviceSettings::new(side);
        if let Some(shared) = inherited {
            shared.fold_into(&mut settings);
        }

        let buffer = match port.allocate_buffer(record.handle(), config.block_size, side) {
            Ok(b) => b,
            Err(e) => {
                coordinator.detach();
                return Err(e);
            }
        };

        let body: Box<dyn StreamLoop> = match queue {
            SampleQueue::Rx(tx) => Box::new(RxLoop::new(
                port.clone(),
                buffer.clone(),
                tx,
                bits,
            )),
            SampleQueue::Tx(rx) => Box::new(TxLoop::new(
                port.clone(),
                buffer.clone(),
                rx,
                bits,
                config.poll_interval,
            )),
        };
        let worker = Arc::new(StreamingWorker::new(
            side,
            format!("{}-stream", side),
            body,
            settings.log2_factor,
            settings.placement,
            config.degraded_after,
            config.shortfall_backoff,
        ));

        log::info!(
            "{} {}: open on {} ({} samples per block)",
            id,
            side,
            port.name(),
            config.block_size
        );

        Ok(Self {
            side,
            id,
            config,
            coordinator: Some(coordinator),
            port,
            buffer: Some(buffer),
            worker,
            settings: Mutex::new(settings),
            inbox,
        })
    }

    fn coordinator(&self) -> Result<&BuddyCoordinator> {
        self.coordinator.as_ref().ok_or(SdrError::NotOpen)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn settings(&self) -> DeviceSettings {
        lock(&self.settings).clone()
    }

    /// Host-visible sample rate (Hz).
    pub fn sample_rate(&self) -> u32 {
        lock(&self.settings).host_sample_rate()
    }

    pub fn center_frequency(&self) -> u64 {
        lock(&self.settings).center_frequency
    }

    /// Converter chain last read back from the hardware for this side.
    pub fn sample_rates(&self) -> SampleRateChain {
        self.coordinator
            .as_ref()
            .map(|c| c.record().sample_rates(self.side))
            .unwrap_or_default()
    }

    pub fn record(&self) -> Option<&Arc<SharedDeviceRecord>> {
        self.coordinator.as_ref().map(|c| c.record())
    }

    pub fn has_buddy(&self) -> bool {
        self.coordinator.as_ref().is_some_and(|c| c.has_buddy())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    /// Start streaming. Returns once the worker thread is in its loop.
    pub fn start(&self) -> Result<()> {
        let record = self.coordinator()?.record();
        let _changes = record.lock_changes();
        self.worker.start(self.config.suspend_timeout)?;
        record.set_worker(self.side, Some(self.worker.clone()));
        log::info!("{} {}: streaming at {} S/s", self.id, self.side, self.sample_rate());
        Ok(())
    }

    /// Stop streaming. Returns once the worker thread has been joined.
    pub fn stop(&self) -> Result<()> {
        let record = self.coordinator()?.record();
        let _changes = record.lock_changes();
        self.worker.stop(self.config.suspend_timeout)?;
        record.set_worker(self.side, None);
        log::info!("{} {}: stopped", self.id, self.side);
        Ok(())
    }

    /// Apply the fields of `new` named by `keys`, or every field if `force`.
    ///
    /// Shared fields go through the buddy coordinator, which pauses both
    /// workers around the hardware write. A rejected attribute is logged and
    /// leaves its setting at the previous value; only a worker that cannot be
    /// paused or an invalid request fails the call.
    pub fn apply_settings(&self, new: &DeviceSettings, keys: &[SettingKey], force: bool) -> Result<()> {
        let coordinator = self.coordinator()?;
        new.validate()?;

        let mut keys: Vec<SettingKey> = if force { SettingKey::ALL.to_vec() } else { keys.to_vec() };
        let mut seen = Vec::with_capacity(keys.len());
        keys.retain(|k| {
            let fresh = !seen.contains(k);
            seen.push(*k);
            fresh
        });
        if keys.is_empty() {
            return Ok(());
        }

        let current = self.settings();
        let mut failed: Vec<SettingKey> = Vec::new();

        let shared_keys: Vec<SettingKey> = keys.iter().copied().filter(|k| k.is_shared()).collect();
        if !shared_keys.is_empty() {
            let mut calibration = None;
            coordinator.apply_shared(|record| {
                self.write_shared(record, &current, new, &shared_keys, &mut failed, &mut calibration)
            })?;
            if let Some(ok) = calibration {
                coordinator.notify(DeviceMessage::CalibrationResult { from: self.side, ok });
            }
        }

        let accepted: Vec<SettingKey> = keys.iter().copied().filter(|k| !failed.contains(k)).collect();
        let mut candidate = current.clone();
        candidate.apply_keys(&accepted, new);
        self.write_local(coordinator.record(), &current, candidate, &accepted, &mut failed);

        let accepted: Vec<SettingKey> = keys.iter().copied().filter(|k| !failed.contains(k)).collect();
        let mut next = current;
        next.apply_keys(&accepted, new);

        if accepted.contains(&SettingKey::Log2Factor) {
            self.worker.set_log2(next.log2_factor);
        }
        if accepted.contains(&SettingKey::Placement) {
            self.worker.set_placement(next.placement);
        }

        log::info!("{} {}: applied {}", self.id, self.side, next.debug_string(&accepted));
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|k| k.name()).collect();
            log::warn!("{} {}: kept previous {}", self.id, self.side, names.join(", "));
        }
        *lock(&self.settings) = next;
        Ok(())
    }

    fn write(
        &self,
        record: &SharedDeviceRecord,
        attribute: &str,
        value: &str,
        keys: &[SettingKey],
        failed: &mut Vec<SettingKey>,
    ) -> bool {
        match record.port().write_attribute(record.handle(), attribute, value) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{} {}: {} = {} rejected: {}", self.id, self.side, attribute, value, e);
                for &key in keys {
                    if !failed.contains(&key) {
                        failed.push(key);
                    }
                }
                false
            }
        }
    }

    /// Calibrate this side with both workers paused. Returns whether the
    /// front-end converged; the buddy is told either way.
    pub fn calibrate(&self) -> Result<bool> {
        let coordinator = self.coordinator()?;
        let current = self.settings();
        let mut ok = false;
        coordinator.apply_shared(|record| {
            ok = self.run_calibration(record, current.dev_sample_rate);
            SharedSettings::from_settings(&current)
        })?;
        coordinator.notify(DeviceMessage::CalibrationResult { from: self.side, ok });
        Ok(ok)
    }

    fn run_calibration(&self, record: &SharedDeviceRecord, dev_sample_rate: u32) -> bool {
        let bandwidth = dev_sample_rate.max(MIN_CALIBRATION_BANDWIDTH);
        match record.port().calibrate(record.handle(), self.side, bandwidth) {
            Ok(()) => {
                log::info!("{} {}: calibrated over {} Hz", self.id, self.side, bandwidth);
                true
            }
            Err(e) => {
                log::warn!("{} {}: calibration failed: {}", self.id, self.side, e);
                false
            }
        }
    }

    fn write_shared(
        &self,
        record: &SharedDeviceRecord,
        current: &DeviceSettings,
        new: &DeviceSettings,
        keys: &[SettingKey],
        failed: &mut Vec<SettingKey>,
        calibration: &mut Option<bool>,
    ) -> SharedSettings {
        let has = |k: SettingKey| keys.contains(&k);
        let mut target = current.clone();
        target.apply_keys(keys, new);

        let rate_written = has(SettingKey::DevSampleRate)
            && self.write(
                record,
                attr::SAMPLE_RATE,
                &target.dev_sample_rate.to_string(),
                &[SettingKey::DevSampleRate],
                failed,
            );
        let rate = if rate_written {
            target.dev_sample_rate
        } else {
            current.dev_sample_rate
        };

        // The FIR design depends on the converter rate.
        let fir_keys: Vec<SettingKey> = FIR_KEYS.iter().copied().filter(|&k| has(k)).collect();
        if !fir_keys.is_empty() || (rate_written && target.fir_enable) {
            if target.fir_enable {
                let spec = FirSpec {
                    bandwidth: target.fir_bandwidth,
                    log2: target.fir_log2,
                    gain_db: target.fir_gain_db,
                    sample_rate: rate,
                };
                if self.write(record, attr::FIR_CONFIG, &spec.to_attribute(), &fir_keys, failed) {
                    self.write(record, attr::FIR_ENABLE, attr::format_bool(true), &fir_keys, failed);
                }
            } else if current.fir_enable || has(SettingKey::FirEnable) {
                self.write(record, attr::FIR_ENABLE, attr::format_bool(false), &[SettingKey::FirEnable], failed);
            }
        }

        if has(SettingKey::LoPpmTenths) {
            self.write(
                record,
                attr::LO_PPM_TENTHS,
                &target.lo_ppm_tenths.to_string(),
                &[SettingKey::LoPpmTenths],
                failed,
            );
        }

        let clock_changed = (has(SettingKey::ExtClock) && (target.ext_clock || current.ext_clock))
            || (has(SettingKey::ExtClockFreq) && target.ext_clock);
        let clock_written = clock_changed && {
            let clock_keys: Vec<SettingKey> = CLOCK_KEYS.iter().copied().filter(|&k| has(k)).collect();
            let source = ClockSource::new(target.ext_clock, target.ext_clock_freq);
            self.write(record, attr::CLOCK_SOURCE, &source.to_attribute(), &clock_keys, failed)
        };

        // New clocks detune the analog paths.
        if rate_written || clock_written {
            *calibration = Some(self.run_calibration(record, rate));
        }

        let applied: Vec<SettingKey> = keys.iter().copied().filter(|k| !failed.contains(k)).collect();
        let mut effective = current.clone();
        effective.apply_keys(&applied, new);
        SharedSettings::from_settings(&effective)
    }

    fn write_local(
        &self,
        record: &SharedDeviceRecord,
        current: &DeviceSettings,
        mut s: DeviceSettings,
        keys: &[SettingKey],
        failed: &mut Vec<SettingKey>,
    ) {
        let has = |k: SettingKey| keys.contains(&k);

        let nco_keys: Vec<SettingKey> = NCO_KEYS.iter().copied().filter(|&k| has(k)).collect();
        let mut nco_written = false;
        // A new converter rate resets the NCO.
        let nco_stale = s.nco_enable && has(SettingKey::DevSampleRate);
        if (!nco_keys.is_empty() && (s.nco_enable || current.nco_enable)) || nco_stale {
            nco_written = self.write(
                record,
                attr::nco_frequency(self.side),
                &attr::format_nco(s.nco_enable, s.nco_frequency),
                &nco_keys,
                failed,
            );
            if !nco_written {
                s.nco_enable = current.nco_enable;
                s.nco_frequency = current.nco_frequency;
            }
        }

        // The converter rate is already in hardware for both sides, so a
        // rejected LO only rolls back the local keys that moved it.
        let retuned = s.device_center_frequency() != current.device_center_frequency();
        if has(SettingKey::CenterFrequency) || (retuned && keys.iter().any(|k| k.moves_lo())) {
            let lo_keys: Vec<SettingKey> = keys.iter().copied().filter(|k| k.moves_lo() && !k.is_shared()).collect();
            let tuned = self.write(
                record,
                attr::lo_frequency(self.side),
                &s.device_center_frequency().to_string(),
                &lo_keys,
                failed,
            );
            if !tuned && nco_written {
                let previous = attr::format_nco(current.nco_enable, current.nco_frequency);
                if let Err(e) = record
                    .port()
                    .write_attribute(record.handle(), attr::nco_frequency(self.side), &previous)
                {
                    log::warn!("{} {}: NCO restore failed: {}", self.id, self.side, e);
                }
            }
        }

        if has(SettingKey::RfBandwidth) {
            self.write(
                record,
                attr::rf_bandwidth(self.side),
                &s.rf_bandwidth.to_string(),
                &[SettingKey::RfBandwidth],
                failed,
            );
        }

        if has(SettingKey::Antenna) {
            self.write(record, attr::port(self.side), &s.antenna, &[SettingKey::Antenna], failed);
        }

        match self.side {
            Side::Rx => {
                if has(SettingKey::GainMode) {
                    self.write(record, attr::RX_GAIN_MODE, s.gain_mode.as_attr(), &[SettingKey::GainMode], failed);
                }
                if has(SettingKey::Gain) {
                    self.write(record, attr::RX_GAIN, &s.gain_db.to_string(), &[SettingKey::Gain], failed);
                }
                let tracking = [
                    (SettingKey::HwBbDcBlock, attr::RX_BB_DC_TRACKING, s.hw_bb_dc_block),
                    (SettingKey::HwRfDcBlock, attr::RX_RF_DC_TRACKING, s.hw_rf_dc_block),
                    (SettingKey::HwIqCorrection, attr::RX_IQ_TRACKING, s.hw_iq_correction),
                ];
                for (key, attribute, enabled) in tracking {
                    if has(key) {
                        self.write(record, attribute, attr::format_bool(enabled), &[key], failed);
                    }
                }
            }
            Side::Tx => {
                if has(SettingKey::Attenuation) {
                    self.write(
                        record,
                        attr::TX_ATTENUATION,
                        &s.attenuation_mdb.to_string(),
                        &[SettingKey::Attenuation],
                        failed,
                    );
                }
            }
        }
    }

    /// Drain the inbox. Returns the number of messages handled.
    pub fn poll_messages(&self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.inbox.try_recv() {
            self.handle_message(msg);
            handled += 1;
        }
        handled
    }

    fn handle_message(&self, msg: DeviceMessage) {
        match msg {
            DeviceMessage::CrossReport(report) => {
                let (before, after) = {
                    let mut settings = lock(&self.settings);
                    let before = settings.device_center_frequency();
                    report.shared.fold_into(&mut settings);
                    (before, settings.device_center_frequency())
                };
                log::debug!(
                    "{} {}: {} changed shared state to {} S/s",
                    self.id,
                    self.side,
                    report.from,
                    report.shared.dev_sample_rate
                );
                // The placement offset scales with the converter rate.
                if after != before {
                    if let Some(c) = self.coordinator.as_ref() {
                        let record = c.record();
                        if let Err(e) = record.port().write_attribute(
                            record.handle(),
                            attr::lo_frequency(self.side),
                            &after.to_string(),
                        ) {
                            log::warn!("{} {}: retune after buddy change failed: {}", self.id, self.side, e);
                        }
                    }
                }
            }
            DeviceMessage::CalibrationResult { from, ok: true } => {
                log::debug!("{} {}: buddy {} calibrated", self.id, self.side, from);
            }
            DeviceMessage::CalibrationResult { from, ok: false } => {
                log::warn!("{} {}: buddy {} calibration failed", self.id, self.side, from);
            }
            DeviceMessage::BuddyAttached(side) => {
                log::info!("{} {}: buddy {} attached", self.id, self.side, side);
            }
            DeviceMessage::BuddyDetached(side) => {
                log::info!("{} {}: buddy {} detached", self.id, self.side, side);
            }
        }
    }

    /// Stop, free the buffer and leave the radio. Returns true if this was
    /// the last side and the hardware handle was closed.
    pub fn close(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(coordinator) = self.coordinator.take() else {
            return false;
        };

        let stopped = {
            let record = coordinator.record();
            let _changes = record.lock_changes();
            let r = self.worker.stop(self.config.suspend_timeout);
            record.set_worker(self.side, None);
            r
        };

        match stopped {
            Ok(()) => {
                if let Some(buffer) = self.buffer.take() {
                    self.port.free_buffer(&buffer);
                }
            }
            // The thread may still be inside a transfer on this buffer.
            Err(e) => log::error!("{} {}: closing with worker still busy: {}", self.id, self.side, e),
        }

        coordinator.detach()
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimEvent, SimPort};
    use crossbeam::channel::bounded;
    use std::thread;
    use std::time::{Duration, Instant};
    use tl_dsp::Placement;

    struct Bench {
        registry: Arc<DeviceRegistry>,
        sim: Arc<SimPort>,
        id: DeviceId,
        config: StreamConfig,
    }

    impl Bench {
        fn new() -> Self {
            Self::with(SimConfig::default(), Self::config())
        }

        fn with(sim: SimConfig, config: StreamConfig) -> Self {
            Self {
                registry: Arc::new(DeviceRegistry::new()),
                sim: Arc::new(SimPort::new(SimConfig { journal: true, ..sim })),
                id: DeviceId::Simulated("bench".into()),
                config,
            }
        }

        fn config() -> StreamConfig {
            StreamConfig {
                block_size: 1024,
                poll_interval: Duration::from_millis(5),
                shortfall_backoff: Duration::from_millis(1),
                ..StreamConfig::default()
            }
        }

        fn open(&self, queue: SampleQueue) -> Result<LogicalDevice> {
            LogicalDevice::open_with_port(
                &self.registry,
                self.id.clone(),
                queue,
                self.config.clone(),
                self.sim.clone(),
            )
        }

        fn rx(&self) -> (LogicalDevice, Receiver<SampleBuf>) {
            let (tx, rx) = bounded(64);
            (self.open(SampleQueue::Rx(tx)).unwrap(), rx)
        }

        fn tx(&self) -> (LogicalDevice, Sender<SampleBuf>) {
            let (tx, rx) = bounded(64);
            (self.open(SampleQueue::Tx(rx)).unwrap(), tx)
        }

        fn write_count(&self) -> usize {
            self.sim
                .journal()
                .iter()
                .filter(|e| matches!(e, SimEvent::Write { .. }))
                .count()
        }
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_buddies_share_one_handle() {
        let bench = Bench::new();
        let (rx, _rx_queue) = bench.rx();
        let (tx, _tx_queue) = bench.tx();

        assert_eq!(bench.sim.opens(), 1);
        assert!(rx.has_buddy() && tx.has_buddy());
        assert!(Arc::ptr_eq(rx.record().unwrap(), tx.record().unwrap()));
        assert_eq!(rx.poll_messages(), 1);
        assert_eq!(tx.poll_messages(), 0);

        assert!(!rx.close());
        assert_eq!(bench.sim.closes(), 0);
        assert!(!tx.has_buddy());
        assert_eq!(tx.poll_messages(), 1);

        assert!(tx.close());
        assert_eq!(bench.sim.closes(), 1);
        assert!(bench.registry.is_empty());
    }

    #[test]
    fn test_second_device_on_same_side_rejected() {
        let bench = Bench::new();
        let (_rx, _q) = bench.rx();
        let (sender, _r) = bounded(4);
        let second = bench.open(SampleQueue::Rx(sender));
        assert!(matches!(second, Err(SdrError::SideInUse { side: Side::Rx, .. })));
        assert_eq!(bench.registry.sides(&bench.id), vec![Side::Rx]);
        assert_eq!(bench.sim.opens(), 1);
    }

    #[test]
    fn test_open_failure_leaves_registry_clean() {
        let bench = Bench::new();
        bench.sim.fail_open(Some("unplugged"));
        let (sender, _r) = bounded(4);
        let err = bench.open(SampleQueue::Rx(sender)).err().unwrap();
        assert!(matches!(err, SdrError::DeviceOpen { .. }));
        assert!(bench.registry.is_empty());

        bench.sim.fail_open(None);
        let (_rx, _q) = bench.rx();
        assert_eq!(bench.registry.len(), 1);
    }

    #[test]
    fn test_shared_change_reaches_buddy() {
        let bench = Bench::new();
        let (rx, _rx_queue) = bench.rx();
        let (tx, _tx_queue) = bench.tx();

        let mut wanted = rx.settings();
        wanted.dev_sample_rate = 4_000_000;
        wanted.lo_ppm_tenths = 12;
        rx.apply_settings(&wanted, &[SettingKey::DevSampleRate, SettingKey::LoPpmTenths], false)
            .unwrap();

        assert_eq!(rx.settings().dev_sample_rate, 4_000_000);
        assert_eq!(tx.settings().dev_sample_rate, 2_500_000);
        // Cross report plus the calibration the new rate triggered
        assert_eq!(tx.poll_messages(), 2);
        assert_eq!(tx.settings().dev_sample_rate, 4_000_000);
        assert_eq!(tx.settings().lo_ppm_tenths, 12);
        assert_eq!(tx.sample_rates().host_rate(), Some(4_000_000));

        // A side opened later starts from the radio's shared state
        drop(tx);
        let (late_tx, _q) = bench.tx();
        assert_eq!(late_tx.settings().dev_sample_rate, 4_000_000);
    }

    #[test]
    fn test_shared_change_pauses_both_streams() {
        let bench = Bench::new();
        let (rx, rx_queue) = bench.rx();
        let (tx, tx_queue) = bench.tx();
        rx.start().unwrap();
        tx.start().unwrap();

        let producer = thread::spawn(move || {
            for _ in 0..200 {
                if tx_queue.send(SampleBuf::from_interleaved(vec![100; 2048])).is_err() {
                    break;
                }
            }
        });

        for i in 0..10u32 {
            let (from, other) = if i % 2 == 0 { (&rx, &tx) } else { (&tx, &rx) };
            let mut wanted = from.settings();
            wanted.dev_sample_rate = 3_000_000 + i * 100_000;
            from.apply_settings(&wanted, &[SettingKey::DevSampleRate], false).unwrap();
            other.poll_messages();
            assert!(rx.is_running() && tx.is_running());
            rx_queue.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        assert_eq!(bench.sim.violations(), 0);
        assert_eq!(rx.settings().dev_sample_rate, tx.settings().dev_sample_rate);
        assert!(tx.stats().blocks > 0);

        rx.stop().unwrap();
        tx.stop().unwrap();
        // Dropping the Tx device releases the producer's queue
        drop(tx);
        producer.join().unwrap();
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();

        let mut wanted = rx.settings();
        wanted.center_frequency = 915_000_000;
        wanted.gain_db = 20;
        rx.apply_settings(&wanted, &[], true).unwrap();
        let writes = bench.write_count();

        let keys = wanted.diff(&rx.settings());
        assert!(keys.is_empty());
        rx.apply_settings(&wanted, &keys, false).unwrap();
        assert_eq!(bench.write_count(), writes);
        assert_eq!(rx.settings(), wanted);
    }

    #[test]
    fn test_rejected_attribute_keeps_previous_value() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let (tx, _t) = bench.tx();
        bench.sim.reject_attribute(attr::RX_GAIN);
        bench.sim.reject_attribute(attr::SAMPLE_RATE);

        let mut wanted = rx.settings();
        wanted.gain_db = 10;
        wanted.dev_sample_rate = 5_000_000;
        wanted.rf_bandwidth = 2_000_000;
        rx.apply_settings(
            &wanted,
            &[SettingKey::Gain, SettingKey::DevSampleRate, SettingKey::RfBandwidth],
            false,
        )
        .unwrap();

        let now = rx.settings();
        assert_eq!(now.gain_db, 40);
        assert_eq!(now.dev_sample_rate, 2_500_000);
        assert_eq!(now.rf_bandwidth, 2_000_000);

        tx.poll_messages();
        assert_eq!(tx.settings().dev_sample_rate, 2_500_000);
    }

    #[test]
    fn test_invalid_request_rejected_before_hardware() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let mut wanted = rx.settings();
        wanted.log2_factor = 9;
        let writes = bench.write_count();
        assert!(matches!(
            rx.apply_settings(&wanted, &[SettingKey::Log2Factor], false),
            Err(SdrError::InvalidSetting { .. })
        ));
        assert_eq!(bench.write_count(), writes);
    }

    #[test]
    fn test_placement_offsets_lo() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let (tx, _t) = bench.tx();
        let handle = rx.record().unwrap().handle();

        let mut wanted = rx.settings();
        wanted.center_frequency = 435_000_000;
        wanted.dev_sample_rate = 4_000_000;
        wanted.log2_factor = 2;
        wanted.placement = Placement::Infra;
        rx.apply_settings(
            &wanted,
            &[
                SettingKey::CenterFrequency,
                SettingKey::DevSampleRate,
                SettingKey::Log2Factor,
                SettingKey::Placement,
            ],
            false,
        )
        .unwrap();
        assert_eq!(
            bench.sim.attribute(handle, attr::RX_LO_FREQUENCY).as_deref(),
            Some("436000000")
        );
        assert_eq!(rx.sample_rate(), 1_000_000);

        // Buddy doubles the converter rate; the quarter-rate offset follows
        let mut faster = tx.settings();
        faster.dev_sample_rate = 8_000_000;
        tx.apply_settings(&faster, &[SettingKey::DevSampleRate], false).unwrap();
        rx.poll_messages();
        assert_eq!(
            bench.sim.attribute(handle, attr::RX_LO_FREQUENCY).as_deref(),
            Some("437000000")
        );
        assert_eq!(rx.sample_rate(), 2_000_000);
    }

    #[test]
    fn test_shortfalls_do_not_stop_stream() {
        let bench = Bench::new();
        let (rx, queue) = bench.rx();
        bench.sim.inject_shortfalls(Side::Rx, 5);
        rx.start().unwrap();

        queue.recv_timeout(Duration::from_secs(2)).unwrap();
        let stats = rx.stats();
        assert_eq!(stats.shortfalls, 5);
        assert_eq!(stats.max_consecutive_shortfalls, 5);
        assert!(rx.is_running());
        wait_for("recovery", || !rx.stats().degraded);
        rx.stop().unwrap();
    }

    #[test]
    fn test_tx_without_producer_sends_silence() {
        let bench = Bench::new();
        let (tx, _sender) = bench.tx();
        tx.start().unwrap();
        wait_for("tx blocks", || bench.sim.tx_samples() >= 2048);
        tx.stop().unwrap();
        assert!(tx.stats().underflows > 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let bench = Bench::new();
        let (rx, queue) = bench.rx();
        rx.start().unwrap();
        queue.recv_timeout(Duration::from_secs(2)).unwrap();
        rx.stop().unwrap();
        assert!(!rx.is_running());
        let before = rx.stats().blocks;

        rx.start().unwrap();
        wait_for("more rx blocks", || rx.stats().blocks > before);
        rx.stop().unwrap();
    }

    #[test]
    fn test_unsupported_sample_width_rejected() {
        let bench = Bench::with(
            SimConfig {
                sample_bits: 20,
                ..SimConfig::default()
            },
            Bench::config(),
        );
        let (sender, _r) = bounded(4);
        let err = bench.open(SampleQueue::Rx(sender)).err().unwrap();
        assert!(matches!(err, SdrError::InvalidSetting { key: "sample_bits", .. }));
        assert!(bench.registry.is_empty());
        assert_eq!(bench.sim.open_handles(), 0);
    }

    #[test]
    fn test_rate_change_redesigns_enabled_fir() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let handle = rx.record().unwrap().handle();

        let mut wanted = rx.settings();
        wanted.fir_enable = true;
        wanted.fir_log2 = 1;
        rx.apply_settings(&wanted, &[SettingKey::FirEnable, SettingKey::FirLog2], false)
            .unwrap();
        let design = bench.sim.attribute(handle, attr::FIR_CONFIG).unwrap();
        assert!(design.ends_with("rate=2500000"), "{}", design);

        let mut faster = rx.settings();
        faster.dev_sample_rate = 4_000_000;
        rx.apply_settings(&faster, &[SettingKey::DevSampleRate], false).unwrap();
        let design = bench.sim.attribute(handle, attr::FIR_CONFIG).unwrap();
        assert_eq!(design, "bw=500000,log2=1,gain=0,rate=4000000");
        assert_eq!(bench.sim.writes(attr::FIR_CONFIG), 2);
        assert_eq!(rx.sample_rates().converter_rate(), Some(8_000_000));

        // A disabled filter is left alone
        let mut off = rx.settings();
        off.fir_enable = false;
        rx.apply_settings(&off, &[SettingKey::FirEnable], false).unwrap();
        off.dev_sample_rate = 3_000_000;
        rx.apply_settings(&off, &[SettingKey::DevSampleRate], false).unwrap();
        assert_eq!(bench.sim.writes(attr::FIR_CONFIG), 2);
    }

    #[test]
    fn test_rejected_lo_reverts_every_retuning_key() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let mut wanted = rx.settings();
        wanted.log2_factor = 2;
        rx.apply_settings(&wanted, &[SettingKey::Log2Factor], false).unwrap();

        bench.sim.reject_attribute(attr::RX_LO_FREQUENCY);
        let mut moved = rx.settings();
        moved.placement = Placement::Infra;
        moved.transverter_mode = true;
        moved.transverter_delta = 1_000_000;
        moved.gain_db = 30;
        rx.apply_settings(
            &moved,
            &[
                SettingKey::Placement,
                SettingKey::TransverterMode,
                SettingKey::TransverterDelta,
                SettingKey::Gain,
            ],
            false,
        )
        .unwrap();

        let now = rx.settings();
        assert_eq!(now.placement, Placement::Center);
        assert!(!now.transverter_mode);
        assert_eq!(now.transverter_delta, 0);
        assert_eq!(now.gain_db, 30);
        assert_eq!(now.device_center_frequency(), 435_000_000);
    }

    #[test]
    fn test_stuck_buddy_aborts_shared_change() {
        let bench = Bench::with(
            SimConfig {
                transfer_delay: Duration::from_millis(300),
                ..SimConfig::default()
            },
            StreamConfig {
                suspend_timeout: Duration::from_millis(20),
                ..Bench::config()
            },
        );
        let (rx, _q) = bench.rx();
        let (tx, _t) = bench.tx();
        tx.start().unwrap();
        // Let the worker get into its first transfer
        thread::sleep(Duration::from_millis(30));
        let rate_writes = bench.sim.writes(attr::SAMPLE_RATE);

        let mut wanted = rx.settings();
        wanted.dev_sample_rate = 4_000_000;
        let err = rx.apply_settings(&wanted, &[SettingKey::DevSampleRate], false).err();
        assert!(matches!(err, Some(SdrError::SuspendTimeout { side: Side::Tx, .. })));

        assert_eq!(bench.sim.writes(attr::SAMPLE_RATE), rate_writes);
        assert_eq!(bench.sim.calibrations(), 0);
        assert_eq!(rx.settings().dev_sample_rate, 2_500_000);
        assert_eq!(bench.sim.violations(), 0);

        // The sibling keeps streaming
        let blocks = tx.stats().blocks;
        wait_for("tx blocks after the abort", || tx.stats().blocks > blocks);
        assert!(tx.is_running());
        assert!(!rx.is_running());
    }

    #[test]
    fn test_calibration_pauses_both_streams() {
        let bench = Bench::new();
        let (rx, rx_queue) = bench.rx();
        let (tx, _t) = bench.tx();
        rx.start().unwrap();
        tx.start().unwrap();
        tx.poll_messages();

        assert!(tx.calibrate().unwrap());
        assert_eq!(bench.sim.calibrations(), 1);
        assert!(bench.sim.journal().contains(&SimEvent::Calibrate {
            side: Side::Tx,
            bandwidth: MIN_CALIBRATION_BANDWIDTH,
        }));
        assert!(rx.is_running() && tx.is_running());
        rx_queue.recv_timeout(Duration::from_secs(2)).unwrap();

        // A rate change calibrates the side that made it
        let mut wanted = rx.settings();
        wanted.dev_sample_rate = 5_000_000;
        rx.apply_settings(&wanted, &[SettingKey::DevSampleRate], false).unwrap();
        assert_eq!(bench.sim.calibrations(), 2);
        assert!(bench.sim.journal().contains(&SimEvent::Calibrate {
            side: Side::Rx,
            bandwidth: 5_000_000,
        }));
        assert_eq!(bench.sim.violations(), 0);

        bench.sim.fail_calibration(true);
        assert!(!rx.calibrate().unwrap());
        assert!(rx.is_running() && tx.is_running());

        rx.stop().unwrap();
        tx.stop().unwrap();
        let mut results = Vec::new();
        while let Ok(msg) = tx.inbox.try_recv() {
            if let DeviceMessage::CalibrationResult { from, ok } = msg {
                results.push((from, ok));
            }
        }
        assert_eq!(results, vec![(Side::Rx, true), (Side::Rx, false)]);
    }

    #[test]
    fn test_clock_source_reaches_buddy() {
        let bench = Bench::new();
        let (rx, _q) = bench.rx();
        let (tx, _t) = bench.tx();
        let handle = rx.record().unwrap().handle();
        tx.poll_messages();

        let mut wanted = tx.settings();
        wanted.ext_clock = true;
        wanted.ext_clock_freq = 40_000_000;
        tx.apply_settings(&wanted, &[SettingKey::ExtClock, SettingKey::ExtClockFreq], false)
            .unwrap();
        assert_eq!(
            bench.sim.attribute(handle, attr::CLOCK_SOURCE).as_deref(),
            Some("external:40000000")
        );
        assert_eq!(bench.sim.calibrations(), 1);

        rx.poll_messages();
        assert!(rx.settings().ext_clock);
        assert_eq!(rx.settings().ext_clock_freq, 40_000_000);

        // Changing the frequency of an unused external input touches nothing
        let mut internal = tx.settings();
        internal.ext_clock = false;
        tx.apply_settings(&internal, &[SettingKey::ExtClock], false).unwrap();
        let writes = bench.sim.writes(attr::CLOCK_SOURCE);
        internal.ext_clock_freq = 20_000_000;
        tx.apply_settings(&internal, &[SettingKey::ExtClockFreq], false).unwrap();
        assert_eq!(bench.sim.writes(attr::CLOCK_SOURCE), writes);
        assert_eq!(
            bench.sim.attribute(handle, attr::CLOCK_SOURCE).as_deref(),
            Some("internal")
        );
    }

    #[test]
    fn test_nco_shifts_lo() {
        let bench = Bench::new();
        let (tx, _t) = bench.tx();
        let handle = tx.record().unwrap().handle();

        let mut wanted = tx.settings();
        wanted.nco_enable = true;
        wanted.nco_frequency = -500_000;
        tx.apply_settings(&wanted, &[SettingKey::NcoEnable, SettingKey::NcoFrequency], false)
            .unwrap();
        assert_eq!(
            bench.sim.attribute(handle, attr::TX_NCO_FREQUENCY).as_deref(),
            Some("-500000")
        );
        assert_eq!(
            bench.sim.attribute(handle, attr::TX_LO_FREQUENCY).as_deref(),
            Some("435500000")
        );
        assert_eq!(tx.center_frequency(), 435_000_000);

        // Rejected LO: the NCO goes back to where it was
        bench.sim.reject_attribute(attr::TX_LO_FREQUENCY);
        let mut shifted = tx.settings();
        shifted.nco_frequency = 700_000;
        tx.apply_settings(&shifted, &[SettingKey::NcoFrequency], false).unwrap();
        assert_eq!(tx.settings().nco_frequency, -500_000);
        assert_eq!(
            bench.sim.attribute(handle, attr::TX_NCO_FREQUENCY).as_deref(),
            Some("-500000")
        );

        // Rejected NCO: the LO is not moved for it
        bench.sim.accept_attribute(attr::TX_LO_FREQUENCY);
        bench.sim.reject_attribute(attr::TX_NCO_FREQUENCY);
        let lo_writes = bench.sim.writes(attr::TX_LO_FREQUENCY);
        tx.apply_settings(&shifted, &[SettingKey::NcoFrequency], false).unwrap();
        assert_eq!(tx.settings().nco_frequency, -500_000);
        assert_eq!(bench.sim.writes(attr::TX_LO_FREQUENCY), lo_writes);

        // A rate change reprograms an enabled NCO
        bench.sim.accept_attribute(attr::TX_NCO_FREQUENCY);
        let nco_writes = bench.sim.writes(attr::TX_NCO_FREQUENCY);
        let mut faster = tx.settings();
        faster.dev_sample_rate = 4_000_000;
        tx.apply_settings(&faster, &[SettingKey::DevSampleRate], false).unwrap();
        assert_eq!(bench.sim.writes(attr::TX_NCO_FREQUENCY), nco_writes + 1);
    }
}
