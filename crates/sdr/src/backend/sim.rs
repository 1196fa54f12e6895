// Copyright 2025-2026 CEMAXECUTER LLC

//! In-memory radio: a continuous tone on Rx, a sink on Tx and an attribute
//! store checked against AD936x-style limits. Faults can be injected.

use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::attr::{self, FirSpec};
use crate::backend::fir::{FirDesigner, KaiserFirDesigner};
use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::{BufferHandle, HardwarePort, PortHandle};
use crate::settings::{EXT_CLOCK_RANGE, FIR_GAINS_DB, MAX_FIR_LOG2};
use crate::{lock, Side};

const SAMPLE_RATE_RANGE: (u32, u32) = (521_000, 61_440_000);
const LO_RANGE: (u64, u64) = (70_000_000, 6_000_000_000);
const RF_BANDWIDTH_RANGE: (u32, u32) = (200_000, 56_000_000);
const RX_GAIN_RANGE: (i32, i32) = (-3, 71);
const TX_ATTENUATION_MAX: u32 = 89_750;
const NCO_MAX: i32 = 32_000_000;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Rx tone offset from the LO (Hz)
    pub tone_hz: f64,
    /// Tone amplitude as a fraction of full scale
    pub amplitude: f64,
    /// Time each transfer blocks
    pub transfer_delay: Duration,
    pub sample_bits: u32,
    /// Record every write and transfer in the journal
    pub journal: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tone_hz: 100_000.0,
            amplitude: 0.5,
            transfer_delay: Duration::from_millis(1),
            sample_bits: 16,
            journal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Open(PortHandle),
    Close(PortHandle),
    Write { key: String, value: String },
    Transfer { side: Side, samples: usize },
    Calibrate { side: Side, bandwidth: u32 },
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    next_buffer: u64,
    handles: HashMap<u64, HashMap<String, String>>,
    buffers: HashSet<u64>,
    opens: usize,
    closes: usize,
    fail_open: Option<String>,
    rejected: HashSet<String>,
    fail_calibration: bool,
    calibrations: usize,
    shortfalls: [usize; 2],
    journal: Vec<SimEvent>,
    writes: HashMap<String, usize>,
    rx_phase: f64,
    tx_samples: u64,
}

fn side_index(side: Side) -> usize {
    match side {
        Side::Rx => 0,
        Side::Tx => 1,
    }
}

/// Simulated front-end implementing [`HardwarePort`].
pub struct SimPort {
    config: SimConfig,
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    violations: AtomicUsize,
}

impl SimPort {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
            in_flight: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
        }
    }

    /// Make the next opens fail with `reason`, or succeed again with `None`.
    pub fn fail_open(&self, reason: Option<&str>) {
        lock(&self.state).fail_open = reason.map(str::to_string);
    }

    pub fn reject_attribute(&self, key: &str) {
        lock(&self.state).rejected.insert(key.to_string());
    }

    pub fn accept_attribute(&self, key: &str) {
        lock(&self.state).rejected.remove(key);
    }

    /// Make calibrations fail until called again with `false`.
    pub fn fail_calibration(&self, fail: bool) {
        lock(&self.state).fail_calibration = fail;
    }

    /// Successful calibrations across all handles.
    pub fn calibrations(&self) -> usize {
        lock(&self.state).calibrations
    }

    /// Make the next `count` transfers on `side` come back half full.
    pub fn inject_shortfalls(&self, side: Side, count: usize) {
        lock(&self.state).shortfalls[side_index(side)] = count;
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// Shared-attribute writes and calibrations that landed while a transfer
    /// was in progress.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }

    /// Successful writes of `key` across all handles.
    pub fn writes(&self, key: &str) -> usize {
        lock(&self.state).writes.get(key).copied().unwrap_or(0)
    }

    /// Current value of `key` on `handle`, bypassing the port.
    pub fn attribute(&self, handle: PortHandle, key: &str) -> Option<String> {
        lock(&self.state).handles.get(&handle.0)?.get(key).cloned()
    }

    pub fn journal(&self) -> Vec<SimEvent> {
        lock(&self.state).journal.clone()
    }

    pub fn tx_samples(&self) -> u64 {
        lock(&self.state).tx_samples
    }

    fn full_scale(&self) -> f64 {
        ((1i32 << (self.config.sample_bits.clamp(2, 16) - 1)) - 1) as f64
    }

    fn record(&self, state: &mut SimState, event: SimEvent) {
        if self.config.journal {
            state.journal.push(event);
        }
    }

    fn check(&self, state: &SimState, key: &str, value: &str) -> Result<()> {
        if state.rejected.contains(key) {
            return Err(SdrError::attribute(key, "rejected by device"));
        }
        let range_err = |lo: &dyn std::fmt::Display, hi: &dyn std::fmt::Display| {
            SdrError::attribute(key, format!("{} outside {}..={}", value, lo, hi))
        };
        match key {
            attr::SAMPLE_RATE => {
                let v: u32 = attr::parse_number(key, value)?;
                let (lo, hi) = SAMPLE_RATE_RANGE;
                if !(lo..=hi).contains(&v) {
                    return Err(range_err(&lo, &hi));
                }
            }
            attr::FIR_CONFIG => {
                let spec = FirSpec::parse(value)?;
                if spec.log2 > MAX_FIR_LOG2 || !FIR_GAINS_DB.contains(&spec.gain_db) {
                    return Err(SdrError::attribute(key, format!("unsupported design '{}'", value)));
                }
                KaiserFirDesigner::default().design(&spec)?;
            }
            attr::FIR_ENABLE | attr::RX_BB_DC_TRACKING | attr::RX_RF_DC_TRACKING | attr::RX_IQ_TRACKING => {
                attr::parse_bool(key, value)?;
            }
            attr::LO_PPM_TENTHS => {
                attr::parse_number::<i32>(key, value)?;
            }
            attr::CLOCK_SOURCE => {
                if let attr::ClockSource::External(hz) = attr::ClockSource::parse(value)? {
                    if !EXT_CLOCK_RANGE.contains(&hz) {
                        return Err(range_err(EXT_CLOCK_RANGE.start(), EXT_CLOCK_RANGE.end()));
                    }
                }
            }
            attr::RX_NCO_FREQUENCY | attr::TX_NCO_FREQUENCY => {
                if let Some(v) = attr::parse_nco(key, value)? {
                    if v.abs() > NCO_MAX {
                        return Err(range_err(&-NCO_MAX, &NCO_MAX));
                    }
                }
            }
            attr::RX_LO_FREQUENCY | attr::TX_LO_FREQUENCY => {
                let v: u64 = attr::parse_number(key, value)?;
                let (lo, hi) = LO_RANGE;
                if !(lo..=hi).contains(&v) {
                    return Err(range_err(&lo, &hi));
                }
            }
            attr::RX_RF_BANDWIDTH | attr::TX_RF_BANDWIDTH => {
                let v: u32 = attr::parse_number(key, value)?;
                let (lo, hi) = RF_BANDWIDTH_RANGE;
                if !(lo..=hi).contains(&v) {
                    return Err(range_err(&lo, &hi));
                }
            }
            attr::RX_PORT | attr::TX_PORT => {
                if value.is_empty() {
                    return Err(SdrError::attribute(key, "empty port name"));
                }
            }
            attr::RX_GAIN_MODE => {
                if !matches!(value, "manual" | "slow_attack" | "fast_attack" | "hybrid") {
                    return Err(SdrError::attribute(key, format!("unknown mode '{}'", value)));
                }
            }
            attr::RX_GAIN => {
                let v: i32 = attr::parse_number(key, value)?;
                let (lo, hi) = RX_GAIN_RANGE;
                if !(lo..=hi).contains(&v) {
                    return Err(range_err(&lo, &hi));
                }
            }
            attr::TX_ATTENUATION => {
                let v: u32 = attr::parse_number(key, value)?;
                if v > TX_ATTENUATION_MAX {
                    return Err(range_err(&0, &TX_ATTENUATION_MAX));
                }
            }
            attr::RX_SAMPLE_RATES | attr::TX_SAMPLE_RATES => {
                return Err(SdrError::attribute(key, "read only"));
            }
            _ => return Err(SdrError::attribute(key, "unknown attribute")),
        }
        Ok(())
    }

    fn rate_chain(attrs: &HashMap<String, String>, side: Side) -> String {
        let rate: u64 = attrs
            .get(attr::SAMPLE_RATE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let fir_on = attrs.get(attr::FIR_ENABLE).map(String::as_str) == Some("1");
        let fir_log2 = match attrs.get(attr::FIR_CONFIG).map(|v| FirSpec::parse(v)) {
            Some(Ok(spec)) if fir_on => spec.log2,
            _ => 0,
        };
        let converter = rate << fir_log2;
        match side {
            Side::Rx => format!("ADC:{} RXSAMP:{}", converter, rate),
            Side::Tx => format!("DAC:{} TXSAMP:{}", converter, rate),
        }
    }

    fn begin_transfer(&self, buffer: &BufferHandle) -> Result<()> {
        if !lock(&self.state).buffers.contains(&buffer.id) {
            return Err(SdrError::Backend(format!("buffer {} not allocated", buffer.id)));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.config.transfer_delay);
        Ok(())
    }

    fn end_transfer(&self, state: &mut SimState, side: Side, requested: usize) -> usize {
        let pending = &mut state.shortfalls[side_index(side)];
        let n = if *pending > 0 {
            *pending -= 1;
            requested / 2
        } else {
            requested
        };
        self.record(state, SimEvent::Transfer { side, samples: n });
        n
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl HardwarePort for SimPort {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn open(&self, id: &DeviceId) -> Result<PortHandle> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_open.clone() {
            return Err(SdrError::DeviceOpen {
                id: id.to_string(),
                reason,
            });
        }
        state.next_handle += 1;
        let handle = PortHandle(state.next_handle);

        let defaults = [
            (attr::SAMPLE_RATE, "2500000"),
            (attr::FIR_ENABLE, "0"),
            (attr::LO_PPM_TENTHS, "0"),
            (attr::CLOCK_SOURCE, "internal"),
            (attr::RX_NCO_FREQUENCY, "off"),
            (attr::TX_NCO_FREQUENCY, "off"),
            (attr::RX_LO_FREQUENCY, "435000000"),
            (attr::TX_LO_FREQUENCY, "435000000"),
            (attr::RX_RF_BANDWIDTH, "1500000"),
            (attr::TX_RF_BANDWIDTH, "1500000"),
            (attr::RX_PORT, "A_BALANCED"),
            (attr::TX_PORT, "A"),
            (attr::RX_GAIN_MODE, "manual"),
            (attr::RX_GAIN, "40"),
            (attr::TX_ATTENUATION, "12500"),
        ];
        let attrs = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        state.handles.insert(handle.0, attrs);
        state.opens += 1;
        self.record(&mut state, SimEvent::Open(handle));
        Ok(handle)
    }

    fn close(&self, handle: PortHandle) {
        let mut state = lock(&self.state);
        if state.handles.remove(&handle.0).is_some() {
            state.closes += 1;
            self.record(&mut state, SimEvent::Close(handle));
        }
    }

    fn read_attribute(&self, handle: PortHandle, key: &str) -> Result<String> {
        let state = lock(&self.state);
        let attrs = state.handles.get(&handle.0).ok_or(SdrError::NotOpen)?;
        match key {
            attr::RX_SAMPLE_RATES => Ok(Self::rate_chain(attrs, Side::Rx)),
            attr::TX_SAMPLE_RATES => Ok(Self::rate_chain(attrs, Side::Tx)),
            _ => attrs
                .get(key)
                .cloned()
                .ok_or_else(|| SdrError::attribute(key, "not set")),
        }
    }

    fn write_attribute(&self, handle: PortHandle, key: &str, value: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.handles.contains_key(&handle.0) {
            return Err(SdrError::NotOpen);
        }
        self.check(&state, key, value)?;

        if attr::is_shared(key) && self.in_flight.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::Relaxed);
            log::error!("sim: {} written during a transfer", key);
        }

        if let Some(attrs) = state.handles.get_mut(&handle.0) {
            attrs.insert(key.to_string(), value.to_string());
        }
        *state.writes.entry(key.to_string()).or_default() += 1;
        self.record(
            &mut state,
            SimEvent::Write {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    fn allocate_buffer(&self, handle: PortHandle, samples: usize, side: Side) -> Result<BufferHandle> {
        let mut state = lock(&self.state);
        if !state.handles.contains_key(&handle.0) {
            return Err(SdrError::NotOpen);
        }
        state.next_buffer += 1;
        let id = state.next_buffer;
        state.buffers.insert(id);
        Ok(BufferHandle {
            id,
            handle,
            side,
            samples,
        })
    }

    fn free_buffer(&self, buffer: &BufferHandle) {
        lock(&self.state).buffers.remove(&buffer.id);
    }

    fn receive(&self, buffer: &BufferHandle, data: &mut [i16]) -> Result<usize> {
        self.begin_transfer(buffer)?;

        let mut state = lock(&self.state);
        let requested = buffer.samples.min(data.len() / 2);
        let n = self.end_transfer(&mut state, Side::Rx, requested);

        let rate = state
            .handles
            .get(&buffer.handle.0)
            .and_then(|a| a.get(attr::SAMPLE_RATE))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0);
        let step = TAU * self.config.tone_hz / rate;
        let amplitude = self.config.amplitude * self.full_scale();
        let mut phase = state.rx_phase;
        for iq in data[..n * 2].chunks_exact_mut(2) {
            iq[0] = (amplitude * phase.cos()).round() as i16;
            iq[1] = (amplitude * phase.sin()).round() as i16;
            phase = (phase + step) % TAU;
        }
        state.rx_phase = phase;
        drop(state);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(n)
    }

    fn transmit(&self, buffer: &BufferHandle, data: &[i16]) -> Result<usize> {
        self.begin_transfer(buffer)?;

        let mut state = lock(&self.state);
        let requested = buffer.samples.min(data.len() / 2);
        let n = self.end_transfer(&mut state, Side::Tx, requested);
        state.tx_samples += n as u64;
        drop(state);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(n)
    }

    fn sample_bits(&self, _side: Side) -> u32 {
        self.config.sample_bits
    }

    fn calibrate(&self, handle: PortHandle, side: Side, bandwidth: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.handles.contains_key(&handle.0) {
            return Err(SdrError::NotOpen);
        }
        if state.fail_calibration {
            return Err(SdrError::Backend(format!("{} calibration did not converge", side)));
        }
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::Relaxed);
            log::error!("sim: {} calibrated during a transfer", side);
        }
        state.calibrations += 1;
        self.record(&mut state, SimEvent::Calibrate { side, bandwidth });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (SimPort, PortHandle) {
        let port = SimPort::new(SimConfig {
            journal: true,
            ..SimConfig::default()
        });
        let handle = port.open(&DeviceId::Simulated("t".into())).unwrap();
        (port, handle)
    }

    #[test]
    fn test_attribute_limits() {
        let (port, h) = open();
        port.write_attribute(h, attr::SAMPLE_RATE, "3000000").unwrap();
        assert_eq!(port.read_attribute(h, attr::SAMPLE_RATE).unwrap(), "3000000");
        assert!(port.write_attribute(h, attr::SAMPLE_RATE, "100000").is_err());
        assert!(port.write_attribute(h, attr::RX_LO_FREQUENCY, "10").is_err());
        assert!(port.write_attribute(h, attr::RX_SAMPLE_RATES, "x").is_err());
        assert!(port.write_attribute(h, "bogus", "1").is_err());
        // Rejected writes leave the stored value alone
        assert_eq!(port.read_attribute(h, attr::SAMPLE_RATE).unwrap(), "3000000");
    }

    #[test]
    fn test_clock_and_nco_limits() {
        let (port, h) = open();
        assert_eq!(port.read_attribute(h, attr::CLOCK_SOURCE).unwrap(), "internal");
        port.write_attribute(h, attr::CLOCK_SOURCE, "external:10000000").unwrap();
        assert!(port.write_attribute(h, attr::CLOCK_SOURCE, "external:1000").is_err());
        assert!(port.write_attribute(h, attr::CLOCK_SOURCE, "pps").is_err());

        port.write_attribute(h, attr::TX_NCO_FREQUENCY, "-1000000").unwrap();
        port.write_attribute(h, attr::TX_NCO_FREQUENCY, "off").unwrap();
        assert!(port.write_attribute(h, attr::RX_NCO_FREQUENCY, "40000000").is_err());
    }

    #[test]
    fn test_calibration() {
        let (port, h) = open();
        port.calibrate(h, Side::Rx, 2_500_000).unwrap();
        assert_eq!(port.calibrations(), 1);
        assert!(port.journal().contains(&SimEvent::Calibrate {
            side: Side::Rx,
            bandwidth: 2_500_000
        }));

        port.fail_calibration(true);
        assert!(port.calibrate(h, Side::Tx, 5_000_000).is_err());
        assert_eq!(port.calibrations(), 1);
        port.close(h);
        port.fail_calibration(false);
        assert!(matches!(port.calibrate(h, Side::Rx, 2_500_000), Err(SdrError::NotOpen)));
        assert_eq!(port.violations(), 0);
    }

    #[test]
    fn test_rate_chain_follows_fir() {
        let (port, h) = open();
        port.write_attribute(h, attr::SAMPLE_RATE, "1000000").unwrap();
        port.write_attribute(h, attr::FIR_CONFIG, "bw=400000,log2=2,gain=0,rate=1000000")
            .unwrap();
        port.write_attribute(h, attr::FIR_ENABLE, "1").unwrap();
        let chain = attr::SampleRateChain::parse(&port.read_attribute(h, attr::RX_SAMPLE_RATES).unwrap())
            .unwrap();
        assert_eq!(chain.converter_rate(), Some(4_000_000));
        assert_eq!(chain.host_rate(), Some(1_000_000));
    }

    #[test]
    fn test_fault_injection() {
        let (port, h) = open();
        port.reject_attribute(attr::RX_GAIN);
        assert!(port.write_attribute(h, attr::RX_GAIN, "10").is_err());
        port.accept_attribute(attr::RX_GAIN);
        port.write_attribute(h, attr::RX_GAIN, "10").unwrap();

        let buf = port.allocate_buffer(h, 128, Side::Rx).unwrap();
        let mut data = vec![0i16; 256];
        port.inject_shortfalls(Side::Rx, 1);
        assert_eq!(port.receive(&buf, &mut data).unwrap(), 64);
        assert_eq!(port.receive(&buf, &mut data).unwrap(), 128);

        port.fail_open(Some("unplugged"));
        assert!(matches!(
            port.open(&DeviceId::Simulated("t".into())),
            Err(SdrError::DeviceOpen { .. })
        ));
    }

    #[test]
    fn test_tone_amplitude() {
        let (port, h) = open();
        let buf = port.allocate_buffer(h, 256, Side::Rx).unwrap();
        let mut data = vec![0i16; 512];
        port.receive(&buf, &mut data).unwrap();
        let peak = data.iter().map(|v| v.unsigned_abs()).max().unwrap();
        assert!((16_000..=16_400).contains(&peak), "peak {}", peak);
    }

    #[test]
    fn test_freed_buffer_rejected() {
        let (port, h) = open();
        let buf = port.allocate_buffer(h, 64, Side::Tx).unwrap();
        port.transmit(&buf, &[0; 128]).unwrap();
        assert_eq!(port.tx_samples(), 64);
        port.free_buffer(&buf);
        assert!(port.transmit(&buf, &[0; 128]).is_err());
    }

    #[test]
    fn test_close_counts_once() {
        let (port, h) = open();
        port.close(h);
        port.close(h);
        assert_eq!(port.opens(), 1);
        assert_eq!(port.closes(), 1);
        assert_eq!(port.open_handles(), 0);
        assert!(port.read_attribute(h, attr::SAMPLE_RATE).is_err());
        assert!(port.journal().contains(&SimEvent::Close(h)));
    }
}
