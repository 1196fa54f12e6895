// Copyright 2025-2026 CEMAXECUTER LLC

//! LimeSuite backend (LimeSDR USB/Mini), addressed by board serial.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::ptr;
use std::sync::Mutex;

use crate::attr::{self, ClockSource, FirSpec};
use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::{BufferHandle, HardwarePort, PortHandle};
use crate::{lock, Side};

type LmsDevice = c_void;
type LmsInfoStr = [c_char; 256];

const LMS_FMT_I16: c_int = 1;
const LMS_LINK_FMT_DEFAULT: c_int = 0;
const LMS_CLOCK_REF: usize = 0x0000;
const LMS_CLOCK_EXTREF: usize = 0x0006;
const LMS_NCO_VAL_COUNT: usize = 16;
const LMS_PATH_LNAH: usize = 1;
const LMS_PATH_LNAL: usize = 2;
const LMS_PATH_LNAW: usize = 3;
const LMS_PATH_TX1: usize = 1;
const LMS_PATH_TX2: usize = 2;
const TRANSFER_TIMEOUT_MS: c_uint = 1000;
const MAX_DEVICES: usize = 16;

#[repr(C)]
struct LmsStream {
    handle: usize,
    is_tx: bool,
    channel: u32,
    fifo_size: u32,
    throughput_vs_latency: f32,
    data_fmt: c_int,
    link_fmt: c_int,
}

#[repr(C)]
struct LmsStreamMeta {
    timestamp: u64,
    wait_for_timestamp: bool,
    flush_partial_packet: bool,
}

extern "C" {
    fn LMS_GetDeviceList(dev_list: *mut LmsInfoStr) -> c_int;
    fn LMS_Open(device: *mut *mut LmsDevice, info: *const c_char, args: *mut c_void) -> c_int;
    fn LMS_Close(device: *mut LmsDevice) -> c_int;
    fn LMS_Init(device: *mut LmsDevice) -> c_int;
    fn LMS_EnableChannel(device: *mut LmsDevice, dir_tx: bool, chan: usize, enabled: bool) -> c_int;
    fn LMS_SetSampleRate(device: *mut LmsDevice, rate: f64, oversample: usize) -> c_int;
    fn LMS_GetSampleRate(device: *mut LmsDevice, dir_tx: bool, chan: usize, host_hz: *mut f64, rf_hz: *mut f64)
        -> c_int;
    fn LMS_SetLOFrequency(device: *mut LmsDevice, dir_tx: bool, chan: usize, frequency: f64) -> c_int;
    fn LMS_SetLPFBW(device: *mut LmsDevice, dir_tx: bool, chan: usize, bandwidth: f64) -> c_int;
    fn LMS_SetGFIRLPF(device: *mut LmsDevice, dir_tx: bool, chan: usize, enabled: bool, bandwidth: f64) -> c_int;
    fn LMS_SetAntenna(device: *mut LmsDevice, dir_tx: bool, chan: usize, index: usize) -> c_int;
    fn LMS_SetGaindB(device: *mut LmsDevice, dir_tx: bool, chan: usize, gain: c_uint) -> c_int;
    fn LMS_SetClockFreq(device: *mut LmsDevice, clk_id: usize, freq: f64) -> c_int;
    fn LMS_GetClockFreq(device: *mut LmsDevice, clk_id: usize, freq: *mut f64) -> c_int;
    fn LMS_Calibrate(device: *mut LmsDevice, dir_tx: bool, chan: usize, bw: f64, flags: c_uint) -> c_int;
    fn LMS_SetNCOFrequency(device: *mut LmsDevice, dir_tx: bool, chan: usize, freq: *const f64, pho: f64) -> c_int;
    fn LMS_SetNCOIndex(device: *mut LmsDevice, dir_tx: bool, chan: usize, index: c_int, downconv: bool) -> c_int;
    fn LMS_SetupStream(device: *mut LmsDevice, stream: *mut LmsStream) -> c_int;
    fn LMS_DestroyStream(device: *mut LmsDevice, stream: *mut LmsStream) -> c_int;
    fn LMS_StartStream(stream: *mut LmsStream) -> c_int;
    fn LMS_StopStream(stream: *mut LmsStream) -> c_int;
    fn LMS_RecvStream(
        stream: *mut LmsStream,
        samples: *mut c_void,
        sample_count: usize,
        meta: *mut LmsStreamMeta,
        timeout_ms: c_uint,
    ) -> c_int;
    fn LMS_SendStream(
        stream: *mut LmsStream,
        samples: *const c_void,
        sample_count: usize,
        meta: *const LmsStreamMeta,
        timeout_ms: c_uint,
    ) -> c_int;
    fn LMS_GetLastErrorMessage() -> *const c_char;
}

fn last_error() -> String {
    unsafe {
        let msg = LMS_GetLastErrorMessage();
        if msg.is_null() {
            "unknown LimeSuite error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().to_string()
        }
    }
}

fn check(key: &str, r: c_int) -> Result<()> {
    if r < 0 {
        Err(SdrError::attribute(key, last_error()))
    } else {
        Ok(())
    }
}

/// Extract the `serial=` field of a LimeSuite info string.
fn serial_of(info: &str) -> Option<String> {
    info.split(',')
        .map(str::trim)
        .find_map(|f| f.strip_prefix("serial="))
        .map(|s| s.trim_start_matches('0').to_string())
}

fn rx_path(name: &str) -> Option<usize> {
    match name {
        "LNAH" => Some(LMS_PATH_LNAH),
        "LNAL" => Some(LMS_PATH_LNAL),
        "LNAW" | "A_BALANCED" => Some(LMS_PATH_LNAW),
        _ => None,
    }
}

fn tx_path(name: &str) -> Option<usize> {
    match name {
        "BAND1" | "A" => Some(LMS_PATH_TX1),
        "BAND2" | "B" => Some(LMS_PATH_TX2),
        _ => None,
    }
}

/// Frequency handed to `LMS_SetClockFreq` for the external reference;
/// negative selects the on-board TCXO.
fn ext_ref_request(source: ClockSource) -> f64 {
    match source {
        ClockSource::Internal => -1.0,
        ClockSource::External(hz) => hz as f64,
    }
}

/// The NCO table holds magnitudes; the sign picks the mixing direction,
/// which is mirrored between the Rx and Tx TSPs.
fn nco_downconvert(tx: bool, frequency: i32) -> bool {
    if tx {
        frequency >= 0
    } else {
        frequency < 0
    }
}

struct Board {
    dev: *mut LmsDevice,
    ref_nominal: f64,
    /// Values as last written, for read-back of write-only settings
    written: HashMap<String, String>,
}

struct Stream {
    dev: *mut LmsDevice,
    stream: Box<LmsStream>,
}

#[derive(Default)]
struct LimeState {
    next_handle: u64,
    next_buffer: u64,
    boards: HashMap<u64, Board>,
    streams: HashMap<u64, Stream>,
}

// Streams are driven from one worker thread each; board calls go through
// the state mutex.
unsafe impl Send for LimeState {}

pub struct LimePort {
    state: Mutex<LimeState>,
}

impl LimePort {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimeState::default()),
        }
    }

    fn apply(board: &mut Board, key: &str, value: &str) -> Result<()> {
        let dev = board.dev;
        let r = unsafe {
            match key {
                attr::SAMPLE_RATE => {
                    let rate: f64 = attr::parse_number(key, value)?;
                    LMS_SetSampleRate(dev, rate, 0)
                }
                attr::FIR_ENABLE => {
                    let on = attr::parse_bool(key, value)?;
                    let bw = board
                        .written
                        .get(attr::FIR_CONFIG)
                        .and_then(|v| FirSpec::parse(v).ok())
                        .map(|s| s.bandwidth as f64)
                        .unwrap_or(0.0);
                    let rx = LMS_SetGFIRLPF(dev, false, 0, on, bw);
                    if rx < 0 {
                        rx
                    } else {
                        LMS_SetGFIRLPF(dev, true, 0, on, bw)
                    }
                }
                // Stored, takes effect on the next enable
                attr::FIR_CONFIG => {
                    FirSpec::parse(value)?;
                    0
                }
                attr::LO_PPM_TENTHS => {
                    let tenths: f64 = attr::parse_number(key, value)?;
                    LMS_SetClockFreq(dev, LMS_CLOCK_REF, board.ref_nominal * (1.0 + tenths / 1e7))
                }
                attr::CLOCK_SOURCE => {
                    let source = ClockSource::parse(value)?;
                    LMS_SetClockFreq(dev, LMS_CLOCK_EXTREF, ext_ref_request(source))
                }
                attr::RX_NCO_FREQUENCY | attr::TX_NCO_FREQUENCY => {
                    let tx = key == attr::TX_NCO_FREQUENCY;
                    match attr::parse_nco(key, value)? {
                        None => LMS_SetNCOIndex(dev, tx, 0, LMS_NCO_VAL_COUNT as c_int, true),
                        Some(f) => {
                            let mut freqs = [0.0f64; LMS_NCO_VAL_COUNT];
                            freqs[0] = f.unsigned_abs() as f64;
                            let r = LMS_SetNCOFrequency(dev, tx, 0, freqs.as_ptr(), 0.0);
                            if r < 0 {
                                r
                            } else {
                                LMS_SetNCOIndex(dev, tx, 0, 0, nco_downconvert(tx, f))
                            }
                        }
                    }
                }
                attr::RX_LO_FREQUENCY | attr::TX_LO_FREQUENCY => {
                    let f: f64 = attr::parse_number(key, value)?;
                    LMS_SetLOFrequency(dev, key == attr::TX_LO_FREQUENCY, 0, f)
                }
                attr::RX_RF_BANDWIDTH | attr::TX_RF_BANDWIDTH => {
                    let bw: f64 = attr::parse_number(key, value)?;
                    LMS_SetLPFBW(dev, key == attr::TX_RF_BANDWIDTH, 0, bw)
                }
                attr::RX_PORT => {
                    let path = rx_path(value)
                        .ok_or_else(|| SdrError::attribute(key, format!("unknown path '{}'", value)))?;
                    LMS_SetAntenna(dev, false, 0, path)
                }
                attr::TX_PORT => {
                    let path = tx_path(value)
                        .ok_or_else(|| SdrError::attribute(key, format!("unknown path '{}'", value)))?;
                    LMS_SetAntenna(dev, true, 0, path)
                }
                attr::RX_GAIN_MODE => {
                    if value != "manual" {
                        return Err(SdrError::attribute(key, "only manual gain is supported"));
                    }
                    0
                }
                attr::RX_GAIN => {
                    let db: i32 = attr::parse_number(key, value)?;
                    LMS_SetGaindB(dev, false, 0, db.clamp(0, 73) as c_uint)
                }
                attr::TX_ATTENUATION => {
                    let mdb: u32 = attr::parse_number(key, value)?;
                    let gain = (73 - (mdb / 1000) as i32).clamp(0, 73);
                    LMS_SetGaindB(dev, true, 0, gain as c_uint)
                }
                // Tracking loops run in the chip's MCU
                attr::RX_BB_DC_TRACKING | attr::RX_RF_DC_TRACKING | attr::RX_IQ_TRACKING => {
                    attr::parse_bool(key, value)?;
                    0
                }
                _ => return Err(SdrError::attribute(key, "not supported by LimeSuite")),
            }
        };
        check(key, r)?;
        board.written.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn rate_chain(dev: *mut LmsDevice, side: Side) -> Result<String> {
        let mut host = 0.0;
        let mut rf = 0.0;
        let key = attr::sample_rates(side);
        check(key, unsafe { LMS_GetSampleRate(dev, side == Side::Tx, 0, &mut host, &mut rf) })?;
        Ok(match side {
            Side::Rx => format!("ADC:{} RXSAMP:{}", rf.round() as u64, host.round() as u64),
            Side::Tx => format!("DAC:{} TXSAMP:{}", rf.round() as u64, host.round() as u64),
        })
    }
}

impl Default for LimePort {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwarePort for LimePort {
    fn name(&self) -> &'static str {
        "limesuite"
    }

    fn open(&self, id: &DeviceId) -> Result<PortHandle> {
        let open_err = |reason: String| SdrError::DeviceOpen {
            id: id.to_string(),
            reason,
        };
        let wanted = match id {
            DeviceId::Serial(s) => s.trim_start_matches('0').to_string(),
            other => return Err(open_err(format!("{} is not a serial", other))),
        };

        let mut list: Vec<LmsInfoStr> = vec![[0; 256]; MAX_DEVICES];
        let n = unsafe { LMS_GetDeviceList(list.as_mut_ptr()) };
        if n < 0 {
            return Err(open_err(last_error()));
        }
        let info = list
            .iter()
            .take((n as usize).min(MAX_DEVICES))
            .find(|info| {
                let s = unsafe { CStr::from_ptr(info.as_ptr()) }.to_string_lossy().to_string();
                serial_of(&s).as_deref() == Some(wanted.as_str())
            })
            .ok_or_else(|| open_err("no board with this serial".to_string()))?;

        let mut dev: *mut LmsDevice = ptr::null_mut();
        unsafe {
            if LMS_Open(&mut dev, info.as_ptr(), ptr::null_mut()) < 0 || dev.is_null() {
                return Err(open_err(last_error()));
            }
            if LMS_Init(dev) < 0
                || LMS_EnableChannel(dev, false, 0, true) < 0
                || LMS_EnableChannel(dev, true, 0, true) < 0
            {
                let reason = last_error();
                LMS_Close(dev);
                return Err(open_err(reason));
            }
        }

        let mut ref_nominal = 0.0;
        if unsafe { LMS_GetClockFreq(dev, LMS_CLOCK_REF, &mut ref_nominal) } < 0 {
            log::warn!("limesuite: reference clock unknown: {}", last_error());
        }

        let mut state = lock(&self.state);
        state.next_handle += 1;
        let handle = PortHandle(state.next_handle);
        state.boards.insert(
            handle.0,
            Board {
                dev,
                ref_nominal,
                written: HashMap::new(),
            },
        );
        log::info!("limesuite: board {} open, ref {} Hz", wanted, ref_nominal);
        Ok(handle)
    }

    fn close(&self, handle: PortHandle) {
        let mut state = lock(&self.state);
        if let Some(board) = state.boards.remove(&handle.0) {
            unsafe { LMS_Close(board.dev) };
        }
    }

    fn read_attribute(&self, handle: PortHandle, key: &str) -> Result<String> {
        let state = lock(&self.state);
        let board = state.boards.get(&handle.0).ok_or(SdrError::NotOpen)?;
        match key {
            attr::RX_SAMPLE_RATES => Self::rate_chain(board.dev, Side::Rx),
            attr::TX_SAMPLE_RATES => Self::rate_chain(board.dev, Side::Tx),
            _ => board
                .written
                .get(key)
                .cloned()
                .ok_or_else(|| SdrError::attribute(key, "not set")),
        }
    }

    fn write_attribute(&self, handle: PortHandle, key: &str, value: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let board = state.boards.get_mut(&handle.0).ok_or(SdrError::NotOpen)?;
        if key == attr::LO_PPM_TENTHS && board.ref_nominal == 0.0 {
            return Err(SdrError::attribute(key, "reference clock unknown"));
        }
        Self::apply(board, key, value)
    }

    fn allocate_buffer(&self, handle: PortHandle, samples: usize, side: Side) -> Result<BufferHandle> {
        let mut state = lock(&self.state);
        let dev = state.boards.get(&handle.0).ok_or(SdrError::NotOpen)?.dev;
        let mut stream = Box::new(LmsStream {
            handle: 0,
            is_tx: side == Side::Tx,
            channel: 0,
            fifo_size: (samples * 4) as u32,
            throughput_vs_latency: 0.5,
            data_fmt: LMS_FMT_I16,
            link_fmt: LMS_LINK_FMT_DEFAULT,
        });
        unsafe {
            if LMS_SetupStream(dev, stream.as_mut()) < 0 {
                return Err(SdrError::Backend(format!("limesuite setup {}: {}", side, last_error())));
            }
            if LMS_StartStream(stream.as_mut()) < 0 {
                let reason = last_error();
                LMS_DestroyStream(dev, stream.as_mut());
                return Err(SdrError::Backend(format!("limesuite start {}: {}", side, reason)));
            }
        }
        state.next_buffer += 1;
        let id = state.next_buffer;
        state.streams.insert(id, Stream { dev, stream });
        Ok(BufferHandle {
            id,
            handle,
            side,
            samples,
        })
    }

    fn free_buffer(&self, buffer: &BufferHandle) {
        if let Some(mut s) = lock(&self.state).streams.remove(&buffer.id) {
            unsafe {
                LMS_StopStream(s.stream.as_mut());
                LMS_DestroyStream(s.dev, s.stream.as_mut());
            }
        }
    }

    fn receive(&self, buffer: &BufferHandle, data: &mut [i16]) -> Result<usize> {
        let stream = lock(&self.state)
            .streams
            .get_mut(&buffer.id)
            .map(|s| s.stream.as_mut() as *mut LmsStream)
            .ok_or_else(|| SdrError::Backend(format!("limesuite: stream {} not set up", buffer.id)))?;

        let count = buffer.samples.min(data.len() / 2);
        let mut meta = LmsStreamMeta {
            timestamp: 0,
            wait_for_timestamp: false,
            flush_partial_packet: false,
        };
        let n = unsafe {
            LMS_RecvStream(stream, data.as_mut_ptr() as *mut c_void, count, &mut meta, TRANSFER_TIMEOUT_MS)
        };
        if n < 0 {
            return Err(SdrError::Backend(format!("limesuite recv: {}", last_error())));
        }
        Ok(n as usize)
    }

    fn transmit(&self, buffer: &BufferHandle, data: &[i16]) -> Result<usize> {
        let stream = lock(&self.state)
            .streams
            .get_mut(&buffer.id)
            .map(|s| s.stream.as_mut() as *mut LmsStream)
            .ok_or_else(|| SdrError::Backend(format!("limesuite: stream {} not set up", buffer.id)))?;

        let count = buffer.samples.min(data.len() / 2);
        let meta = LmsStreamMeta {
            timestamp: 0,
            wait_for_timestamp: false,
            flush_partial_packet: false,
        };
        let n = unsafe {
            LMS_SendStream(stream, data.as_ptr() as *const c_void, count, &meta, TRANSFER_TIMEOUT_MS)
        };
        if n < 0 {
            return Err(SdrError::Backend(format!("limesuite send: {}", last_error())));
        }
        Ok(n as usize)
    }

    fn sample_bits(&self, _side: Side) -> u32 {
        12
    }

    fn calibrate(&self, handle: PortHandle, side: Side, bandwidth: u32) -> Result<()> {
        let state = lock(&self.state);
        let board = state.boards.get(&handle.0).ok_or(SdrError::NotOpen)?;
        let r = unsafe { LMS_Calibrate(board.dev, side == Side::Tx, 0, bandwidth as f64, 0) };
        if r < 0 {
            return Err(SdrError::Backend(format!("limesuite calibrate {}: {}", side, last_error())));
        }
        Ok(())
    }
}

impl Drop for LimePort {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for (_, mut s) in state.streams.drain() {
            unsafe {
                LMS_StopStream(s.stream.as_mut());
                LMS_DestroyStream(s.dev, s.stream.as_mut());
            }
        }
        for (_, board) in state.boards.drain() {
            unsafe { LMS_Close(board.dev) };
        }
    }
}
