// Copyright 2025-2026 CEMAXECUTER LLC

//! libiio backend for AD936x/ADRV9002 style front-ends (PlutoSDR, Jupiter).

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::attr::{self, FirSpec};
use crate::backend::fir::{FirDesigner, KaiserFirDesigner};
use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::{BufferHandle, HardwarePort, PortHandle};
use crate::{lock, Side};

type IioContext = c_void;
type IioDevice = c_void;
type IioChannel = c_void;
type IioBuffer = c_void;

extern "C" {
    fn iio_create_context_from_uri(uri: *const c_char) -> *mut IioContext;
    fn iio_context_destroy(ctx: *mut IioContext);
    fn iio_context_find_device(ctx: *const IioContext, name: *const c_char) -> *mut IioDevice;
    fn iio_device_find_channel(dev: *const IioDevice, name: *const c_char, output: bool) -> *mut IioChannel;
    fn iio_device_identify_filename(
        dev: *const IioDevice,
        filename: *const c_char,
        chn: *mut *mut IioChannel,
        attr: *mut *const c_char,
    ) -> c_int;
    fn iio_device_find_attr(dev: *const IioDevice, name: *const c_char) -> *const c_char;
    fn iio_device_attr_read(dev: *const IioDevice, attr: *const c_char, dst: *mut c_char, len: usize) -> isize;
    fn iio_device_attr_write(dev: *const IioDevice, attr: *const c_char, src: *const c_char) -> isize;
    fn iio_device_debug_attr_read(dev: *const IioDevice, attr: *const c_char, dst: *mut c_char, len: usize)
        -> isize;
    fn iio_device_debug_attr_write(dev: *const IioDevice, attr: *const c_char, src: *const c_char) -> isize;
    fn iio_channel_attr_read(chn: *const IioChannel, attr: *const c_char, dst: *mut c_char, len: usize) -> isize;
    fn iio_channel_attr_write(chn: *const IioChannel, attr: *const c_char, src: *const c_char) -> isize;
    fn iio_channel_enable(chn: *mut IioChannel);
    fn iio_device_create_buffer(dev: *const IioDevice, samples_count: usize, cyclic: bool) -> *mut IioBuffer;
    fn iio_buffer_destroy(buf: *mut IioBuffer);
    fn iio_buffer_refill(buf: *mut IioBuffer) -> isize;
    fn iio_buffer_push(buf: *mut IioBuffer) -> isize;
    fn iio_buffer_start(buf: *const IioBuffer) -> *mut c_void;
    fn iio_buffer_end(buf: *const IioBuffer) -> *mut c_void;
    fn iio_strerror(err: c_int, dst: *mut c_char, len: usize);
}

const PHY_NAMES: [&str; 2] = ["ad9361-phy", "adrv9002-phy"];
const RX_NAMES: [&str; 2] = ["cf-ad9361-lpc", "axi-adrv9002-rx-lpc"];
const TX_NAMES: [&str; 2] = ["cf-ad9361-dds-core-lpc", "axi-adrv9002-tx-lpc"];

/// Bytes per complex sample in a two-channel buffer.
const SAMPLE_STEP: usize = 4;

fn errstr(err: isize) -> String {
    let mut buf = [0 as c_char; 256];
    unsafe {
        iio_strerror((-err) as c_int, buf.as_mut_ptr(), buf.len());
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().to_string()
    }
}

fn cstring(key: &str, s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| SdrError::attribute(key, "embedded NUL"))
}

/// Driver file names a logical key maps to. Sample rate is written on
/// both directions.
fn filenames(key: &str) -> Option<&'static [&'static str]> {
    Some(match key {
        attr::SAMPLE_RATE => &["in_voltage0_sampling_frequency", "out_voltage0_sampling_frequency"],
        attr::FIR_ENABLE => &["in_out_voltage_filter_fir_en"],
        attr::FIR_CONFIG => &["filter_fir_config"],
        attr::LO_PPM_TENTHS => &["xo_correction"],
        attr::RX_LO_FREQUENCY => &["out_altvoltage0_RX_LO_frequency"],
        attr::TX_LO_FREQUENCY => &["out_altvoltage1_TX_LO_frequency"],
        attr::RX_RF_BANDWIDTH => &["in_voltage_rf_bandwidth"],
        attr::TX_RF_BANDWIDTH => &["out_voltage_rf_bandwidth"],
        attr::RX_PORT => &["in_voltage0_rf_port_select"],
        attr::TX_PORT => &["out_voltage0_rf_port_select"],
        attr::RX_GAIN_MODE => &["in_voltage0_gain_control_mode"],
        attr::RX_GAIN => &["in_voltage0_hardwaregain"],
        attr::RX_BB_DC_TRACKING => &["in_voltage_bb_dc_offset_tracking_en"],
        attr::RX_RF_DC_TRACKING => &["in_voltage_rf_dc_offset_tracking_en"],
        attr::RX_IQ_TRACKING => &["in_voltage_quadrature_tracking_en"],
        attr::TX_ATTENUATION => &["out_voltage0_hardwaregain"],
        attr::RX_SAMPLE_RATES => &["rx_path_rates"],
        attr::TX_SAMPLE_RATES => &["tx_path_rates"],
        _ => return None,
    })
}

struct Context {
    ctx: *mut IioContext,
    phy: *mut IioDevice,
    rx: *mut IioDevice,
    tx: *mut IioDevice,
    /// Reference clock as found at open (Hz)
    xo_nominal: i64,
}

struct Buffer {
    raw: *mut IioBuffer,
}

#[derive(Default)]
struct IioState {
    next_handle: u64,
    next_buffer: u64,
    contexts: HashMap<u64, Context>,
    buffers: HashMap<u64, Buffer>,
}

// libiio handles are used from the worker threads one buffer per side; all
// context-level calls go through the state mutex.
unsafe impl Send for IioState {}

/// libiio context per open handle.
pub struct IioPort {
    designer: Box<dyn FirDesigner>,
    state: Mutex<IioState>,
}

impl IioPort {
    pub fn new() -> Self {
        Self::with_designer(Box::new(KaiserFirDesigner::default()))
    }

    pub fn with_designer(designer: Box<dyn FirDesigner>) -> Self {
        Self {
            designer,
            state: Mutex::new(IioState::default()),
        }
    }

    fn find_device(ctx: *mut IioContext, names: &[&str]) -> *mut IioDevice {
        for name in names {
            let Ok(c) = CString::new(*name) else {
                continue;
            };
            let dev = unsafe { iio_context_find_device(ctx, c.as_ptr()) };
            if !dev.is_null() {
                return dev;
            }
        }
        ptr::null_mut()
    }

    fn enable_iq(dev: *mut IioDevice, output: bool) {
        for name in ["voltage0", "voltage1"] {
            let Ok(c) = CString::new(name) else {
                continue;
            };
            unsafe {
                let chn = iio_device_find_channel(dev, c.as_ptr(), output);
                if !chn.is_null() {
                    iio_channel_enable(chn);
                }
            }
        }
    }

    fn read_file(dev: *mut IioDevice, key: &str, filename: &str) -> Result<String> {
        let file = cstring(key, filename)?;
        let mut chn: *mut IioChannel = ptr::null_mut();
        let mut name: *const c_char = ptr::null();
        let mut buf = [0 as c_char; 1024];
        let n = unsafe {
            if iio_device_identify_filename(dev, file.as_ptr(), &mut chn, &mut name) < 0 {
                return Err(SdrError::attribute(key, format!("{} not recognized", filename)));
            }
            if !chn.is_null() {
                iio_channel_attr_read(chn, name, buf.as_mut_ptr(), buf.len())
            } else if !iio_device_find_attr(dev, name).is_null() {
                iio_device_attr_read(dev, name, buf.as_mut_ptr(), buf.len())
            } else {
                iio_device_debug_attr_read(dev, name, buf.as_mut_ptr(), buf.len())
            }
        };
        if n < 0 {
            return Err(SdrError::attribute(key, errstr(n)));
        }
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().trim().to_string())
    }

    fn write_file(dev: *mut IioDevice, key: &str, filename: &str, value: &str) -> Result<()> {
        let file = cstring(key, filename)?;
        let val = cstring(key, value)?;
        let mut chn: *mut IioChannel = ptr::null_mut();
        let mut name: *const c_char = ptr::null();
        let n = unsafe {
            if iio_device_identify_filename(dev, file.as_ptr(), &mut chn, &mut name) < 0 {
                return Err(SdrError::attribute(key, format!("{} not recognized", filename)));
            }
            if !chn.is_null() {
                iio_channel_attr_write(chn, name, val.as_ptr())
            } else if !iio_device_find_attr(dev, name).is_null() {
                iio_device_attr_write(dev, name, val.as_ptr())
            } else {
                iio_device_debug_attr_write(dev, name, val.as_ptr())
            }
        };
        if n < 0 {
            return Err(SdrError::attribute(key, format!("{}={}: {}", filename, value, errstr(n))));
        }
        log::debug!("iio: {}={}", filename, value);
        Ok(())
    }

    /// Translate a logical value into what the driver file expects.
    fn to_driver(&self, key: &str, value: &str, xo_nominal: i64) -> Result<String> {
        match key {
            attr::FIR_CONFIG => self.designer.design(&FirSpec::parse(value)?),
            attr::LO_PPM_TENTHS => {
                let tenths: i64 = attr::parse_number(key, value)?;
                Ok((xo_nominal + xo_nominal * tenths / 10_000_000).to_string())
            }
            attr::TX_ATTENUATION => {
                let mdb: u32 = attr::parse_number(key, value)?;
                Ok(format!("{:.3}", -(mdb as f64) / 1000.0))
            }
            _ => Ok(value.to_string()),
        }
    }

    /// Translate a driver reading back into the logical format.
    fn from_driver(key: &str, raw: &str, xo_nominal: i64) -> Result<String> {
        // Gains read back as "40.000000 dB"
        let number = raw.split_whitespace().next().unwrap_or("");
        match key {
            attr::RX_GAIN => Ok(format!("{}", attr::parse_number::<f64>(key, number)?.round() as i64)),
            attr::TX_ATTENUATION => {
                let db: f64 = attr::parse_number(key, number)?;
                Ok(format!("{}", (-db * 1000.0).round() as i64))
            }
            attr::LO_PPM_TENTHS => {
                let xo: i64 = attr::parse_number(key, number)?;
                if xo_nominal == 0 {
                    return Ok("0".to_string());
                }
                Ok(((xo - xo_nominal) * 10_000_000 / xo_nominal).to_string())
            }
            attr::RX_SAMPLE_RATES | attr::TX_SAMPLE_RATES => Ok(raw
                .split_whitespace()
                .filter(|tok| !tok.starts_with("BBPLL:"))
                .collect::<Vec<_>>()
                .join(" ")),
            _ => Ok(raw.to_string()),
        }
    }
}

impl Default for IioPort {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwarePort for IioPort {
    fn name(&self) -> &'static str {
        "iio"
    }

    fn open(&self, id: &DeviceId) -> Result<PortHandle> {
        let open_err = |reason: String| SdrError::DeviceOpen {
            id: id.to_string(),
            reason,
        };
        let uri = match id {
            DeviceId::Uri(uri) => uri,
            other => return Err(open_err(format!("{} is not an iio URI", other))),
        };
        let c_uri = CString::new(uri.as_str()).map_err(|_| open_err("embedded NUL".to_string()))?;

        let ctx = unsafe { iio_create_context_from_uri(c_uri.as_ptr()) };
        if ctx.is_null() {
            return Err(open_err("no iio context at this URI".to_string()));
        }
        let phy = Self::find_device(ctx, &PHY_NAMES);
        let rx = Self::find_device(ctx, &RX_NAMES);
        let tx = Self::find_device(ctx, &TX_NAMES);
        if phy.is_null() || rx.is_null() || tx.is_null() {
            unsafe { iio_context_destroy(ctx) };
            return Err(open_err("context lacks phy, rx or tx streaming device".to_string()));
        }
        Self::enable_iq(rx, false);
        Self::enable_iq(tx, true);

        let xo_nominal = Self::read_file(phy, attr::LO_PPM_TENTHS, "xo_correction")
            .and_then(|v| attr::parse_number(attr::LO_PPM_TENTHS, &v))
            .unwrap_or_else(|e| {
                log::warn!("iio: reference clock unknown, ppm correction disabled: {}", e);
                0
            });

        let mut state = lock(&self.state);
        state.next_handle += 1;
        let handle = PortHandle(state.next_handle);
        state.contexts.insert(
            handle.0,
            Context {
                ctx,
                phy,
                rx,
                tx,
                xo_nominal,
            },
        );
        log::info!("iio: context {} open, xo {} Hz", uri, xo_nominal);
        Ok(handle)
    }

    fn close(&self, handle: PortHandle) {
        let mut state = lock(&self.state);
        if let Some(c) = state.contexts.remove(&handle.0) {
            unsafe { iio_context_destroy(c.ctx) };
        }
    }

    fn read_attribute(&self, handle: PortHandle, key: &str) -> Result<String> {
        let state = lock(&self.state);
        let c = state.contexts.get(&handle.0).ok_or(SdrError::NotOpen)?;
        let files = filenames(key).ok_or_else(|| SdrError::attribute(key, "unknown attribute"))?;
        let raw = Self::read_file(c.phy, key, files[0])?;
        Self::from_driver(key, &raw, c.xo_nominal)
    }

    fn write_attribute(&self, handle: PortHandle, key: &str, value: &str) -> Result<()> {
        let state = lock(&self.state);
        let c = state.contexts.get(&handle.0).ok_or(SdrError::NotOpen)?;
        if matches!(key, attr::RX_SAMPLE_RATES | attr::TX_SAMPLE_RATES) {
            return Err(SdrError::attribute(key, "read only"));
        }
        if key == attr::LO_PPM_TENTHS && c.xo_nominal == 0 {
            return Err(SdrError::attribute(key, "reference clock unknown"));
        }
        let files = filenames(key).ok_or_else(|| SdrError::attribute(key, "unknown attribute"))?;
        let driver_value = self.to_driver(key, value, c.xo_nominal)?;
        for file in files {
            Self::write_file(c.phy, key, file, &driver_value)?;
        }
        Ok(())
    }

    fn allocate_buffer(&self, handle: PortHandle, samples: usize, side: Side) -> Result<BufferHandle> {
        let mut state = lock(&self.state);
        let c = state.contexts.get(&handle.0).ok_or(SdrError::NotOpen)?;
        let dev = match side {
            Side::Rx => c.rx,
            Side::Tx => c.tx,
        };
        let raw = unsafe { iio_device_create_buffer(dev, samples, false) };
        if raw.is_null() {
            return Err(SdrError::Backend(format!("iio: cannot create {} buffer of {}", side, samples)));
        }
        state.next_buffer += 1;
        let id = state.next_buffer;
        state.buffers.insert(id, Buffer { raw });
        Ok(BufferHandle {
            id,
            handle,
            side,
            samples,
        })
    }

    fn free_buffer(&self, buffer: &BufferHandle) {
        if let Some(b) = lock(&self.state).buffers.remove(&buffer.id) {
            unsafe { iio_buffer_destroy(b.raw) };
        }
    }

    fn receive(&self, buffer: &BufferHandle, data: &mut [i16]) -> Result<usize> {
        let raw = lock(&self.state)
            .buffers
            .get(&buffer.id)
            .map(|b| b.raw)
            .ok_or_else(|| SdrError::Backend(format!("iio: buffer {} not allocated", buffer.id)))?;

        // Blocks until the DMA block is full; no lock held here.
        let n = unsafe { iio_buffer_refill(raw) };
        if n < 0 {
            return Err(SdrError::Backend(format!("iio refill: {}", errstr(n))));
        }

        let bytes = unsafe {
            let start = iio_buffer_start(raw) as *const u8;
            let end = iio_buffer_end(raw) as *const u8;
            std::slice::from_raw_parts(start, (end as usize).saturating_sub(start as usize))
        };
        let samples = (bytes.len() / SAMPLE_STEP).min(data.len() / 2);
        let out = &mut data[..samples * 2];
        LittleEndian::read_i16_into(&bytes[..samples * SAMPLE_STEP], out);
        // 12-bit two's complement in 16-bit words
        for v in out.iter_mut() {
            *v = (*v << 4) >> 4;
        }
        Ok(samples)
    }

    fn transmit(&self, buffer: &BufferHandle, data: &[i16]) -> Result<usize> {
        let raw = lock(&self.state)
            .buffers
            .get(&buffer.id)
            .map(|b| b.raw)
            .ok_or_else(|| SdrError::Backend(format!("iio: buffer {} not allocated", buffer.id)))?;

        let bytes = unsafe {
            let start = iio_buffer_start(raw) as *mut u8;
            let end = iio_buffer_end(raw) as *mut u8;
            std::slice::from_raw_parts_mut(start, (end as usize).saturating_sub(start as usize))
        };
        let samples = (bytes.len() / SAMPLE_STEP).min(data.len() / 2);
        LittleEndian::write_i16_into(&data[..samples * 2], &mut bytes[..samples * SAMPLE_STEP]);

        let n = unsafe { iio_buffer_push(raw) };
        if n < 0 {
            return Err(SdrError::Backend(format!("iio push: {}", errstr(n))));
        }
        Ok((n as usize / SAMPLE_STEP).min(samples))
    }

    fn sample_bits(&self, side: Side) -> u32 {
        match side {
            Side::Rx => 12,
            Side::Tx => 16,
        }
    }
}

impl Drop for IioPort {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for (_, b) in state.buffers.drain() {
            unsafe { iio_buffer_destroy(b.raw) };
        }
        for (_, c) in state.contexts.drain() {
            unsafe { iio_context_destroy(c.ctx) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_logical_key_maps() {
        for key in [
            attr::SAMPLE_RATE,
            attr::FIR_ENABLE,
            attr::FIR_CONFIG,
            attr::LO_PPM_TENTHS,
            attr::RX_LO_FREQUENCY,
            attr::TX_LO_FREQUENCY,
            attr::RX_GAIN,
            attr::TX_ATTENUATION,
            attr::RX_SAMPLE_RATES,
        ] {
            assert!(filenames(key).is_some(), "{} unmapped", key);
        }
        assert_eq!(filenames(attr::SAMPLE_RATE).unwrap().len(), 2);
    }

    #[test]
    fn test_value_translation() {
        let port = IioPort::new();
        assert_eq!(port.to_driver(attr::TX_ATTENUATION, "12500", 0).unwrap(), "-12.500");
        assert_eq!(port.to_driver(attr::LO_PPM_TENTHS, "10", 40_000_000).unwrap(), "40000040");
        assert_eq!(IioPort::from_driver(attr::RX_GAIN, "40.000000 dB", 0).unwrap(), "40");
        assert_eq!(IioPort::from_driver(attr::TX_ATTENUATION, "-12.500000 dB", 0).unwrap(), "12500");
        assert_eq!(IioPort::from_driver(attr::LO_PPM_TENTHS, "40000040", 40_000_000).unwrap(), "10");
        assert_eq!(
            IioPort::from_driver(attr::RX_SAMPLE_RATES, "BBPLL:983040000 ADC:245760000 RXSAMP:30720000", 0)
                .unwrap(),
            "ADC:245760000 RXSAMP:30720000"
        );
    }
}
