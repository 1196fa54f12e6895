//! Backend-neutral hardware attribute keys and value formats.

use std::fmt;

use crate::error::{Result, SdrError};
use crate::Side;

/// Converter sample rate, shared by both sides (Hz).
pub const SAMPLE_RATE: &str = "sample_rate";
/// On-chip FIR enable, `1` or `0`. Shared.
pub const FIR_ENABLE: &str = "fir_enable";
/// On-chip FIR design, see [`FirSpec`]. Shared.
pub const FIR_CONFIG: &str = "fir_config";
/// Reference oscillator correction in tenths of ppm. Shared.
pub const LO_PPM_TENTHS: &str = "lo_ppm_tenths";
/// Reference clock, see [`ClockSource`]. Shared.
pub const CLOCK_SOURCE: &str = "clock_source";

pub const RX_LO_FREQUENCY: &str = "rx_lo_frequency";
pub const TX_LO_FREQUENCY: &str = "tx_lo_frequency";
/// Signed NCO shift in Hz, or `off`
pub const RX_NCO_FREQUENCY: &str = "rx_nco_frequency";
pub const TX_NCO_FREQUENCY: &str = "tx_nco_frequency";
pub const RX_RF_BANDWIDTH: &str = "rx_rf_bandwidth";
pub const TX_RF_BANDWIDTH: &str = "tx_rf_bandwidth";
pub const RX_PORT: &str = "rx_port";
pub const TX_PORT: &str = "tx_port";
pub const RX_GAIN_MODE: &str = "rx_gain_mode";
/// Rx gain in dB
pub const RX_GAIN: &str = "rx_gain";
/// Baseband DC offset tracking, `1` or `0`
pub const RX_BB_DC_TRACKING: &str = "rx_bb_dc_tracking";
/// RF DC offset tracking, `1` or `0`
pub const RX_RF_DC_TRACKING: &str = "rx_rf_dc_tracking";
/// Quadrature (I/Q imbalance) tracking, `1` or `0`
pub const RX_IQ_TRACKING: &str = "rx_iq_tracking";
/// Tx attenuation in millidB, positive
pub const TX_ATTENUATION: &str = "tx_attenuation";
/// Read only: Rx converter chain, see [`SampleRateChain`]
pub const RX_SAMPLE_RATES: &str = "rx_sample_rates";
/// Read only: Tx converter chain
pub const TX_SAMPLE_RATES: &str = "tx_sample_rates";

pub fn lo_frequency(side: Side) -> &'static str {
    match side {
        Side::Rx => RX_LO_FREQUENCY,
        Side::Tx => TX_LO_FREQUENCY,
    }
}

pub fn nco_frequency(side: Side) -> &'static str {
    match side {
        Side::Rx => RX_NCO_FREQUENCY,
        Side::Tx => TX_NCO_FREQUENCY,
    }
}

pub fn rf_bandwidth(side: Side) -> &'static str {
    match side {
        Side::Rx => RX_RF_BANDWIDTH,
        Side::Tx => TX_RF_BANDWIDTH,
    }
}

pub fn port(side: Side) -> &'static str {
    match side {
        Side::Rx => RX_PORT,
        Side::Tx => TX_PORT,
    }
}

pub fn sample_rates(side: Side) -> &'static str {
    match side {
        Side::Rx => RX_SAMPLE_RATES,
        Side::Tx => TX_SAMPLE_RATES,
    }
}

/// Keys whose change affects both sides of the front-end.
pub fn is_shared(key: &str) -> bool {
    matches!(key, SAMPLE_RATE | FIR_ENABLE | FIR_CONFIG | LO_PPM_TENTHS | CLOCK_SOURCE)
}

/// `off` when disabled, otherwise the signed shift in Hz.
pub fn format_nco(enabled: bool, frequency: i32) -> String {
    if enabled {
        frequency.to_string()
    } else {
        "off".to_string()
    }
}

pub fn parse_nco(key: &str, v: &str) -> Result<Option<i32>> {
    match v.trim() {
        "off" => Ok(None),
        other => parse_number(key, other).map(Some),
    }
}

/// Reference the front-end PLLs lock to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Internal,
    /// External reference input at this frequency (Hz)
    External(u32),
}

impl ClockSource {
    pub fn new(external: bool, frequency: u32) -> Self {
        if external {
            ClockSource::External(frequency)
        } else {
            ClockSource::Internal
        }
    }

    pub fn to_attribute(&self) -> String {
        match self {
            ClockSource::Internal => "internal".to_string(),
            ClockSource::External(hz) => format!("external:{}", hz),
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v.trim() {
            "internal" => Ok(ClockSource::Internal),
            other => match other.strip_prefix("external:") {
                Some(hz) => Ok(ClockSource::External(parse_number(CLOCK_SOURCE, hz)?)),
                None => Err(SdrError::attribute(CLOCK_SOURCE, format!("unknown source '{}'", other))),
            },
        }
    }
}

pub fn format_bool(v: bool) -> &'static str {
    if v {
        "1"
    } else {
        "0"
    }
}

pub fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(SdrError::attribute(key, format!("not a boolean: '{}'", other))),
    }
}

pub fn parse_number<T: std::str::FromStr>(key: &str, v: &str) -> Result<T> {
    v.trim()
        .parse()
        .map_err(|_| SdrError::attribute(key, format!("not a number: '{}'", v)))
}

/// On-chip FIR request handed to the backend (and its coefficient designer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirSpec {
    /// Passband width in Hz
    pub bandwidth: u32,
    /// FIR rate change, log2 (0..=2)
    pub log2: u32,
    /// FIR gain in dB
    pub gain_db: i32,
    /// Converter sample rate the FIR is designed for (Hz)
    pub sample_rate: u32,
}

impl FirSpec {
    pub fn to_attribute(&self) -> String {
        format!(
            "bw={},log2={},gain={},rate={}",
            self.bandwidth, self.log2, self.gain_db, self.sample_rate
        )
    }

    pub fn parse(v: &str) -> Result<Self> {
        let mut spec = FirSpec {
            bandwidth: 0,
            log2: 0,
            gain_db: 0,
            sample_rate: 0,
        };
        for field in v.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| SdrError::attribute(FIR_CONFIG, format!("bad field '{}'", field)))?;
            match name {
                "bw" => spec.bandwidth = parse_number(FIR_CONFIG, value)?,
                "log2" => spec.log2 = parse_number(FIR_CONFIG, value)?,
                "gain" => spec.gain_db = parse_number(FIR_CONFIG, value)?,
                "rate" => spec.sample_rate = parse_number(FIR_CONFIG, value)?,
                other => {
                    return Err(SdrError::attribute(FIR_CONFIG, format!("unknown field '{}'", other)))
                }
            }
        }
        Ok(spec)
    }
}

/// Rates through the hardware's converter chain, converter first, host last.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleRateChain {
    pub stages: Vec<(String, u64)>,
}

impl SampleRateChain {
    /// Parse `NAME:rate` tokens separated by whitespace.
    pub fn parse(v: &str) -> Result<Self> {
        let stages = v
            .split_whitespace()
            .map(|tok| -> Result<(String, u64)> {
                let (name, rate) = tok
                    .split_once(':')
                    .ok_or_else(|| SdrError::attribute("sample_rates", format!("bad stage '{}'", tok)))?;
                Ok((name.to_string(), parse_number::<u64>("sample_rates", rate)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn converter_rate(&self) -> Option<u64> {
        self.stages.first().map(|s| s.1)
    }

    /// Rate at the host interface, before host-side rate conversion.
    pub fn host_rate(&self) -> Option<u64> {
        self.stages.last().map(|s| s.1)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for SampleRateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, rate)) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", name, rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fir_spec_attribute() {
        let spec = FirSpec {
            bandwidth: 500_000,
            log2: 1,
            gain_db: -6,
            sample_rate: 2_500_000,
        };
        let text = spec.to_attribute();
        assert_eq!(text, "bw=500000,log2=1,gain=-6,rate=2500000");
        assert_eq!(FirSpec::parse(&text).unwrap(), spec);
        assert!(FirSpec::parse("bw=1,taps=64").is_err());
    }

    #[test]
    fn test_sample_rate_chain() {
        let chain = SampleRateChain::parse("BBPLL:983040000 ADC:245760000 R2:122880000 R1:61440000 RF:30720000 RXSAMP:30720000").unwrap();
        assert_eq!(chain.stages.len(), 6);
        assert_eq!(chain.converter_rate(), Some(983_040_000));
        assert_eq!(chain.host_rate(), Some(30_720_000));
        assert!(SampleRateChain::parse("ADC=1").is_err());
        assert!(SampleRateChain::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_shared_keys() {
        assert!(is_shared(SAMPLE_RATE));
        assert!(is_shared(LO_PPM_TENTHS));
        assert!(!is_shared(RX_GAIN));
        assert!(!is_shared(lo_frequency(Side::Tx)));
        assert!(is_shared(CLOCK_SOURCE));
        assert!(!is_shared(nco_frequency(Side::Rx)));
    }

    #[test]
    fn test_clock_source_attribute() {
        assert_eq!(ClockSource::new(false, 10_000_000).to_attribute(), "internal");
        let ext = ClockSource::new(true, 40_000_000);
        assert_eq!(ext.to_attribute(), "external:40000000");
        assert_eq!(ClockSource::parse("external:40000000").unwrap(), ext);
        assert_eq!(ClockSource::parse("internal").unwrap(), ClockSource::Internal);
        assert!(ClockSource::parse("external:").is_err());
        assert!(ClockSource::parse("gps").is_err());
    }

    #[test]
    fn test_nco_values() {
        assert_eq!(format_nco(false, 1000), "off");
        assert_eq!(format_nco(true, -250_000), "-250000");
        assert_eq!(parse_nco(RX_NCO_FREQUENCY, "off").unwrap(), None);
        assert_eq!(parse_nco(RX_NCO_FREQUENCY, "-250000").unwrap(), Some(-250_000));
        assert!(parse_nco(RX_NCO_FREQUENCY, "fast").is_err());
    }
}
