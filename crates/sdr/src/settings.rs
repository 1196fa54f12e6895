use std::fmt;
use std::str::FromStr;

use tl_dsp::rate::MAX_LOG2;
use tl_dsp::Placement;

use crate::error::{Result, SdrError};
use crate::Side;

/// Largest on-chip FIR rate change (log2).
pub const MAX_FIR_LOG2: u32 = 2;

/// On-chip FIR gains the hardware accepts, dB.
pub const FIR_GAINS_DB: [i32; 4] = [-12, -6, 0, 6];

/// External reference frequencies the front-ends lock to (Hz).
pub const EXT_CLOCK_RANGE: std::ops::RangeInclusive<u32> = 10_000_000..=52_000_000;

/// Rx automatic gain control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainMode {
    #[default]
    Manual,
    SlowAttack,
    FastAttack,
    Hybrid,
}

impl GainMode {
    pub fn as_attr(self) -> &'static str {
        match self {
            GainMode::Manual => "manual",
            GainMode::SlowAttack => "slow_attack",
            GainMode::FastAttack => "fast_attack",
            GainMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for GainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_attr())
    }
}

impl FromStr for GainMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(GainMode::Manual),
            "slow_attack" | "slow" => Ok(GainMode::SlowAttack),
            "fast_attack" | "fast" => Ok(GainMode::FastAttack),
            "hybrid" => Ok(GainMode::Hybrid),
            other => Err(format!("unknown gain mode '{}'", other)),
        }
    }
}

/// Names one field of [`DeviceSettings`] in a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    CenterFrequency,
    DevSampleRate,
    Log2Factor,
    Placement,
    RfBandwidth,
    FirEnable,
    FirBandwidth,
    FirLog2,
    FirGain,
    LoPpmTenths,
    Antenna,
    GainMode,
    Gain,
    Attenuation,
    HwBbDcBlock,
    HwRfDcBlock,
    HwIqCorrection,
    TransverterMode,
    TransverterDelta,
    ExtClock,
    ExtClockFreq,
    NcoEnable,
    NcoFrequency,
}

impl SettingKey {
    pub const ALL: [SettingKey; 23] = [
        SettingKey::CenterFrequency,
        SettingKey::DevSampleRate,
        SettingKey::Log2Factor,
        SettingKey::Placement,
        SettingKey::RfBandwidth,
        SettingKey::FirEnable,
        SettingKey::FirBandwidth,
        SettingKey::FirLog2,
        SettingKey::FirGain,
        SettingKey::LoPpmTenths,
        SettingKey::Antenna,
        SettingKey::GainMode,
        SettingKey::Gain,
        SettingKey::Attenuation,
        SettingKey::HwBbDcBlock,
        SettingKey::HwRfDcBlock,
        SettingKey::HwIqCorrection,
        SettingKey::TransverterMode,
        SettingKey::TransverterDelta,
        SettingKey::ExtClock,
        SettingKey::ExtClockFreq,
        SettingKey::NcoEnable,
        SettingKey::NcoFrequency,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SettingKey::CenterFrequency => "centerFrequency",
            SettingKey::DevSampleRate => "devSampleRate",
            SettingKey::Log2Factor => "log2Factor",
            SettingKey::Placement => "fcPos",
            SettingKey::RfBandwidth => "lpfBW",
            SettingKey::FirEnable => "lpfFIREnable",
            SettingKey::FirBandwidth => "lpfFIRBW",
            SettingKey::FirLog2 => "lpfFIRlog2",
            SettingKey::FirGain => "lpfFIRGain",
            SettingKey::LoPpmTenths => "LOppmTenths",
            SettingKey::Antenna => "antennaPath",
            SettingKey::GainMode => "gainMode",
            SettingKey::Gain => "gain",
            SettingKey::Attenuation => "att",
            SettingKey::HwBbDcBlock => "hwBBDCBlock",
            SettingKey::HwRfDcBlock => "hwRFDCBlock",
            SettingKey::HwIqCorrection => "hwIQCorrection",
            SettingKey::TransverterMode => "transverterMode",
            SettingKey::TransverterDelta => "transverterDeltaFrequency",
            SettingKey::ExtClock => "extClock",
            SettingKey::ExtClockFreq => "extClockFreq",
            SettingKey::NcoEnable => "ncoEnable",
            SettingKey::NcoFrequency => "ncoFrequency",
        }
    }

    /// Keys that change the analog chain of both sides.
    pub fn is_shared(self) -> bool {
        matches!(
            self,
            SettingKey::DevSampleRate
                | SettingKey::FirEnable
                | SettingKey::FirBandwidth
                | SettingKey::FirLog2
                | SettingKey::FirGain
                | SettingKey::LoPpmTenths
                | SettingKey::ExtClock
                | SettingKey::ExtClockFreq
        )
    }

    /// Keys that move the LO written to hardware.
    pub fn moves_lo(self) -> bool {
        matches!(
            self,
            SettingKey::CenterFrequency
                | SettingKey::TransverterMode
                | SettingKey::TransverterDelta
                | SettingKey::Placement
                | SettingKey::Log2Factor
                | SettingKey::DevSampleRate
                | SettingKey::NcoEnable
                | SettingKey::NcoFrequency
        )
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SettingKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown setting '{}'", s))
    }
}

/// Per-side configuration snapshot of a logical device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Wanted centre frequency at the antenna (Hz)
    pub center_frequency: u64,
    /// Converter sample rate (Hz). Host rate is this >> `log2_factor`.
    pub dev_sample_rate: u32,
    /// Host-side decimation (Rx) or interpolation (Tx), log2
    pub log2_factor: u32,
    pub placement: Placement,
    /// Analog filter bandwidth (Hz)
    pub rf_bandwidth: u32,
    pub fir_enable: bool,
    pub fir_bandwidth: u32,
    pub fir_log2: u32,
    pub fir_gain_db: i32,
    /// Reference correction, tenths of ppm
    pub lo_ppm_tenths: i32,
    pub antenna: String,
    /// Rx only
    pub gain_mode: GainMode,
    /// Rx gain (dB)
    pub gain_db: i32,
    /// Tx attenuation (millidB)
    pub attenuation_mdb: u32,
    /// Rx only
    pub hw_bb_dc_block: bool,
    /// Rx only
    pub hw_rf_dc_block: bool,
    /// Rx only
    pub hw_iq_correction: bool,
    pub transverter_mode: bool,
    /// Transverter LO offset (Hz), subtracted from the centre frequency
    pub transverter_delta: i64,
    /// Reference from the external clock input instead of the TCXO. Shared.
    pub ext_clock: bool,
    /// External reference frequency (Hz)
    pub ext_clock_freq: u32,
    /// On-chip NCO between the LO and the converters
    pub nco_enable: bool,
    /// NCO shift (Hz); the LO sits this far below the centre frequency
    pub nco_frequency: i32,
}

impl DeviceSettings {
    pub fn new(side: Side) -> Self {
        Self {
            center_frequency: 435_000_000,
            dev_sample_rate: 2_500_000,
            log2_factor: 0,
            placement: Placement::Center,
            rf_bandwidth: 1_500_000,
            fir_enable: false,
            fir_bandwidth: 500_000,
            fir_log2: 0,
            fir_gain_db: 0,
            lo_ppm_tenths: 0,
            antenna: match side {
                Side::Rx => "A_BALANCED".to_string(),
                Side::Tx => "A".to_string(),
            },
            gain_mode: GainMode::Manual,
            gain_db: 40,
            attenuation_mdb: 12_500,
            hw_bb_dc_block: true,
            hw_rf_dc_block: true,
            hw_iq_correction: true,
            transverter_mode: false,
            transverter_delta: 0,
            ext_clock: false,
            ext_clock_freq: 10_000_000,
            nco_enable: false,
            nco_frequency: 0,
        }
    }

    pub fn host_sample_rate(&self) -> u32 {
        self.dev_sample_rate >> self.log2_factor.min(MAX_LOG2)
    }

    /// Offset of the wanted signal from the LO imposed by the placement.
    pub fn frequency_shift(&self) -> i64 {
        if self.log2_factor == 0 {
            return 0;
        }
        let quarter = self.dev_sample_rate as i64 / 4;
        match self.placement {
            Placement::Infra => -quarter,
            Placement::Supra => quarter,
            Placement::Center => 0,
        }
    }

    /// Frequency the NCO adds on top of the LO (Hz).
    pub fn nco_shift(&self) -> i64 {
        if self.nco_enable {
            self.nco_frequency as i64
        } else {
            0
        }
    }

    /// LO frequency to program so the wanted signal lands where the
    /// placement expects it.
    pub fn device_center_frequency(&self) -> u64 {
        let mut f = self.center_frequency as i64;
        if self.transverter_mode {
            f -= self.transverter_delta;
        }
        f -= self.nco_shift();
        (f.max(0) - self.frequency_shift()).max(0) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.dev_sample_rate == 0 {
            return Err(SdrError::InvalidSetting {
                key: "devSampleRate",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.log2_factor > MAX_LOG2 {
            return Err(SdrError::InvalidSetting {
                key: "log2Factor",
                reason: format!("{} exceeds {}", self.log2_factor, MAX_LOG2),
            });
        }
        if self.fir_log2 > MAX_FIR_LOG2 {
            return Err(SdrError::InvalidSetting {
                key: "lpfFIRlog2",
                reason: format!("{} exceeds {}", self.fir_log2, MAX_FIR_LOG2),
            });
        }
        if self.ext_clock && !EXT_CLOCK_RANGE.contains(&self.ext_clock_freq) {
            return Err(SdrError::InvalidSetting {
                key: "extClockFreq",
                reason: format!("{} Hz outside {:?}", self.ext_clock_freq, EXT_CLOCK_RANGE),
            });
        }
        if self.nco_enable && self.nco_frequency.unsigned_abs() > self.dev_sample_rate / 2 {
            return Err(SdrError::InvalidSetting {
                key: "ncoFrequency",
                reason: format!("{} Hz beyond half the converter rate", self.nco_frequency),
            });
        }
        if !FIR_GAINS_DB.contains(&self.fir_gain_db) {
            return Err(SdrError::InvalidSetting {
                key: "lpfFIRGain",
                reason: format!("{} dB not one of {:?}", self.fir_gain_db, FIR_GAINS_DB),
            });
        }
        Ok(())
    }

    fn same(&self, other: &DeviceSettings, key: SettingKey) -> bool {
        match key {
            SettingKey::CenterFrequency => self.center_frequency == other.center_frequency,
            SettingKey::DevSampleRate => self.dev_sample_rate == other.dev_sample_rate,
            SettingKey::Log2Factor => self.log2_factor == other.log2_factor,
            SettingKey::Placement => self.placement == other.placement,
            SettingKey::RfBandwidth => self.rf_bandwidth == other.rf_bandwidth,
            SettingKey::FirEnable => self.fir_enable == other.fir_enable,
            SettingKey::FirBandwidth => self.fir_bandwidth == other.fir_bandwidth,
            SettingKey::FirLog2 => self.fir_log2 == other.fir_log2,
            SettingKey::FirGain => self.fir_gain_db == other.fir_gain_db,
            SettingKey::LoPpmTenths => self.lo_ppm_tenths == other.lo_ppm_tenths,
            SettingKey::Antenna => self.antenna == other.antenna,
            SettingKey::GainMode => self.gain_mode == other.gain_mode,
            SettingKey::Gain => self.gain_db == other.gain_db,
            SettingKey::Attenuation => self.attenuation_mdb == other.attenuation_mdb,
            SettingKey::HwBbDcBlock => self.hw_bb_dc_block == other.hw_bb_dc_block,
            SettingKey::HwRfDcBlock => self.hw_rf_dc_block == other.hw_rf_dc_block,
            SettingKey::HwIqCorrection => self.hw_iq_correction == other.hw_iq_correction,
            SettingKey::TransverterMode => self.transverter_mode == other.transverter_mode,
            SettingKey::TransverterDelta => self.transverter_delta == other.transverter_delta,
            SettingKey::ExtClock => self.ext_clock == other.ext_clock,
            SettingKey::ExtClockFreq => self.ext_clock_freq == other.ext_clock_freq,
            SettingKey::NcoEnable => self.nco_enable == other.nco_enable,
            SettingKey::NcoFrequency => self.nco_frequency == other.nco_frequency,
        }
    }

    /// Keys whose values differ from `other`.
    pub fn diff(&self, other: &DeviceSettings) -> Vec<SettingKey> {
        SettingKey::ALL
            .iter()
            .copied()
            .filter(|&k| !self.same(other, k))
            .collect()
    }

    /// Copy the listed fields from `from`.
    pub fn apply_keys(&mut self, keys: &[SettingKey], from: &DeviceSettings) {
        for &key in keys {
            match key {
                SettingKey::CenterFrequency => self.center_frequency = from.center_frequency,
                SettingKey::DevSampleRate => self.dev_sample_rate = from.dev_sample_rate,
                SettingKey::Log2Factor => self.log2_factor = from.log2_factor,
                SettingKey::Placement => self.placement = from.placement,
                SettingKey::RfBandwidth => self.rf_bandwidth = from.rf_bandwidth,
                SettingKey::FirEnable => self.fir_enable = from.fir_enable,
                SettingKey::FirBandwidth => self.fir_bandwidth = from.fir_bandwidth,
                SettingKey::FirLog2 => self.fir_log2 = from.fir_log2,
                SettingKey::FirGain => self.fir_gain_db = from.fir_gain_db,
                SettingKey::LoPpmTenths => self.lo_ppm_tenths = from.lo_ppm_tenths,
                SettingKey::Antenna => self.antenna = from.antenna.clone(),
                SettingKey::GainMode => self.gain_mode = from.gain_mode,
                SettingKey::Gain => self.gain_db = from.gain_db,
                SettingKey::Attenuation => self.attenuation_mdb = from.attenuation_mdb,
                SettingKey::HwBbDcBlock => self.hw_bb_dc_block = from.hw_bb_dc_block,
                SettingKey::HwRfDcBlock => self.hw_rf_dc_block = from.hw_rf_dc_block,
                SettingKey::HwIqCorrection => self.hw_iq_correction = from.hw_iq_correction,
                SettingKey::TransverterMode => self.transverter_mode = from.transverter_mode,
                SettingKey::TransverterDelta => self.transverter_delta = from.transverter_delta,
                SettingKey::ExtClock => self.ext_clock = from.ext_clock,
                SettingKey::ExtClockFreq => self.ext_clock_freq = from.ext_clock_freq,
                SettingKey::NcoEnable => self.nco_enable = from.nco_enable,
                SettingKey::NcoFrequency => self.nco_frequency = from.nco_frequency,
            }
        }
    }

    pub fn value_string(&self, key: SettingKey) -> String {
        match key {
            SettingKey::CenterFrequency => self.center_frequency.to_string(),
            SettingKey::DevSampleRate => self.dev_sample_rate.to_string(),
            SettingKey::Log2Factor => self.log2_factor.to_string(),
            SettingKey::Placement => self.placement.to_string(),
            SettingKey::RfBandwidth => self.rf_bandwidth.to_string(),
            SettingKey::FirEnable => self.fir_enable.to_string(),
            SettingKey::FirBandwidth => self.fir_bandwidth.to_string(),
            SettingKey::FirLog2 => self.fir_log2.to_string(),
            SettingKey::FirGain => self.fir_gain_db.to_string(),
            SettingKey::LoPpmTenths => self.lo_ppm_tenths.to_string(),
            SettingKey::Antenna => self.antenna.clone(),
            SettingKey::GainMode => self.gain_mode.to_string(),
            SettingKey::Gain => self.gain_db.to_string(),
            SettingKey::Attenuation => self.attenuation_mdb.to_string(),
            SettingKey::HwBbDcBlock => self.hw_bb_dc_block.to_string(),
            SettingKey::HwRfDcBlock => self.hw_rf_dc_block.to_string(),
            SettingKey::HwIqCorrection => self.hw_iq_correction.to_string(),
            SettingKey::TransverterMode => self.transverter_mode.to_string(),
            SettingKey::TransverterDelta => self.transverter_delta.to_string(),
            SettingKey::ExtClock => self.ext_clock.to_string(),
            SettingKey::ExtClockFreq => self.ext_clock_freq.to_string(),
            SettingKey::NcoEnable => self.nco_enable.to_string(),
            SettingKey::NcoFrequency => self.nco_frequency.to_string(),
        }
    }

    /// `key: value` pairs for logging a change.
    pub fn debug_string(&self, keys: &[SettingKey]) -> String {
        keys.iter()
            .map(|&k| format!("{}: {}", k, self.value_string(k)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The part of the settings owned by the physical radio rather than a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedSettings {
    pub dev_sample_rate: u32,
    pub fir_enable: bool,
    pub fir_bandwidth: u32,
    pub fir_log2: u32,
    pub fir_gain_db: i32,
    pub lo_ppm_tenths: i32,
    pub ext_clock: bool,
    pub ext_clock_freq: u32,
}

impl SharedSettings {
    pub const KEYS: [SettingKey; 8] = [
        SettingKey::DevSampleRate,
        SettingKey::FirEnable,
        SettingKey::FirBandwidth,
        SettingKey::FirLog2,
        SettingKey::FirGain,
        SettingKey::LoPpmTenths,
        SettingKey::ExtClock,
        SettingKey::ExtClockFreq,
    ];

    pub fn from_settings(s: &DeviceSettings) -> Self {
        Self {
            dev_sample_rate: s.dev_sample_rate,
            fir_enable: s.fir_enable,
            fir_bandwidth: s.fir_bandwidth,
            fir_log2: s.fir_log2,
            fir_gain_db: s.fir_gain_db,
            lo_ppm_tenths: s.lo_ppm_tenths,
            ext_clock: s.ext_clock,
            ext_clock_freq: s.ext_clock_freq,
        }
    }

    /// Overwrite the shared fields of `settings`. Absolute values, so applying
    /// the same state twice is harmless.
    pub fn fold_into(&self, settings: &mut DeviceSettings) {
        settings.dev_sample_rate = self.dev_sample_rate;
        settings.fir_enable = self.fir_enable;
        settings.fir_bandwidth = self.fir_bandwidth;
        settings.fir_log2 = self.fir_log2;
        settings.fir_gain_db = self.fir_gain_db;
        settings.lo_ppm_tenths = self.lo_ppm_tenths;
        settings.ext_clock = self.ext_clock;
        settings.ext_clock_freq = self.ext_clock_freq;
    }
}

/// Sent to the sibling after a shared change so its settings stay in step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossNotification {
    pub from: Side,
    pub shared: SharedSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_round_trip() {
        for key in SettingKey::ALL {
            assert_eq!(key.name().parse::<SettingKey>(), Ok(key));
        }
        assert!("bogus".parse::<SettingKey>().is_err());
    }

    #[test]
    fn test_diff_and_apply_keys() {
        let a = DeviceSettings::new(Side::Rx);
        let mut b = a.clone();
        b.dev_sample_rate = 3_072_000;
        b.gain_db = 20;
        b.placement = Placement::Infra;
        let keys = a.diff(&b);
        assert_eq!(
            keys,
            vec![SettingKey::DevSampleRate, SettingKey::Placement, SettingKey::Gain]
        );

        let mut c = a.clone();
        c.apply_keys(&[SettingKey::Gain], &b);
        assert_eq!(c.gain_db, 20);
        assert_eq!(c.dev_sample_rate, a.dev_sample_rate);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn test_device_center_frequency_placement() {
        let mut s = DeviceSettings::new(Side::Rx);
        s.center_frequency = 100_000_000;
        s.dev_sample_rate = 4_000_000;
        s.log2_factor = 2;

        s.placement = Placement::Center;
        assert_eq!(s.device_center_frequency(), 100_000_000);
        s.placement = Placement::Infra;
        assert_eq!(s.device_center_frequency(), 101_000_000);
        s.placement = Placement::Supra;
        assert_eq!(s.device_center_frequency(), 99_000_000);

        // No host-side rate change: placement has no effect.
        s.log2_factor = 0;
        assert_eq!(s.device_center_frequency(), 100_000_000);
        assert_eq!(s.host_sample_rate(), 4_000_000);
    }

    #[test]
    fn test_device_center_frequency_transverter() {
        let mut s = DeviceSettings::new(Side::Tx);
        s.center_frequency = 10_368_000_000;
        s.transverter_mode = true;
        s.transverter_delta = 9_936_000_000;
        assert_eq!(s.device_center_frequency(), 432_000_000);

        s.transverter_delta = 20_000_000_000;
        assert_eq!(s.device_center_frequency(), 0);
    }

    #[test]
    fn test_nco_moves_lo_below_centre() {
        let mut s = DeviceSettings::new(Side::Rx);
        s.center_frequency = 100_000_000;
        s.nco_frequency = 250_000;
        assert_eq!(s.device_center_frequency(), 100_000_000);

        s.nco_enable = true;
        assert_eq!(s.device_center_frequency(), 99_750_000);
        s.nco_frequency = -250_000;
        assert_eq!(s.device_center_frequency(), 100_250_000);

        // Placement offset stacks on top of the NCO
        s.dev_sample_rate = 4_000_000;
        s.log2_factor = 1;
        s.placement = Placement::Infra;
        assert_eq!(s.device_center_frequency(), 101_250_000);
    }

    #[test]
    fn test_validate() {
        let mut s = DeviceSettings::new(Side::Rx);
        assert!(s.validate().is_ok());
        s.log2_factor = 7;
        assert!(s.validate().is_err());
        s.log2_factor = 6;
        s.fir_gain_db = 3;
        assert!(s.validate().is_err());
        s.fir_gain_db = 0;

        s.ext_clock = true;
        s.ext_clock_freq = 5_000_000;
        assert!(s.validate().is_err());
        s.ext_clock_freq = 40_000_000;
        assert!(s.validate().is_ok());

        s.nco_enable = true;
        s.nco_frequency = -1_300_000;
        assert!(s.validate().is_err(), "NCO beyond half of 2.5 MS/s accepted");
        s.nco_frequency = 1_000_000;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_shared_fold_is_idempotent() {
        let mut src = DeviceSettings::new(Side::Rx);
        src.dev_sample_rate = 1_920_000;
        src.fir_enable = true;
        src.lo_ppm_tenths = -15;
        let shared = SharedSettings::from_settings(&src);

        let mut dst = DeviceSettings::new(Side::Tx);
        shared.fold_into(&mut dst);
        let once = dst.clone();
        shared.fold_into(&mut dst);
        assert_eq!(dst, once);
        assert_eq!(dst.dev_sample_rate, 1_920_000);
        assert_eq!(dst.antenna, "A");
    }

    #[test]
    fn test_debug_string() {
        let s = DeviceSettings::new(Side::Rx);
        assert_eq!(
            s.debug_string(&[SettingKey::DevSampleRate, SettingKey::FirEnable]),
            "devSampleRate: 2500000 lpfFIREnable: false"
        );
    }
}
