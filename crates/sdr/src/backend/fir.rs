// Copyright 2025-2026 CEMAXECUTER LLC

//! On-chip FIR coefficient design for AD936x-style `filter_fir_config` text.

use tl_dsp::window;

use crate::attr::{self, FirSpec};
use crate::error::{Result, SdrError};

/// Most taps the on-chip FIR accepts.
pub const MAX_TAPS: usize = 128;

/// Turns a [`FirSpec`] into the hardware's filter configuration text.
pub trait FirDesigner: Send + Sync {
    fn design(&self, spec: &FirSpec) -> Result<String>;
}

/// Kaiser-windowed sinc design, same taps for Rx decimation and Tx
/// interpolation.
#[derive(Debug, Clone, Copy)]
pub struct KaiserFirDesigner {
    pub beta: f64,
}

impl Default for KaiserFirDesigner {
    fn default() -> Self {
        Self { beta: 6.0 }
    }
}

impl KaiserFirDesigner {
    /// Quantized taps for `spec`, scaled so the DC gain is unity in Q15.
    pub fn taps(&self, spec: &FirSpec) -> Result<Vec<i16>> {
        if spec.sample_rate == 0 {
            return Err(SdrError::attribute(attr::FIR_CONFIG, "zero sample rate"));
        }
        let factor = 1usize << spec.log2;
        let n = (32 * factor).min(MAX_TAPS);
        let fir_rate = spec.sample_rate as f64 * factor as f64;
        let cutoff = (spec.bandwidth as f64 / 2.0 / fir_rate).clamp(0.01, 0.49);

        Ok(window::lowpass(n, cutoff, self.beta)
            .iter()
            .map(|v| (v * 32767.0).round().clamp(-32768.0, 32767.0) as i16)
            .collect())
    }
}

impl FirDesigner for KaiserFirDesigner {
    fn design(&self, spec: &FirSpec) -> Result<String> {
        let taps = self.taps(spec)?;
        let factor = 1u32 << spec.log2;
        let mut text = format!(
            "RX 3 GAIN {} DEC {}\nTX 3 GAIN {} INT {}\n",
            spec.gain_db, factor, spec.gain_db, factor
        );
        for t in &taps {
            text.push_str(&format!("{},{}\n", t, t));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(log2: u32) -> FirSpec {
        FirSpec {
            bandwidth: 500_000,
            log2,
            gain_db: -6,
            sample_rate: 2_500_000,
        }
    }

    #[test]
    fn test_tap_count_follows_factor() {
        let d = KaiserFirDesigner::default();
        assert_eq!(d.taps(&spec(0)).unwrap().len(), 32);
        assert_eq!(d.taps(&spec(1)).unwrap().len(), 64);
        assert_eq!(d.taps(&spec(2)).unwrap().len(), 128);
    }

    #[test]
    fn test_taps_unity_dc() {
        let taps = KaiserFirDesigner::default().taps(&spec(1)).unwrap();
        let sum: i32 = taps.iter().map(|&t| t as i32).sum();
        assert!((sum - 32767).abs() < 40, "sum {}", sum);
    }

    #[test]
    fn test_config_text() {
        let text = KaiserFirDesigner::default().design(&spec(2)).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("RX 3 GAIN -6 DEC 4"));
        assert_eq!(lines.next(), Some("TX 3 GAIN -6 INT 4"));
        assert_eq!(lines.count(), 128);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut s = spec(0);
        s.sample_rate = 0;
        assert!(KaiserFirDesigner::default().design(&s).is_err());
    }
}
