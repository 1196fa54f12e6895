use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::window;

/// Strongest spectral component of a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// FFT bin, 0..size
    pub bin: usize,
    /// Frequency in cycles per sample, in [-0.5, 0.5)
    pub frequency: f64,
    /// Power relative to a full-scale complex tone, in dB
    pub power_db: f32,
}

impl Peak {
    /// Offset from the centre frequency in Hz for a given sample rate.
    pub fn offset_hz(&self, sample_rate: u32) -> f64 {
        self.frequency * sample_rate as f64
    }
}

/// Windowed forward FFT over interleaved int16 I/Q, reporting the peak bin.
pub struct ToneMeter {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    window: Vec<f32>,
    window_gain: f32,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl ToneMeter {
    /// `size` complex samples per measurement.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();
        let window: Vec<f32> = window::kaiser(size, 6.0).into_iter().map(|w| w as f32).collect();
        let window_gain = window.iter().sum::<f32>();
        Self {
            fft,
            size,
            window,
            window_gain,
            buffer: vec![Complex32::new(0.0, 0.0); size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Measure the first `size` complex samples of `samples`. Returns `None`
    /// when fewer are available.
    pub fn peak(&mut self, samples: &[i16]) -> Option<Peak> {
        if samples.len() < self.size * 2 {
            return None;
        }
        for (i, (slot, iq)) in self.buffer.iter_mut().zip(samples.chunks_exact(2)).enumerate() {
            let w = self.window[i] / 32768.0;
            *slot = Complex32::new(iq[0] as f32 * w, iq[1] as f32 * w);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let (bin, mag) = self
            .buffer
            .iter()
            .map(|v| v.norm())
            .enumerate()
            .fold((0, 0.0f32), |best, (i, m)| if m > best.1 { (i, m) } else { best });

        let signed = if bin >= self.size / 2 {
            bin as f64 - self.size as f64
        } else {
            bin as f64
        };
        let rel = (mag / self.window_gain).max(1e-10);
        Some(Peak {
            bin,
            frequency: signed / self.size as f64,
            power_db: 20.0 * rel.log10(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, bin: f64, size: usize, amplitude: f32) -> Vec<i16> {
        let mut out = Vec::with_capacity(n * 2);
        for i in 0..n {
            let ph = 2.0 * std::f64::consts::PI * bin * i as f64 / size as f64;
            out.push((amplitude * ph.cos() as f32) as i16);
            out.push((amplitude * ph.sin() as f32) as i16);
        }
        out
    }

    #[test]
    fn test_peak_positive_tone() {
        let size = 256;
        let mut meter = ToneMeter::new(size);
        let peak = meter.peak(&tone(size, 20.0, size, 16000.0)).expect("no peak");
        assert_eq!(peak.bin, 20);
        assert!((peak.frequency - 20.0 / 256.0).abs() < 1e-9);
        // Half scale is about -6 dB.
        assert!((peak.power_db + 6.0).abs() < 0.5, "unexpected power {}", peak.power_db);
    }

    #[test]
    fn test_peak_negative_tone() {
        let size = 512;
        let mut meter = ToneMeter::new(size);
        let peak = meter.peak(&tone(size, -64.0, size, 30000.0)).expect("no peak");
        assert_eq!(peak.bin, 512 - 64);
        assert!((peak.offset_hz(512_000) + 64_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_block() {
        let mut meter = ToneMeter::new(64);
        assert!(meter.peak(&[0i16; 100]).is_none());
    }
}
