use std::f64::consts::PI;

/// Modified Bessel function of the first kind, order 0 (for Kaiser window)
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let x_sq_over_4 = x * x / 4.0;
    for k in 1..=30 {
        term *= x_sq_over_4 / (k * k) as f64;
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

/// Generate Kaiser window coefficients
///
/// - `n`: window length
/// - `beta`: shape parameter (higher = narrower mainlobe, lower sidelobes)
pub fn kaiser(n: usize, beta: f64) -> Vec<f64> {
    let mut w = Vec::with_capacity(n);
    let n_f = n as f64;
    let denom = bessel_i0(beta);

    for i in 0..n {
        let x = 2.0 * i as f64 / (n_f - 1.0) - 1.0;
        let arg = beta * (1.0 - x * x).max(0.0).sqrt();
        w.push(bessel_i0(arg) / denom);
    }
    w
}

/// Half-band low-pass prototype: Kaiser-windowed sinc with cutoff fs/4.
///
/// `taps` must be odd. Every even offset from the centre is exactly zero and
/// the centre tap is 0.5.
pub fn halfband_prototype(taps: usize, beta: f64) -> Vec<f64> {
    assert!(taps % 2 == 1, "half-band length must be odd, got {}", taps);
    let win = kaiser(taps, beta);
    let mid = (taps / 2) as i64;
    (0..taps)
        .map(|i| {
            let n = i as i64 - mid;
            if n == 0 {
                0.5
            } else if n % 2 == 0 {
                0.0
            } else {
                let x = PI * n as f64 / 2.0;
                x.sin() / (PI * n as f64) * win[i]
            }
        })
        .collect()
}

/// Quantize the non-zero outer taps of a half-band prototype to fixed point.
///
/// Returns the taps left of the centre at odd offsets, outermost first. The
/// innermost tap absorbs the rounding error so DC gain is exactly unity.
pub fn quantize_halfband(prototype: &[f64], shift: u32) -> Vec<i64> {
    let mid = prototype.len() / 2;
    let scale = (1u64 << shift) as f64;
    let mut q: Vec<i64> = (0..mid)
        .step_by(2)
        .map(|i| (prototype[i] * scale).round() as i64)
        .collect();
    let target = 1i64 << (shift - 2);
    let sum: i64 = q.iter().sum();
    if let Some(inner) = q.last_mut() {
        *inner += target - sum;
    }
    q
}

/// Kaiser-windowed sinc low-pass.
///
/// `cutoff` is the -6 dB point as a fraction of the sample rate (0..0.5).
/// Taps are normalized to unity DC gain.
pub fn lowpass(taps: usize, cutoff: f64, beta: f64) -> Vec<f64> {
    let win = kaiser(taps, beta);
    let mid = (taps as f64 - 1.0) / 2.0;
    let mut h: Vec<f64> = (0..taps)
        .map(|i| {
            let t = i as f64 - mid;
            let sinc = if t.abs() < 1e-12 {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * t).sin() / (PI * t)
            };
            sinc * win[i]
        })
        .collect();
    let sum: f64 = h.iter().sum();
    if sum != 0.0 {
        h.iter_mut().for_each(|v| *v /= sum);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaiser_window() {
        let w = kaiser(64, 7.0);
        assert_eq!(w.len(), 64);
        // Should be symmetric
        for i in 0..32 {
            assert!(
                (w[i] - w[63 - i]).abs() < 1e-10,
                "asymmetry at index {}: {} != {}",
                i,
                w[i],
                w[63 - i]
            );
        }
        // Peak at center
        assert!(w[31] > 0.99);
        // Edges should be small
        assert!(w[0] < 0.1);
    }

    #[test]
    fn test_halfband_prototype_shape() {
        let h = halfband_prototype(63, 8.0);
        assert_eq!(h.len(), 63);
        assert_eq!(h[31], 0.5);
        for i in 0..31 {
            assert!(
                (h[i] - h[62 - i]).abs() < 1e-12,
                "asymmetry at {}: {} != {}",
                i,
                h[i],
                h[62 - i]
            );
            if (31 - i) % 2 == 0 {
                assert_eq!(h[i], 0.0, "even offset {} not zero", 31 - i);
            }
        }
    }

    #[test]
    fn test_quantized_halfband_matches_table() {
        let q = quantize_halfband(&halfband_prototype(63, 8.0), crate::halfband::HB_SHIFT);
        assert_eq!(q.as_slice(), &crate::halfband::HB_COEFFS[..]);
    }

    #[test]
    fn test_lowpass_unity_dc() {
        let h = lowpass(64, 0.1, 6.0);
        assert_eq!(h.len(), 64);
        let sum: f64 = h.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((h[10] - h[53]).abs() < 1e-12);
        // Tone at 0.4 fs is well into the stopband
        let (mut re, mut im) = (0.0, 0.0);
        for (n, v) in h.iter().enumerate() {
            let w = 2.0 * PI * 0.4 * n as f64;
            re += v * w.cos();
            im += v * w.sin();
        }
        assert!((re * re + im * im).sqrt() < 2e-3);
    }
}
