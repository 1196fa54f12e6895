use std::fmt;
use std::str::FromStr;

use num_complex::Complex;

use crate::halfband::{Acc, HalfbandDecimator, HalfbandInterpolator, Rotation};

/// Largest supported log2 rate change (64x).
pub const MAX_LOG2: u32 = 6;

/// Extra fractional bits carried through the cascade.
pub const GUARD_BITS: u32 = 8;

/// Native sample width of the pipeline.
pub const PIPELINE_BITS: u32 = 16;

/// Where the wanted signal sits relative to the folding frequency of the
/// stage running at the hardware rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Lower half of the hardware band, centred on -fs/4.
    Infra,
    /// Upper half, centred on +fs/4.
    Supra,
    /// Straddles DC.
    #[default]
    Center,
}

impl Placement {
    pub const ALL: [Placement; 3] = [Placement::Infra, Placement::Supra, Placement::Center];

    /// Compact encoding for atomics.
    pub fn as_u8(self) -> u8 {
        match self {
            Placement::Infra => 0,
            Placement::Supra => 1,
            Placement::Center => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Placement::Infra,
            1 => Placement::Supra,
            _ => Placement::Center,
        }
    }

    fn decimation_rotation(self) -> Rotation {
        match self {
            Placement::Infra => Rotation::Up,
            Placement::Supra => Rotation::Down,
            Placement::Center => Rotation::None,
        }
    }

    fn interpolation_rotation(self) -> Rotation {
        match self {
            Placement::Infra => Rotation::Down,
            Placement::Supra => Rotation::Up,
            Placement::Center => Rotation::None,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Placement::Infra => "infra",
            Placement::Supra => "supra",
            Placement::Center => "center",
        })
    }
}

impl FromStr for Placement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infra" | "inf" | "0" => Ok(Placement::Infra),
            "supra" | "sup" | "1" => Ok(Placement::Supra),
            "center" | "cen" | "2" => Ok(Placement::Center),
            other => Err(format!("unknown placement '{}' (use infra, supra or center)", other)),
        }
    }
}

/// Direction of a rate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Decimate,
    Interpolate,
}

#[inline]
fn requantize(v: i64) -> i16 {
    let r = (v + (1 << (GUARD_BITS - 1))) >> GUARD_BITS;
    r.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

#[inline]
fn saturate(v: i64) -> i16 {
    v.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// Receive-side cascade: hardware-rate samples in, host-rate samples out.
pub struct Decimator {
    pre_shift: u32,
    log2: u32,
    placement: Placement,
    stages: Vec<HalfbandDecimator>,
}

impl Decimator {
    /// `input_bits`: significant bits of the raw hardware samples (1..=16).
    pub fn new(input_bits: u32) -> Self {
        assert!(
            (1..=PIPELINE_BITS).contains(&input_bits),
            "input width {} out of range",
            input_bits
        );
        Self {
            pre_shift: PIPELINE_BITS - input_bits,
            log2: 0,
            placement: Placement::Center,
            stages: Vec::new(),
        }
    }

    pub fn log2(&self) -> u32 {
        self.log2
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Select factor and placement. Stages are rebuilt from a clean state
    /// only when either changes.
    pub fn configure(&mut self, log2: u32, placement: Placement) {
        let log2 = log2.min(MAX_LOG2);
        if log2 == self.log2 && placement == self.placement && self.stages.len() == log2 as usize {
            return;
        }
        self.log2 = log2;
        self.placement = placement;
        self.stages = (0..log2)
            .map(|i| {
                let rotation = if i == 0 { placement.decimation_rotation() } else { Rotation::None };
                HalfbandDecimator::new(rotation)
            })
            .collect();
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    /// Convert one block of interleaved I/Q. `out` is cleared first.
    pub fn process(&mut self, log2: u32, placement: Placement, input: &[i16], out: &mut Vec<i16>) {
        self.configure(log2, placement);
        out.clear();

        if self.stages.is_empty() {
            out.extend(input.iter().map(|&s| saturate((s as i64) << self.pre_shift)));
            return;
        }

        out.reserve(input.len() >> self.log2);
        let shift = self.pre_shift + GUARD_BITS;
        'samples: for iq in input.chunks_exact(2) {
            let mut v: Acc = Complex::new((iq[0] as i64) << shift, (iq[1] as i64) << shift);
            for stage in &mut self.stages {
                match stage.push(v) {
                    Some(next) => v = next,
                    None => continue 'samples,
                }
            }
            out.push(requantize(v.re));
            out.push(requantize(v.im));
        }
    }
}

/// Transmit-side cascade: host-rate samples in, hardware-rate samples out.
pub struct Interpolator {
    post_shift: u32,
    log2: u32,
    placement: Placement,
    stages: Vec<HalfbandInterpolator>,
    scratch: Vec<Acc>,
    next: Vec<Acc>,
}

impl Interpolator {
    /// `output_bits`: significant bits expected by the hardware (1..=16).
    pub fn new(output_bits: u32) -> Self {
        assert!(
            (1..=PIPELINE_BITS).contains(&output_bits),
            "output width {} out of range",
            output_bits
        );
        Self {
            post_shift: PIPELINE_BITS - output_bits,
            log2: 0,
            placement: Placement::Center,
            stages: Vec::new(),
            scratch: Vec::new(),
            next: Vec::new(),
        }
    }

    pub fn log2(&self) -> u32 {
        self.log2
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn configure(&mut self, log2: u32, placement: Placement) {
        let log2 = log2.min(MAX_LOG2);
        if log2 == self.log2 && placement == self.placement && self.stages.len() == log2 as usize {
            return;
        }
        self.log2 = log2;
        self.placement = placement;
        // The last stage runs at the hardware rate.
        self.stages = (0..log2)
            .map(|i| {
                let rotation = if i + 1 == log2 {
                    placement.interpolation_rotation()
                } else {
                    Rotation::None
                };
                HalfbandInterpolator::new(rotation)
            })
            .collect();
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    /// Convert one block of interleaved I/Q. `out` is cleared first and
    /// receives `input.len() << log2` values.
    pub fn process(&mut self, log2: u32, placement: Placement, input: &[i16], out: &mut Vec<i16>) {
        self.configure(log2, placement);
        out.clear();

        if self.stages.is_empty() {
            out.extend(input.iter().map(|&s| s >> self.post_shift));
            return;
        }

        self.scratch.clear();
        self.scratch.extend(
            input
                .chunks_exact(2)
                .map(|iq| Complex::new((iq[0] as i64) << GUARD_BITS, (iq[1] as i64) << GUARD_BITS)),
        );

        for stage in &mut self.stages {
            self.next.clear();
            self.next.reserve(self.scratch.len() * 2);
            for &v in &self.scratch {
                self.next.extend_from_slice(&stage.push(v));
            }
            std::mem::swap(&mut self.scratch, &mut self.next);
        }

        out.reserve(self.scratch.len() * 2);
        for v in &self.scratch {
            out.push(requantize(v.re) >> self.post_shift);
            out.push(requantize(v.im) >> self.post_shift);
        }
    }
}

/// One-shot conversion of interleaved 16-bit I/Q with a fresh engine.
pub fn convert(samples: &[i16], log2: u32, placement: Placement, conversion: Conversion) -> Vec<i16> {
    let mut out = Vec::new();
    match conversion {
        Conversion::Decimate => {
            Decimator::new(PIPELINE_BITS).process(log2, placement, samples, &mut out)
        }
        Conversion::Interpolate => {
            Interpolator::new(PIPELINE_BITS).process(log2, placement, samples, &mut out)
        }
    }
    out
}
