//! Zero-phase Butterworth low-pass filtering of finite buffers
//!
//! The filter is designed as cascaded second-order sections (bilinear transform of the
//! analog Butterworth prototype) and run forward then backward over the buffer, so the
//! output has no group delay. Both passes start from the steady state of the edge value
//! and the buffer is extended by odd reflection of `3 * (order + 1)` samples on each
//! side, which keeps the start-up transient small. Values near either end are still
//! less trustworthy than the middle.

use std::f64::consts::PI;

use rustfft::num_complex::Complex64;

use crate::{
    error::{Error, Result},
    DEFAULT_MIN_FILTER_POINTS,
};

/// Validated low-pass design parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterSpec {
    order: usize,
    cutoff_hz: f64,
    sampling_hz: f64,
}

impl FilterSpec {
    /// Rejects (never clamps) a cutoff at or above Nyquist
    pub fn new(order: usize, cutoff_hz: f64, sampling_hz: f64) -> Result<Self> {
        if order == 0 {
            return Err(Error::InvalidFilter("order must be at least 1".to_owned()));
        }
        if !(sampling_hz.is_finite() && sampling_hz > 0.0) {
            return Err(Error::InvalidFilter(format!(
                "sampling frequency {sampling_hz} Hz must be positive"
            )));
        }
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(Error::InvalidFilter(format!(
                "cutoff {cutoff_hz} Hz must be positive"
            )));
        }
        if cutoff_hz >= sampling_hz / 2.0 {
            return Err(Error::InvalidFilter(format!(
                "cutoff {cutoff_hz} Hz is not below Nyquist ({} Hz)",
                sampling_hz / 2.0
            )));
        }
        Ok(Self {
            order,
            cutoff_hz,
            sampling_hz,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn cutoff_hz(&self) -> f64 {
        self.cutoff_hz
    }

    pub fn sampling_hz(&self) -> f64 {
        self.sampling_hz
    }
}

/// Direct form II transposed biquad, `a[0] == 1`
#[derive(Clone, Copy, Debug, PartialEq)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 3],
}

impl Biquad {
    /// Scale the numerator for unit gain at DC
    fn unit_dc(b: [f64; 3], a: [f64; 3]) -> Self {
        let g = a.iter().sum::<f64>() / b.iter().sum::<f64>();
        Self {
            b: b.map(|c| c * g),
            a,
        }
    }

    fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    /// Delay-line state after an infinitely long constant input `x`
    fn steady_state(&self, x: f64) -> [f64; 2] {
        let y = self.dc_gain() * x;
        let z1 = self.b[2] * x - self.a[2] * y;
        let z0 = self.b[1] * x - self.a[1] * y + z1;
        [z0, z1]
    }

    fn run(&self, data: &mut [f64], mut z: [f64; 2]) {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        for x in data.iter_mut() {
            let input = *x;
            let y = b0 * input + z[0];
            z[0] = b1 * input - a1 * y + z[1];
            z[1] = b2 * input - a2 * y;
            *x = y;
        }
    }
}

fn butterworth_sections(spec: &FilterSpec) -> Vec<Biquad> {
    let n = spec.order;
    // Bilinear transform at fs = 2 with the cutoff pre-warped
    let wn = spec.cutoff_hz / (spec.sampling_hz / 2.0);
    let fs2 = 4.0;
    let warped = fs2 * (PI * wn / 2.0).tan();
    let mut sections = Vec::with_capacity((n + 1) / 2);
    for k in 0..n / 2 {
        let theta = PI * (2 * k + n + 1) as f64 / (2 * n) as f64;
        let analog = Complex64::from_polar(warped, theta);
        let pole = (fs2 + analog) / (fs2 - analog);
        sections.push(Biquad::unit_dc(
            [1.0, 2.0, 1.0],
            [1.0, -2.0 * pole.re, pole.norm_sqr()],
        ));
    }
    if n % 2 == 1 {
        let pole = (fs2 - warped) / (fs2 + warped);
        sections.push(Biquad::unit_dc([1.0, 1.0, 0.0], [1.0, -pole, 0.0]));
    }
    sections
}

/// A designed low-pass filter
#[derive(Clone, Debug)]
pub struct LowPassFilter {
    spec: FilterSpec,
    sections: Vec<Biquad>,
    min_points: usize,
}

impl LowPassFilter {
    pub fn design(spec: FilterSpec) -> Self {
        Self {
            sections: butterworth_sections(&spec),
            spec,
            min_points: DEFAULT_MIN_FILTER_POINTS,
        }
    }

    /// Buffers shorter than this are passed through untouched
    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn min_points(&self) -> usize {
        self.min_points
    }

    /// Reflection length used on each side of the buffer
    pub fn padlen(&self) -> usize {
        3 * (self.spec.order + 1)
    }

    fn run(&self, data: &mut [f64]) {
        let Some(&first) = data.first() else {
            return;
        };
        let mut level = first;
        for section in &self.sections {
            section.run(data, section.steady_state(level));
            level *= section.dc_gain();
        }
    }

    /// Filter forward and backward. Output has the same length as `data`.
    ///
    /// Degraded mode: a buffer shorter than [`Self::min_points`] comes back unfiltered,
    /// there is not enough signal for the design to settle and the caller is better
    /// served by raw data than by an error.
    pub fn apply(&self, data: &[f64]) -> Vec<f64> {
        let n = data.len();
        if n < self.min_points || n < 2 {
            return data.to_vec();
        }
        let pad = self.padlen().min(n - 1);
        let (first, last) = (data[0], data[n - 1]);
        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - data[i]));
        ext.extend_from_slice(data);
        ext.extend((1..=pad).map(|i| 2.0 * last - data[n - 1 - i]));

        self.run(&mut ext);
        ext.reverse();
        self.run(&mut ext);
        ext.reverse();

        ext.drain(pad..pad + n).collect()
    }
}
