//! Scalar summaries of a thrust or displacement signal

use std::ops::Range;

use rustfft::{num_complex::Complex64, FftPlanner};

use crate::{DEFAULT_BIAS_LEAD, DEFAULT_STEADY_TAIL};

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population mean and standard deviation
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some((m, var.sqrt()))
}

/// Mean of the leading `n_lead` samples, the pre-event baseline. Uses what there is
/// when the signal is shorter, and reads 0 for an empty signal.
pub fn bias(signal: &[f64], n_lead: usize) -> f64 {
    mean(&signal[..n_lead.min(signal.len())]).unwrap_or(0.0)
}

/// Largest excursion above the baseline
pub fn nominal_thrust(signal: &[f64], bias: f64) -> Option<f64> {
    signal.iter().map(|v| v - bias).reduce(f64::max)
}

/// Index and signed value of the largest magnitude sample (first one on ties)
pub fn peak(signal: &[f64]) -> Option<(usize, f64)> {
    signal
        .iter()
        .copied()
        .enumerate()
        .reduce(|best, cur| if cur.1.abs() > best.1.abs() { cur } else { best })
}

/// Mean and standard deviation over the trailing `tail_window` samples
pub fn steady_state_stats(signal: &[f64], tail_window: usize) -> Option<(f64, f64)> {
    mean_std(&signal[signal.len().saturating_sub(tail_window)..])
}

/// Frequency in Hz of the largest bin in the one-sided spectrum of the centered signal.
/// Centering leaves the DC bin near zero so it cannot win on an offset.
pub fn natural_frequency(signal: &[f64], sampling_hz: f64) -> Option<f64> {
    let n = signal.len();
    if n < 2 || !(sampling_hz > 0.0) {
        return None;
    }
    let m = mean(signal)?;
    let mut spectrum: Vec<Complex64> = signal.iter().map(|&v| Complex64::new(v - m, 0.0)).collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut spectrum);
    let (bin, _) = spectrum[..n / 2 + 1]
        .iter()
        .map(|c| c.norm())
        .enumerate()
        .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })?;
    Some(bin as f64 * sampling_hz / n as f64)
}

/// Result of a static deflection reading
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Deflection {
    pub baseline: f64,
    pub plateau: f64,
    /// `|plateau - baseline|`
    pub delta: f64,
    /// `sqrt(std_a² + std_b²)`, independent errors
    pub combined_std: f64,
}

/// Difference between the means of two windows with propagated uncertainty
pub fn displacement_delta(
    signal: &[f64],
    window_a: Range<usize>,
    window_b: Range<usize>,
) -> Option<Deflection> {
    let (mean_a, std_a) = mean_std(signal.get(window_a)?)?;
    let (mean_b, std_b) = mean_std(signal.get(window_b)?)?;
    Some(Deflection {
        baseline: mean_a,
        plateau: mean_b,
        delta: (mean_b - mean_a).abs(),
        combined_std: std_a.hypot(std_b),
    })
}

/// Index range of the samples whose time falls in `[start, end]`. `times` must be sorted.
pub fn time_window(times: &[f64], start: f64, end: f64) -> Range<usize> {
    let lo = times.partition_point(|&t| t < start);
    let hi = times.partition_point(|&t| t <= end);
    lo..hi.max(lo)
}

/// The summary record handed to reporting
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metrics {
    pub bias: f64,
    pub nominal_thrust: f64,
    pub peak_value: f64,
    pub steady_state_mean: f64,
    pub steady_state_std: f64,
    pub natural_frequency: f64,
}

/// Reduces a signal to [`Metrics`]
#[derive(Clone, Copy, Debug)]
pub struct MetricsExtractor {
    pub bias_lead: usize,
    pub steady_tail: usize,
}

impl Default for MetricsExtractor {
    fn default() -> Self {
        Self {
            bias_lead: DEFAULT_BIAS_LEAD,
            steady_tail: DEFAULT_STEADY_TAIL,
        }
    }
}

impl MetricsExtractor {
    /// `None` for an empty signal
    pub fn extract(&self, signal: &[f64], sampling_hz: f64) -> Option<Metrics> {
        let bias = bias(signal, self.bias_lead);
        let (steady_state_mean, steady_state_std) = steady_state_stats(signal, self.steady_tail)?;
        Some(Metrics {
            bias,
            nominal_thrust: nominal_thrust(signal, bias)?,
            peak_value: peak(signal)?.1,
            steady_state_mean,
            steady_state_std,
            natural_frequency: natural_frequency(signal, sampling_hz).unwrap_or(0.0),
        })
    }
}
