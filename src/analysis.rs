//! Post-hoc analysis of a finished log

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    convert::CalibrationModel,
    error::{Error, Result},
    filter::{FilterSpec, LowPassFilter},
    metrics::{self, Deflection, Metrics, MetricsExtractor},
    pipeline::{condition, OutputStage},
    rate::RateEstimator,
    sample::SampleBuffer,
    DEFAULT_ANALYSIS_CUTOFF_HZ, DEFAULT_FILTER_ORDER, DEFAULT_MIN_FILTER_POINTS,
    DEFAULT_MIN_RATE_SAMPLES, DEFAULT_RAW_SCALE,
};

#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub filter_order: usize,
    pub cutoff_hz: f64,
    pub min_filter_points: usize,
    pub min_rate_samples: usize,
    pub raw_scale: f64,
    pub stage: OutputStage,
    pub extractor: MetricsExtractor,
    /// Time window (s) before the load is applied
    pub baseline: Option<(f64, f64)>,
    /// Time window (s) while the load is applied
    pub plateau: Option<(f64, f64)>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            filter_order: DEFAULT_FILTER_ORDER,
            cutoff_hz: DEFAULT_ANALYSIS_CUTOFF_HZ,
            min_filter_points: DEFAULT_MIN_FILTER_POINTS,
            min_rate_samples: DEFAULT_MIN_RATE_SAMPLES,
            raw_scale: DEFAULT_RAW_SCALE,
            stage: OutputStage::Thrust,
            extractor: MetricsExtractor::default(),
            baseline: None,
            plateau: None,
        }
    }
}

/// Whole-signal statistics
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalStats {
    pub mean: f64,
    pub std: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

impl SignalStats {
    fn of(signal: &[f64]) -> Option<Self> {
        let (mean, std) = metrics::mean_std(signal)?;
        Some(Self {
            mean,
            std,
            variance: std * std,
            min: signal.iter().copied().reduce(f64::min)?,
            max: signal.iter().copied().reduce(f64::max)?,
        })
    }
}

/// Static deflection reading, in µm and converted to thrust
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StaticDeflection {
    pub displacement: Deflection,
    pub thrust_mn: f64,
    pub thrust_std_mn: f64,
}

#[derive(Clone, Debug)]
pub struct AnalysisReport {
    pub generated: DateTime<Utc>,
    pub samples: usize,
    pub duration: f64,
    pub sampling_hz: f64,
    pub stage: OutputStage,
    pub metrics: Metrics,
    pub stats: SignalStats,
    pub deflection: Option<StaticDeflection>,
}

fn static_deflection(
    times: &[f64],
    displacement: &[f64],
    baseline: (f64, f64),
    plateau: (f64, f64),
    calibration: &CalibrationModel,
) -> Option<StaticDeflection> {
    let a = metrics::time_window(times, baseline.0, baseline.1);
    let b = metrics::time_window(times, plateau.0, plateau.1);
    let displacement = metrics::displacement_delta(displacement, a, b)?;
    Some(StaticDeflection {
        thrust_mn: calibration.to_thrust(displacement.delta),
        thrust_std_mn: calibration.to_thrust(displacement.combined_std),
        displacement,
    })
}

/// Filter, convert and summarize a complete recording
pub fn analyze(
    buffer: &SampleBuffer,
    calibration: &CalibrationModel,
    config: &AnalysisConfig,
) -> Result<AnalysisReport> {
    let sampling_hz = RateEstimator::new(config.min_rate_samples).estimate(buffer)?;
    let spec = FilterSpec::new(config.filter_order, config.cutoff_hz, sampling_hz)?;
    let filter = LowPassFilter::design(spec).with_min_points(config.min_filter_points);

    let displacement = condition(
        buffer,
        config.raw_scale,
        &filter,
        OutputStage::Displacement,
        calibration,
    );
    let signal = match config.stage {
        OutputStage::Displacement => displacement.clone(),
        OutputStage::Thrust => calibration.to_thrust_series(&displacement),
    };
    let not_enough = || Error::InsufficientData {
        required: 1,
        available: signal.len(),
    };
    let metrics = config
        .extractor
        .extract(&signal, sampling_hz)
        .ok_or_else(not_enough)?;
    let stats = SignalStats::of(&signal).ok_or_else(not_enough)?;

    let deflection = match (config.baseline, config.plateau) {
        (Some(baseline), Some(plateau)) => {
            let reading = static_deflection(
                &buffer.times(),
                &displacement,
                baseline,
                plateau,
                calibration,
            );
            if reading.is_none() {
                warn!(?baseline, ?plateau, "Deflection windows hold no samples");
            }
            reading
        }
        (None, None) => None,
        _ => {
            warn!("Deflection needs both a baseline and a plateau window");
            None
        }
    };

    let duration = match (buffer.first(), buffer.last()) {
        (Some(f), Some(l)) => l.time - f.time,
        _ => 0.0,
    };
    info!(samples = buffer.len(), sampling_hz, "Analysis complete");
    Ok(AnalysisReport {
        generated: Utc::now(),
        samples: buffer.len(),
        duration,
        sampling_hz,
        stage: config.stage,
        metrics,
        stats,
        deflection,
    })
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.stage.unit();
        writeln!(f, "Report generated {}", self.generated.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(
            f,
            "{} samples over {:.2} s ({:.2} Hz)",
            self.samples, self.duration, self.sampling_hz
        )?;
        let m = &self.metrics;
        writeln!(f, "Bias:              {:.4} {unit}", m.bias)?;
        writeln!(f, "Nominal:           {:.4} {unit}", m.nominal_thrust)?;
        writeln!(f, "Peak:              {:.4} {unit}", m.peak_value)?;
        writeln!(
            f,
            "Steady state:      {:.4} ± {:.6} {unit}",
            m.steady_state_mean, m.steady_state_std
        )?;
        writeln!(f, "Natural frequency: {:.5} Hz", m.natural_frequency)?;
        let s = &self.stats;
        writeln!(
            f,
            "Signal:            mean {:.4}, std {:.4}, var {:.6}, min {:.4}, max {:.4} {unit}",
            s.mean, s.std, s.variance, s.min, s.max
        )?;
        if let Some(d) = &self.deflection {
            writeln!(
                f,
                "Deflection:        {:.5} ± {:.5} µm ({:.5} ± {:.5} mN)",
                d.displacement.delta, d.displacement.combined_std, d.thrust_mn, d.thrust_std_mn
            )?;
        }
        Ok(())
    }
}
