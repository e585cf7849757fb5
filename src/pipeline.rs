//! The windowed refresh pipeline: snapshot, crop, filter, convert, re-reference.
//!
//! Everything that has to survive from one refresh to the next lives in
//! [`PipelineState`], created once warm-up succeeds. Sample buffers themselves are
//! rebuilt on every refresh and dropped afterwards.

use std::collections::VecDeque;

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::{
    capture::SampleSource,
    convert::CalibrationModel,
    error::{Error, Result},
    filter::{FilterSpec, LowPassFilter},
    metrics,
    rate::RateEstimator,
    sample::SampleBuffer,
    DEFAULT_CUTOFF_HZ, DEFAULT_FAILURE_WARN, DEFAULT_FILTER_ORDER, DEFAULT_HISTORY_THRESHOLD,
    DEFAULT_MIN_FILTER_POINTS, DEFAULT_MIN_RATE_SAMPLES, DEFAULT_RAW_SCALE,
    DEFAULT_ROLLING_WINDOW, DEFAULT_WARMUP_SAMPLES, DEFAULT_WINDOW_SECS,
};

/// Which signal the pipeline reports
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputStage {
    /// Offset displacement in µm
    Displacement,
    /// Offset thrust in mN
    #[default]
    Thrust,
}

impl OutputStage {
    pub fn unit(&self) -> &'static str {
        match self {
            OutputStage::Displacement => "µm",
            OutputStage::Thrust => "mN",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Seconds of data shown per refresh
    pub window_secs: f64,
    /// Leading filtered samples averaged into the warm-up bias
    pub warmup_samples: usize,
    /// Samples required before the first rate estimate
    pub min_rate_samples: usize,
    pub filter_order: usize,
    pub cutoff_hz: f64,
    pub min_filter_points: usize,
    /// Refresh outputs to accumulate before switching to the rolling bias
    pub history_threshold: usize,
    /// Refresh outputs averaged by the rolling bias
    pub rolling_window: usize,
    /// Multiplier from logged units to µm
    pub raw_scale: f64,
    pub stage: OutputStage,
    /// Re-estimate the sampling rate every N refreshes, `None` keeps the first estimate
    pub reestimate_every: Option<u64>,
    pub failure_warn_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            warmup_samples: DEFAULT_WARMUP_SAMPLES,
            min_rate_samples: DEFAULT_MIN_RATE_SAMPLES,
            filter_order: DEFAULT_FILTER_ORDER,
            cutoff_hz: DEFAULT_CUTOFF_HZ,
            min_filter_points: DEFAULT_MIN_FILTER_POINTS,
            history_threshold: DEFAULT_HISTORY_THRESHOLD,
            rolling_window: DEFAULT_ROLLING_WINDOW,
            raw_scale: DEFAULT_RAW_SCALE,
            stage: OutputStage::Thrust,
            reestimate_every: None,
            failure_warn_threshold: DEFAULT_FAILURE_WARN,
        }
    }
}

/// Scale, filter and (optionally) convert a buffer into the requested stage
pub fn condition(
    buffer: &SampleBuffer,
    raw_scale: f64,
    filter: &LowPassFilter,
    stage: OutputStage,
    calibration: &CalibrationModel,
) -> Vec<f64> {
    let displacement = filter.apply(&buffer.scaled_values(raw_scale));
    match stage {
        OutputStage::Displacement => displacement,
        OutputStage::Thrust => calibration.to_thrust_series(&displacement),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiasMode {
    Warmup,
    Rolling,
}

/// Zero reference bookkeeping across refreshes.
///
/// Holds the warm-up average until more than `threshold` outputs have been recorded,
/// then switches for good to the pooled mean of the latest `window` outputs.
#[derive(Clone, Debug)]
pub struct BiasTracker {
    warmup: f64,
    threshold: usize,
    window: usize,
    // (sum, count) of each recent output
    history: VecDeque<(f64, usize)>,
    seen: usize,
    mode: BiasMode,
}

impl BiasTracker {
    pub fn new(warmup: f64, threshold: usize, window: usize) -> Self {
        let window = window.max(1);
        Self {
            warmup,
            threshold,
            window,
            history: VecDeque::with_capacity(window),
            seen: 0,
            mode: BiasMode::Warmup,
        }
    }

    /// Add one refresh output (pre-offset) and return the bias now in effect
    pub fn record(&mut self, output: &[f64]) -> f64 {
        if !output.is_empty() {
            if self.history.len() == self.window {
                self.history.pop_front();
            }
            self.history.push_back((output.iter().sum(), output.len()));
            self.seen += 1;
        }
        if self.mode == BiasMode::Warmup && self.seen > self.threshold {
            info!(outputs = self.seen, "Switching to rolling bias");
            self.mode = BiasMode::Rolling;
        }
        self.bias()
    }

    pub fn bias(&self) -> f64 {
        match self.mode {
            BiasMode::Warmup => self.warmup,
            BiasMode::Rolling => {
                let (sum, count) = self
                    .history
                    .iter()
                    .fold((0.0, 0usize), |(s, c), &(hs, hc)| (s + hs, c + hc));
                if count == 0 {
                    self.warmup
                } else {
                    sum / count as f64
                }
            }
        }
    }

    pub fn warmup(&self) -> f64 {
        self.warmup
    }

    pub fn mode(&self) -> BiasMode {
        self.mode
    }

    pub fn outputs_seen(&self) -> usize {
        self.seen
    }
}

/// Per-session state, initialized when warm-up completes
#[derive(Clone, Debug)]
pub struct PipelineState {
    sampling_hz: f64,
    filter: LowPassFilter,
    window_len: usize,
    bias: BiasTracker,
    refreshes: u64,
}

impl PipelineState {
    pub fn sampling_hz(&self) -> f64 {
        self.sampling_hz
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn bias(&self) -> &BiasTracker {
        &self.bias
    }

    pub fn filter(&self) -> &LowPassFilter {
        &self.filter
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }
}

/// Ordered (time, value) pairs produced by one refresh
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThrustSeries {
    pub stage: OutputStage,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl ThrustSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }

    pub fn latest(&self) -> Option<(f64, f64)> {
        Some((*self.times.last()?, *self.values.last()?))
    }
}

/// A successful refresh, as handed to display collaborators
#[derive(Clone, Debug)]
pub struct Refresh {
    pub cycle: u64,
    pub series: ThrustSeries,
    pub sampling_hz: f64,
    pub bias: f64,
    pub bias_mode: BiasMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Warm-up still waiting for enough samples
    NotReady { required: usize, available: usize },
    /// A new output is available from [`WindowedPipeline::latest`]
    Updated,
    /// The cycle failed; the previous output is kept
    Failed,
}

fn window_len(window_secs: f64, sampling_hz: f64) -> usize {
    ((window_secs * sampling_hz).round() as usize).max(1)
}

pub struct WindowedPipeline {
    config: PipelineConfig,
    calibration: CalibrationModel,
    rate: RateEstimator,
    state: Option<PipelineState>,
    latest: Option<Refresh>,
    consecutive_failures: u32,
    // Source generation the current state was built from
    generation: u64,
}

impl WindowedPipeline {
    pub fn new(config: PipelineConfig, calibration: CalibrationModel) -> Self {
        Self {
            rate: RateEstimator::new(config.min_rate_samples),
            config,
            calibration,
            state: None,
            latest: None,
            consecutive_failures: 0,
            generation: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> Option<&PipelineState> {
        self.state.as_ref()
    }

    /// Last successful output, retained across failed cycles
    pub fn latest(&self) -> Option<&Refresh> {
        self.latest.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn design(&self, sampling_hz: f64) -> Result<LowPassFilter> {
        let spec = FilterSpec::new(self.config.filter_order, self.config.cutoff_hz, sampling_hz)?;
        Ok(LowPassFilter::design(spec).with_min_points(self.config.min_filter_points))
    }

    fn warm_up(&self, buffer: &SampleBuffer) -> Result<PipelineState> {
        let sampling_hz = self.rate.estimate(buffer)?;
        let filter = self.design(sampling_hz)?;
        let window_len = window_len(self.config.window_secs, sampling_hz);
        let lead = buffer.head(self.config.warmup_samples.max(window_len));
        let signal = condition(
            &lead,
            self.config.raw_scale,
            &filter,
            self.config.stage,
            &self.calibration,
        );
        let warmup = metrics::bias(&signal, self.config.warmup_samples);
        info!(
            sampling_hz,
            window_len,
            bias = warmup,
            unit = self.config.stage.unit(),
            "Warm-up complete"
        );
        Ok(PipelineState {
            sampling_hz,
            filter,
            window_len,
            bias: BiasTracker::new(
                warmup,
                self.config.history_threshold,
                self.config.rolling_window,
            ),
            refreshes: 0,
        })
    }

    fn reestimate(&self, state: &mut PipelineState, window: &SampleBuffer) -> Result<()> {
        let sampling_hz = match self.rate.estimate(window) {
            Ok(fs) => fs,
            Err(e @ (Error::InsufficientData { .. } | Error::InvalidTimebase { .. })) => {
                debug!("Keeping previous rate estimate: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if ((sampling_hz - state.sampling_hz) / state.sampling_hz).abs() > 1e-3 {
            info!(
                previous = state.sampling_hz,
                current = sampling_hz,
                "Sampling rate drifted, redesigning filter"
            );
            state.filter = self.design(sampling_hz)?;
            state.sampling_hz = sampling_hz;
            state.window_len = window_len(self.config.window_secs, sampling_hz);
        }
        Ok(())
    }

    fn try_refresh<S: SampleSource + ?Sized>(&mut self, source: &mut S) -> Result<RefreshOutcome> {
        let buffer = source.snapshot()?;
        let generation = source.generation();
        if generation != self.generation {
            // A new run has its own baseline and rate, start over from warm-up
            info!(generation, "Source restarted, warming up again");
            self.generation = generation;
            self.state = None;
            self.latest = None;
        }
        let mut state = match self.state.take() {
            Some(state) => state,
            None => match self.warm_up(&buffer) {
                Ok(state) => state,
                Err(Error::InsufficientData {
                    required,
                    available,
                }) => return Ok(RefreshOutcome::NotReady { required, available }),
                Err(e) => return Err(e),
            },
        };
        let result = self.process(&mut state, &buffer);
        self.state = Some(state);
        let refresh = result?;
        self.latest = Some(refresh);
        Ok(RefreshOutcome::Updated)
    }

    fn process(&self, state: &mut PipelineState, buffer: &SampleBuffer) -> Result<Refresh> {
        if buffer.is_empty() {
            return Err(Error::InsufficientData {
                required: 1,
                available: 0,
            });
        }
        state.refreshes += 1;
        if let Some(every) = self.config.reestimate_every.filter(|&n| n > 0) {
            if state.refreshes % every == 0 {
                // Never estimate over fewer samples than warm-up needed
                let span = buffer.tail(state.window_len.max(self.rate.min_samples()));
                self.reestimate(state, &span)?;
            }
        }
        let window = buffer.tail(state.window_len);
        let signal = condition(
            &window,
            self.config.raw_scale,
            &state.filter,
            self.config.stage,
            &self.calibration,
        );
        let bias = state.bias.record(&signal);
        Ok(Refresh {
            cycle: state.refreshes,
            series: ThrustSeries {
                stage: self.config.stage,
                times: window.times(),
                values: signal.iter().map(|v| v - bias).collect(),
            },
            sampling_hz: state.sampling_hz,
            bias,
            bias_mode: state.bias.mode(),
        })
    }

    /// Run one refresh cycle.
    ///
    /// Only fatal errors come back as `Err`. Anything else is logged, counted and
    /// reported as [`RefreshOutcome::Failed`] while [`Self::latest`] keeps the previous
    /// output.
    pub fn refresh<S: SampleSource + ?Sized>(&mut self, source: &mut S) -> Result<RefreshOutcome> {
        match self.try_refresh(source) {
            Ok(outcome) => {
                if outcome == RefreshOutcome::Updated {
                    self.consecutive_failures = 0;
                }
                Ok(outcome)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.consecutive_failures += 1;
                let threshold = self.config.failure_warn_threshold.max(1);
                if self.consecutive_failures == 1 {
                    warn!("Refresh failed, keeping previous output: {e}");
                } else if self.consecutive_failures % threshold == 0 {
                    warn!(
                        failures = self.consecutive_failures,
                        "Refreshes keep failing: {e}"
                    );
                } else {
                    debug!(failures = self.consecutive_failures, "Refresh failed: {e}");
                }
                Ok(RefreshOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::MemorySource, sample::Sample};

    fn calibration() -> CalibrationModel {
        CalibrationModel::new(0.0125, 0.25, 0.3).unwrap()
    }

    fn samples(range: std::ops::Range<usize>, fs: f64, value: impl Fn(usize) -> f64) -> Vec<Sample> {
        range.map(|i| Sample::new(i as f64 / fs, value(i))).collect()
    }

    #[test]
    fn test_bias_switch_after_threshold() {
        let mut tracker = BiasTracker::new(-7.0, 1000, 200);
        for i in 1..=999 {
            assert_eq!(tracker.record(&[i as f64; 10]), -7.0);
        }
        assert_eq!(tracker.mode(), BiasMode::Warmup);
        assert_eq!(tracker.record(&[1000.0; 10]), -7.0);
        let bias = tracker.record(&[1001.0; 10]);
        assert_eq!(tracker.mode(), BiasMode::Rolling);
        // latest 200 outputs are 802..=1001
        assert!((bias - 901.5).abs() < 1e-9, "{bias}");
    }

    #[test]
    fn test_rolling_bias_never_reverts() {
        let mut tracker = BiasTracker::new(0.0, 2, 2);
        for v in [1.0, 2.0, 3.0, 5.0] {
            tracker.record(&[v]);
        }
        assert_eq!(tracker.mode(), BiasMode::Rolling);
        assert_eq!(tracker.bias(), 4.0);
        tracker.record(&[]);
        assert_eq!(tracker.mode(), BiasMode::Rolling);
        assert_eq!(tracker.outputs_seen(), 4);
    }

    #[test]
    fn test_rolling_bias_pools_samples() {
        let mut tracker = BiasTracker::new(0.0, 0, 2);
        tracker.record(&[0.0, 0.0, 0.0]);
        assert_eq!(tracker.record(&[4.0]), 1.0);
    }

    #[test]
    fn test_not_ready_until_min_samples() {
        let mut source = MemorySource::new();
        source.extend(samples(0..150, 50.0, |_| 0.01));
        let mut pipeline = WindowedPipeline::new(PipelineConfig::default(), calibration());
        assert_eq!(
            pipeline.refresh(&mut source).unwrap(),
            RefreshOutcome::NotReady {
                required: 200,
                available: 150
            }
        );
        assert!(pipeline.state().is_none());
        source.extend(samples(150..300, 50.0, |_| 0.01));
        assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Updated);
        let state = pipeline.state().unwrap();
        assert!((state.sampling_hz() - 50.0).abs() < 1e-9);
        assert_eq!(state.window_len(), 1000);
    }

    #[test]
    fn test_constant_signal_reads_zero() {
        let mut source = MemorySource::new();
        source.extend(samples(0..600, 50.0, |_| 0.012));
        let config = PipelineConfig {
            stage: OutputStage::Displacement,
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        pipeline.refresh(&mut source).unwrap();
        let refresh = pipeline.latest().unwrap();
        assert!((refresh.bias - 12.0).abs() < 1e-9);
        assert_eq!(refresh.series.len(), 600);
        assert!(refresh.series.values.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_window_is_cropped_and_thrust_offset() {
        let fs = 50.0;
        let mut source = MemorySource::new();
        // 10 s at rest then a 300 µm deflection
        source.extend(samples(0..3000, fs, |i| if i < 500 { 0.0 } else { 0.3 }));
        let config = PipelineConfig {
            window_secs: 10.0,
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Updated);
        let refresh = pipeline.latest().unwrap();
        assert_eq!(refresh.series.len(), 500);
        assert_eq!(refresh.series.times[0], 2500.0 / fs);
        assert!(refresh.bias.abs() < 1e-6);
        let (_, value) = refresh.series.latest().unwrap();
        assert!((value - 0.05).abs() < 1e-6, "{value}");
    }

    struct Flaky {
        inner: MemorySource,
        fail: bool,
    }

    impl SampleSource for Flaky {
        fn snapshot(&mut self) -> Result<SampleBuffer> {
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "sensor hiccup").into())
            } else {
                self.inner.snapshot()
            }
        }

        fn is_ready(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_failed_cycle_keeps_previous_output() {
        let mut inner = MemorySource::new();
        inner.extend(samples(0..400, 50.0, |_| 0.0));
        let mut source = Flaky { inner, fail: false };
        let mut pipeline = WindowedPipeline::new(PipelineConfig::default(), calibration());
        pipeline.refresh(&mut source).unwrap();
        assert_eq!(pipeline.latest().unwrap().cycle, 1);

        source.fail = true;
        for n in 1..=3 {
            assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Failed);
            assert_eq!(pipeline.consecutive_failures(), n);
        }
        assert_eq!(pipeline.latest().unwrap().cycle, 1);

        source.fail = false;
        assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Updated);
        assert_eq!(pipeline.consecutive_failures(), 0);
        assert_eq!(pipeline.latest().unwrap().cycle, 2);
    }

    #[test]
    fn test_cutoff_above_nyquist_is_fatal() {
        let mut source = MemorySource::new();
        source.extend(samples(0..300, 2.0, |_| 0.0));
        let config = PipelineConfig {
            cutoff_hz: 5.0,
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        assert!(matches!(
            pipeline.refresh(&mut source),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_reestimation_follows_rate_change() {
        let mut source = MemorySource::new();
        source.extend(samples(0..400, 50.0, |_| 0.0));
        let config = PipelineConfig {
            window_secs: 4.0,
            reestimate_every: Some(1),
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        pipeline.refresh(&mut source).unwrap();
        assert!((pipeline.state().unwrap().sampling_hz() - 50.0).abs() < 1e-9);
        // acquisition slows down to 25 Hz
        let t0 = 400.0 / 50.0;
        source.extend((0..400).map(|i| Sample::new(t0 + (i + 1) as f64 / 25.0, 0.0)));
        pipeline.refresh(&mut source).unwrap();
        let state = pipeline.state().unwrap();
        assert!((state.sampling_hz() - 25.0).abs() < 1e-9);
        assert_eq!(state.window_len(), 100);
    }

    #[test]
    fn test_reestimation_with_window_shorter_than_min_samples() {
        let mut source = MemorySource::new();
        source.extend(samples(0..400, 50.0, |_| 0.0));
        let config = PipelineConfig {
            window_secs: 2.0,
            reestimate_every: Some(1),
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        pipeline.refresh(&mut source).unwrap();
        assert_eq!(pipeline.state().unwrap().window_len(), 100);
        let t0 = 400.0 / 50.0;
        source.extend((0..300).map(|i| Sample::new(t0 + (i + 1) as f64 / 25.0, 0.0)));
        assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Updated);
        let state = pipeline.state().unwrap();
        assert!((state.sampling_hz() - 25.0).abs() < 1e-9);
        assert_eq!(state.window_len(), 50);
        assert_eq!(pipeline.latest().unwrap().series.len(), 50);
    }

    #[test]
    fn test_refresh_switches_to_rolling_bias() {
        let mut source = MemorySource::new();
        source.extend(samples(0..300, 50.0, |_| 0.01));
        let config = PipelineConfig {
            window_secs: 2.0,
            history_threshold: 3,
            rolling_window: 2,
            stage: OutputStage::Displacement,
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        pipeline.refresh(&mut source).unwrap();
        // The balance settles somewhere else after warm-up
        source.extend(samples(300..600, 50.0, |_| 0.02));
        for _ in 0..2 {
            pipeline.refresh(&mut source).unwrap();
        }
        let refresh = pipeline.latest().unwrap();
        assert_eq!(refresh.cycle, 3);
        assert_eq!(refresh.bias_mode, BiasMode::Warmup);
        assert!((refresh.bias - 10.0).abs() < 1e-6, "{}", refresh.bias);

        pipeline.refresh(&mut source).unwrap();
        let refresh = pipeline.latest().unwrap();
        assert_eq!(refresh.bias_mode, BiasMode::Rolling);
        assert!((refresh.bias - 20.0).abs() < 1e-6, "{}", refresh.bias);
        assert!(refresh.series.values.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_restarted_source_warms_up_again() {
        let mut source = MemorySource::new();
        source.extend(samples(0..600, 50.0, |_| 0.5));
        let config = PipelineConfig {
            stage: OutputStage::Displacement,
            ..Default::default()
        };
        let mut pipeline = WindowedPipeline::new(config, calibration());
        pipeline.refresh(&mut source).unwrap();
        assert!((pipeline.latest().unwrap().bias - 500.0).abs() < 1e-6);

        source.restart();
        source.extend(samples(0..100, 50.0, |_| 0.0));
        assert!(matches!(
            pipeline.refresh(&mut source).unwrap(),
            RefreshOutcome::NotReady { available: 100, .. }
        ));
        assert!(pipeline.state().is_none());
        assert!(pipeline.latest().is_none());

        source.extend(samples(100..300, 50.0, |_| 0.0));
        assert_eq!(pipeline.refresh(&mut source).unwrap(), RefreshOutcome::Updated);
        let refresh = pipeline.latest().unwrap();
        assert_eq!(refresh.cycle, 1);
        assert!(refresh.bias.abs() < 1e-6, "{}", refresh.bias);
        let (_, value) = refresh.series.latest().unwrap();
        assert!(value.abs() < 1e-6, "{value}");
    }
}
