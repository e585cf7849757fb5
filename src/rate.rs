//! Sampling-rate inference from irregular timestamps

use tracing::debug;

use crate::{
    error::{Error, Result},
    sample::SampleBuffer,
    DEFAULT_MIN_RATE_SAMPLES,
};

/// Derives the average sampling frequency of a buffer from its first and last
/// timestamps. Refuses to answer until `min_samples` are available, since the
/// acquisition clock jitters enough to make short spans misleading.
#[derive(Clone, Copy, Debug)]
pub struct RateEstimator {
    min_samples: usize,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RATE_SAMPLES)
    }
}

impl RateEstimator {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(2),
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// `(count - 1) / (t_last - t_first)` in Hz
    pub fn estimate(&self, buffer: &SampleBuffer) -> Result<f64> {
        let count = buffer.len();
        if count < self.min_samples {
            return Err(Error::InsufficientData {
                required: self.min_samples,
                available: count,
            });
        }
        let (Some(first), Some(last)) = (buffer.first(), buffer.last()) else {
            return Err(Error::InsufficientData {
                required: self.min_samples,
                available: count,
            });
        };
        let span = last.time - first.time;
        if !(span.is_finite() && span > 0.0) {
            return Err(Error::InvalidTimebase { span });
        }
        let fs = (count - 1) as f64 / span;
        debug!(count, span, fs, "Estimated sampling rate");
        Ok(fs)
    }
}
