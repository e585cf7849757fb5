//! Samples as written by the acquisition process and the buffers built from them

use clap::ValueEnum;

use crate::error::{Error, Result};

/// One displacement reading. `value` is in the sensor's native unit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(time: f64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Decimal mark used by the log writer
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecimalSeparator {
    #[default]
    Comma,
    Point,
}

fn parse_field(field: &str, decimal: DecimalSeparator) -> Option<f64> {
    let value = match decimal {
        DecimalSeparator::Comma => field.trim().replace(',', ".").parse::<f64>(),
        DecimalSeparator::Point => field.trim().parse::<f64>(),
    };
    value.ok().filter(|v| v.is_finite())
}

/// Parse one `<time>\t<value>` record
pub fn parse_line(line: &str, decimal: DecimalSeparator) -> Result<Sample> {
    let malformed = || Error::MalformedSample {
        line: line.to_owned(),
    };
    let mut fields = line.split('\t');
    let time = fields.next().ok_or_else(malformed)?;
    let value = fields.next().ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }
    match (parse_field(time, decimal), parse_field(value, decimal)) {
        (Some(time), Some(value)) => Ok(Sample { time, value }),
        _ => Err(malformed()),
    }
}

/// Ordered, immutable snapshot of samples used by a single refresh
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
}

impl SampleBuffer {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&Sample> {
        self.samples.first()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    /// Raw values multiplied by `scale`
    pub fn scaled_values(&self, scale: f64) -> Vec<f64> {
        self.samples.iter().map(|s| s.value * scale).collect()
    }

    /// The trailing `n` samples (all of them if there are fewer)
    pub fn tail(&self, n: usize) -> SampleBuffer {
        let start = self.samples.len().saturating_sub(n);
        SampleBuffer::new(self.samples[start..].to_vec())
    }

    /// The leading `n` samples (all of them if there are fewer)
    pub fn head(&self, n: usize) -> SampleBuffer {
        let end = n.min(self.samples.len());
        SampleBuffer::new(self.samples[..end].to_vec())
    }
}

impl From<Vec<Sample>> for SampleBuffer {
    fn from(samples: Vec<Sample>) -> Self {
        Self::new(samples)
    }
}
