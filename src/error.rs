//! Error types shared by every stage of the pipeline

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sample log {path:?} did not appear or stayed empty for {waited:?}")]
    SourceUnavailable { path: PathBuf, waited: Duration },

    #[error("insufficient data: need {required} samples, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("malformed sample line {line:?}")]
    MalformedSample { line: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("samples span {span} s, cannot derive a sampling rate")]
    InvalidTimebase { span: f64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that end a monitoring session instead of a single refresh
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. } | Error::InvalidCalibration(_) | Error::InvalidFilter(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
